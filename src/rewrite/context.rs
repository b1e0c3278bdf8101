// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::collections::HashMap;

use itertools::Itertools;

use super::{
    column_rewriter::remap_columns,
    driver::RejectReason,
    equivalence::EquivalenceClasses,
    mapping::{match_relations, Relation, RelationMatch},
    normal_form::{Predicate, SpjgNormalForm},
};
use crate::plan::{ColumnRef, ColumnRefFactory, RelationId};

/// Everything known about one (query, materialized view) rewrite attempt.
///
/// A context is created fresh for every pair and dropped once the attempt
/// succeeds or fails. The factories it owns are copies, so columns minted
/// while rewriting never leak into the analyzer's factory.
#[derive(Debug)]
pub struct RewriteContext {
    query: SpjgNormalForm,
    view: SpjgNormalForm,
    query_factory: ColumnRefFactory,
    view_factory: ColumnRefFactory,
    relations: RelationMatch,
    query_origins: HashMap<ColumnRef, RelationId>,
    view_origins: HashMap<ColumnRef, RelationId>,
    /// Query conjuncts, with the query's own equivalence classes
    query_predicate: Predicate,
    /// View conjuncts re-expressed over query columns, with the equivalence classes they imply
    view_predicate: Predicate,
}

impl RewriteContext {
    /// Pair the relations of both normal forms and bring the view's
    /// predicate into the query's column space.
    pub fn try_new(
        query: SpjgNormalForm,
        mut query_factory: ColumnRefFactory,
        view: SpjgNormalForm,
        view_factory: ColumnRefFactory,
    ) -> Result<Self, RejectReason> {
        let mut relations = match_relations(query.relations(), view.relations())
            .map_err(RejectReason::NoStructuralCorrespondence)?;

        let mut query_origins = origins(query.relations());
        let view_origins = origins(view.relations());

        // The view may read columns of a shared relation that the query never reads.
        // Give them query-side counterparts so every view predicate has a query-space form.
        for relation in query.relations() {
            let Some(view_relation) = relations.mapping.query_to_view(relation.id) else {
                continue;
            };
            let Some(view_columns) = relations.view_columns.get(&view_relation) else {
                continue;
            };
            let query_columns = relations.query_columns.entry(relation.id).or_default();
            for (name, view_column) in view_columns.iter().sorted_by_key(|(name, _)| *name) {
                if query_columns.contains_key(name) {
                    continue;
                }
                let column = query_factory.create_column(
                    view_column.name(),
                    view_column.data_type().clone(),
                    view_column.nullable(),
                );
                query_factory.bind_column(&column, relation.id)?;
                query_origins.insert(column.clone(), relation.id);
                query_columns.insert(name.clone(), column);
            }
        }

        let view_conjuncts = view
            .conjuncts()
            .iter()
            .map(|conjunct| {
                let (rewritten, complete) = remap_columns(
                    conjunct,
                    &view_origins,
                    |r| relations.mapping.view_to_query(r),
                    &relations.query_columns,
                );
                complete
                    .then_some(rewritten)
                    .ok_or(RejectReason::ResidualNotExpressible)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let query_predicate = Predicate::new(
            query.conjuncts(),
            EquivalenceClasses::build(query.conjuncts()),
        )?;
        let view_predicate =
            Predicate::new(&view_conjuncts, EquivalenceClasses::build(&view_conjuncts))?;

        log::trace!(
            "query equivalences: {}, query-based view equivalences: {}",
            query_predicate.equivalences(),
            view_predicate.equivalences()
        );

        Ok(Self {
            query,
            view,
            query_factory,
            view_factory,
            relations,
            query_origins,
            view_origins,
            query_predicate,
            view_predicate,
        })
    }

    /// The query, in normal form.
    pub fn query(&self) -> &SpjgNormalForm {
        &self.query
    }

    /// The view, in normal form. Its expressions are in view column space.
    pub fn view(&self) -> &SpjgNormalForm {
        &self.view
    }

    /// This attempt's copy of the query's factory.
    pub fn query_factory(&self) -> &ColumnRefFactory {
        &self.query_factory
    }

    pub(crate) fn query_factory_mut(&mut self) -> &mut ColumnRefFactory {
        &mut self.query_factory
    }

    /// Give up the context, keeping the query factory that rewritten plans refer to.
    pub fn into_query_factory(self) -> ColumnRefFactory {
        self.query_factory
    }

    /// This attempt's copy of the view's factory.
    pub fn view_factory(&self) -> &ColumnRefFactory {
        &self.view_factory
    }

    /// The relation pairing and per-relation column tables.
    pub fn relation_match(&self) -> &RelationMatch {
        &self.relations
    }

    /// Equivalence classes derived from the query's predicates.
    pub fn query_equivalences(&self) -> &EquivalenceClasses {
        self.query_predicate.equivalences()
    }

    /// Equivalence classes derived from the view's predicates, over query columns.
    pub fn query_based_view_equivalences(&self) -> &EquivalenceClasses {
        self.view_predicate.equivalences()
    }

    pub(crate) fn query_predicate(&self) -> &Predicate {
        &self.query_predicate
    }

    pub(crate) fn view_predicate(&self) -> &Predicate {
        &self.view_predicate
    }

    /// The query relation a query column belongs to.
    pub fn query_relation_of(&self, column: &ColumnRef) -> Option<RelationId> {
        self.query_origins.get(column).copied()
    }

    /// The view relation a view column belongs to.
    pub fn view_relation_of(&self, column: &ColumnRef) -> Option<RelationId> {
        self.view_origins.get(column).copied()
    }
}

/// Map each relation column to its relation.
fn origins(relations: &[Relation]) -> HashMap<ColumnRef, RelationId> {
    relations
        .iter()
        .flat_map(|r| r.columns.iter().map(|c| (c.clone(), r.id)))
        .collect()
}
