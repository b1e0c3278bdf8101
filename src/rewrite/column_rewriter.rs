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

/*!

Moving expressions between the query's and the view's column spaces.

Query and view plans are analyzed independently, so the same table column has a
different [`ColumnRef`] on each side. A [`ColumnRewriter`] replaces columns using
the relation pairing of a [`RewriteContext`] (relation first, then column name),
and can normalize columns to the representative of their equivalence class.
Remapping always happens before normalization, since both sets of equivalence
classes are keyed by query columns.

*/

use std::collections::HashMap;

use datafusion_common::tree_node::{Transformed, TransformedResult, TreeNode};

use super::{context::RewriteContext, mapping::RelationColumns};
use crate::plan::{ColumnRef, RelationId, ScalarOperator};

/// Which way to move columns between relation spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Query columns to view columns
    QueryToView,
    /// View columns to query columns
    ViewToQuery,
}

/// Which equivalence classes to normalize with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Equivalences {
    /// Classes implied by the query's predicates
    Query,
    /// Classes implied by the view's predicates, over query columns
    QueryBasedView,
}

/// What a rewrite does. The default does nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteOptions {
    /// Move columns to the other side's relations
    pub remap: Option<Direction>,
    /// Replace columns by their class representative
    pub normalize: Option<Equivalences>,
}

impl RewriteOptions {
    /// Remap only.
    pub const fn remap(direction: Direction) -> Self {
        Self {
            remap: Some(direction),
            normalize: None,
        }
    }

    /// Normalize only.
    pub const fn normalize(equivalences: Equivalences) -> Self {
        Self {
            remap: None,
            normalize: Some(equivalences),
        }
    }

    /// Remap, then normalize.
    pub const fn remap_and_normalize(direction: Direction, equivalences: Equivalences) -> Self {
        Self {
            remap: Some(direction),
            normalize: Some(equivalences),
        }
    }
}

/// Rewrites expressions and columns between the query and view of one [`RewriteContext`].
///
/// Rewrites never mutate their input. Columns that can't be remapped are left unchanged;
/// the `try_` variants instead return `None` if any column was left behind.
#[derive(Debug, Clone, Copy)]
pub struct ColumnRewriter<'a> {
    context: &'a RewriteContext,
}

impl<'a> ColumnRewriter<'a> {
    /// A rewriter for `context`.
    pub fn new(context: &'a RewriteContext) -> Self {
        Self { context }
    }

    /// Rewrite `expr` as described by `options`. Unmappable columns are kept.
    pub fn rewrite(&self, expr: &ScalarOperator, options: RewriteOptions) -> ScalarOperator {
        self.apply(expr, options).0
    }

    /// Rewrite `expr` as described by `options`, failing if any column can't be remapped.
    pub fn try_rewrite(&self, expr: &ScalarOperator, options: RewriteOptions) -> Option<ScalarOperator> {
        let (rewritten, complete) = self.apply(expr, options);
        complete.then_some(rewritten)
    }

    fn apply(&self, expr: &ScalarOperator, options: RewriteOptions) -> (ScalarOperator, bool) {
        let RewriteOptions { remap, normalize } = options;
        match remap {
            None => (self.normalize(expr.clone(), normalize), true),
            Some(Direction::ViewToQuery) => {
                let (remapped, complete) = self.remap(expr, Direction::ViewToQuery);
                (self.normalize(remapped, normalize), complete)
            }
            // equivalence classes are keyed by query columns, so normalize while still on the query side
            Some(Direction::QueryToView) => {
                let normalized = self.normalize(expr.clone(), normalize);
                self.remap(&normalized, Direction::QueryToView)
            }
        }
    }

    fn remap(&self, expr: &ScalarOperator, direction: Direction) -> (ScalarOperator, bool) {
        let context = self.context;
        let relations = context.relation_match();
        match direction {
            Direction::QueryToView => remap_columns(
                expr,
                &QueryOrigins(context),
                |r| relations.mapping.query_to_view(r),
                &relations.view_columns,
            ),
            Direction::ViewToQuery => remap_columns(
                expr,
                &ViewOrigins(context),
                |r| relations.mapping.view_to_query(r),
                &relations.query_columns,
            ),
        }
    }

    fn normalize(&self, expr: ScalarOperator, equivalences: Option<Equivalences>) -> ScalarOperator {
        match equivalences {
            None => expr,
            Some(Equivalences::Query) => self.context.query_equivalences().normalize_expr(expr),
            Some(Equivalences::QueryBasedView) => self
                .context
                .query_based_view_equivalences()
                .normalize_expr(expr),
        }
    }

    /// Replace query columns by their view counterparts.
    pub fn rewrite_query_to_view(&self, expr: Option<&ScalarOperator>) -> Option<ScalarOperator> {
        expr.map(|e| self.rewrite(e, RewriteOptions::remap(Direction::QueryToView)))
    }

    /// Replace view columns by their query counterparts.
    pub fn rewrite_view_to_query(&self, expr: Option<&ScalarOperator>) -> Option<ScalarOperator> {
        expr.map(|e| self.rewrite(e, RewriteOptions::remap(Direction::ViewToQuery)))
    }

    /// Normalize query columns with the query's equivalence classes.
    pub fn rewrite_by_query_ec(&self, expr: Option<&ScalarOperator>) -> Option<ScalarOperator> {
        expr.map(|e| self.rewrite(e, RewriteOptions::normalize(Equivalences::Query)))
    }

    /// Normalize query columns with the view's equivalence classes.
    pub fn rewrite_by_view_ec(&self, expr: Option<&ScalarOperator>) -> Option<ScalarOperator> {
        expr.map(|e| self.rewrite(e, RewriteOptions::normalize(Equivalences::QueryBasedView)))
    }

    /// Move view columns to the query side, then normalize with the query's equivalence classes.
    pub fn rewrite_view_to_query_with_query_ec(
        &self,
        expr: Option<&ScalarOperator>,
    ) -> Option<ScalarOperator> {
        expr.map(|e| {
            self.rewrite(
                e,
                RewriteOptions::remap_and_normalize(Direction::ViewToQuery, Equivalences::Query),
            )
        })
    }

    /// Move view columns to the query side, then normalize with the view's equivalence classes.
    pub fn rewrite_view_to_query_with_view_ec(
        &self,
        expr: Option<&ScalarOperator>,
    ) -> Option<ScalarOperator> {
        expr.map(|e| {
            self.rewrite(
                e,
                RewriteOptions::remap_and_normalize(
                    Direction::ViewToQuery,
                    Equivalences::QueryBasedView,
                ),
            )
        })
    }

    /// Checked [`Self::rewrite_query_to_view`].
    pub fn try_rewrite_query_to_view(&self, expr: &ScalarOperator) -> Option<ScalarOperator> {
        self.try_rewrite(expr, RewriteOptions::remap(Direction::QueryToView))
    }

    /// Checked [`Self::rewrite_view_to_query`].
    pub fn try_rewrite_view_to_query(&self, expr: &ScalarOperator) -> Option<ScalarOperator> {
        self.try_rewrite(expr, RewriteOptions::remap(Direction::ViewToQuery))
    }

    /// Checked [`Self::rewrite_view_to_query_with_view_ec`].
    pub fn try_rewrite_view_to_query_with_view_ec(
        &self,
        expr: &ScalarOperator,
    ) -> Option<ScalarOperator> {
        self.try_rewrite(
            expr,
            RewriteOptions::remap_and_normalize(Direction::ViewToQuery, Equivalences::QueryBasedView),
        )
    }

    /// The query column corresponding to a view column, if there is one.
    ///
    /// Ids are only unique within one side, so the result may have the same id as `column`.
    pub fn rewrite_view_to_query_column(&self, column: &ColumnRef) -> Option<ColumnRef> {
        let relations = self.context.relation_match();
        remap_column(
            column,
            &ViewOrigins(self.context),
            |r| relations.mapping.view_to_query(r),
            &relations.query_columns,
        )
    }

    /// The view column corresponding to a query column, if there is one.
    pub fn rewrite_query_to_view_column(&self, column: &ColumnRef) -> Option<ColumnRef> {
        let relations = self.context.relation_match();
        remap_column(
            column,
            &QueryOrigins(self.context),
            |r| relations.mapping.query_to_view(r),
            &relations.view_columns,
        )
    }
}

/// Where a column comes from, on one side of a rewrite.
pub(crate) trait ColumnOrigins {
    fn relation_of(&self, column: &ColumnRef) -> Option<RelationId>;
}

impl ColumnOrigins for HashMap<ColumnRef, RelationId> {
    fn relation_of(&self, column: &ColumnRef) -> Option<RelationId> {
        self.get(column).copied()
    }
}

struct QueryOrigins<'a>(&'a RewriteContext);

impl ColumnOrigins for QueryOrigins<'_> {
    fn relation_of(&self, column: &ColumnRef) -> Option<RelationId> {
        self.0.query_relation_of(column)
    }
}

struct ViewOrigins<'a>(&'a RewriteContext);

impl ColumnOrigins for ViewOrigins<'_> {
    fn relation_of(&self, column: &ColumnRef) -> Option<RelationId> {
        self.0.view_relation_of(column)
    }
}

fn remap_column(
    column: &ColumnRef,
    origins: &impl ColumnOrigins,
    mapping: impl Fn(RelationId) -> Option<RelationId>,
    destination: &RelationColumns,
) -> Option<ColumnRef> {
    let relation = mapping(origins.relation_of(column)?)?;
    destination
        .get(&relation)?
        .get(&column.name().to_lowercase())
        .cloned()
}

/// Replace every column of `expr` through the relation `mapping`, matching columns by name.
/// Also returns whether every column could be replaced.
pub(crate) fn remap_columns(
    expr: &ScalarOperator,
    origins: &impl ColumnOrigins,
    mapping: impl Fn(RelationId) -> Option<RelationId>,
    destination: &RelationColumns,
) -> (ScalarOperator, bool) {
    let mut complete = true;
    let rewritten = expr
        .clone()
        .transform(|e| {
            Ok(match e {
                ScalarOperator::Column(c) => match remap_column(&c, origins, &mapping, destination) {
                    Some(new) => Transformed::yes(ScalarOperator::Column(new)),
                    None => {
                        complete = false;
                        Transformed::no(ScalarOperator::Column(c))
                    }
                },
                e => Transformed::no(e),
            })
        })
        .data()
        // No chance of error since we never return Err
        .unwrap_or_else(|_| unreachable!());

    (rewritten, complete)
}
