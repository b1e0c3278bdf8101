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

use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::Arc,
};

use datafusion_common::ResolvedTableReference;
use itertools::Itertools;

use crate::plan::{ColumnRef, RelationId};

/// Structural identity of a relation, used to pair query relations with view relations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelationKey {
    /// A base table (or materialized view) scan
    Table(ResolvedTableReference),
    /// An opaque subquery, identified by a fingerprint of its shape
    Subquery(String),
}

impl Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(table) => write!(f, "{table}"),
            Self::Subquery(fingerprint) => write!(f, "subquery {fingerprint}"),
        }
    }
}

/// One relation of a select-project-join plan.
#[derive(Debug, Clone)]
pub struct Relation {
    /// Relation id within its plan's factory
    pub id: RelationId,
    /// Structural identity
    pub key: RelationKey,
    /// Columns produced by this relation
    pub columns: Vec<ColumnRef>,
}

/// A bijection between query relations and view relations.
///
/// Both directions are kept, so [`RelationIdMapping::inverse`] is constant time.
#[derive(Debug, Clone, Default)]
pub struct RelationIdMapping {
    forward: Arc<HashMap<RelationId, RelationId>>,
    backward: Arc<HashMap<RelationId, RelationId>>,
}

impl RelationIdMapping {
    /// Build a mapping from `(query, view)` pairs. Returns `None` if the pairs
    /// are not one-to-one.
    pub fn try_new(pairs: impl IntoIterator<Item = (RelationId, RelationId)>) -> Option<Self> {
        let mut forward = HashMap::new();
        let mut backward = HashMap::new();
        for (query, view) in pairs {
            if forward.insert(query, view).is_some() || backward.insert(view, query).is_some() {
                return None;
            }
        }

        Some(Self {
            forward: Arc::new(forward),
            backward: Arc::new(backward),
        })
    }

    /// The view relation paired with a query relation.
    pub fn query_to_view(&self, query: RelationId) -> Option<RelationId> {
        self.forward.get(&query).copied()
    }

    /// The query relation paired with a view relation.
    pub fn view_to_query(&self, view: RelationId) -> Option<RelationId> {
        self.backward.get(&view).copied()
    }

    /// The same mapping seen from the other side.
    pub fn inverse(&self) -> Self {
        Self {
            forward: Arc::clone(&self.backward),
            backward: Arc::clone(&self.forward),
        }
    }

    /// Number of mapped pairs.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

/// Reasons why the relations of a query and a view could not be paired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchFailure {
    /// A relation of the query does not appear in the view
    MissingRelation(RelationKey),
    /// A relation appears more than once, so there is no unique pairing
    Ambiguous(RelationKey),
    /// The view joins a relation that the query doesn't reference,
    /// which may change the view's row multiplicity
    ExtraViewRelation(RelationKey),
}

impl Display for MatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRelation(key) => write!(f, "query relation {key} missing from view"),
            Self::Ambiguous(key) => write!(f, "ambiguous pairing for relation {key}"),
            Self::ExtraViewRelation(key) => write!(f, "view joins extra relation {key}"),
        }
    }
}

/// Columns of each relation, keyed by lowercase name.
pub type RelationColumns = HashMap<RelationId, HashMap<String, ColumnRef>>;

/// The result of pairing a query's relations with a view's relations.
#[derive(Debug, Clone)]
pub struct RelationMatch {
    /// query relation <-> view relation
    pub mapping: RelationIdMapping,
    /// Query relation columns by lowercase name
    pub query_columns: RelationColumns,
    /// View relation columns by lowercase name.
    /// View columns without a same-named query column are view-only.
    pub view_columns: RelationColumns,
}

/// Pair every query relation with exactly one view relation of the same
/// structural identity.
pub fn match_relations(
    query: &[Relation],
    view: &[Relation],
) -> Result<RelationMatch, MatchFailure> {
    let query_by_key = query.iter().into_group_map_by(|r| &r.key);
    let view_by_key = view.iter().into_group_map_by(|r| &r.key);

    let mut pairs = Vec::with_capacity(query.len());
    // iterate in plan order so failures are deterministic
    for relation in query {
        let candidates = view_by_key
            .get(&relation.key)
            .ok_or_else(|| MatchFailure::MissingRelation(relation.key.clone()))?;

        let occurrences = query_by_key.get(&relation.key).map_or(0, Vec::len);
        match candidates.as_slice() {
            [candidate] if occurrences == 1 => pairs.push((relation.id, candidate.id)),
            _ => return Err(MatchFailure::Ambiguous(relation.key.clone())),
        }
    }

    if let Some(extra) = view.iter().find(|r| !query_by_key.contains_key(&r.key)) {
        return Err(MatchFailure::ExtraViewRelation(extra.key.clone()));
    }

    let mapping = RelationIdMapping::try_new(pairs)
        .ok_or_else(|| MatchFailure::Ambiguous(query[0].key.clone()))?;

    Ok(RelationMatch {
        mapping,
        query_columns: columns_by_name(query),
        view_columns: columns_by_name(view),
    })
}

fn columns_by_name(relations: &[Relation]) -> RelationColumns {
    relations
        .iter()
        .map(|relation| {
            let mut columns = HashMap::with_capacity(relation.columns.len());
            for column in &relation.columns {
                columns
                    .entry(column.name().to_lowercase())
                    .or_insert_with(|| column.clone());
            }
            (relation.id, columns)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use arrow_schema::DataType;
    use datafusion_common::TableReference;

    use super::{match_relations, MatchFailure, Relation, RelationIdMapping, RelationKey};
    use crate::plan::{ColumnRefFactory, RelationId};

    fn relation(factory: &mut ColumnRefFactory, table: &str, columns: &[&str]) -> Relation {
        let id = factory.create_relation();
        let columns = columns
            .iter()
            .map(|name| {
                factory
                    .create_relation_column(id, *name, DataType::Int32, true)
                    .unwrap()
            })
            .collect();
        Relation {
            id,
            key: RelationKey::Table(TableReference::bare(table).resolve("datafusion", "public")),
            columns,
        }
    }

    #[test]
    fn mapping_is_invertible() {
        let mapping =
            RelationIdMapping::try_new([(RelationId(0), RelationId(5)), (RelationId(1), RelationId(4))])
                .unwrap();
        let inverse = mapping.inverse();
        assert_eq!(mapping.query_to_view(RelationId(1)), Some(RelationId(4)));
        assert_eq!(inverse.query_to_view(RelationId(4)), Some(RelationId(1)));
        assert_eq!(inverse.inverse().view_to_query(RelationId(5)), Some(RelationId(0)));
        assert_eq!(mapping.len(), 2);

        assert!(
            RelationIdMapping::try_new([(RelationId(0), RelationId(1)), (RelationId(2), RelationId(1))])
                .is_none()
        );
    }

    #[test]
    fn match_by_table_and_column_name() {
        let mut query_factory = ColumnRefFactory::new();
        let mut view_factory = ColumnRefFactory::new();

        let q_t1 = relation(&mut query_factory, "t1", &["v4", "v5"]);
        let q_t2 = relation(&mut query_factory, "t2", &["c4"]);
        let v_t2 = relation(&mut view_factory, "t2", &["C4", "c5"]);
        let v_t1 = relation(&mut view_factory, "t1", &["v4", "v5"]);

        let matched = match_relations(&[q_t1.clone(), q_t2.clone()], &[v_t2.clone(), v_t1.clone()])
            .unwrap();
        assert_eq!(matched.mapping.query_to_view(q_t1.id), Some(v_t1.id));
        assert_eq!(matched.mapping.query_to_view(q_t2.id), Some(v_t2.id));
        // case-insensitive names
        assert_eq!(matched.view_columns[&v_t2.id]["c4"], v_t2.columns[0]);
        // view-only column is kept
        assert!(matched.view_columns[&v_t2.id].contains_key("c5"));
        assert!(!matched.query_columns[&q_t2.id].contains_key("c5"));
    }

    #[test]
    fn unmatched_and_ambiguous_relations_fail() {
        let mut query_factory = ColumnRefFactory::new();
        let mut view_factory = ColumnRefFactory::new();

        let q_t1 = relation(&mut query_factory, "t1", &["a"]);
        let q_t1_again = relation(&mut query_factory, "t1", &["a"]);
        let q_t3 = relation(&mut query_factory, "t3", &["a"]);
        let v_t1 = relation(&mut view_factory, "t1", &["a"]);
        let v_t1_again = relation(&mut view_factory, "t1", &["a"]);
        let v_t2 = relation(&mut view_factory, "t2", &["a"]);

        assert!(matches!(
            match_relations(&[q_t3], &[v_t1.clone()]),
            Err(MatchFailure::MissingRelation(_))
        ));
        assert!(matches!(
            match_relations(&[q_t1.clone(), q_t1_again.clone()], &[v_t1.clone(), v_t1_again]),
            Err(MatchFailure::Ambiguous(_))
        ));
        assert!(matches!(
            match_relations(&[q_t1.clone(), q_t1_again], &[v_t1.clone()]),
            Err(MatchFailure::Ambiguous(_))
        ));
        assert!(matches!(
            match_relations(&[q_t1], &[v_t1, v_t2]),
            Err(MatchFailure::ExtraViewRelation(_))
        ));
    }
}
