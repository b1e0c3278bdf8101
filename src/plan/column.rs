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
    cmp::Ordering,
    collections::HashMap,
    fmt::{self, Display},
    hash::{Hash, Hasher},
    sync::Arc,
};

use arrow_schema::DataType;
use datafusion_common::{internal_err, Result};

/// Identifies one instantiation of a table (or opaque subquery) inside a plan.
/// Scanning the same table twice yields two distinct relation ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationId(pub u32);

impl Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A reference to a column produced somewhere in a plan.
///
/// Two `ColumnRef`s are the same column if and only if their ids are equal;
/// the name and type are informational.
#[derive(Debug, Clone)]
pub struct ColumnRef {
    id: u32,
    name: Arc<str>,
    data_type: DataType,
    nullable: bool,
}

impl ColumnRef {
    /// Unique id of this column within its [`ColumnRefFactory`].
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name of this column, as written in the originating table or alias.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Semantic type of this column.
    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    /// Whether this column may contain nulls.
    pub fn nullable(&self) -> bool {
        self.nullable
    }
}

impl PartialEq for ColumnRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ColumnRef {}

impl Hash for ColumnRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialOrd for ColumnRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ColumnRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Hands out [`ColumnRef`]s and [`RelationId`]s for one plan, and remembers
/// which relation each column was produced by.
///
/// The analyzer owns one factory per compiled query; every materialized view
/// keeps the factory its defining plan was built with. Rewrite attempts work on
/// clones, so the originals are never mutated by a failed attempt.
#[derive(Debug, Clone)]
pub struct ColumnRefFactory {
    columns: Vec<ColumnRef>,
    relation_by_column: HashMap<u32, RelationId>,
    columns_by_relation: HashMap<RelationId, Vec<ColumnRef>>,
    next_relation_id: u32,
}

impl Default for ColumnRefFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ColumnRefFactory {
    /// Create an empty factory. Column ids start at 1.
    pub fn new() -> Self {
        Self {
            columns: vec![],
            relation_by_column: HashMap::new(),
            columns_by_relation: HashMap::new(),
            next_relation_id: 0,
        }
    }

    /// Create a column that does not belong to any relation,
    /// e.g. the output of a projection or an aggregate.
    pub fn create_column(
        &mut self,
        name: impl Into<Arc<str>>,
        data_type: DataType,
        nullable: bool,
    ) -> ColumnRef {
        let column = ColumnRef {
            id: self.columns.len() as u32 + 1,
            name: name.into(),
            data_type,
            nullable,
        };
        self.columns.push(column.clone());
        column
    }

    /// Allocate a new relation id.
    pub fn create_relation(&mut self) -> RelationId {
        let relation = RelationId(self.next_relation_id);
        self.next_relation_id += 1;
        self.columns_by_relation.insert(relation, vec![]);
        relation
    }

    /// Create a column produced by `relation`.
    pub fn create_relation_column(
        &mut self,
        relation: RelationId,
        name: impl Into<Arc<str>>,
        data_type: DataType,
        nullable: bool,
    ) -> Result<ColumnRef> {
        let column = self.create_column(name, data_type, nullable);
        self.bind_column(&column, relation)?;
        Ok(column)
    }

    /// Record that an existing column is produced by `relation`.
    /// A column may only ever belong to a single relation.
    pub fn bind_column(&mut self, column: &ColumnRef, relation: RelationId) -> Result<()> {
        if self.column(column.id).is_none() {
            return internal_err!("column {column} was not created by this factory");
        }

        match self.relation_by_column.get(&column.id) {
            Some(existing) if *existing == relation => return Ok(()),
            Some(existing) => {
                return internal_err!(
                    "column {column} already belongs to relation {existing}, cannot bind to {relation}"
                )
            }
            None => {}
        }

        let Some(columns) = self.columns_by_relation.get_mut(&relation) else {
            return internal_err!("relation {relation} was not created by this factory");
        };

        columns.push(column.clone());
        self.relation_by_column.insert(column.id, relation);
        Ok(())
    }

    /// Look up a column by id.
    pub fn column(&self, id: u32) -> Option<&ColumnRef> {
        id.checked_sub(1)
            .and_then(|idx| self.columns.get(idx as usize))
    }

    /// The relation that produced this column, if any.
    pub fn relation_of(&self, column: &ColumnRef) -> Option<RelationId> {
        self.relation_by_column.get(&column.id).copied()
    }

    /// All columns produced by `relation`, in creation order.
    pub fn relation_columns(&self, relation: RelationId) -> &[ColumnRef] {
        self.columns_by_relation
            .get(&relation)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of columns created so far.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}
