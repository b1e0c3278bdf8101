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
    borrow::Cow,
    collections::HashMap,
    fmt::{self, Display},
};

use datafusion_common::tree_node::{Transformed, TreeNode};
use datafusion_expr::Operator;
use itertools::Itertools;

use crate::plan::{BinaryExpr, ColumnRef, ScalarOperator};

/// Partition of columns into classes of columns known to hold equal values,
/// derived from `col = col` conjuncts.
///
/// Each class has a normal representative: the first of its columns to be
/// inserted. Columns that were never inserted form implicit singleton classes.
/// Representatives are only meaningful within one instance; they are not
/// stable across rebuilds.
#[derive(Debug, Clone, Default)]
pub struct EquivalenceClasses {
    /// Column -> its class representative
    representatives: HashMap<ColumnRef, ColumnRef>,
    /// Representative -> members, in insertion order (representative first)
    members: HashMap<ColumnRef, Vec<ColumnRef>>,
    /// Representatives, in class creation order
    order: Vec<ColumnRef>,
}

impl EquivalenceClasses {
    /// An empty set of classes: every column is its own singleton.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build classes from every `a = b` column equality among `predicates`.
    /// All other conjuncts are ignored.
    pub fn build<'a>(predicates: impl IntoIterator<Item = &'a ScalarOperator>) -> Self {
        let mut classes = Self::new();
        for predicate in predicates {
            if let Some((left, right)) = as_column_equality(predicate) {
                classes.add_equivalence(left, right);
            }
        }
        classes
    }

    /// Record that `a` and `b` are equal, merging their classes.
    pub fn add_equivalence(&mut self, a: &ColumnRef, b: &ColumnRef) {
        let rep_a = self.insert(a);
        let rep_b = self.insert(b);
        if rep_a == rep_b {
            return;
        }

        // the class created first keeps its representative
        let (keep, merge) = match (self.position(&rep_a), self.position(&rep_b)) {
            (Some(i), Some(j)) if j < i => (rep_b, rep_a),
            _ => (rep_a, rep_b),
        };

        let moved = self.members.remove(&merge).unwrap_or_default();
        for column in &moved {
            self.representatives.insert(column.clone(), keep.clone());
        }
        self.members.entry(keep).or_default().extend(moved);
        self.order.retain(|c| c != &merge);
    }

    /// Insert a column as a singleton class if absent; return its representative.
    fn insert(&mut self, column: &ColumnRef) -> ColumnRef {
        if let Some(rep) = self.representatives.get(column) {
            return rep.clone();
        }
        self.representatives.insert(column.clone(), column.clone());
        self.members.insert(column.clone(), vec![column.clone()]);
        self.order.push(column.clone());
        column.clone()
    }

    fn position(&self, representative: &ColumnRef) -> Option<usize> {
        self.order.iter().position(|c| c == representative)
    }

    /// The normal representative of `column`'s class.
    pub fn representative<'a>(&'a self, column: &'a ColumnRef) -> &'a ColumnRef {
        self.representatives.get(column).unwrap_or(column)
    }

    /// All members of `column`'s class. Never empty; a column that was never
    /// inserted is returned as a singleton.
    pub fn class_of(&self, column: &ColumnRef) -> Cow<'_, [ColumnRef]> {
        match self
            .representatives
            .get(column)
            .and_then(|rep| self.members.get(rep))
        {
            Some(members) => Cow::Borrowed(members.as_slice()),
            None => Cow::Owned(vec![column.clone()]),
        }
    }

    /// Whether `a` and `b` are known to be equal.
    pub fn are_equivalent(&self, a: &ColumnRef, b: &ColumnRef) -> bool {
        self.representative(a) == self.representative(b)
    }

    /// Non-trivial classes (two or more members), in creation order.
    pub fn classes(&self) -> impl Iterator<Item = &[ColumnRef]> {
        self.order
            .iter()
            .filter_map(|rep| self.members.get(rep))
            .filter(|members| members.len() > 1)
            .map(Vec::as_slice)
    }

    /// Whether there are no non-trivial classes.
    pub fn is_empty(&self) -> bool {
        self.classes().next().is_none()
    }

    /// Replace every column in `expr` by its class representative.
    pub fn normalize_expr(&self, expr: ScalarOperator) -> ScalarOperator {
        expr.transform(|e| {
            Ok(match e {
                ScalarOperator::Column(c) => match self.representatives.get(&c) {
                    Some(rep) if rep != &c => Transformed::yes(ScalarOperator::Column(rep.clone())),
                    _ => Transformed::no(ScalarOperator::Column(c)),
                },
                e => Transformed::no(e),
            })
        })
        .map(|t| t.data)
        // No chance of error since we never return Err
        .unwrap_or_else(|_| unreachable!())
    }
}

impl Display for EquivalenceClasses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]",
            self.classes()
                .map(|class| format!("{{{}}}", class.iter().join(", ")))
                .join(", ")
        )
    }
}

/// If `predicate` is `a = b` for two columns, return them.
pub(crate) fn as_column_equality(predicate: &ScalarOperator) -> Option<(&ColumnRef, &ColumnRef)> {
    match predicate {
        ScalarOperator::BinaryExpr(BinaryExpr {
            left,
            op: Operator::Eq,
            right,
        }) => match (left.as_ref(), right.as_ref()) {
            (ScalarOperator::Column(a), ScalarOperator::Column(b)) => Some((a, b)),
            _ => None,
        },
        _ => None,
    }
}
