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
    collections::BTreeSet,
    fmt::{self, Display},
};

use arrow_schema::DataType;
use datafusion_common::{
    tree_node::{Transformed, TreeNode, TreeNodeRecursion},
    Result, ScalarValue,
};
use datafusion_expr::Operator;
use itertools::Itertools;

use super::column::ColumnRef;

/// A scalar expression over [`ColumnRef`]s.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarOperator {
    /// A column reference
    Column(ColumnRef),
    /// A constant value
    Literal(ScalarValue),
    /// `left op right`
    BinaryExpr(BinaryExpr),
    /// Logical negation
    Not(Box<ScalarOperator>),
    /// `expr IS NULL`
    IsNull(Box<ScalarOperator>),
    /// `expr IS NOT NULL`
    IsNotNull(Box<ScalarOperator>),
    /// `CAST(expr AS data_type)`
    Cast(Cast),
    /// A call to a deterministic scalar function, e.g. `concat` or `date_trunc`
    ScalarFunction(ScalarFunction),
}

/// Binary expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinaryExpr {
    /// Left-hand side
    pub left: Box<ScalarOperator>,
    /// Operator
    pub op: Operator,
    /// Right-hand side
    pub right: Box<ScalarOperator>,
}

/// Cast expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cast {
    /// Expression being cast
    pub expr: Box<ScalarOperator>,
    /// Target type
    pub data_type: DataType,
}

/// Scalar function call, identified by lowercase name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScalarFunction {
    /// Function name
    pub name: String,
    /// Arguments
    pub args: Vec<ScalarOperator>,
}

/// Shorthand for a column reference expression.
pub fn col(column: &ColumnRef) -> ScalarOperator {
    ScalarOperator::Column(column.clone())
}

/// Shorthand for a literal expression.
pub fn lit(value: impl Into<ScalarValue>) -> ScalarOperator {
    ScalarOperator::Literal(value.into())
}

/// Shorthand for a scalar function call.
pub fn call(name: impl Into<String>, args: Vec<ScalarOperator>) -> ScalarOperator {
    ScalarOperator::ScalarFunction(ScalarFunction {
        name: name.into().to_lowercase(),
        args,
    })
}

impl ScalarOperator {
    /// Build `self op other`.
    pub fn binary(self, op: Operator, other: ScalarOperator) -> Self {
        Self::BinaryExpr(BinaryExpr {
            left: Box::new(self),
            op,
            right: Box::new(other),
        })
    }

    /// `self = other`
    pub fn eq(self, other: ScalarOperator) -> Self {
        self.binary(Operator::Eq, other)
    }

    /// `self >= other`
    pub fn gt_eq(self, other: ScalarOperator) -> Self {
        self.binary(Operator::GtEq, other)
    }

    /// `self > other`
    pub fn gt(self, other: ScalarOperator) -> Self {
        self.binary(Operator::Gt, other)
    }

    /// `self <= other`
    pub fn lt_eq(self, other: ScalarOperator) -> Self {
        self.binary(Operator::LtEq, other)
    }

    /// `self < other`
    pub fn lt(self, other: ScalarOperator) -> Self {
        self.binary(Operator::Lt, other)
    }

    /// `self AND other`
    pub fn and(self, other: ScalarOperator) -> Self {
        self.binary(Operator::And, other)
    }

    /// `self OR other`
    pub fn or(self, other: ScalarOperator) -> Self {
        self.binary(Operator::Or, other)
    }

    /// `self IS NULL`
    pub fn is_null(self) -> Self {
        Self::IsNull(Box::new(self))
    }

    /// `self IS NOT NULL`
    pub fn is_not_null(self) -> Self {
        Self::IsNotNull(Box::new(self))
    }

    /// `CAST(self AS data_type)`
    pub fn cast_to(self, data_type: DataType) -> Self {
        Self::Cast(Cast {
            expr: Box::new(self),
            data_type,
        })
    }

    /// If this is a bare column reference, return it.
    pub fn as_column(&self) -> Option<&ColumnRef> {
        match self {
            Self::Column(c) => Some(c),
            _ => None,
        }
    }

    /// The set of distinct columns referenced anywhere in this expression.
    pub fn column_refs(&self) -> BTreeSet<&ColumnRef> {
        let mut columns = BTreeSet::new();
        self.apply(|expr| {
            if let Self::Column(c) = expr {
                columns.insert(c);
            }
            Ok(TreeNodeRecursion::Continue)
        })
        // the closure never fails
        .ok();
        columns
    }

    fn children(&self) -> Vec<&ScalarOperator> {
        match self {
            Self::Column(_) | Self::Literal(_) => vec![],
            Self::BinaryExpr(BinaryExpr { left, right, .. }) => vec![left, right],
            Self::Not(e) | Self::IsNull(e) | Self::IsNotNull(e) => vec![e],
            Self::Cast(Cast { expr, .. }) => vec![expr],
            Self::ScalarFunction(ScalarFunction { args, .. }) => args.iter().collect(),
        }
    }
}

impl TreeNode for ScalarOperator {
    fn apply_children<'n, F: FnMut(&'n Self) -> Result<TreeNodeRecursion>>(
        &'n self,
        mut f: F,
    ) -> Result<TreeNodeRecursion> {
        let mut tnr = TreeNodeRecursion::Continue;
        for child in self.children() {
            tnr = f(child)?;
            if tnr == TreeNodeRecursion::Stop {
                break;
            }
        }
        Ok(tnr)
    }

    fn map_children<F: FnMut(Self) -> Result<Transformed<Self>>>(
        self,
        mut f: F,
    ) -> Result<Transformed<Self>> {
        Ok(match self {
            Self::Column(_) | Self::Literal(_) => Transformed::no(self),
            Self::BinaryExpr(BinaryExpr { left, op, right }) => {
                let left = f(*left)?;
                if left.tnr == TreeNodeRecursion::Stop {
                    let transformed = left.transformed;
                    return Ok(Transformed::new(
                        left.data.binary(op, *right),
                        transformed,
                        TreeNodeRecursion::Stop,
                    ));
                }
                let right = f(*right)?;
                Transformed::new(
                    left.data.binary(op, right.data),
                    left.transformed || right.transformed,
                    right.tnr,
                )
            }
            Self::Not(e) => f(*e)?.update_data(|e| Self::Not(Box::new(e))),
            Self::IsNull(e) => f(*e)?.update_data(|e| Self::IsNull(Box::new(e))),
            Self::IsNotNull(e) => f(*e)?.update_data(|e| Self::IsNotNull(Box::new(e))),
            Self::Cast(Cast { expr, data_type }) => {
                f(*expr)?.update_data(|e| e.cast_to(data_type))
            }
            Self::ScalarFunction(ScalarFunction { name, args }) => {
                map_until_stop(args, f)?.update_data(|args| Self::ScalarFunction(ScalarFunction { name, args }))
            }
        })
    }
}

/// Apply `f` to every item until one of them asks to stop,
/// collecting the (possibly transformed) items.
pub(crate) fn map_until_stop<T, F: FnMut(T) -> Result<Transformed<T>>>(
    items: Vec<T>,
    mut f: F,
) -> Result<Transformed<Vec<T>>> {
    let mut tnr = TreeNodeRecursion::Continue;
    let mut transformed = false;
    let mut data = Vec::with_capacity(items.len());
    for item in items {
        if tnr == TreeNodeRecursion::Stop {
            data.push(item);
            continue;
        }
        let result = f(item)?;
        tnr = result.tnr;
        transformed |= result.transformed;
        data.push(result.data);
    }
    Ok(Transformed::new(data, transformed, tnr))
}

impl Display for ScalarOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(c) => write!(f, "{c}"),
            Self::Literal(v) => write!(f, "{v:?}"),
            Self::BinaryExpr(BinaryExpr { left, op, right }) => {
                write!(f, "({left} {op} {right})")
            }
            Self::Not(e) => write!(f, "NOT {e}"),
            Self::IsNull(e) => write!(f, "{e} IS NULL"),
            Self::IsNotNull(e) => write!(f, "{e} IS NOT NULL"),
            Self::Cast(Cast { expr, data_type }) => write!(f, "CAST({expr} AS {data_type})"),
            Self::ScalarFunction(ScalarFunction { name, args }) => {
                write!(f, "{name}({})", args.iter().join(", "))
            }
        }
    }
}

/// Split a predicate into its top-level conjuncts.
pub fn split_conjunction(expr: &ScalarOperator) -> Vec<&ScalarOperator> {
    fn split<'a>(expr: &'a ScalarOperator, acc: &mut Vec<&'a ScalarOperator>) {
        match expr {
            ScalarOperator::BinaryExpr(BinaryExpr {
                left,
                op: Operator::And,
                right,
            }) => {
                split(left, acc);
                split(right, acc);
            }
            other => acc.push(other),
        }
    }

    let mut acc = vec![];
    split(expr, &mut acc);
    acc
}

/// Combine predicates with `AND`. Returns `None` when there are none.
pub fn conjunction(exprs: impl IntoIterator<Item = ScalarOperator>) -> Option<ScalarOperator> {
    exprs.into_iter().reduce(ScalarOperator::and)
}

/// Aggregate functions supported by materialized view rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    /// `SUM`
    Sum,
    /// `COUNT`; `COUNT(*)` is a count with no arguments
    Count,
    /// `MIN`
    Min,
    /// `MAX`
    Max,
    /// `AVG`
    Avg,
}

impl AggregateFunction {
    /// The function that combines partial results of this function,
    /// if partial results can be combined at all.
    pub fn rollup(&self) -> Option<AggregateFunction> {
        match self {
            Self::Sum | Self::Count => Some(Self::Sum),
            Self::Min => Some(Self::Min),
            Self::Max => Some(Self::Max),
            Self::Avg => None,
        }
    }
}

impl Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
        })
    }
}

/// A call to an aggregate function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateCall {
    /// The function
    pub func: AggregateFunction,
    /// Arguments; empty for `COUNT(*)`
    pub args: Vec<ScalarOperator>,
    /// Whether this is a `DISTINCT` aggregate
    pub distinct: bool,
}

impl AggregateCall {
    /// A non-distinct aggregate call.
    pub fn new(func: AggregateFunction, args: Vec<ScalarOperator>) -> Self {
        Self {
            func,
            args,
            distinct: false,
        }
    }

    /// Rewrite every argument with `f`.
    pub fn map_args(
        self,
        f: impl FnMut(ScalarOperator) -> Result<ScalarOperator>,
    ) -> Result<Self> {
        Ok(Self {
            args: self.args.into_iter().map(f).collect::<Result<_>>()?,
            ..self
        })
    }
}

impl Display for AggregateCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let distinct = if self.distinct { "DISTINCT " } else { "" };
        if self.args.is_empty() {
            write!(f, "{}({distinct}*)", self.func)
        } else {
            write!(f, "{}({distinct}{})", self.func, self.args.iter().join(", "))
        }
    }
}

#[cfg(test)]
mod test {
    use arrow_schema::DataType;
    use datafusion_common::{
        tree_node::{Transformed, TransformedResult, TreeNode},
        Result,
    };

    use super::{call, col, conjunction, lit, split_conjunction, ScalarOperator};
    use crate::plan::ColumnRefFactory;

    #[test]
    fn split_and_join_conjunctions() {
        let mut factory = ColumnRefFactory::new();
        let a = factory.create_column("a", DataType::Int32, true);
        let b = factory.create_column("b", DataType::Int32, true);

        let predicate = col(&a)
            .gt(lit(1))
            .and(col(&b).eq(col(&a)).and(col(&b).is_not_null()));
        let conjuncts = split_conjunction(&predicate);
        assert_eq!(conjuncts.len(), 3);
        assert_eq!(conjuncts[0], &col(&a).gt(lit(1)));

        let rebuilt = conjunction(conjuncts.into_iter().cloned()).unwrap();
        assert_eq!(split_conjunction(&rebuilt).len(), 3);
        assert_eq!(conjunction(vec![]), None);
    }

    #[test]
    fn transform_replaces_columns_everywhere() -> Result<()> {
        let mut factory = ColumnRefFactory::new();
        let a = factory.create_column("a", DataType::Utf8, true);
        let b = factory.create_column("b", DataType::Utf8, true);

        let expr = call("concat", vec![col(&a), lit("x"), col(&a)]).is_null();
        let rewritten = expr
            .clone()
            .transform(|e| {
                Ok(match e {
                    ScalarOperator::Column(c) if c == a => Transformed::yes(col(&b)),
                    e => Transformed::no(e),
                })
            })
            .data()?;

        assert_eq!(
            rewritten,
            call("concat", vec![col(&b), lit("x"), col(&b)]).is_null()
        );
        assert_eq!(
            rewritten.column_refs().into_iter().cloned().collect::<Vec<_>>(),
            vec![b.clone()]
        );
        assert_eq!(expr.to_string(), "concat(a#1, Utf8(\"x\"), a#1) IS NULL");

        Ok(())
    }
}
