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

/// Column and relation identity.
pub mod column;

/// Scalar and aggregate expressions.
pub mod expr;

use std::{
    fmt::{self, Display},
    sync::Arc,
};

use arrow_schema::DataType;
use datafusion_common::{
    plan_err,
    tree_node::{Transformed, TreeNode, TreeNodeRecursion},
    JoinType, ResolvedTableReference, Result,
};
use itertools::Itertools;

pub use column::{ColumnRef, ColumnRefFactory, RelationId};
pub use expr::{
    call, col, conjunction, lit, split_conjunction, AggregateCall, AggregateFunction, BinaryExpr,
    Cast, ScalarFunction, ScalarOperator,
};

/// A resolved logical plan over [`ColumnRef`]s.
///
/// Plans are immutable; children are shared behind [`Arc`]s so that
/// rewritten plans can reuse untouched subtrees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalPlan {
    /// Read a table
    Scan(Scan),
    /// Keep rows matching a predicate
    Filter(Filter),
    /// Compute new columns
    Projection(Projection),
    /// Join two inputs
    Join(Join),
    /// Group and aggregate
    Aggregate(Aggregate),
}

/// Table scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    /// The relation produced by this scan
    pub relation: RelationId,
    /// Fully qualified table name
    pub table: ResolvedTableReference,
    /// Output columns, all bound to `relation`
    pub columns: Vec<ColumnRef>,
    /// Filters pushed down into the scan
    pub filters: Vec<ScalarOperator>,
}

/// Filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    /// Input plan
    pub input: Arc<LogicalPlan>,
    /// Predicate over the input's columns
    pub predicate: ScalarOperator,
}

/// Projection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    /// Input plan
    pub input: Arc<LogicalPlan>,
    /// Output columns with their defining expressions
    pub exprs: Vec<(ColumnRef, ScalarOperator)>,
}

/// Join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    /// Left input
    pub left: Arc<LogicalPlan>,
    /// Right input
    pub right: Arc<LogicalPlan>,
    /// Join type. A cross join is an inner join without a condition.
    pub join_type: JoinType,
    /// Join condition
    pub on: Option<ScalarOperator>,
}

/// Aggregate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    /// Input plan
    pub input: Arc<LogicalPlan>,
    /// Grouping columns, passed through to the output
    pub group_by: Vec<ColumnRef>,
    /// Aggregate output columns with their calls
    pub aggregates: Vec<(ColumnRef, AggregateCall)>,
}

impl LogicalPlan {
    /// Columns produced by this plan, in order.
    pub fn output_columns(&self) -> Vec<ColumnRef> {
        match self {
            Self::Scan(scan) => scan.columns.clone(),
            Self::Filter(filter) => filter.input.output_columns(),
            Self::Projection(projection) => projection
                .exprs
                .iter()
                .map(|(c, _)| c.clone())
                .collect(),
            Self::Join(join) => {
                let mut columns = join.left.output_columns();
                columns.extend(join.right.output_columns());
                columns
            }
            Self::Aggregate(agg) => agg
                .group_by
                .iter()
                .cloned()
                .chain(agg.aggregates.iter().map(|(c, _)| c.clone()))
                .collect(),
        }
    }

    /// Direct inputs of this plan.
    pub fn inputs(&self) -> Vec<&LogicalPlan> {
        match self {
            Self::Scan(_) => vec![],
            Self::Filter(Filter { input, .. })
            | Self::Projection(Projection { input, .. })
            | Self::Aggregate(Aggregate { input, .. }) => vec![input.as_ref()],
            Self::Join(Join { left, right, .. }) => vec![left.as_ref(), right.as_ref()],
        }
    }

    /// All tables scanned by this plan, in scan order, without duplicates.
    pub fn referenced_tables(&self) -> Vec<ResolvedTableReference> {
        let mut tables: Vec<ResolvedTableReference> = vec![];
        self.apply(|plan| {
            if let Self::Scan(scan) = plan {
                if !tables.contains(&scan.table) {
                    tables.push(scan.table.clone());
                }
            }
            Ok(TreeNodeRecursion::Continue)
        })
        // the closure never fails
        .ok();
        tables
    }

    /// Display this plan as an indented tree, one node per line.
    pub fn display_indent(&self) -> impl Display + '_ {
        struct Indent<'a>(&'a LogicalPlan);

        impl Display for Indent<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fn fmt_node(
                    plan: &LogicalPlan,
                    depth: usize,
                    f: &mut fmt::Formatter<'_>,
                ) -> fmt::Result {
                    writeln!(f, "{:indent$}{plan}", "", indent = depth * 2)?;
                    plan.inputs()
                        .into_iter()
                        .try_for_each(|input| fmt_node(input, depth + 1, f))
                }

                fmt_node(self.0, 0, f)
            }
        }

        Indent(self)
    }
}

/// Displays only the top node of the plan; see [`LogicalPlan::display_indent`].
impl Display for LogicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan(scan) => {
                write!(f, "Scan: {} [{}]", scan.table, scan.columns.iter().join(", "))?;
                if !scan.filters.is_empty() {
                    write!(f, " filters=[{}]", scan.filters.iter().join(", "))?;
                }
                Ok(())
            }
            Self::Filter(filter) => write!(f, "Filter: {}", filter.predicate),
            Self::Projection(projection) => write!(
                f,
                "Projection: {}",
                projection
                    .exprs
                    .iter()
                    .map(|(c, e)| format!("{e} AS {c}"))
                    .join(", ")
            ),
            Self::Join(join) => {
                write!(f, "Join: {}", join.join_type)?;
                if let Some(on) = &join.on {
                    write!(f, " on={on}")?;
                }
                Ok(())
            }
            Self::Aggregate(agg) => write!(
                f,
                "Aggregate: group_by=[{}] aggregates=[{}]",
                agg.group_by.iter().join(", "),
                agg.aggregates
                    .iter()
                    .map(|(c, call)| format!("{call} AS {c}"))
                    .join(", ")
            ),
        }
    }
}

impl TreeNode for LogicalPlan {
    fn apply_children<'n, F: FnMut(&'n Self) -> Result<TreeNodeRecursion>>(
        &'n self,
        mut f: F,
    ) -> Result<TreeNodeRecursion> {
        let mut tnr = TreeNodeRecursion::Continue;
        for input in self.inputs() {
            tnr = f(input)?;
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
        let mut map_input = |input: Arc<LogicalPlan>| -> Result<Transformed<Arc<LogicalPlan>>> {
            Ok(f(Arc::unwrap_or_clone(input))?.update_data(Arc::new))
        };

        Ok(match self {
            Self::Scan(_) => Transformed::no(self),
            Self::Filter(Filter { input, predicate }) => map_input(input)?
                .update_data(|input| Self::Filter(Filter { input, predicate })),
            Self::Projection(Projection { input, exprs }) => map_input(input)?
                .update_data(|input| Self::Projection(Projection { input, exprs })),
            Self::Aggregate(Aggregate {
                input,
                group_by,
                aggregates,
            }) => map_input(input)?.update_data(|input| {
                Self::Aggregate(Aggregate {
                    input,
                    group_by,
                    aggregates,
                })
            }),
            Self::Join(Join {
                left,
                right,
                join_type,
                on,
            }) => {
                let left = map_input(left)?;
                if left.tnr == TreeNodeRecursion::Stop {
                    let transformed = left.transformed;
                    return Ok(Transformed::new(
                        Self::Join(Join {
                            left: left.data,
                            right,
                            join_type,
                            on,
                        }),
                        transformed,
                        TreeNodeRecursion::Stop,
                    ));
                }
                let right = map_input(right)?;
                Transformed::new(
                    Self::Join(Join {
                        left: left.data,
                        right: right.data,
                        join_type,
                        on,
                    }),
                    left.transformed || right.transformed,
                    right.tnr,
                )
            }
        })
    }
}

/// Builds [`LogicalPlan`]s while minting new columns from a [`ColumnRefFactory`].
///
/// This is how analyzers (and tests) construct plans; columns can be looked
/// up by name from the plan under construction with [`PlanBuilder::column`].
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    plan: LogicalPlan,
}

impl PlanBuilder {
    /// Start from an existing plan.
    pub fn from(plan: LogicalPlan) -> Self {
        Self { plan }
    }

    /// Scan `table`, creating a new relation with the given columns.
    pub fn scan(
        factory: &mut ColumnRefFactory,
        table: ResolvedTableReference,
        columns: &[(&str, DataType)],
    ) -> Result<Self> {
        let relation = factory.create_relation();
        let columns = columns
            .iter()
            .map(|(name, data_type)| {
                factory.create_relation_column(relation, *name, data_type.clone(), true)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            plan: LogicalPlan::Scan(Scan {
                relation,
                table,
                columns,
                filters: vec![],
            }),
        })
    }

    /// Find an output column of the plan built so far by (case-insensitive) name.
    pub fn column(&self, name: &str) -> Result<ColumnRef> {
        let matches = self
            .plan
            .output_columns()
            .into_iter()
            .filter(|c| c.name().eq_ignore_ascii_case(name))
            .collect_vec();

        match matches.as_slice() {
            [column] => Ok(column.clone()),
            [] => plan_err!("no column named {name} in plan output"),
            _ => plan_err!("column name {name} is ambiguous in plan output"),
        }
    }

    /// Shorthand for `col(&self.column(name)?)`.
    pub fn col(&self, name: &str) -> Result<ScalarOperator> {
        self.column(name).map(ScalarOperator::Column)
    }

    /// Add a filter on top of the plan.
    pub fn filter(self, predicate: ScalarOperator) -> Self {
        Self {
            plan: LogicalPlan::Filter(Filter {
                input: Arc::new(self.plan),
                predicate,
            }),
        }
    }

    /// Project named expressions. Bare column references keep their identity;
    /// every other expression gets a fresh output column.
    pub fn project(
        self,
        factory: &mut ColumnRefFactory,
        exprs: Vec<(&str, ScalarOperator)>,
    ) -> Result<Self> {
        let input_columns = self.plan.output_columns();
        let exprs = exprs
            .into_iter()
            .map(|(name, expr)| {
                let column = match &expr {
                    ScalarOperator::Column(c)
                        if c.name().eq_ignore_ascii_case(name) && input_columns.contains(c) =>
                    {
                        c.clone()
                    }
                    _ => factory.create_column(name, infer_type(&expr)?, true),
                };
                Ok((column, expr))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            plan: LogicalPlan::Projection(Projection {
                input: Arc::new(self.plan),
                exprs,
            }),
        })
    }

    /// Join with another plan.
    pub fn join(
        self,
        right: LogicalPlan,
        join_type: JoinType,
        on: Option<ScalarOperator>,
    ) -> Self {
        Self {
            plan: LogicalPlan::Join(Join {
                left: Arc::new(self.plan),
                right: Arc::new(right),
                join_type,
                on,
            }),
        }
    }

    /// Group by the named output columns and compute named aggregates.
    pub fn aggregate(
        self,
        factory: &mut ColumnRefFactory,
        group_by: &[&str],
        aggregates: Vec<(&str, AggregateCall)>,
    ) -> Result<Self> {
        let group_by = group_by
            .iter()
            .map(|name| self.column(name))
            .collect::<Result<Vec<_>>>()?;
        let aggregates = aggregates
            .into_iter()
            .map(|(name, call)| {
                let data_type = aggregate_type(&call)?;
                Ok((factory.create_column(name, data_type, true), call))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            plan: LogicalPlan::Aggregate(Aggregate {
                input: Arc::new(self.plan),
                group_by,
                aggregates,
            }),
        })
    }

    /// Finish building.
    pub fn build(self) -> LogicalPlan {
        self.plan
    }
}

/// Best-effort result type of an expression, used when minting projection columns.
pub fn infer_type(expr: &ScalarOperator) -> Result<DataType> {
    use datafusion_expr::Operator;

    Ok(match expr {
        ScalarOperator::Column(c) => c.data_type().clone(),
        ScalarOperator::Literal(v) => v.data_type(),
        ScalarOperator::Cast(cast) => cast.data_type.clone(),
        ScalarOperator::Not(_) | ScalarOperator::IsNull(_) | ScalarOperator::IsNotNull(_) => {
            DataType::Boolean
        }
        ScalarOperator::BinaryExpr(BinaryExpr { left, op, .. }) => match op {
            Operator::Plus
            | Operator::Minus
            | Operator::Multiply
            | Operator::Divide
            | Operator::Modulo => infer_type(left)?,
            _ => DataType::Boolean,
        },
        ScalarOperator::ScalarFunction(ScalarFunction { name, args }) => match name.as_str() {
            "date_trunc" | "time_slice" => match args.get(1) {
                Some(arg) => infer_type(arg)?,
                None => return plan_err!("{name} expects two arguments"),
            },
            "concat" | "lower" | "upper" | "substr" => DataType::Utf8,
            _ => match args.first() {
                Some(arg) => infer_type(arg)?,
                None => return plan_err!("cannot infer result type of {name}()"),
            },
        },
    })
}

/// Result type of an aggregate call.
pub fn aggregate_type(call: &AggregateCall) -> Result<DataType> {
    let arg_type = match call.args.first() {
        Some(arg) => Some(infer_type(arg)?),
        None => None,
    };

    Ok(match (call.func, arg_type) {
        (AggregateFunction::Count, _) => DataType::Int64,
        (AggregateFunction::Avg, _) => DataType::Float64,
        (AggregateFunction::Sum, Some(t)) if t.is_signed_integer() => DataType::Int64,
        (AggregateFunction::Sum, Some(t)) if t.is_unsigned_integer() => DataType::UInt64,
        (AggregateFunction::Sum, Some(t)) if t.is_floating() => DataType::Float64,
        (_, Some(t)) => t,
        (func, None) => return plan_err!("{func} requires an argument"),
    })
}
