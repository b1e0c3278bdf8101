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

Rewriting a query against a single materialized view.

[`rewrite_candidate`] moves through the stages of [`RewriteStage`] and either produces a
[`CandidateRewrite`], a plan that scans the materialized view instead of the base tables,
or a [`Rejection`] naming the stage and the reason it failed. Rejections are ordinary
values: the caller simply falls back to the original plan.

The rewritten plan has the shape

```text
Projection: <query outputs>
  [Filter: <having>]
    [Aggregate: <query grouping>, <re-aggregated calls>]
      [Projection: <grouping expressions>]
        [Filter: <compensating predicates>]
          Scan: <materialized view>
```

and outputs the same [`ColumnRef`]s as the original query.

*/

use std::{
    collections::BTreeSet,
    fmt::{self, Display},
    sync::Arc,
};

use datafusion_common::{
    tree_node::{Transformed, TreeNode, TreeNodeRewriter},
    DataFusionError, ResolvedTableReference, Result,
};
use datafusion_expr::interval_arithmetic::Interval;
use itertools::Itertools;

use super::{
    column_rewriter::{ColumnRewriter, Equivalences, RewriteOptions},
    context::RewriteContext,
    mapping::MatchFailure,
    normal_form::{AggregateInfo, SpjgNormalForm},
    RewriteConfig,
};
use crate::plan::{
    col, conjunction, Aggregate, AggregateCall, ColumnRef, ColumnRefFactory, Filter, LogicalPlan,
    PlanBuilder, Projection, ScalarFunction, ScalarOperator,
};

/// Stages of a rewrite attempt, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RewriteStage {
    /// Every query relation is paired with a view relation
    MatchedRelations,
    /// The view's predicate is implied by the query's, up to compensating predicates
    PredicatesCompensated,
    /// Every query output is expressed over the view's outputs
    OutputRewritten,
    /// The view is usable: active, enabled and fresh enough
    Accepted,
}

/// Why a rewrite attempt was rejected.
#[derive(Debug)]
pub enum RejectReason {
    /// The relations of the query and view could not be paired
    NoStructuralCorrespondence(MatchFailure),
    /// The view filters out rows the query needs
    PredicateNotImplied,
    /// A compensating predicate references something the view doesn't output
    ResidualNotExpressible,
    /// A query output can't be computed from the view's outputs
    OutputNotExpressible(String),
    /// The aggregations of query and view are incompatible
    AggregateShapeMismatch(String),
    /// The materialized view is inactive
    Inactive,
    /// The query reads stale partitions of the materialized view
    Stale(Vec<String>),
    /// The plan has a shape that can't be analyzed
    UnsupportedPlan(String),
    /// The materialized view is not enabled for query rewriting
    DisabledForRewrite,
    /// An unexpected error
    Internal(DataFusionError),
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoStructuralCorrespondence(failure) => {
                write!(f, "no structural correspondence: {failure}")
            }
            Self::PredicateNotImplied => write!(f, "view predicate not implied by query"),
            Self::ResidualNotExpressible => {
                write!(f, "compensating predicate not expressible over view outputs")
            }
            Self::OutputNotExpressible(output) => {
                write!(f, "output {output} not expressible over view outputs")
            }
            Self::AggregateShapeMismatch(reason) => write!(f, "aggregate mismatch: {reason}"),
            Self::Inactive => write!(f, "materialized view is inactive"),
            Self::Stale(partitions) => {
                write!(f, "query reads stale partitions [{}]", partitions.join(", "))
            }
            Self::UnsupportedPlan(reason) => write!(f, "unsupported plan: {reason}"),
            Self::DisabledForRewrite => write!(f, "materialized view not enabled for query rewrite"),
            Self::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl From<DataFusionError> for RejectReason {
    fn from(e: DataFusionError) -> Self {
        match e {
            DataFusionError::NotImplemented(reason) => Self::UnsupportedPlan(reason),
            e => Self::Internal(e),
        }
    }
}

/// A rejected rewrite attempt.
#[derive(Debug)]
pub struct Rejection {
    /// The stage that could not be reached
    pub stage: RewriteStage,
    /// Why
    pub reason: RejectReason,
}

impl Rejection {
    /// Reject at `stage`.
    pub fn new(stage: RewriteStage, reason: RejectReason) -> Self {
        Self { stage, reason }
    }
}

impl Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rejected before {:?}: {}", self.stage, self.reason)
    }
}

trait RejectAt<T> {
    fn reject_at(self, stage: RewriteStage) -> Result<T, Rejection>;
}

impl<T> RejectAt<T> for Result<T, DataFusionError> {
    fn reject_at(self, stage: RewriteStage) -> Result<T, Rejection> {
        self.map_err(|e| Rejection::new(stage, e.into()))
    }
}

impl<T> RejectAt<T> for Result<T, RejectReason> {
    fn reject_at(self, stage: RewriteStage) -> Result<T, Rejection> {
        self.map_err(|reason| Rejection::new(stage, reason))
    }
}

/// The definition of a materialized view, as needed to rewrite against it.
#[derive(Debug, Clone, Copy)]
pub struct ViewDefinition<'a> {
    /// Name of the materialized view; the rewritten plan scans this table
    pub name: &'a ResolvedTableReference,
    /// The defining plan
    pub plan: &'a LogicalPlan,
    /// The factory `plan` was built with
    pub factory: &'a ColumnRefFactory,
    /// The output column the view is partitioned by, if any
    pub partition_column: Option<&'a str>,
}

/// Which partitions of the materialized view a rewritten plan may read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionScope {
    /// Any partition
    All,
    /// None; the query's predicate on the partition column is unsatisfiable
    Nothing,
    /// Partitions intersecting this range of the partition column
    Range(Interval),
}

/// A successful rewrite against one materialized view.
#[derive(Debug, Clone)]
pub struct CandidateRewrite {
    /// The rewritten plan
    pub plan: LogicalPlan,
    /// The query factory, extended with the columns of the materialized view scan
    pub factory: ColumnRefFactory,
    /// Number of compensating predicates applied on top of the view
    pub compensations: usize,
    /// Partitions of the view that `plan` reads
    pub partition_scope: PartitionScope,
}

/// Try to rewrite `query` as a plan over the materialized view `view`.
pub fn rewrite_candidate(
    query: &LogicalPlan,
    query_factory: &ColumnRefFactory,
    view: &ViewDefinition<'_>,
    config: &RewriteConfig,
) -> Result<CandidateRewrite, Rejection> {
    let stage = RewriteStage::MatchedRelations;

    // analysis may register opaque relations, so work on copies
    let mut query_factory = query_factory.clone();
    let mut view_factory = view.factory.clone();
    let query_normal_form = SpjgNormalForm::new(query, &mut query_factory).reject_at(stage)?;
    let view_normal_form = SpjgNormalForm::new(view.plan, &mut view_factory).reject_at(stage)?;

    match (query_normal_form.aggregate(), view_normal_form.aggregate()) {
        (_, Some(view_aggregate)) if !view_aggregate.having.is_empty() => {
            return Err(Rejection::new(
                stage,
                RejectReason::UnsupportedPlan("view has a HAVING clause".to_string()),
            ))
        }
        (None, Some(_)) => {
            return Err(Rejection::new(
                stage,
                RejectReason::AggregateShapeMismatch(
                    "view aggregates but query does not".to_string(),
                ),
            ))
        }
        _ => {}
    }

    let query_outputs = query_normal_form
        .output_columns()
        .iter()
        .cloned()
        .zip(query_normal_form.output_exprs().iter().cloned())
        .collect_vec();
    let query_aggregate = query_normal_form.aggregate().cloned();

    let mut context =
        RewriteContext::try_new(query_normal_form, query_factory, view_normal_form, view_factory)
            .reject_at(stage)?;

    log::trace!("matched relations of {}", view.name);

    // one scan column per view output
    let view_output_columns = context.view().output_columns().to_vec();
    let scan_columns = view_output_columns
        .iter()
        .map(|c| (c.name(), c.data_type().clone()))
        .collect_vec();
    let mv_scan = PlanBuilder::scan(context.query_factory_mut(), view.name.clone(), &scan_columns)
        .reject_at(stage)?
        .build();

    let stage = RewriteStage::PredicatesCompensated;
    let rewriter = ColumnRewriter::new(&context);

    // Check the subsumption tests, and compute any auxiliary needed filter expressions.
    // If we pass all three subsumption tests, the query's rows are a subset of the view's rows.
    let query_predicate = context.query_predicate();
    let view_predicate = context.view_predicate();
    let equijoin_filters = query_predicate
        .equijoin_subsumption_test(view_predicate)
        .ok_or(RejectReason::PredicateNotImplied)
        .reject_at(stage)?;
    let range_filters = query_predicate
        .range_subsumption_test(view_predicate)
        .reject_at(stage)?
        .ok_or(RejectReason::PredicateNotImplied)
        .reject_at(stage)?;
    let residual_filters = query_predicate
        .residual_subsumption_test(view_predicate, |e| {
            rewriter.rewrite(e, RewriteOptions::normalize(Equivalences::Query))
        })
        .ok_or(RejectReason::PredicateNotImplied)
        .reject_at(stage)?;

    log::trace!("passed subsumption tests");

    let outputs = ViewOutputs::new(&context, &rewriter, mv_scan.output_columns());
    let compensations = equijoin_filters
        .into_iter()
        .chain(range_filters)
        .chain(residual_filters)
        .map(|filter| outputs.express(&filter, &rewriter))
        .collect::<Option<Vec<_>>>()
        .ok_or(RejectReason::ResidualNotExpressible)
        .reject_at(stage)?;
    let num_compensations = compensations.len();

    let stage = RewriteStage::OutputRewritten;
    let partition_scope =
        partition_scope(&context, &rewriter, view.partition_column).reject_at(stage)?;

    let mut input = mv_scan;
    if let Some(predicate) = conjunction(compensations) {
        input = LogicalPlan::Filter(Filter {
            input: Arc::new(input),
            predicate,
        });
    }

    let plan = match query_aggregate {
        None => {
            let exprs = query_outputs
                .into_iter()
                .map(|(column, expr)| match outputs.express(&expr, &rewriter) {
                    Some(expr) => Ok((column, expr)),
                    None => Err(not_expressible(&rewriter, &column, &expr)),
                })
                .collect::<Result<Vec<_>, _>>()
                .reject_at(stage)?;

            LogicalPlan::Projection(Projection {
                input: Arc::new(input),
                exprs,
            })
        }
        Some(query_aggregate) => {
            let aggregated = if context.view().aggregate().is_some() {
                rewrite_over_aggregate_view(input, &query_aggregate, &outputs, &rewriter, config)
            } else {
                rewrite_over_spj_view(input, &query_aggregate, &outputs, &rewriter)
            }
            .reject_at(stage)?;

            let mut plan = aggregated;
            if let Some(predicate) = conjunction(query_aggregate.having.iter().cloned()) {
                plan = LogicalPlan::Filter(Filter {
                    input: Arc::new(plan),
                    predicate,
                });
            }
            LogicalPlan::Projection(Projection {
                input: Arc::new(plan),
                exprs: query_outputs,
            })
        }
    };

    log::trace!("passed output rewrite against {}", view.name);

    Ok(CandidateRewrite {
        plan,
        factory: context.into_query_factory(),
        compensations: num_compensations,
        partition_scope,
    })
}

fn not_expressible(
    rewriter: &ColumnRewriter<'_>,
    column: &ColumnRef,
    expr: &ScalarOperator,
) -> RejectReason {
    log::debug!(
        "query output {column} := {expr} is not produced by the view (in view space: {})",
        rewriter
            .rewrite_query_to_view(Some(expr))
            .map(|e| e.to_string())
            .unwrap_or_default()
    );
    RejectReason::OutputNotExpressible(column.to_string())
}

/// Re-aggregate the rows of a view that doesn't aggregate.
fn rewrite_over_spj_view(
    input: LogicalPlan,
    query_aggregate: &AggregateInfo,
    outputs: &ViewOutputs,
    rewriter: &ColumnRewriter<'_>,
) -> Result<LogicalPlan, RejectReason> {
    let groups = express_groups(query_aggregate, outputs, rewriter)?;
    let aggregates = query_aggregate
        .aggregates
        .iter()
        .map(|(column, call)| {
            let args = call
                .args
                .iter()
                .map(|arg| outputs.express(arg, rewriter))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| RejectReason::OutputNotExpressible(column.to_string()))?;
            Ok((
                column.clone(),
                AggregateCall {
                    args,
                    ..call.clone()
                },
            ))
        })
        .collect::<Result<Vec<_>, RejectReason>>()?;

    Ok(aggregate_over(input, groups, aggregates))
}

/// Answer an aggregate query from a view that already aggregates,
/// either directly or by rolling the view's aggregates up to a coarser grouping.
fn rewrite_over_aggregate_view(
    input: LogicalPlan,
    query_aggregate: &AggregateInfo,
    outputs: &ViewOutputs,
    rewriter: &ColumnRewriter<'_>,
    config: &RewriteConfig,
) -> Result<LogicalPlan, RejectReason> {
    let groups = express_groups(query_aggregate, outputs, rewriter)?;

    // The groupings are identical if every view grouping key is also a query grouping expression.
    let exact = outputs
        .group_keys()
        .all(|key| groups.iter().any(|(_, expr)| expr.as_column() == Some(key)));

    let calls = query_aggregate
        .aggregates
        .iter()
        .map(|(column, call)| {
            let normalized = call.clone().map_args(|arg| {
                Ok(rewriter.rewrite(&arg, RewriteOptions::normalize(Equivalences::QueryBasedView)))
            })?;
            Ok((column, normalized))
        })
        .collect::<Result<Vec<_>>>()?;

    if exact {
        log::trace!("view grouping matches query grouping");
        let mut exprs = groups;
        for (column, call) in calls {
            let mv_column = outputs.aggregate(&call).ok_or_else(|| {
                RejectReason::AggregateShapeMismatch(format!("view does not compute {call}"))
            })?;
            exprs.push((column.clone(), col(mv_column)));
        }
        return Ok(LogicalPlan::Projection(Projection {
            input: Arc::new(input),
            exprs,
        }));
    }

    if !config.enable_aggregate_rollup {
        return Err(RejectReason::AggregateShapeMismatch(
            "query grouping is coarser than the view's and rollup is disabled".to_string(),
        ));
    }

    log::trace!("rolling up view aggregates");
    let aggregates = calls
        .into_iter()
        .map(|(column, call)| {
            let mv_column = outputs.aggregate(&call).ok_or_else(|| {
                RejectReason::AggregateShapeMismatch(format!("view does not compute {call}"))
            })?;
            let rollup = call.func.rollup().filter(|_| !call.distinct).ok_or_else(|| {
                RejectReason::AggregateShapeMismatch(format!("{call} cannot be rolled up"))
            })?;
            Ok((column.clone(), AggregateCall::new(rollup, vec![col(mv_column)])))
        })
        .collect::<Result<Vec<_>, RejectReason>>()?;

    Ok(aggregate_over(input, groups, aggregates))
}

/// Express each query grouping column over the view's outputs.
fn express_groups(
    query_aggregate: &AggregateInfo,
    outputs: &ViewOutputs,
    rewriter: &ColumnRewriter<'_>,
) -> Result<Vec<(ColumnRef, ScalarOperator)>, RejectReason> {
    query_aggregate
        .group_columns
        .iter()
        .zip(&query_aggregate.group_exprs)
        .map(|(column, expr)| match outputs.express(expr, rewriter) {
            Some(expr) => Ok((column.clone(), expr)),
            None => Err(not_expressible(rewriter, column, expr)),
        })
        .collect()
}

/// `Aggregate(Projection(input))`, where the projection computes the grouping
/// columns and passes through every column the aggregate calls read.
fn aggregate_over(
    input: LogicalPlan,
    groups: Vec<(ColumnRef, ScalarOperator)>,
    aggregates: Vec<(ColumnRef, AggregateCall)>,
) -> LogicalPlan {
    let group_by = groups.iter().map(|(c, _)| c.clone()).collect_vec();
    let passthrough = aggregates
        .iter()
        .flat_map(|(_, call)| call.args.iter().flat_map(|arg| arg.column_refs()))
        .cloned()
        .collect::<BTreeSet<_>>();

    let mut exprs = groups;
    exprs.extend(passthrough.into_iter().map(|c| {
        let expr = col(&c);
        (c, expr)
    }));

    LogicalPlan::Aggregate(Aggregate {
        input: Arc::new(LogicalPlan::Projection(Projection {
            input: Arc::new(input),
            exprs,
        })),
        group_by,
        aggregates,
    })
}

/// The range of the view's partition column that the query reads.
fn partition_scope(
    context: &RewriteContext,
    rewriter: &ColumnRewriter<'_>,
    partition_column: Option<&str>,
) -> Result<PartitionScope, RejectReason> {
    let view = context.view();
    let Some(idx) = partition_column.and_then(|name| {
        view.output_columns()
            .iter()
            .position(|c| c.name().eq_ignore_ascii_case(name))
    }) else {
        return Ok(PartitionScope::All);
    };

    let mut expr = &view.output_exprs()[idx];
    if let Some(group_expr) = view
        .aggregate()
        .zip(expr.as_column())
        .and_then(|(aggregate, column)| aggregate.group_expr(column))
    {
        expr = group_expr;
    }

    // time buckets are monotone, so the bucketed column's range bounds the partitions read
    if let ScalarOperator::ScalarFunction(ScalarFunction { name, args }) = expr {
        if name == "date_trunc" && args.len() == 2 {
            expr = &args[1];
        }
    }

    let Some(query_column) = expr
        .as_column()
        .and_then(|c| rewriter.rewrite_view_to_query_column(c))
    else {
        return Ok(PartitionScope::All);
    };

    Ok(match context.query_predicate().column_range(&query_column)? {
        None => PartitionScope::Nothing,
        Some(range) if range.lower().is_null() && range.upper().is_null() => PartitionScope::All,
        Some(range) => PartitionScope::Range(range),
    })
}

/// What one output of the view provides, in query column space.
#[derive(Debug, Clone)]
enum ViewOutput {
    /// A row-level expression over relation columns
    Expr(ScalarOperator),
    /// A grouping key of an aggregating view
    GroupKey(ScalarOperator),
    /// An aggregate of an aggregating view
    Aggregate(AggregateCall),
    /// Something that can't be reused
    Opaque,
}

/// The outputs of a view, paired with the materialized view scan columns that hold them.
#[derive(Debug)]
struct ViewOutputs {
    outputs: Vec<(ViewOutput, ColumnRef)>,
    mv_columns: BTreeSet<ColumnRef>,
}

impl ViewOutputs {
    fn new(
        context: &RewriteContext,
        rewriter: &ColumnRewriter<'_>,
        mv_columns: Vec<ColumnRef>,
    ) -> Self {
        let view = context.view();
        let outputs = view
            .output_exprs()
            .iter()
            .zip(&mv_columns)
            .map(|(expr, mv_column)| {
                let output = match view.aggregate() {
                    None => rewriter
                        .try_rewrite_view_to_query_with_view_ec(expr)
                        .map_or(ViewOutput::Opaque, ViewOutput::Expr),
                    Some(aggregate) => classify_aggregate_output(expr, aggregate, rewriter),
                };
                (output, mv_column.clone())
            })
            .collect();

        Self {
            outputs,
            mv_columns: mv_columns.into_iter().collect(),
        }
    }

    /// Rewrite a query expression to read from the view's outputs.
    /// Returns `None` if any base column is left over.
    fn express(
        &self,
        expr: &ScalarOperator,
        rewriter: &ColumnRewriter<'_>,
    ) -> Option<ScalarOperator> {
        let normalized =
            rewriter.rewrite(expr, RewriteOptions::normalize(Equivalences::QueryBasedView));
        let mut this = self;
        let rewritten = normalized
            .rewrite(&mut this)
            // No chance of error since we never return Err
            .ok()?
            .data;

        // Check that all references to the original relations have been replaced.
        let replaced = rewritten
            .column_refs()
            .into_iter()
            .all(|c| self.mv_columns.contains(c));
        replaced.then_some(rewritten)
    }

    fn group_keys(&self) -> impl Iterator<Item = &ColumnRef> {
        self.outputs.iter().filter_map(|(output, mv_column)| match output {
            ViewOutput::GroupKey(_) => Some(mv_column),
            _ => None,
        })
    }

    /// The view column holding `call`, already in query space.
    fn aggregate(&self, call: &AggregateCall) -> Option<&ColumnRef> {
        self.outputs.iter().find_map(|(output, mv_column)| match output {
            ViewOutput::Aggregate(view_call) if view_call == call => Some(mv_column),
            _ => None,
        })
    }
}

fn classify_aggregate_output(
    expr: &ScalarOperator,
    aggregate: &AggregateInfo,
    rewriter: &ColumnRewriter<'_>,
) -> ViewOutput {
    let Some(column) = expr.as_column() else {
        // derived from aggregates; the query could only use it verbatim
        return ViewOutput::Opaque;
    };

    if let Some(group_expr) = aggregate.group_expr(column) {
        return rewriter
            .try_rewrite_view_to_query_with_view_ec(group_expr)
            .map_or(ViewOutput::Opaque, ViewOutput::GroupKey);
    }

    match aggregate.aggregate_call(column) {
        Some(call) => call
            .args
            .iter()
            .map(|arg| rewriter.try_rewrite_view_to_query_with_view_ec(arg))
            .collect::<Option<Vec<_>>>()
            .map_or(ViewOutput::Opaque, |args| {
                ViewOutput::Aggregate(AggregateCall {
                    args,
                    ..call.clone()
                })
            }),
        None => ViewOutput::Opaque,
    }
}

/// Rewrite an expression to re-use output columns of the view, where possible.
impl TreeNodeRewriter for &ViewOutputs {
    type Node = ScalarOperator;

    fn f_down(&mut self, node: Self::Node) -> Result<Transformed<Self::Node>> {
        Ok(
            match self.outputs.iter().find_map(|(output, mv_column)| match output {
                ViewOutput::Expr(e) | ViewOutput::GroupKey(e) if e == &node => Some(mv_column),
                _ => None,
            }) {
                Some(mv_column) => Transformed::yes(col(mv_column)),
                None => Transformed::no(node),
            },
        )
    }
}

#[cfg(test)]
mod test {
    use arrow_schema::DataType;
    use datafusion_common::{tree_node::TreeNode, Result, TableReference};
    use datafusion_expr::Operator;

    use super::{rewrite_candidate, PartitionScope, RejectReason, RewriteStage, ViewDefinition};
    use crate::{
        plan::{
            call, col, lit, split_conjunction, AggregateCall, AggregateFunction, ColumnRefFactory,
            LogicalPlan, PlanBuilder, ScalarOperator,
        },
        rewrite::RewriteConfig,
    };

    fn example_scan(factory: &mut ColumnRefFactory) -> Result<PlanBuilder> {
        PlanBuilder::scan(
            factory,
            TableReference::bare("example").resolve("datafusion", "public"),
            &[
                ("l_orderkey", DataType::Int32),
                ("l_partkey", DataType::Int32),
                ("l_shipdate", DataType::Date32),
                ("l_quantity", DataType::Float64),
                ("l_extendedprice", DataType::Float64),
                ("o_custkey", DataType::Int32),
                ("o_orderkey", DataType::Int32),
                ("o_orderdate", DataType::Date32),
                ("p_name", DataType::Utf8),
                ("p_partkey", DataType::Int32),
            ],
        )
    }

    fn mv_name() -> datafusion_common::ResolvedTableReference {
        TableReference::bare("mv").resolve("datafusion", "public")
    }

    /// Every column read by `plan` above its scans must come from the materialized view scan.
    fn assert_reads_only_mv(plan: &LogicalPlan) -> Result<()> {
        plan.apply(|node| {
            if let LogicalPlan::Scan(scan) = node {
                assert_eq!(scan.table, mv_name());
            }
            Ok(datafusion_common::tree_node::TreeNodeRecursion::Continue)
        })?;
        Ok(())
    }

    #[test]
    fn rewrite_with_compensating_filters() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut view_factory = ColumnRefFactory::new();
        let scan = example_scan(&mut view_factory)?;
        let c = |name: &str| scan.col(name);
        let view_filter = c("l_orderkey")?
            .eq(c("o_orderkey")?)
            .and(c("l_partkey")?.eq(c("p_partkey")?))
            .and(c("p_partkey")?.gt_eq(lit(150)))
            .and(c("o_custkey")?.gt_eq(lit(50)))
            .and(c("o_custkey")?.lt_eq(lit(500)))
            .and(call("like", vec![c("p_name")?, lit("%abc%")]));
        let view_outputs = vec![
            ("l_orderkey", c("l_orderkey")?),
            ("o_custkey", c("o_custkey")?),
            ("l_partkey", c("l_partkey")?),
            ("l_shipdate", c("l_shipdate")?),
            ("o_orderdate", c("o_orderdate")?),
            (
                "gross_revenue",
                c("l_quantity")?.binary(Operator::Multiply, c("l_extendedprice")?),
            ),
        ];
        let view = scan
            .clone()
            .filter(view_filter)
            .project(&mut view_factory, view_outputs)?
            .build();

        let mut query_factory = ColumnRefFactory::new();
        let scan = example_scan(&mut query_factory)?;
        let c = |name: &str| scan.col(name);
        let revenue = c("l_quantity")?.binary(Operator::Multiply, c("l_extendedprice")?);
        let query_filter = c("l_orderkey")?
            .eq(c("o_orderkey")?)
            .and(c("l_partkey")?.eq(c("p_partkey")?))
            .and(c("l_partkey")?.gt_eq(lit(150)))
            .and(c("l_partkey")?.lt_eq(lit(160)))
            .and(c("o_custkey")?.eq(lit(123)))
            .and(c("o_orderdate")?.eq(c("l_shipdate")?))
            .and(call("like", vec![c("p_name")?, lit("%abc%")]))
            .and(revenue.clone().gt(lit(100.0)));
        let query_outputs = vec![
            ("l_orderkey", c("l_orderkey")?),
            ("o_custkey", c("o_custkey")?),
            ("l_partkey", c("l_partkey")?),
            ("revenue", revenue),
        ];
        let query = scan
            .clone()
            .filter(query_filter)
            .project(&mut query_factory, query_outputs)?
            .build();

        let name = mv_name();
        let rewrite = rewrite_candidate(
            &query,
            &query_factory,
            &ViewDefinition {
                name: &name,
                plan: &view,
                factory: &view_factory,
                partition_column: None,
            },
            &RewriteConfig::default(),
        )
        .map_err(|r| datafusion_common::DataFusionError::Plan(r.to_string()))?;

        // o_orderdate = l_shipdate, l_partkey >= 150, l_partkey <= 160, o_custkey = 123, revenue > 100
        assert_eq!(rewrite.compensations, 5);
        assert_eq!(rewrite.plan.output_columns(), query.output_columns());
        assert_eq!(rewrite.partition_scope, PartitionScope::All);
        assert_reads_only_mv(&rewrite.plan)?;

        let LogicalPlan::Projection(projection) = &rewrite.plan else {
            panic!("expected a projection, got {}", rewrite.plan.display_indent());
        };
        let LogicalPlan::Filter(filter) = projection.input.as_ref() else {
            panic!("expected a filter, got {}", rewrite.plan.display_indent());
        };
        let LogicalPlan::Scan(mv_scan) = filter.input.as_ref() else {
            panic!("expected a scan, got {}", rewrite.plan.display_indent());
        };
        let gross_revenue = &mv_scan.columns[5];
        assert_eq!(gross_revenue.name(), "gross_revenue");
        assert!(split_conjunction(&filter.predicate)
            .contains(&&col(gross_revenue).gt(lit(100.0))));
        assert_eq!(projection.exprs[3].1, col(gross_revenue));

        Ok(())
    }

    fn single_table(
        factory: &mut ColumnRefFactory,
        filter: Option<fn(&PlanBuilder) -> Result<ScalarOperator>>,
        outputs: &[&str],
    ) -> Result<LogicalPlan> {
        let mut builder = PlanBuilder::scan(
            factory,
            TableReference::bare("t1").resolve("datafusion", "public"),
            &[
                ("v4", DataType::Int32),
                ("v5", DataType::Int32),
                ("v6", DataType::Int32),
            ],
        )?;
        if let Some(filter) = filter {
            let predicate = filter(&builder)?;
            builder = builder.filter(predicate);
        }
        let exprs = outputs
            .iter()
            .map(|name| Ok((*name, builder.col(name)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(builder.project(factory, exprs)?.build())
    }

    fn attempt(
        query: &LogicalPlan,
        query_factory: &ColumnRefFactory,
        view: &LogicalPlan,
        view_factory: &ColumnRefFactory,
        config: &RewriteConfig,
    ) -> Result<super::CandidateRewrite, super::Rejection> {
        let name = mv_name();
        rewrite_candidate(
            query,
            query_factory,
            &ViewDefinition {
                name: &name,
                plan: view,
                factory: view_factory,
                partition_column: Some("v4"),
            },
            config,
        )
    }

    #[test]
    fn rejections() -> Result<()> {
        let mut view_factory = ColumnRefFactory::new();
        let view = single_table(
            &mut view_factory,
            Some(|b| Ok(b.col("v4")?.gt(lit(3)))),
            &["v4", "v6"],
        )?;

        // v5 is not an output of the view
        let mut query_factory = ColumnRefFactory::new();
        let query = single_table(
            &mut query_factory,
            Some(|b| Ok(b.col("v4")?.gt(lit(4)))),
            &["v4", "v5"],
        )?;
        let rejection = attempt(&query, &query_factory, &view, &view_factory, &Default::default())
            .unwrap_err();
        assert_eq!(rejection.stage, RewriteStage::OutputRewritten);
        assert!(matches!(rejection.reason, RejectReason::OutputNotExpressible(_)));

        // the view doesn't have the rows the query needs
        let mut query_factory = ColumnRefFactory::new();
        let query = single_table(
            &mut query_factory,
            Some(|b| Ok(b.col("v4")?.gt(lit(2)))),
            &["v4"],
        )?;
        let rejection = attempt(&query, &query_factory, &view, &view_factory, &Default::default())
            .unwrap_err();
        assert_eq!(rejection.stage, RewriteStage::PredicatesCompensated);
        assert!(matches!(rejection.reason, RejectReason::PredicateNotImplied));

        // compensating predicate on a column the view doesn't output
        let mut query_factory = ColumnRefFactory::new();
        let query = single_table(
            &mut query_factory,
            Some(|b| Ok(b.col("v4")?.gt(lit(4)).and(b.col("v5")?.lt(lit(0))))),
            &["v4"],
        )?;
        let rejection = attempt(&query, &query_factory, &view, &view_factory, &Default::default())
            .unwrap_err();
        assert!(matches!(rejection.reason, RejectReason::ResidualNotExpressible));

        Ok(())
    }

    #[test]
    fn partition_scope_follows_query_range() -> Result<()> {
        let mut view_factory = ColumnRefFactory::new();
        let view = single_table(&mut view_factory, None, &["v4", "v5"])?;

        let mut query_factory = ColumnRefFactory::new();
        let query = single_table(
            &mut query_factory,
            Some(|b| Ok(b.col("v4")?.gt_eq(lit(2)).and(b.col("v4")?.lt(lit(4))))),
            &["v4", "v5"],
        )?;
        let rewrite = attempt(&query, &query_factory, &view, &view_factory, &Default::default())
            .map_err(|r| datafusion_common::DataFusionError::Plan(r.to_string()))?;
        let PartitionScope::Range(range) = rewrite.partition_scope else {
            panic!("expected a range, got {:?}", rewrite.partition_scope);
        };
        assert_eq!(range.lower(), &datafusion_common::ScalarValue::Int32(Some(2)));
        assert_eq!(range.upper(), &datafusion_common::ScalarValue::Int32(Some(3)));
        assert_eq!(rewrite.compensations, 2);

        let mut query_factory = ColumnRefFactory::new();
        let query = single_table(
            &mut query_factory,
            Some(|b| Ok(b.col("v4")?.gt(lit(5)).and(b.col("v4")?.lt(lit(2))))),
            &["v4"],
        )?;
        let rewrite = attempt(&query, &query_factory, &view, &view_factory, &Default::default())
            .map_err(|r| datafusion_common::DataFusionError::Plan(r.to_string()))?;
        assert_eq!(rewrite.partition_scope, PartitionScope::Nothing);

        Ok(())
    }

    fn aggregate_plan(
        factory: &mut ColumnRefFactory,
        group_by: &[&str],
        aggregates: &[(&str, AggregateFunction)],
    ) -> Result<LogicalPlan> {
        let scan = PlanBuilder::scan(
            factory,
            TableReference::bare("t1").resolve("datafusion", "public"),
            &[
                ("v4", DataType::Int32),
                ("v5", DataType::Int32),
                ("v6", DataType::Int32),
            ],
        )?;
        let v5 = scan.col("v5")?;
        let calls = aggregates
            .iter()
            .map(|(name, func)| (*name, AggregateCall::new(*func, vec![v5.clone()])))
            .collect();
        Ok(scan.aggregate(factory, group_by, calls)?.build())
    }

    fn count_aggregates(plan: &LogicalPlan) -> Result<usize> {
        let mut count = 0;
        plan.apply(|node| {
            if let LogicalPlan::Aggregate(_) = node {
                count += 1;
            }
            Ok(datafusion_common::tree_node::TreeNodeRecursion::Continue)
        })?;
        Ok(count)
    }

    #[test]
    fn aggregate_queries() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut view_factory = ColumnRefFactory::new();
        let view = aggregate_plan(
            &mut view_factory,
            &["v4", "v6"],
            &[
                ("total", AggregateFunction::Sum),
                ("cnt", AggregateFunction::Count),
                ("lo", AggregateFunction::Min),
                ("mean", AggregateFunction::Avg),
            ],
        )?;

        // same grouping: no re-aggregation
        let mut query_factory = ColumnRefFactory::new();
        let query = aggregate_plan(
            &mut query_factory,
            &["v6", "v4"],
            &[("s", AggregateFunction::Sum), ("a", AggregateFunction::Avg)],
        )?;
        let rewrite = attempt(&query, &query_factory, &view, &view_factory, &Default::default())
            .map_err(|r| datafusion_common::DataFusionError::Plan(r.to_string()))?;
        assert_eq!(count_aggregates(&rewrite.plan)?, 0);
        assert_eq!(rewrite.plan.output_columns(), query.output_columns());
        assert_reads_only_mv(&rewrite.plan)?;

        // coarser grouping: roll up
        let mut query_factory = ColumnRefFactory::new();
        let query = aggregate_plan(
            &mut query_factory,
            &["v4"],
            &[
                ("s", AggregateFunction::Sum),
                ("c", AggregateFunction::Count),
                ("m", AggregateFunction::Min),
            ],
        )?;
        let rewrite = attempt(&query, &query_factory, &view, &view_factory, &Default::default())
            .map_err(|r| datafusion_common::DataFusionError::Plan(r.to_string()))?;
        assert_eq!(count_aggregates(&rewrite.plan)?, 1);
        let mut funcs = vec![];
        rewrite.plan.apply(|node| {
            if let LogicalPlan::Aggregate(aggregate) = node {
                funcs.extend(aggregate.aggregates.iter().map(|(_, call)| call.func));
            }
            Ok(datafusion_common::tree_node::TreeNodeRecursion::Continue)
        })?;
        assert_eq!(
            funcs,
            vec![AggregateFunction::Sum, AggregateFunction::Sum, AggregateFunction::Min]
        );

        // ... unless disabled
        let config = RewriteConfig {
            enable_aggregate_rollup: false,
            ..Default::default()
        };
        let rejection =
            attempt(&query, &query_factory, &view, &view_factory, &config).unwrap_err();
        assert!(matches!(rejection.reason, RejectReason::AggregateShapeMismatch(_)));

        // averages can't be rolled up
        let mut query_factory = ColumnRefFactory::new();
        let query = aggregate_plan(&mut query_factory, &["v4"], &[("a", AggregateFunction::Avg)])?;
        let rejection = attempt(&query, &query_factory, &view, &view_factory, &Default::default())
            .unwrap_err();
        assert!(matches!(rejection.reason, RejectReason::AggregateShapeMismatch(_)));

        // grouping by something the view doesn't group by
        let mut query_factory = ColumnRefFactory::new();
        let query = aggregate_plan(&mut query_factory, &["v5"], &[("s", AggregateFunction::Sum)])?;
        let rejection = attempt(&query, &query_factory, &view, &view_factory, &Default::default())
            .unwrap_err();
        assert!(matches!(rejection.reason, RejectReason::OutputNotExpressible(_)));

        // a plain query can't be answered from aggregated rows
        let mut query_factory = ColumnRefFactory::new();
        let query = single_table(&mut query_factory, None, &["v4"])?;
        let rejection = attempt(&query, &query_factory, &view, &view_factory, &Default::default())
            .unwrap_err();
        assert_eq!(rejection.stage, RewriteStage::MatchedRelations);

        Ok(())
    }

    #[test]
    fn aggregate_query_over_plain_view() -> Result<()> {
        let mut view_factory = ColumnRefFactory::new();
        let view = single_table(&mut view_factory, None, &["v4", "v5"])?;

        let mut query_factory = ColumnRefFactory::new();
        let query = aggregate_plan(
            &mut query_factory,
            &["v4"],
            &[("s", AggregateFunction::Sum), ("a", AggregateFunction::Avg)],
        )?;
        let rewrite = attempt(&query, &query_factory, &view, &view_factory, &Default::default())
            .map_err(|r| datafusion_common::DataFusionError::Plan(r.to_string()))?;

        assert_eq!(count_aggregates(&rewrite.plan)?, 1);
        assert_eq!(rewrite.plan.output_columns(), query.output_columns());
        assert_reads_only_mv(&rewrite.plan)?;

        Ok(())
    }
}
