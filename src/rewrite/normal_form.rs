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

This module contains code primarily used for view matching. We implement the view matching algorithm from [this paper](https://courses.cs.washington.edu/courses/cse591d/01sp/opt_views.pdf),
which provides a method for determining when one Select-Project-Join query can be rewritten in terms of another Select-Project-Join query,
extended with a single top-level aggregation (SPJG).

The analysis is contained in [`SpjgNormalForm::new`]; the tests themselves live on [`Predicate`] and are driven by
[`rewrite_candidate`](super::driver::rewrite_candidate). The method can be summarized as follows:
1. Compute column equivalence classes for the query and the view.
2. Compute range intervals for the query and the view.
3. (Equijoin subsumption test) Check that each column equivalence class of the view is a subset of a column equivalence class of the query.
4. (Range subsumption test) Check that each range of the view contains the corresponding range from the query.
5. (Residual subsumption test) Check that every filter in the view that is not a column equivalence relation or a range filter matches a filter from the query.
6. Compute any compensating filters needed in order to restrict the view's rows to match the query.
7. Check that the output of the query, and the compensating filters, can be rewritten using the view's columns as inputs.

Query and view are analyzed with separate [`ColumnRefFactory`]s, so before the tests run all view
predicates are brought into the query's column space through the relation mapping
(see [`ColumnRewriter`](super::column_rewriter::ColumnRewriter)).

# Example

Consider the following table:

```sql
CREATE TABLE example (
    l_orderkey INT,
    l_partkey INT,
    l_shipdate DATE,
    l_quantity DOUBLE,
    l_extendedprice DOUBLE,
    o_custkey INT,
    o_orderkey INT,
    o_orderdate DATE,
    p_name VARCHAR,
    p_partkey INT,
)
```

And consider the follow view:

```sql
CREATE MATERIALIZED VIEW mv AS SELECT
    l_orderkey,
    o_custkey,
    l_partkey,
    l_shipdate, o_orderdate,
    l_quantity*l_extendedprice AS gross_revenue
FROM example
WHERE
    l_orderkey = o_orderkey AND
    l_partkey = p_partkey AND
    p_partkey >= 150 AND
    o_custkey >= 50 AND
    o_custkey <= 500 AND
    p_name LIKE '%abc%'
```

During analysis, we look at the implied equivalence classes and possible range of values for each equivalence class.
For this view, the following nontrivial equivalence classes are generated:
 * `{l_orderkey, o_orderkey}`
 * `{l_partkey, p_partkey}`

All other columns have their own singleton equivalence classes.
Likewise, the following nontrivial ranges are generated:
 * `150 <= {l_partkey, p_partkey} < inf`
 * `50 <= {o_custkey} <= 500`

The rest of the equivalence classes are considered to have ranges of (-inf, inf).
The remaining filter `p_name LIKE '%abc%'` is considered 'residual' as it is not a column equivalence nor a range filter.

Now consider the following query:

```sql
SELECT
    l_orderkey,
    o_custkey,
    l_partkey,
    l_quantity*l_extendedprice
FROM example
WHERE
    l_orderkey = o_orderkey AND
    l_partkey = p_partkey AND
    l_partkey >= 150 AND
    l_partkey <= 160 AND
    o_custkey = 123 AND
    o_orderdate = l_shipdate AND
    p_name like '%abc%' AND
    l_quantity*l_extendedprice > 100
```

The three subsumption tests pass, and produce the compensating filters
 * `o_orderdate = l_shipdate`
 * `150 <= {l_partkey, p_partkey} <= 160`
 * `{o_custkey} = 123`
 * `l_quantity*l_extendedprice > 100`

which are finally rewritten in terms of the view's output columns. This example is included as a unit test of the driver.

# Aggregates

A plan may contain one aggregate above its select-project-join core. Its grouping expressions and aggregate calls are
flattened like any other expression, and projections/filters above it become the output expressions and `HAVING`
conjuncts respectively. Aggregates found *below* a join are treated as opaque relations, identified by a structural
fingerprint of their subplan, so that a view joining the same aggregated subquery can still be matched.

*/

use std::collections::HashMap;

use datafusion_common::{
    not_impl_err,
    tree_node::{Transformed, TransformedResult, TreeNode},
    DataFusionError, JoinType, Result, ScalarValue,
};
use datafusion_expr::{
    interval_arithmetic::{satisfy_greater, Interval},
    Operator,
};
use itertools::Itertools;

use super::{
    equivalence::{as_column_equality, EquivalenceClasses},
    mapping::{Relation, RelationKey},
};
use crate::plan::{
    col, lit, split_conjunction, Aggregate, AggregateCall, BinaryExpr, Cast, ColumnRef,
    ColumnRefFactory, Filter, Join, LogicalPlan, Projection, ScalarFunction, ScalarOperator,
};

/// A normalized representation of a plan containing only Select/Project/Join in the relational algebra sense,
/// optionally topped by a single aggregation.
#[derive(Debug, Clone)]
pub struct SpjgNormalForm {
    output_columns: Vec<ColumnRef>,
    output_exprs: Vec<ScalarOperator>,
    relations: Vec<Relation>,
    conjuncts: Vec<ScalarOperator>,
    aggregate: Option<AggregateInfo>,
}

/// The aggregation on top of a select-project-join core.
#[derive(Debug, Clone)]
pub struct AggregateInfo {
    /// Grouping columns, as output by the aggregate
    pub group_columns: Vec<ColumnRef>,
    /// Definitions of the grouping columns over relation columns
    pub group_exprs: Vec<ScalarOperator>,
    /// Aggregate output columns and their calls, with arguments over relation columns
    pub aggregates: Vec<(ColumnRef, AggregateCall)>,
    /// Conjuncts applied after aggregation, over grouping and aggregate columns
    pub having: Vec<ScalarOperator>,
}

impl AggregateInfo {
    /// Definition of a grouping column, if `column` is one.
    pub fn group_expr(&self, column: &ColumnRef) -> Option<&ScalarOperator> {
        self.group_columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.group_exprs[idx])
    }

    /// The call computing an aggregate column, if `column` is one.
    pub fn aggregate_call(&self, column: &ColumnRef) -> Option<&AggregateCall> {
        self.aggregates
            .iter()
            .find_map(|(c, call)| (c == column).then_some(call))
    }
}

impl SpjgNormalForm {
    /// Columns output by this plan.
    pub fn output_columns(&self) -> &[ColumnRef] {
        &self.output_columns
    }

    /// Expressions output by this plan, one per output column.
    ///
    /// Without an aggregate these are expressed over relation columns, which lets the plan be rewritten
    /// as a cross join followed by a projection (minus filters, so the result would be a superset).
    /// With an aggregate, they are expressed over the aggregate's grouping and aggregate columns.
    pub fn output_exprs(&self) -> &[ScalarOperator] {
        &self.output_exprs
    }

    /// All relations joined by this plan, in plan order.
    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Filter conjuncts below any aggregation, over relation columns.
    pub fn conjuncts(&self) -> &[ScalarOperator] {
        &self.conjuncts
    }

    /// The top-level aggregation, if any.
    pub fn aggregate(&self) -> Option<&AggregateInfo> {
        self.aggregate.as_ref()
    }

    /// Analyze a plan and rewrite it in normal form.
    ///
    /// Opaque subqueries are registered as new relations in `factory`.
    pub fn new(original_plan: &LogicalPlan, factory: &mut ColumnRefFactory) -> Result<Self> {
        let output_columns = original_plan.output_columns();

        // Peel projections & filters until we either find the top-level aggregate
        // or reach the select-project-join core.
        let mut above = vec![];
        let mut node = original_plan;
        let aggregate = loop {
            match node {
                LogicalPlan::Projection(Projection { input, .. })
                | LogicalPlan::Filter(Filter { input, .. }) => {
                    above.push(node);
                    node = input.as_ref();
                }
                LogicalPlan::Aggregate(agg) => break Some(agg),
                _ => break None,
            }
        };

        let Some(agg) = aggregate else {
            let mut core = SpjCore::default();
            core.visit(original_plan, factory)?;
            let output_exprs = output_columns
                .iter()
                .map(|c| core.flatten(col(c)))
                .collect();

            return Ok(Self {
                output_columns,
                output_exprs,
                relations: core.relations,
                conjuncts: core.conjuncts,
                aggregate: None,
            });
        };

        let mut core = SpjCore::default();
        core.visit(&agg.input, factory)?;

        let group_exprs = agg
            .group_by
            .iter()
            .map(|c| core.flatten(col(c)))
            .collect();
        let aggregates = agg
            .aggregates
            .iter()
            .map(|(c, call)| {
                let call = call.clone().map_args(|arg| Ok(core.flatten(arg)))?;
                Ok((c.clone(), call))
            })
            .collect::<Result<Vec<_>>>()?;

        // Everything between the output and the aggregate.
        // These nodes are visited bottom-up so that definitions compose.
        let mut post = SpjCore::default();
        for node in above.into_iter().rev() {
            match node {
                LogicalPlan::Projection(projection) => post.define(projection),
                LogicalPlan::Filter(filter) => post.add_filter(&filter.predicate),
                _ => unreachable!("only projections and filters are collected"),
            }
        }
        let output_exprs = output_columns
            .iter()
            .map(|c| post.flatten(col(c)))
            .collect();

        Ok(Self {
            output_columns,
            output_exprs,
            relations: core.relations,
            conjuncts: core.conjuncts,
            aggregate: Some(AggregateInfo {
                group_columns: agg.group_by.clone(),
                group_exprs,
                aggregates,
                having: post.conjuncts,
            }),
        })
    }
}

/// Accumulates the relations, filters and column definitions of a select-project-join core.
#[derive(Debug, Default)]
struct SpjCore {
    /// Definitions of projected columns, already flattened
    definitions: HashMap<ColumnRef, ScalarOperator>,
    relations: Vec<Relation>,
    conjuncts: Vec<ScalarOperator>,
}

impl SpjCore {
    fn visit(&mut self, plan: &LogicalPlan, factory: &mut ColumnRefFactory) -> Result<()> {
        match plan {
            LogicalPlan::Scan(scan) => {
                self.relations.push(Relation {
                    id: scan.relation,
                    key: RelationKey::Table(scan.table.clone()),
                    columns: scan.columns.clone(),
                });
                for filter in &scan.filters {
                    self.add_filter(filter);
                }
            }
            LogicalPlan::Filter(filter) => {
                self.visit(&filter.input, factory)?;
                self.add_filter(&filter.predicate);
            }
            LogicalPlan::Projection(projection) => {
                self.visit(&projection.input, factory)?;
                self.define(projection);
            }
            LogicalPlan::Join(Join {
                left,
                right,
                join_type: JoinType::Inner,
                on,
            }) => {
                self.visit(left, factory)?;
                self.visit(right, factory)?;
                if let Some(on) = on {
                    self.add_filter(on);
                }
            }
            LogicalPlan::Join(join) => {
                return not_impl_err!("{} joins are not supported for view matching", join.join_type)
            }
            LogicalPlan::Aggregate(_) => {
                // An aggregate inside the core is an opaque relation.
                // Its grouping columns stay bound to the scans below it in the factory,
                // so the relation's own column list is authoritative.
                self.relations.push(Relation {
                    id: factory.create_relation(),
                    key: RelationKey::Subquery(fingerprint(plan)),
                    columns: plan.output_columns(),
                });
            }
        }

        Ok(())
    }

    fn define(&mut self, projection: &Projection) {
        for (column, expr) in &projection.exprs {
            if expr.as_column() == Some(column) {
                continue;
            }
            let definition = self.flatten(expr.clone());
            self.definitions.insert(column.clone(), definition);
        }
    }

    fn add_filter(&mut self, predicate: &ScalarOperator) {
        for conjunct in split_conjunction(predicate) {
            let conjunct = self.flatten(conjunct.clone());
            if !self.conjuncts.contains(&conjunct) {
                self.conjuncts.push(conjunct);
            }
        }
    }

    /// Inline the definitions of projected columns.
    fn flatten(&self, expr: ScalarOperator) -> ScalarOperator {
        if self.definitions.is_empty() {
            return expr;
        }

        expr.transform_up(|e| {
            Ok(match e {
                ScalarOperator::Column(c) => match self.definitions.get(&c) {
                    Some(definition) => Transformed::yes(definition.clone()),
                    None => Transformed::no(ScalarOperator::Column(c)),
                },
                e => Transformed::no(e),
            })
        })
        .data()
        // No chance of error since we never return Err
        .unwrap_or_else(|_| unreachable!())
    }
}

/// A structural fingerprint of a subplan that doesn't depend on column ids.
///
/// Columns are rendered by origin: `table#occurrence.column` for scanned columns,
/// the defining expression for projected columns and the call for aggregates.
/// Two subplans with the same fingerprint compute the same relation.
pub fn fingerprint(plan: &LogicalPlan) -> String {
    let mut renderer = Fingerprinter::default();
    let body = renderer.render(plan);
    let outputs = plan
        .output_columns()
        .iter()
        .map(|c| format!("{}={}", c.name().to_lowercase(), renderer.column(c)))
        .join(",");
    format!("{body}->[{outputs}]")
}

#[derive(Default)]
struct Fingerprinter {
    names: HashMap<ColumnRef, String>,
    occurrences: HashMap<String, usize>,
}

impl Fingerprinter {
    fn column(&self, column: &ColumnRef) -> String {
        self.names
            .get(column)
            .cloned()
            .unwrap_or_else(|| format!("?{}", column.name().to_lowercase()))
    }

    fn expr(&self, expr: &ScalarOperator) -> String {
        match expr {
            ScalarOperator::Column(c) => self.column(c),
            ScalarOperator::Literal(v) => format!("{v:?}"),
            ScalarOperator::BinaryExpr(BinaryExpr { left, op, right }) => {
                format!("({} {op} {})", self.expr(left), self.expr(right))
            }
            ScalarOperator::Not(e) => format!("not({})", self.expr(e)),
            ScalarOperator::IsNull(e) => format!("is_null({})", self.expr(e)),
            ScalarOperator::IsNotNull(e) => format!("is_not_null({})", self.expr(e)),
            ScalarOperator::Cast(Cast { expr, data_type }) => {
                format!("cast({} as {data_type})", self.expr(expr))
            }
            ScalarOperator::ScalarFunction(ScalarFunction { name, args }) => {
                format!("{name}({})", args.iter().map(|a| self.expr(a)).join(","))
            }
        }
    }

    fn render(&mut self, plan: &LogicalPlan) -> String {
        match plan {
            LogicalPlan::Scan(scan) => {
                let table = scan.table.to_string();
                let occurrence = self.occurrences.entry(table.clone()).or_default();
                let prefix = format!("{table}#{occurrence}");
                *occurrence += 1;
                for column in &scan.columns {
                    self.names.insert(
                        column.clone(),
                        format!("{prefix}.{}", column.name().to_lowercase()),
                    );
                }
                let filters = scan.filters.iter().map(|f| self.expr(f)).join(" and ");
                format!("scan({prefix};{filters})")
            }
            LogicalPlan::Filter(filter) => {
                let input = self.render(&filter.input);
                format!("filter({input};{})", self.expr(&filter.predicate))
            }
            LogicalPlan::Projection(projection) => {
                let input = self.render(&projection.input);
                let rendered = projection
                    .exprs
                    .iter()
                    .map(|(c, e)| (c.clone(), self.expr(e)))
                    .collect_vec();
                let exprs = rendered.iter().map(|(_, e)| e.as_str()).join(",");
                self.names.extend(rendered.clone());
                format!("project({input};{exprs})")
            }
            LogicalPlan::Join(join) => {
                let left = self.render(&join.left);
                let right = self.render(&join.right);
                let on = join.on.as_ref().map(|on| self.expr(on)).unwrap_or_default();
                format!("join({};{left};{right};{on})", join.join_type)
            }
            LogicalPlan::Aggregate(Aggregate {
                input,
                group_by,
                aggregates,
            }) => {
                let input = self.render(input);
                let groups = group_by.iter().map(|c| self.column(c)).join(",");
                let calls = aggregates
                    .iter()
                    .map(|(c, call)| {
                        let distinct = if call.distinct { "distinct " } else { "" };
                        let args = call.args.iter().map(|a| self.expr(a)).join(",");
                        (c.clone(), format!("{}({distinct}{args})", call.func))
                    })
                    .collect_vec();
                let rendered_calls = calls.iter().map(|(_, call)| call.as_str()).join(",");
                self.names.extend(calls.clone());
                format!("aggregate({input};{groups};{rendered_calls})")
            }
        }
    }
}

/// Stores information on filters from a Select-Project-Join plan.
#[derive(Debug, Clone)]
pub(crate) struct Predicate {
    /// Column equivalence classes.
    equivalences: EquivalenceClasses,
    /// Stores (possibly empty) intervals describing each non-trivially constrained equivalence class,
    /// keyed by class representative. Classes without an entry are unbounded.
    ranges: HashMap<ColumnRef, Option<Interval>>,
    /// Filter expressions that aren't column equality predicates or range filters.
    residuals: Vec<ScalarOperator>,
}

impl Predicate {
    /// Classify conjuncts into equivalences, ranges and residuals.
    /// `equivalences` must have been built from the same conjuncts.
    pub(crate) fn new(conjuncts: &[ScalarOperator], equivalences: EquivalenceClasses) -> Result<Self> {
        let mut new = Self {
            equivalences,
            ranges: HashMap::new(),
            residuals: vec![],
        };

        for conjunct in conjuncts {
            match as_column_equality(conjunct) {
                Some((a, b)) if a != b => {}
                _ => new.insert_conjunct(conjunct)?,
            }
        }

        Ok(new)
    }

    pub(crate) fn equivalences(&self) -> &EquivalenceClasses {
        &self.equivalences
    }

    /// The range of `column`'s class; `Ok(None)` if it is empty.
    fn range_for(&self, column: &ColumnRef) -> Result<Option<Interval>> {
        match self.ranges.get(self.equivalences.representative(column)) {
            Some(range) => Ok(range.clone()),
            None => Interval::make_unbounded(column.data_type()).map(Some),
        }
    }

    /// Update range for a column's equivalence class
    fn add_range(&mut self, c: &ColumnRef, op: &Operator, value: &ScalarValue) -> Result<()> {
        if value.is_null() {
            return Err(DataFusionError::Plan(format!(
                "comparison of {c} with null is not a range"
            )));
        }
        // first coerce the value if needed
        let value = value.cast_to(c.data_type())?;

        let new_range = match op {
            Operator::Eq => Some(Interval::try_new(value.clone(), value.clone())?),
            Operator::LtEq => Some(Interval::try_new(
                ScalarValue::try_from(value.data_type())?,
                value.clone(),
            )?),
            Operator::GtEq => Some(Interval::try_new(
                value.clone(),
                ScalarValue::try_from(value.data_type())?,
            )?),
            // Note: This is a roundabout way (read: hack) to construct an open Interval.
            // DataFusion's Interval type represents closed intervals,
            // so handling of open intervals is done by adding/subtracting the smallest increment.
            // However, there is not really a public API to do this,
            // other than the satisfy_greater method.
            Operator::Lt => satisfy_greater(
                &Interval::try_new(value.clone(), value.clone())?,
                &Interval::make_unbounded(&value.data_type())?,
                true,
            )?
            .map(|(_, range)| range),
            // Same thing as above.
            Operator::Gt => satisfy_greater(
                &Interval::make_unbounded(&value.data_type())?,
                &Interval::try_new(value.clone(), value.clone())?,
                true,
            )?
            .map(|(range, _)| range),
            _ => {
                return Err(DataFusionError::Plan(
                    "unsupported binary expression".to_string(),
                ))
            }
        };

        let representative = self.equivalences.representative(c).clone();
        let merged = match (self.ranges.remove(&representative), new_range) {
            (None, new_range) => new_range,
            (Some(None), _) | (Some(_), None) => None,
            (Some(Some(range)), Some(new_range)) => range.intersect(new_range)?,
        };
        self.ranges.insert(representative, merged);

        Ok(())
    }

    /// Add a generic filter expression to our collection of filters.
    /// A conjunct is a term T_i of an expression T_1 AND T_2 AND T_3 AND ...
    fn insert_conjunct(&mut self, expr: &ScalarOperator) -> Result<()> {
        match expr {
            ScalarOperator::BinaryExpr(BinaryExpr { left, op, right }) => {
                self.insert_binary_expr(left, *op, right)?;
            }
            ScalarOperator::Not(e) => match e.as_ref() {
                ScalarOperator::BinaryExpr(BinaryExpr { left, op, right }) => {
                    if let Some(negated) = op.negate() {
                        self.insert_binary_expr(left, negated, right)?;
                    } else {
                        self.insert_residual(expr.clone());
                    }
                }
                _ => self.insert_residual(expr.clone()),
            },
            _ => self.insert_residual(expr.clone()),
        }

        Ok(())
    }

    /// Add a binary expression to our collection of filters.
    fn insert_binary_expr(
        &mut self,
        left: &ScalarOperator,
        op: Operator,
        right: &ScalarOperator,
    ) -> Result<()> {
        match (left, op, right) {
            (ScalarOperator::Column(c), op, ScalarOperator::Literal(v)) => {
                if let Err(e) = self.add_range(c, &op, v) {
                    // Add a range can fail in some cases, so just fallthrough
                    log::debug!("failed to add range filter: {e}");
                } else {
                    return Ok(());
                }
            }
            (ScalarOperator::Literal(_), op, ScalarOperator::Column(_)) => {
                if let Some(swapped) = op.swap() {
                    return self.insert_binary_expr(right, swapped, left);
                }
            }
            _ => {}
        }

        self.insert_residual(left.clone().binary(op, right.clone()));

        Ok(())
    }

    fn insert_residual(&mut self, expr: ScalarOperator) {
        if !self.residuals.contains(&expr) {
            self.residuals.push(expr);
        }
    }

    /// Test that all column equivalence classes of `other` are subsumed by one from `self`.
    /// This is called the 'equijoin' subsumption test because column equivalences often
    /// result from join predicates.
    /// Returns any compensating column equality predicates that should be applied to
    /// make this plan match the output of the other one.
    pub(crate) fn equijoin_subsumption_test(&self, other: &Self) -> Option<Vec<ScalarOperator>> {
        for other_class in other.equivalences.classes() {
            let representative = self.equivalences.representative(&other_class[0]);
            if other_class
                .iter()
                .any(|c| self.equivalences.representative(c) != representative)
            {
                return None;
            }
        }

        // Within each of our classes, every group of columns that the other plan
        // already considers equal needs one equality to join it to the rest.
        let mut new_equivalences = vec![];
        for class in self.equivalences.classes() {
            let mut seen: Vec<&ColumnRef> = vec![];
            for column in class {
                let other_rep = other.equivalences.representative(column);
                if seen
                    .iter()
                    .any(|s| other.equivalences.representative(s) == other_rep)
                {
                    continue;
                }
                if let Some(first) = seen.first() {
                    new_equivalences.push(col(first).eq(col(column)));
                }
                seen.push(column);
            }
        }

        log::trace!("passed equijoin subsumption test");

        Some(new_equivalences)
    }

    /// Test that all range filters of `self` are contained in one from `other`.
    /// This includes equality comparisons, which map to ranges of the form [v, v]
    /// for some value v.
    /// Returns any compensating range filters that should be applied to this plan
    /// to make its output match the other one.
    pub(crate) fn range_subsumption_test(&self, other: &Self) -> Result<Option<Vec<ScalarOperator>>> {
        // every range of `other` must contain our range for the same class
        for (other_column, other_range) in other.ranges.iter().sorted_by_key(|(c, _)| *c) {
            let Some(range) = self.range_for(other_column)? else {
                // empty; it's always contained in another range
                continue;
            };
            match other_range {
                None => return Ok(None),
                Some(other_range) if other_range.contains(&range)? != Interval::CERTAINLY_TRUE => {
                    return Ok(None)
                }
                Some(_) => {}
            }
        }

        let mut extra_range_filters = vec![];
        for (column, range) in self.ranges.iter().sorted_by_key(|(c, _)| *c) {
            let range = match range {
                None => {
                    // this range is never satisfiable, so it's always False
                    extra_range_filters.push(lit(false));
                    continue;
                }
                Some(range) => range,
            };

            let Some(other_range) = other.range_for(column)? else {
                continue;
            };

            if other_range.contains(range)? != Interval::CERTAINLY_TRUE {
                return Ok(None);
            }

            if range.contains(&other_range)? == Interval::CERTAINLY_TRUE {
                continue;
            }

            if !(range.lower().is_null() || range.upper().is_null())
                && (range.lower() == range.upper())
            {
                // col >= val AND col <= val is not treated the same as col = val
                // by later stages, so equalities are preserved as such.
                extra_range_filters.push(col(column).eq(ScalarOperator::Literal(range.lower().clone())));
            } else {
                if !range.lower().is_null() {
                    extra_range_filters
                        .push(col(column).gt_eq(ScalarOperator::Literal(range.lower().clone())));
                }

                if !range.upper().is_null() {
                    extra_range_filters
                        .push(col(column).lt_eq(ScalarOperator::Literal(range.upper().clone())));
                }
            }
        }

        log::trace!("passed range subsumption test");

        Ok(Some(extra_range_filters))
    }

    /// Test that any "residual" filters (not column equivalence or range filters) from
    /// `other` have matching entries in `self`.
    /// For example, a residual filter might look like `x * y > 100`, as this expression
    /// is neither a column equivalence nor a range filter (importantly, not a range filter
    /// directly on a column).
    /// Both sides are compared after `normalize`.
    /// Return any residual filters in this plan that are not in the other one.
    pub(crate) fn residual_subsumption_test(
        &self,
        other: &Self,
        normalize: impl Fn(&ScalarOperator) -> ScalarOperator,
    ) -> Option<Vec<ScalarOperator>> {
        let [self_residuals, other_residuals] = [&self.residuals, &other.residuals].map(|set| {
            set.iter()
                .map(&normalize)
                .unique()
                .collect_vec()
        });

        if !other_residuals.iter().all(|r| self_residuals.contains(r)) {
            return None;
        }

        log::trace!("passed residual subsumption test");

        Some(
            self_residuals
                .into_iter()
                .filter(|r| !other_residuals.contains(r))
                .collect_vec(),
        )
    }

    /// The range of values allowed for `column` by this predicate, if bounded.
    pub(crate) fn column_range(&self, column: &ColumnRef) -> Result<Option<Interval>> {
        self.range_for(column)
    }
}
