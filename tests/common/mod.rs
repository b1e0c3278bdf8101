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

#![allow(dead_code)]

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use arrow::util::pretty::pretty_format_batches;
use datafusion::prelude::SessionContext;
use datafusion_common::{JoinType, ResolvedTableReference, ScalarValue, TableReference};
use datafusion_mv_rewrite::{
    materialized::{
        partition_metadata::{PartitionMetadata, PartitionMetadataSource, TableKind, TableMetadata},
        MaterializedView,
    },
    plan::{AggregateCall, BinaryExpr, Cast, LogicalPlan, ScalarFunction, ScalarOperator},
};
use itertools::Itertools;
use parking_lot::RwLock;

pub fn table(name: &str) -> ResolvedTableReference {
    TableReference::bare(name).resolve("datafusion", "public")
}

/// Renders a [`LogicalPlan`] as SQL that DataFusion can run.
///
/// Every column is aliased `c<id>`, so the output of two plans built with the
/// same factory can be compared directly.
#[derive(Default)]
pub struct SqlWriter {
    next_alias: usize,
}

impl SqlWriter {
    pub fn plan(&mut self, plan: &LogicalPlan) -> Result<String> {
        Ok(match plan {
            LogicalPlan::Scan(scan) => {
                let columns = scan
                    .columns
                    .iter()
                    .map(|c| format!("\"{}\" AS c{}", c.name(), c.id()))
                    .join(", ");
                let mut sql = format!("SELECT {columns} FROM {}", scan.table);
                if !scan.filters.is_empty() {
                    let filters = scan
                        .filters
                        .iter()
                        .map(|f| self.expr(f))
                        .collect::<Result<Vec<_>>>()?;
                    sql = format!("{sql} WHERE {}", filters.join(" AND "));
                }
                sql
            }
            LogicalPlan::Filter(filter) => {
                let input = self.subquery(&filter.input)?;
                format!("SELECT * FROM {input} WHERE {}", self.expr(&filter.predicate)?)
            }
            LogicalPlan::Projection(projection) => {
                let input = self.subquery(&projection.input)?;
                let exprs = projection
                    .exprs
                    .iter()
                    .map(|(c, e)| Ok(format!("{} AS c{}", self.expr(e)?, c.id())))
                    .collect::<Result<Vec<_>>>()?;
                format!("SELECT {} FROM {input}", exprs.join(", "))
            }
            LogicalPlan::Join(join) => {
                let left = self.subquery(&join.left)?;
                let right = self.subquery(&join.right)?;
                let keyword = match (join.join_type, &join.on) {
                    (JoinType::Inner, None) => return Ok(format!("SELECT * FROM {left} CROSS JOIN {right}")),
                    (JoinType::Inner, _) => "JOIN",
                    (JoinType::Left, _) => "LEFT JOIN",
                    (JoinType::Right, _) => "RIGHT JOIN",
                    (JoinType::Full, _) => "FULL JOIN",
                    (other, _) => bail!("can't render {other} joins"),
                };
                let on = match &join.on {
                    Some(on) => self.expr(on)?,
                    None => "true".to_string(),
                };
                format!("SELECT * FROM {left} {keyword} {right} ON {on}")
            }
            LogicalPlan::Aggregate(aggregate) => {
                let input = self.subquery(&aggregate.input)?;
                let groups = aggregate
                    .group_by
                    .iter()
                    .map(|c| format!("c{}", c.id()))
                    .collect_vec();
                let aggregates = aggregate
                    .aggregates
                    .iter()
                    .map(|(c, call)| Ok(format!("{} AS c{}", self.aggregate(call)?, c.id())))
                    .collect::<Result<Vec<_>>>()?;
                let select = groups.iter().cloned().chain(aggregates).join(", ");
                if groups.is_empty() {
                    format!("SELECT {select} FROM {input}")
                } else {
                    format!("SELECT {select} FROM {input} GROUP BY {}", groups.join(", "))
                }
            }
        })
    }

    fn subquery(&mut self, plan: &LogicalPlan) -> Result<String> {
        let sql = self.plan(plan)?;
        self.next_alias += 1;
        Ok(format!("({sql}) AS s{}", self.next_alias))
    }

    fn aggregate(&mut self, call: &AggregateCall) -> Result<String> {
        if call.args.is_empty() {
            return Ok(format!("{}(*)", call.func));
        }
        let args = call
            .args
            .iter()
            .map(|a| self.expr(a))
            .collect::<Result<Vec<_>>>()?;
        let distinct = if call.distinct { "DISTINCT " } else { "" };
        Ok(format!("{}({distinct}{})", call.func, args.join(", ")))
    }

    fn expr(&mut self, expr: &ScalarOperator) -> Result<String> {
        Ok(match expr {
            ScalarOperator::Column(c) => format!("c{}", c.id()),
            ScalarOperator::Literal(value) => literal(value)?,
            ScalarOperator::BinaryExpr(BinaryExpr { left, op, right }) => {
                format!("({} {op} {})", self.expr(left)?, self.expr(right)?)
            }
            ScalarOperator::Not(e) => format!("(NOT {})", self.expr(e)?),
            ScalarOperator::IsNull(e) => format!("({} IS NULL)", self.expr(e)?),
            ScalarOperator::IsNotNull(e) => format!("({} IS NOT NULL)", self.expr(e)?),
            ScalarOperator::Cast(Cast { expr, data_type }) => {
                format!("arrow_cast({}, '{data_type}')", self.expr(expr)?)
            }
            ScalarOperator::ScalarFunction(ScalarFunction { name, args }) => {
                let args = args.iter().map(|a| self.expr(a)).collect::<Result<Vec<_>>>()?;
                format!("{name}({})", args.join(", "))
            }
        })
    }
}

fn literal(value: &ScalarValue) -> Result<String> {
    if value.is_null() {
        return Ok("NULL".to_string());
    }
    Ok(match value {
        ScalarValue::Utf8(Some(s)) | ScalarValue::LargeUtf8(Some(s)) => {
            format!("'{}'", s.replace('\'', "''"))
        }
        ScalarValue::Date32(_) => format!("DATE '{value}'"),
        ScalarValue::Boolean(_)
        | ScalarValue::Int8(_)
        | ScalarValue::Int16(_)
        | ScalarValue::Int32(_)
        | ScalarValue::Int64(_)
        | ScalarValue::UInt8(_)
        | ScalarValue::UInt16(_)
        | ScalarValue::UInt32(_)
        | ScalarValue::UInt64(_)
        | ScalarValue::Float32(_)
        | ScalarValue::Float64(_) => value.to_string(),
        other => bail!("can't render literal {other:?}"),
    })
}

/// Run `plan`, returning its rows in a canonical order as a table.
pub async fn run(ctx: &SessionContext, plan: &LogicalPlan) -> Result<String> {
    let sql = SqlWriter::default().plan(plan)?;
    let order = plan
        .output_columns()
        .iter()
        .map(|c| format!("c{}", c.id()))
        .join(", ");
    let sql = format!("SELECT * FROM ({sql}) AS result ORDER BY {order}");

    let batches = ctx
        .sql(&sql)
        .await
        .with_context(|| format!("plan {sql}"))?
        .collect()
        .await
        .with_context(|| format!("run {sql}"))?;

    Ok(pretty_format_batches(&batches)?.to_string())
}

/// Store the contents of `mv` as a table under its name, with its output column names.
pub async fn materialize(ctx: &SessionContext, mv: &MaterializedView) -> Result<()> {
    let sql = SqlWriter::default().plan(mv.plan())?;
    let columns = mv
        .plan()
        .output_columns()
        .iter()
        .map(|c| format!("c{} AS \"{}\"", c.id(), c.name()))
        .join(", ");

    ctx.sql(&format!("DROP TABLE IF EXISTS {}", mv.name()))
        .await?
        .collect()
        .await?;
    ctx.sql(&format!(
        "CREATE TABLE {} AS SELECT {columns} FROM ({sql}) AS mv",
        mv.name()
    ))
    .await
    .with_context(|| format!("materialize {}", mv.name()))?
    .collect()
    .await?;

    Ok(())
}

/// Partition metadata kept in memory, for tables whose loads the test simulates.
#[derive(Debug, Default)]
pub struct InMemoryPartitions {
    tables: RwLock<HashMap<String, TableMetadata>>,
}

impl InMemoryPartitions {
    pub fn set(&self, table: &ResolvedTableReference, metadata: TableMetadata) {
        self.tables.write().insert(table.to_string(), metadata);
    }

    pub fn remove(&self, table: &ResolvedTableReference) {
        self.tables.write().remove(&table.to_string());
    }

    /// Simulate a load into `partition` of `table`.
    pub fn load(&self, table: &ResolvedTableReference, partition: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let Some(p) = tables
            .get_mut(&table.to_string())
            .and_then(|t| t.partitions.iter_mut().find(|p| p.name == partition))
        else {
            bail!("no partition {partition} in {table}");
        };
        p.version += 1;
        Ok(())
    }

    /// An unpartitioned native table holding data.
    pub fn unpartitioned(&self, table: &ResolvedTableReference) {
        self.set(
            table,
            TableMetadata {
                kind: TableKind::Native,
                partition_column: None,
                partitions: vec![PartitionMetadata {
                    name: table.table.to_string(),
                    id: 1,
                    version: 2,
                    range: None,
                }],
            },
        );
    }
}

impl PartitionMetadataSource for InMemoryPartitions {
    fn name(&self) -> &str {
        "in_memory"
    }

    fn table_metadata(
        &self,
        table: &ResolvedTableReference,
    ) -> datafusion_common::Result<TableMetadata> {
        self.tables
            .read()
            .get(&table.to_string())
            .cloned()
            .ok_or_else(|| datafusion_common::DataFusionError::Plan(format!("no such table {table}")))
    }
}
