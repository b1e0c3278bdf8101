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

mod common;

use std::sync::Arc;

use anyhow::Result;
use arrow_schema::DataType;
use common::{materialize, run, table, InMemoryPartitions};
use datafusion::prelude::SessionContext;
use datafusion_common::JoinType;
use datafusion_mv_rewrite::{
    materialized::{
        partition_metadata::PartitionMetadataRegistry,
        refresh::refresh_materialized_view,
        staleness::StalenessResolver,
        MaterializedView, MaterializedViewRegistry, RefreshScheme,
    },
    plan::{lit, AggregateCall, AggregateFunction, ColumnRefFactory, LogicalPlan, PlanBuilder},
    rewrite::{CardinalityEstimator, MaterializedViewRewrite, RewriteConfig},
    MaterializedConfig,
};

struct TestContext {
    ctx: SessionContext,
    partitions: Arc<InMemoryPartitions>,
    views: Arc<MaterializedViewRegistry>,
    resolver: Arc<StalenessResolver>,
}

impl TestContext {
    fn rewriter(&self) -> MaterializedViewRewrite {
        MaterializedViewRewrite::new(
            Arc::clone(&self.views),
            Arc::clone(&self.resolver),
            RewriteConfig::default(),
        )
    }

    /// Register, populate and refresh a materialized view.
    async fn create_mv(
        &self,
        name: &str,
        plan: LogicalPlan,
        factory: ColumnRefFactory,
        config: MaterializedConfig,
    ) -> Result<Arc<MaterializedView>> {
        let mv = self.views.register(MaterializedView::try_new(
            table(name),
            plan,
            factory,
            None,
            RefreshScheme::default(),
            config,
        )?);
        self.refresh(&mv).await?;
        Ok(mv)
    }

    async fn refresh(&self, mv: &MaterializedView) -> Result<()> {
        materialize(&self.ctx, mv).await?;
        refresh_materialized_view(&self.resolver, &self.views, mv, |_| Ok(()))?;
        Ok(())
    }
}

async fn setup() -> Result<TestContext> {
    let _ = env_logger::builder().is_test(true).try_init();

    let ctx = SessionContext::new();
    for sql in [
        "CREATE TABLE t1 (v4 INT, v5 INT, v6 INT)",
        "INSERT INTO t1 VALUES (1, 10, 100), (1, 11, 110), (2, 20, 200), (2, 21, 210), (3, 30, 300), (4, 40, 400), (5, 50, 500)",
        "CREATE TABLE t2 (c4 INT, c5 INT, c6 INT)",
        "INSERT INTO t2 VALUES (1, 1, 100), (2, 2, 200), (3, 3, 300), (4, 4, 400), (5, 5, 500), (6, 6, 600)",
    ] {
        ctx.sql(sql).await?.collect().await?;
    }

    let partitions = Arc::new(InMemoryPartitions::default());
    let metadata = Arc::new(PartitionMetadataRegistry::default());
    for name in ["t1", "t2"] {
        partitions.unpartitioned(&table(name));
        metadata.register_source(&table(name), partitions.clone());
    }

    Ok(TestContext {
        ctx,
        partitions,
        views: Arc::new(MaterializedViewRegistry::default()),
        resolver: Arc::new(StalenessResolver::new(metadata)),
    })
}

fn scan_t1(factory: &mut ColumnRefFactory) -> Result<PlanBuilder> {
    Ok(PlanBuilder::scan(
        factory,
        table("t1"),
        &[
            ("v4", DataType::Int32),
            ("v5", DataType::Int32),
            ("v6", DataType::Int32),
        ],
    )?)
}

/// `t2 join (select v4, sum(v5) as total from t1 group by v4) on c4 = v4`
fn join_agg_view(factory: &mut ColumnRefFactory) -> Result<PlanBuilder> {
    let t2 = PlanBuilder::scan(
        factory,
        table("t2"),
        &[
            ("c4", DataType::Int32),
            ("c5", DataType::Int32),
            ("c6", DataType::Int32),
        ],
    )?;

    let t1 = scan_t1(factory)?;
    let v5 = t1.col("v5")?;
    let agg_view_1 = t1
        .aggregate(
            factory,
            &["v4"],
            vec![("total", AggregateCall::new(AggregateFunction::Sum, vec![v5]))],
        )?
        .build();

    let on = t2
        .col("c4")?
        .eq(PlanBuilder::from(agg_view_1.clone()).col("v4")?);
    Ok(t2.join(agg_view_1, JoinType::Inner, Some(on)))
}

fn project(
    builder: PlanBuilder,
    factory: &mut ColumnRefFactory,
    names: &[&'static str],
) -> Result<LogicalPlan> {
    let exprs = names
        .iter()
        .map(|name| Ok((*name, builder.col(name)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(builder.project(factory, exprs)?.build())
}

#[tokio::test]
async fn test_rewrite_join_over_aggregate_view() -> Result<()> {
    let ctx = setup().await?;

    let mut factory = ColumnRefFactory::new();
    let joined = join_agg_view(&mut factory)?;
    let plan = project(joined, &mut factory, &["v4", "total", "c5", "c6"])?;
    ctx.create_mv("mv1", plan, factory, MaterializedConfig::default())
        .await?;

    let mut factory = ColumnRefFactory::new();
    let joined = join_agg_view(&mut factory)?;
    let c6 = joined.col("c6")?;
    let query = project(
        joined.filter(c6.gt_eq(lit(300))),
        &mut factory,
        &["v4", "total", "c5", "c6"],
    )?;

    let alternatives = ctx.rewriter().rewrite(&query, &factory);
    assert_eq!(alternatives.len(), 1);
    let rewrite = &alternatives[0];
    assert_eq!(rewrite.view, table("mv1"));
    assert_eq!(rewrite.compensations, 1);
    assert_eq!(rewrite.plan.referenced_tables(), vec![table("mv1")]);
    assert_eq!(rewrite.plan.output_columns(), query.output_columns());

    let expected = run(&ctx.ctx, &query).await?;
    let actual = run(&ctx.ctx, &rewrite.plan).await?;
    // v4 = 3, 4, 5
    assert_eq!(expected.lines().count(), 7, "{expected}");
    assert_eq!(expected, actual, "rewritten plan:\n{}", rewrite.plan.display_indent());

    Ok(())
}

#[tokio::test]
async fn test_stale_view_is_not_used() -> Result<()> {
    let ctx = setup().await?;

    let mut factory = ColumnRefFactory::new();
    let joined = join_agg_view(&mut factory)?;
    let plan = project(joined, &mut factory, &["v4", "total", "c5", "c6"])?;
    let mv = ctx
        .create_mv("mv1", plan, factory, MaterializedConfig::default())
        .await?;

    let mut factory = ColumnRefFactory::new();
    let joined = join_agg_view(&mut factory)?;
    let query = project(joined, &mut factory, &["v4", "total", "c5", "c6"])?;
    assert_eq!(ctx.rewriter().rewrite(&query, &factory).len(), 1);

    ctx.ctx
        .sql("INSERT INTO t1 VALUES (6, 60, 600)")
        .await?
        .collect()
        .await?;
    ctx.partitions.load(&table("t1"), "t1")?;

    // the query falls back to the base tables
    assert!(ctx.rewriter().rewrite(&query, &factory).is_empty());

    ctx.refresh(&mv).await?;
    let alternatives = ctx.rewriter().rewrite(&query, &factory);
    assert_eq!(alternatives.len(), 1);
    assert_eq!(alternatives[0].compensations, 0);
    assert_eq!(
        run(&ctx.ctx, &query).await?,
        run(&ctx.ctx, &alternatives[0].plan).await?
    );

    Ok(())
}

#[tokio::test]
async fn test_rollup_over_finer_grouping() -> Result<()> {
    let ctx = setup().await?;

    let mut factory = ColumnRefFactory::new();
    let t1 = scan_t1(&mut factory)?;
    let v6 = t1.col("v6")?;
    let plan = t1
        .aggregate(
            &mut factory,
            &["v4", "v5"],
            vec![
                ("cnt", AggregateCall::new(AggregateFunction::Count, vec![])),
                ("s", AggregateCall::new(AggregateFunction::Sum, vec![v6])),
            ],
        )?
        .build();
    ctx.create_mv("mv2", plan, factory, MaterializedConfig::default())
        .await?;

    let mut factory = ColumnRefFactory::new();
    let t1 = scan_t1(&mut factory)?;
    let v4 = t1.col("v4")?;
    let v6 = t1.col("v6")?;
    let query = t1
        .filter(v4.gt_eq(lit(2)))
        .aggregate(
            &mut factory,
            &["v4"],
            vec![
                ("n", AggregateCall::new(AggregateFunction::Count, vec![])),
                ("s6", AggregateCall::new(AggregateFunction::Sum, vec![v6])),
            ],
        )?
        .build();

    let alternatives = ctx.rewriter().rewrite(&query, &factory);
    assert_eq!(alternatives.len(), 1);
    let rewrite = &alternatives[0];
    assert_eq!(rewrite.view, table("mv2"));
    assert_eq!(rewrite.plan.referenced_tables(), vec![table("mv2")]);

    let expected = run(&ctx.ctx, &query).await?;
    let actual = run(&ctx.ctx, &rewrite.plan).await?;
    assert_eq!(expected, actual, "rewritten plan:\n{}", rewrite.plan.display_indent());

    Ok(())
}

#[tokio::test]
async fn test_views_excluded_from_rewrite() -> Result<()> {
    let ctx = setup().await?;

    let mut factory = ColumnRefFactory::new();
    let joined = join_agg_view(&mut factory)?;
    let plan = project(joined, &mut factory, &["v4", "total", "c5", "c6"])?;
    let mv = ctx
        .create_mv(
            "mv1",
            plan,
            factory,
            MaterializedConfig {
                use_in_query_rewrite: false,
                ..Default::default()
            },
        )
        .await?;

    let mut factory = ColumnRefFactory::new();
    let joined = join_agg_view(&mut factory)?;
    let query = project(joined, &mut factory, &["v4", "c6"])?;
    assert!(ctx.rewriter().rewrite(&query, &factory).is_empty());

    let rejection = ctx
        .rewriter()
        .attempt(&query, &factory, &mv)
        .expect_err("view is excluded from rewriting");
    assert_eq!(
        rejection.reason.to_string(),
        datafusion_mv_rewrite::rewrite::driver::RejectReason::DisabledForRewrite.to_string()
    );

    Ok(())
}

/// Pretends `mv_small` is smaller than every other table.
struct ByName;

impl CardinalityEstimator for ByName {
    fn estimate_rows(&self, plan: &LogicalPlan) -> Option<u64> {
        let tables = plan.referenced_tables();
        tables
            .iter()
            .any(|t| t.table.as_ref() == "mv_small")
            .then_some(10)
            .or(Some(1_000))
    }
}

#[tokio::test]
async fn test_ranking_by_estimated_rows() -> Result<()> {
    let ctx = setup().await?;

    for name in ["mv_large", "mv_small"] {
        let mut factory = ColumnRefFactory::new();
        let joined = join_agg_view(&mut factory)?;
        let plan = project(joined, &mut factory, &["v4", "total", "c5", "c6"])?;
        ctx.create_mv(name, plan, factory, MaterializedConfig::default())
            .await?;
    }

    let mut factory = ColumnRefFactory::new();
    let joined = join_agg_view(&mut factory)?;
    let query = project(joined, &mut factory, &["v4", "total"])?;

    let names = |rewriter: &MaterializedViewRewrite| {
        rewriter
            .rewrite(&query, &factory)
            .into_iter()
            .map(|alternative| alternative.view.table.to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(names(&ctx.rewriter()), vec!["mv_large", "mv_small"]);
    assert_eq!(
        names(&ctx.rewriter().with_cardinality_estimator(Arc::new(ByName))),
        vec!["mv_small", "mv_large"]
    );

    Ok(())
}
