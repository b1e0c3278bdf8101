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

/// Partitions of external tables in the Hive partitioning scheme
pub mod hive_partition;

/// Partition ranges and the base table / materialized view partition diff
pub mod partition;

/// Pluggable sources of live partition metadata
pub mod partition_metadata;

/// Refreshing materialized views and committing their bookkeeping
pub mod refresh;

/// Deciding which materialized view partitions are stale
pub mod staleness;

mod util;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use datafusion_common::{
    not_impl_err, plan_err, DataFusionError, ResolvedTableReference, Result, ScalarValue,
};
use itertools::Itertools;
use parking_lot::RwLock;

use crate::{
    plan::{ColumnRefFactory, LogicalPlan, ScalarFunction, ScalarOperator},
    rewrite::{driver::ViewDefinition, mapping::RelationKey, normal_form::SpjgNormalForm},
    MaterializedConfig,
};
use partition::{PartitionRange, TimeGranularity};
use partition_metadata::{PartitionMetadata, PartitionMetadataSource, TableKind, TableMetadata};

/// When a materialized view is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshType {
    /// Together with the loads into its base tables
    Sync,
    /// In the background, on a schedule or after loads
    Async,
    /// Only on request
    Manual,
    /// Incrementally, after every load
    Incremental,
}

/// Whether a materialized view is populated as soon as it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMoment {
    /// Populate on creation
    Immediate,
    /// Populate on the first refresh
    Deferred,
}

/// Period of a scheduled asynchronous refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncRefreshSchedule {
    /// First refresh
    pub start: Option<NaiveDateTime>,
    /// Number of `unit`s between refreshes
    pub step: u32,
    /// Unit of `step`
    pub unit: TimeGranularity,
}

/// How and when a materialized view is refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshScheme {
    /// When refreshes happen
    pub refresh_type: RefreshType,
    /// Whether creation populates the view
    pub moment: RefreshMoment,
    /// Period of asynchronous refreshes; `None` refreshes after loads instead
    pub schedule: Option<AsyncRefreshSchedule>,
}

impl Default for RefreshScheme {
    fn default() -> Self {
        Self {
            refresh_type: RefreshType::Async,
            moment: RefreshMoment::Immediate,
            schedule: None,
        }
    }
}

/// How a materialized view's partition column derives from a base table column:
/// either that column, or `date_trunc(granularity, column)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionExpr {
    /// Output column of the view the view is partitioned by
    pub mv_column: String,
    /// Base table the partition column comes from
    pub table: ResolvedTableReference,
    /// Partition column of that table
    pub column: String,
    /// Time bucket, if the view is partitioned more coarsely than its base table
    pub granularity: Option<TimeGranularity>,
}

impl PartitionExpr {
    /// Trace the view's output column `mv_column` back to a base table column.
    fn resolve(plan: &LogicalPlan, factory: &ColumnRefFactory, mv_column: &str) -> Result<Self> {
        let mut factory = factory.clone();
        let normal_form = SpjgNormalForm::new(plan, &mut factory)?;

        let Some(idx) = normal_form
            .output_columns()
            .iter()
            .position(|c| c.name().eq_ignore_ascii_case(mv_column))
        else {
            return plan_err!("partition column {mv_column} is not an output of the view");
        };

        let mut expr = &normal_form.output_exprs()[idx];
        if let Some(aggregate) = normal_form.aggregate() {
            match expr.as_column().and_then(|c| aggregate.group_expr(c)) {
                Some(group_expr) => expr = group_expr,
                None => return not_impl_err!("partition column {mv_column} is not a grouping key"),
            }
        }

        let (column, granularity) = match expr {
            ScalarOperator::Column(c) => (c, None),
            ScalarOperator::ScalarFunction(ScalarFunction { name, args }) if name == "date_trunc" => {
                match args.as_slice() {
                    [ScalarOperator::Literal(ScalarValue::Utf8(Some(granularity))), ScalarOperator::Column(c)] => {
                        (c, Some(granularity.parse::<TimeGranularity>()?))
                    }
                    _ => return not_impl_err!("unsupported partition expression {expr}"),
                }
            }
            _ => return not_impl_err!("unsupported partition expression {expr}"),
        };

        let table = normal_form
            .relations()
            .iter()
            .find(|r| r.columns.contains(column))
            .map(|r| &r.key);
        match table {
            Some(RelationKey::Table(table)) => Ok(Self {
                mv_column: mv_column.to_string(),
                table: table.clone(),
                column: column.name().to_string(),
                granularity,
            }),
            _ => not_impl_err!("partition column {mv_column} does not come from a base table"),
        }
    }
}

/// Recorded state of a base table partition, as of the last refresh that read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasePartitionInfo {
    /// Partition id
    pub id: i64,
    /// Data version, or modification time for external tables
    pub version: i64,
}

/// A partition of a materialized view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvPartition {
    /// Partition id
    pub id: i64,
    /// Data version, increased on every refresh of the partition
    pub version: i64,
    /// Range of the partition column; unbounded if the view isn't partitioned
    pub range: PartitionRange,
}

/// What a materialized view knows about its own data.
/// Only a successful refresh changes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshBookkeeping {
    /// table -> partition -> state of the base table partitions last read
    pub base_partitions: BTreeMap<String, BTreeMap<String, BasePartitionInfo>>,
    /// The view's own partitions
    pub partitions: BTreeMap<String, MvPartition>,
    /// table -> partitions of upstream materialized views refreshed since they were last read
    pub upstream_dirty: BTreeMap<String, BTreeSet<String>>,
    /// Number of refreshes committed
    pub generation: u64,
    /// Time of the last committed refresh
    pub last_refresh_time: Option<DateTime<Utc>>,
    pub(crate) next_partition_id: i64,
}

/// A materialized view: a table defined by a query over base tables,
/// plus the bookkeeping that tells how fresh its contents are.
#[derive(Debug)]
pub struct MaterializedView {
    name: ResolvedTableReference,
    plan: LogicalPlan,
    factory: ColumnRefFactory,
    base_tables: Vec<ResolvedTableReference>,
    refresh_scheme: RefreshScheme,
    partition_expr: Option<PartitionExpr>,
    config: MaterializedConfig,
    active: AtomicBool,
    bookkeeping: RwLock<RefreshBookkeeping>,
}

impl MaterializedView {
    /// Define a materialized view named `name` as `plan`, partitioned by its output column `partition_by`.
    pub fn try_new(
        name: ResolvedTableReference,
        plan: LogicalPlan,
        factory: ColumnRefFactory,
        partition_by: Option<&str>,
        refresh_scheme: RefreshScheme,
        config: MaterializedConfig,
    ) -> Result<Self> {
        let partition_expr = partition_by
            .map(|column| PartitionExpr::resolve(&plan, &factory, column))
            .transpose()
            .map_err(|e| e.context(format!("invalid partitioning for materialized view {name}")))?;

        Ok(Self {
            base_tables: plan.referenced_tables(),
            name,
            plan,
            factory,
            refresh_scheme,
            partition_expr,
            config,
            active: AtomicBool::new(true),
            bookkeeping: RwLock::new(RefreshBookkeeping::default()),
        })
    }

    /// Fully qualified name
    pub fn name(&self) -> &ResolvedTableReference {
        &self.name
    }

    /// The defining plan
    pub fn plan(&self) -> &LogicalPlan {
        &self.plan
    }

    /// The factory the defining plan was built with
    pub fn factory(&self) -> &ColumnRefFactory {
        &self.factory
    }

    /// Tables scanned by the defining plan, in plan order
    pub fn base_tables(&self) -> &[ResolvedTableReference] {
        &self.base_tables
    }

    /// How the view is refreshed
    pub fn refresh_scheme(&self) -> &RefreshScheme {
        &self.refresh_scheme
    }

    /// How the view is partitioned, if it is
    pub fn partition_expr(&self) -> Option<&PartitionExpr> {
        self.partition_expr.as_ref()
    }

    /// Options
    pub fn config(&self) -> &MaterializedConfig {
        &self.config
    }

    /// The definition as seen by query rewriting.
    pub fn definition(&self) -> ViewDefinition<'_> {
        ViewDefinition {
            name: &self.name,
            plan: &self.plan,
            factory: &self.factory,
            partition_column: self.partition_expr.as_ref().map(|p| p.mv_column.as_str()),
        }
    }

    /// Whether the view can be used. An inactive view stays inactive until [`Self::activate`].
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop using the view, e.g. because a base table disappeared.
    pub fn set_inactive(&self, reason: &str) {
        if self.active.swap(false, Ordering::AcqRel) {
            log::warn!("materialized view {} is now inactive: {reason}", self.name);
        }
    }

    /// Use the view again after its definition was repaired.
    pub fn activate(&self) {
        if !self.active.swap(true, Ordering::AcqRel) {
            log::info!("materialized view {} is active again", self.name);
        }
    }

    /// A copy of the refresh bookkeeping.
    pub fn snapshot(&self) -> RefreshBookkeeping {
        self.bookkeeping.read().clone()
    }

    pub(crate) fn bookkeeping(&self) -> &RwLock<RefreshBookkeeping> {
        &self.bookkeeping
    }

    /// Name of the single partition of an unpartitioned view.
    pub fn unpartitioned_name(&self) -> String {
        self.name.table.to_string()
    }

    /// Ranges of the view's current partitions.
    pub fn partition_ranges(&self) -> BTreeMap<String, PartitionRange> {
        self.bookkeeping
            .read()
            .partitions
            .iter()
            .map(|(name, p)| (name.clone(), p.range.clone()))
            .collect()
    }

    /// Whether loads into base tables trigger a refresh, rather than a schedule or the user.
    pub fn is_load_triggered_refresh(&self) -> bool {
        match self.refresh_scheme.refresh_type {
            RefreshType::Incremental => true,
            RefreshType::Async => self.refresh_scheme.schedule.is_none(),
            RefreshType::Sync | RefreshType::Manual => false,
        }
    }

    /// Whether the view reads `table`.
    pub fn contains_base_table(&self, table: &ResolvedTableReference) -> bool {
        self.base_tables.contains(table)
    }

    /// Whether a load into `table` should refresh this view.
    pub fn should_trigger_refresh_by(&self, table: &ResolvedTableReference) -> bool {
        self.is_load_triggered_refresh()
            && self.contains_base_table(table)
            && !self
                .config
                .excluded_trigger_tables
                .iter()
                .any(|excluded| util::resolve_like(excluded, &self.name) == *table)
    }

    /// Record that partitions of the upstream materialized view `table` changed.
    pub(crate) fn mark_upstream_dirty(
        &self,
        table: &ResolvedTableReference,
        partitions: impl IntoIterator<Item = String>,
    ) {
        let mut bookkeeping = self.bookkeeping.write();
        bookkeeping
            .upstream_dirty
            .entry(table.to_string())
            .or_default()
            .extend(partitions);
    }
}

/// Registry of the materialized views of a catalog.
///
/// It is also the [`PartitionMetadataSource`] for those views,
/// so views defined over other views can track their freshness.
#[derive(Debug, Default)]
pub struct MaterializedViewRegistry {
    views: DashMap<String, Arc<MaterializedView>>,
}

impl MaterializedViewRegistry {
    /// Add a view, replacing any view of the same name.
    pub fn register(&self, mv: MaterializedView) -> Arc<MaterializedView> {
        let mv = Arc::new(mv);
        if self
            .views
            .insert(mv.name().to_string(), Arc::clone(&mv))
            .is_some()
        {
            log::debug!("replaced materialized view {}", mv.name());
        }
        mv
    }

    /// The view named `name`.
    pub fn get(&self, name: &ResolvedTableReference) -> Option<Arc<MaterializedView>> {
        self.views.get(&name.to_string()).map(|r| Arc::clone(r.value()))
    }

    /// Drop the view named `name`.
    pub fn remove(&self, name: &ResolvedTableReference) -> Option<Arc<MaterializedView>> {
        self.views.remove(&name.to_string()).map(|(_, mv)| mv)
    }

    /// All views, in name order.
    pub fn views(&self) -> Vec<Arc<MaterializedView>> {
        self.views
            .iter()
            .map(|r| Arc::clone(r.value()))
            .sorted_by_key(|mv| mv.name().to_string())
            .collect()
    }

    /// Views that read `table`, in name order.
    pub fn views_referencing(&self, table: &ResolvedTableReference) -> Vec<Arc<MaterializedView>> {
        self.views
            .iter()
            .filter(|r| r.value().contains_base_table(table))
            .map(|r| Arc::clone(r.value()))
            .sorted_by_key(|mv| mv.name().to_string())
            .collect()
    }
}

impl PartitionMetadataSource for MaterializedViewRegistry {
    fn name(&self) -> &str {
        "materialized_views"
    }

    fn table_metadata(&self, table: &ResolvedTableReference) -> Result<TableMetadata> {
        let mv = self
            .get(table)
            .ok_or_else(|| DataFusionError::Plan(format!("no materialized view named {table}")))?;
        let partitioned = mv.partition_expr().is_some();
        let snapshot = mv.snapshot();

        Ok(TableMetadata {
            kind: TableKind::MaterializedView,
            partition_column: mv.partition_expr().map(|p| p.mv_column.clone()),
            partitions: snapshot
                .partitions
                .into_iter()
                .map(|(name, p)| PartitionMetadata {
                    name,
                    id: p.id,
                    version: p.version,
                    range: partitioned.then_some(p.range),
                })
                .collect(),
        })
    }
}
