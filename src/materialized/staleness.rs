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

//! Which partitions of a materialized view are stale.
//!
//! Live partitions of every base table are compared by name against what the view recorded
//! at its last refresh. In priority order, a base partition is changed when:
//!
//! 1. it is live but wasn't recorded (new data), unless it is a native partition
//!    still at its initial, empty version;
//! 2. any recorded partition is gone: nothing is known about what was removed,
//!    so every partition of that table is considered changed;
//! 3. its id changed (dropped and recreated under the same name);
//! 4. its version increased, or for external tables its modification time differs.
//!
//! Changed base partitions are then mapped onto the view's own partitions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use datafusion_common::{plan_err, DataFusionError, Result};

use super::{
    partition::{compute_partition_mapping, expand_potential_refresh, PartitionRange},
    partition_metadata::{PartitionMetadataRegistry, TableKind, TableMetadata},
    MaterializedView, RefreshBookkeeping,
};

/// What has to happen for a materialized view to become fresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshPlan {
    /// Generation of the bookkeeping this plan was computed from
    pub generation: u64,
    /// View partitions to recompute, including new ones
    pub partitions_to_refresh: BTreeSet<String>,
    /// View partitions to create
    pub partitions_to_add: BTreeMap<String, PartitionRange>,
    /// View partitions to drop
    pub partitions_to_drop: BTreeMap<String, PartitionRange>,
    /// table -> base partitions the recomputation reads
    pub base_partitions_to_read: BTreeMap<String, BTreeSet<String>>,
    /// table -> live partition metadata the plan was computed from
    pub live: BTreeMap<String, TableMetadata>,
    /// table -> upstream-dirty partitions this plan accounts for
    pub(crate) upstream_dirty: BTreeMap<String, BTreeSet<String>>,
}

impl RefreshPlan {
    /// Whether the view is already fresh.
    pub fn is_empty(&self) -> bool {
        self.partitions_to_refresh.is_empty() && self.partitions_to_drop.is_empty()
    }
}

/// Changes to one base table since the view last read it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TableChanges {
    /// These partitions changed; may be empty
    Partitions(BTreeSet<String>),
    /// Anything may have changed
    Everything,
}

impl TableChanges {
    fn is_unchanged(&self) -> bool {
        matches!(self, Self::Partitions(changed) if changed.is_empty())
    }
}

/// Decides which partitions of materialized views are stale,
/// using the live partition metadata of their base tables.
#[derive(Debug, Clone)]
pub struct StalenessResolver {
    metadata: Arc<PartitionMetadataRegistry>,
}

impl StalenessResolver {
    /// Resolve live partitions through `metadata`.
    pub fn new(metadata: Arc<PartitionMetadataRegistry>) -> Self {
        Self { metadata }
    }

    /// The registry live partitions are read from.
    pub fn metadata(&self) -> &Arc<PartitionMetadataRegistry> {
        &self.metadata
    }

    /// Names of the partitions of `mv` that must be recomputed before it can be trusted.
    pub fn compute_partitions_to_refresh(&self, mv: &MaterializedView) -> Result<BTreeSet<String>> {
        self.plan_refresh(mv).map(|plan| plan.partitions_to_refresh)
    }

    /// Work out how to bring `mv` up to date with its base tables.
    ///
    /// If a base table or the partition column of the view can no longer be resolved,
    /// the view is made inactive.
    pub fn plan_refresh(&self, mv: &MaterializedView) -> Result<RefreshPlan> {
        if !mv.is_active() {
            return plan_err!("materialized view {} is inactive", mv.name());
        }

        let snapshot = mv.snapshot();
        let mut live = BTreeMap::new();
        for table in mv.base_tables() {
            let metadata = self
                .metadata
                .table_metadata(table)
                .map_err(|e| resolution_failure(mv, e))?;
            live.insert(table.to_string(), metadata);
        }

        let changes = live
            .iter()
            .map(|(table, metadata)| (table.as_str(), table_changes(mv, table, metadata, &snapshot)))
            .collect::<BTreeMap<_, _>>();

        let mut plan = RefreshPlan {
            generation: snapshot.generation,
            upstream_dirty: snapshot.upstream_dirty.clone(),
            ..Default::default()
        };

        match mv.partition_expr() {
            None => {
                let name = mv.unpartitioned_name();
                if !snapshot.partitions.contains_key(&name) {
                    plan.partitions_to_add.insert(name.clone(), PartitionRange::unbounded());
                    plan.partitions_to_refresh.insert(name);
                } else if changes.values().any(|c| !c.is_unchanged()) {
                    plan.partitions_to_refresh.insert(name);
                }
                if !plan.partitions_to_refresh.is_empty() {
                    plan.base_partitions_to_read = all_partitions(&live);
                }
            }
            Some(partition_expr) => {
                let table = partition_expr.table.to_string();
                let Some(partition_table) = live.get(&table) else {
                    return Err(resolution_failure(
                        mv,
                        DataFusionError::Plan(format!("{table} is not a base table of the view")),
                    ));
                };
                let column_matches = partition_table
                    .partition_column
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(&partition_expr.column));
                if !column_matches {
                    return Err(resolution_failure(
                        mv,
                        DataFusionError::Plan(format!(
                            "{table} is no longer partitioned by {}",
                            partition_expr.column
                        )),
                    ));
                }

                let mv_ranges: BTreeMap<String, PartitionRange> = snapshot
                    .partitions
                    .iter()
                    .map(|(name, p)| (name.clone(), p.range.clone()))
                    .collect();
                let base_ranges = partition_table.partition_ranges();
                let mapping =
                    compute_partition_mapping(&base_ranges, &mv_ranges, partition_expr.granularity)?;
                let after_diff = mapping.diff.apply(&mv_ranges);

                let other_tables_changed = changes
                    .iter()
                    .any(|(t, c)| *t != table.as_str() && !c.is_unchanged());
                let changed = match &changes[table.as_str()] {
                    TableChanges::Partitions(changed)
                        if !other_tables_changed
                            && changed.iter().all(|p| mapping.base_to_mv.contains_key(p)) =>
                    {
                        Some(changed)
                    }
                    _ => None,
                };

                plan.partitions_to_refresh = match changed {
                    Some(changed) => mapping
                        .diff
                        .adds
                        .keys()
                        .cloned()
                        .chain(expand_potential_refresh(&mapping, changed).mv_partitions)
                        .collect(),
                    None => after_diff.keys().cloned().collect(),
                };

                if !plan.partitions_to_refresh.is_empty() {
                    let mut base_partitions_to_read = all_partitions(&live);
                    base_partitions_to_read.insert(
                        table,
                        plan.partitions_to_refresh
                            .iter()
                            .flat_map(|p| mapping.mv_to_base.get(p).into_iter().flatten().cloned())
                            .collect(),
                    );
                    plan.base_partitions_to_read = base_partitions_to_read;
                }
                plan.partitions_to_add = mapping.diff.adds;
                plan.partitions_to_drop = mapping.diff.deletes;
            }
        }

        log::trace!(
            "materialized view {} needs refreshing: {:?}",
            mv.name(),
            plan.partitions_to_refresh
        );
        plan.live = live;
        Ok(plan)
    }
}

fn resolution_failure(mv: &MaterializedView, error: DataFusionError) -> DataFusionError {
    mv.set_inactive(&error.to_string());
    DataFusionError::Plan(format!(
        "couldn't resolve the base tables of materialized view {}: {error}",
        mv.name()
    ))
}

fn all_partitions(live: &BTreeMap<String, TableMetadata>) -> BTreeMap<String, BTreeSet<String>> {
    live.iter()
        .map(|(table, metadata)| {
            (
                table.clone(),
                metadata.partitions.iter().map(|p| p.name.clone()).collect(),
            )
        })
        .collect()
}

fn table_changes(
    mv: &MaterializedView,
    table: &str,
    live: &TableMetadata,
    snapshot: &RefreshBookkeeping,
) -> TableChanges {
    let recorded = snapshot.base_partitions.get(table);

    if let TableKind::External {
        tracks_partitions: false,
    } = live.kind
    {
        // without change tracking the table is only trusted on request, and only once read
        return if mv.config().force_external_table_query_rewrite && recorded.is_some() {
            TableChanges::Partitions(BTreeSet::new())
        } else {
            TableChanges::Everything
        };
    }

    let empty = BTreeMap::new();
    let recorded = recorded.unwrap_or(&empty);
    let live_partitions = live.partitions_by_name();

    if let Some(gone) = recorded
        .keys()
        .find(|name| !live_partitions.contains_key(name.as_str()))
    {
        log::debug!("partition {gone} of {table} was dropped");
        return TableChanges::Everything;
    }

    let mut changed = live
        .partitions
        .iter()
        .filter(|p| match recorded.get(&p.name) {
            None => !(live.kind == TableKind::Native && p.version == 1),
            Some(info) if info.id != p.id => true,
            Some(info) => match live.kind {
                TableKind::External { .. } => p.version != info.version,
                TableKind::Native | TableKind::MaterializedView => p.version > info.version,
            },
        })
        .map(|p| p.name.clone())
        .collect::<BTreeSet<_>>();

    if let Some(dirty) = snapshot.upstream_dirty.get(table) {
        changed.extend(
            dirty
                .iter()
                .filter(|p| live_partitions.contains_key(p.as_str()))
                .cloned(),
        );
    }

    TableChanges::Partitions(changed)
}
