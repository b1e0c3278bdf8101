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

use std::collections::BTreeSet;

use chrono::Utc;
use datafusion_common::{exec_err, Result};

use super::{
    staleness::{RefreshPlan, StalenessResolver},
    BasePartitionInfo, MaterializedView, MaterializedViewRegistry, MvPartition,
};

/// Result of a refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Generation of the bookkeeping after the refresh
    pub generation: u64,
    /// Partitions recomputed
    pub refreshed: BTreeSet<String>,
    /// Partitions created
    pub added: BTreeSet<String>,
    /// Partitions dropped
    pub dropped: BTreeSet<String>,
}

/// Bring `mv` up to date.
///
/// `recompute` does the actual work described by the [`RefreshPlan`].
/// The view's bookkeeping is only updated once it succeeds, and all at once;
/// then every view in `registry` built on top of `mv` learns which partitions changed.
pub fn refresh_materialized_view<F>(
    resolver: &StalenessResolver,
    registry: &MaterializedViewRegistry,
    mv: &MaterializedView,
    recompute: F,
) -> Result<RefreshOutcome>
where
    F: FnOnce(&RefreshPlan) -> Result<()>,
{
    let plan = resolver.plan_refresh(mv)?;
    if plan.is_empty() {
        log::debug!("materialized view {} is up to date", mv.name());
        return Ok(RefreshOutcome {
            generation: plan.generation,
            ..Default::default()
        });
    }

    if let Err(e) = recompute(&plan) {
        log::warn!(
            "refresh of materialized view {} failed, partitions {:?} stay stale: {e}",
            mv.name(),
            plan.partitions_to_refresh
        );
        return Err(e.context(format!("couldn't refresh materialized view {}", mv.name())));
    }

    let outcome = commit(mv, &plan)?;
    log::debug!(
        "refreshed materialized view {} to generation {}: {:?}",
        mv.name(),
        outcome.generation,
        outcome.refreshed
    );

    // the write lock on `mv` is released by now
    for downstream in registry.views_referencing(mv.name()) {
        downstream.mark_upstream_dirty(mv.name(), outcome.refreshed.iter().cloned());
    }

    Ok(outcome)
}

fn commit(mv: &MaterializedView, plan: &RefreshPlan) -> Result<RefreshOutcome> {
    let mut bookkeeping = mv.bookkeeping().write();
    if bookkeeping.generation != plan.generation {
        return exec_err!(
            "materialized view {} was refreshed concurrently (planned at generation {}, now at {})",
            mv.name(),
            plan.generation,
            bookkeeping.generation
        );
    }

    bookkeeping.base_partitions = plan
        .live
        .iter()
        .map(|(table, metadata)| {
            let partitions = metadata
                .partitions
                .iter()
                .map(|p| {
                    (
                        p.name.clone(),
                        BasePartitionInfo {
                            id: p.id,
                            version: p.version,
                        },
                    )
                })
                .collect();
            (table.clone(), partitions)
        })
        .collect();

    for name in plan.partitions_to_drop.keys() {
        bookkeeping.partitions.remove(name);
    }
    for (name, range) in &plan.partitions_to_add {
        let id = bookkeeping.next_partition_id;
        bookkeeping.next_partition_id += 1;
        bookkeeping.partitions.insert(
            name.clone(),
            MvPartition {
                id,
                version: 0,
                range: range.clone(),
            },
        );
    }
    for name in &plan.partitions_to_refresh {
        if let Some(partition) = bookkeeping.partitions.get_mut(name) {
            partition.version += 1;
        }
    }

    for (table, consumed) in &plan.upstream_dirty {
        if let Some(dirty) = bookkeeping.upstream_dirty.get_mut(table) {
            dirty.retain(|p| !consumed.contains(p));
        }
    }
    bookkeeping.upstream_dirty.retain(|_, dirty| !dirty.is_empty());

    bookkeeping.generation += 1;
    bookkeeping.last_refresh_time = Some(Utc::now());

    Ok(RefreshOutcome {
        generation: bookkeeping.generation,
        refreshed: plan.partitions_to_refresh.clone(),
        added: plan.partitions_to_add.keys().cloned().collect(),
        dropped: plan.partitions_to_drop.keys().cloned().collect(),
    })
}
