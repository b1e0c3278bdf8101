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

use std::{cmp::Ordering, sync::Arc};

use datafusion_common::ResolvedTableReference;
use itertools::Itertools;

use crate::{
    materialized::{staleness::StalenessResolver, MaterializedView, MaterializedViewRegistry},
    plan::{ColumnRefFactory, LogicalPlan},
};

/// Rewriting expressions between query and view column spaces.
pub mod column_rewriter;

/// Per-attempt state shared by the rewrite stages.
pub mod context;

/// The rewrite of a query against one materialized view.
pub mod driver;

/// Column equivalence classes derived from equality predicates.
pub mod equivalence;

/// Pairing the relations of a query with those of a view.
pub mod mapping;

/// SPJG normal form and predicate subsumption.
pub mod normal_form;

mod util;

use driver::{
    rewrite_candidate, CandidateRewrite, PartitionScope, RejectReason, Rejection, RewriteStage,
};

/// Options for materialized view query rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteConfig {
    /// Answer queries with a coarser grouping than the view's by re-aggregating the view.
    pub enable_aggregate_rollup: bool,
    /// Reject views whose stale partitions the query would read.
    pub check_staleness: bool,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            enable_aggregate_rollup: true,
            check_staleness: true,
        }
    }
}

/// Estimates the number of rows a plan produces. Used to break ties between rewrites.
pub trait CardinalityEstimator: Send + Sync {
    /// Estimated row count of `plan`, if known.
    fn estimate_rows(&self, plan: &LogicalPlan) -> Option<u64>;
}

/// A query rewritten to read from a materialized view.
#[derive(Debug, Clone)]
pub struct RewriteAlternative {
    /// Name of the materialized view
    pub view: ResolvedTableReference,
    /// The rewritten plan, with the same output columns as the query
    pub plan: LogicalPlan,
    /// The factory the rewritten plan's columns come from
    pub factory: ColumnRefFactory,
    /// Number of compensating predicates applied on top of the view
    pub compensations: usize,
    /// Estimated rows, if an estimator is configured
    pub estimated_rows: Option<u64>,
}

/// The "replace scans with a materialized view scan" transformation.
///
/// For a resolved query plan, every registered materialized view that shares a table
/// with the query is tried in turn. Successful rewrites are returned as alternatives,
/// best first: fewest compensating predicates, then fewest estimated rows, then name.
pub struct MaterializedViewRewrite {
    registry: Arc<MaterializedViewRegistry>,
    resolver: Arc<StalenessResolver>,
    estimator: Option<Arc<dyn CardinalityEstimator>>,
    config: RewriteConfig,
}

impl std::fmt::Debug for MaterializedViewRewrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterializedViewRewrite")
            .field("registry", &self.registry)
            .field("has_estimator", &self.estimator.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl MaterializedViewRewrite {
    /// Rewrite against the views in `registry`, checking their freshness with `resolver`.
    pub fn new(
        registry: Arc<MaterializedViewRegistry>,
        resolver: Arc<StalenessResolver>,
        config: RewriteConfig,
    ) -> Self {
        Self {
            registry,
            resolver,
            estimator: None,
            config,
        }
    }

    /// Break ties between rewrites with `estimator`.
    pub fn with_cardinality_estimator(mut self, estimator: Arc<dyn CardinalityEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Options in effect.
    pub fn config(&self) -> &RewriteConfig {
        &self.config
    }

    /// All rewrites of `plan` over registered materialized views, best first.
    /// Rejected candidates are logged and skipped.
    pub fn rewrite(&self, plan: &LogicalPlan, factory: &ColumnRefFactory) -> Vec<RewriteAlternative> {
        let candidates = util::candidate_views(&self.registry, plan);
        log::trace!(
            "{} materialized view candidates for plan:\n{}",
            candidates.len(),
            plan.display_indent()
        );

        let mut alternatives = candidates
            .into_iter()
            .filter_map(|mv| match self.attempt(plan, factory, &mv) {
                Ok(rewrite) => Some(RewriteAlternative {
                    view: mv.name().clone(),
                    estimated_rows: self
                        .estimator
                        .as_ref()
                        .and_then(|estimator| estimator.estimate_rows(&rewrite.plan)),
                    plan: rewrite.plan,
                    factory: rewrite.factory,
                    compensations: rewrite.compensations,
                }),
                Err(rejection) => {
                    log::debug!("not rewriting with {}: {rejection}", mv.name());
                    None
                }
            })
            .collect_vec();

        alternatives.sort_by(rank);
        alternatives
    }

    /// Try to rewrite `plan` over a single materialized view.
    pub fn attempt(
        &self,
        plan: &LogicalPlan,
        factory: &ColumnRefFactory,
        mv: &MaterializedView,
    ) -> Result<CandidateRewrite, Rejection> {
        let reject = |reason| Err(Rejection::new(RewriteStage::Accepted, reason));

        // cheap checks first
        if !mv.is_active() {
            return reject(RejectReason::Inactive);
        }
        if !mv.config().use_in_query_rewrite {
            return reject(RejectReason::DisabledForRewrite);
        }

        let rewrite = rewrite_candidate(plan, factory, &mv.definition(), &self.config)?;

        if self.config.check_staleness {
            let stale = self
                .stale_partitions_read(mv, &rewrite.partition_scope)
                .map_err(|e| Rejection::new(RewriteStage::Accepted, e.into()))?;
            if !stale.is_empty() {
                return reject(RejectReason::Stale(stale));
            }
        }

        log::trace!("accepted rewrite with {}", mv.name());
        Ok(rewrite)
    }

    /// Partitions of `mv` that need a refresh and that a plan reading `scope` would see.
    fn stale_partitions_read(
        &self,
        mv: &MaterializedView,
        scope: &PartitionScope,
    ) -> datafusion_common::Result<Vec<String>> {
        if *scope == PartitionScope::Nothing {
            return Ok(vec![]);
        }

        let plan = self.resolver.plan_refresh(mv)?;
        let snapshot = mv.snapshot();
        Ok(plan
            .partitions_to_refresh
            .iter()
            .filter(|name| {
                let PartitionScope::Range(interval) = scope else {
                    return true;
                };
                let range = snapshot
                    .partitions
                    .get(*name)
                    .map(|p| &p.range)
                    .or_else(|| plan.partitions_to_add.get(*name));
                // unknown ranges might hold anything
                range.map_or(true, |range| range.intersects_interval(interval))
            })
            .cloned()
            .collect())
    }
}

/// Fewest compensations, then fewest estimated rows (unknown last), then view name.
fn rank(a: &RewriteAlternative, b: &RewriteAlternative) -> Ordering {
    let rows = |r: &RewriteAlternative| (r.estimated_rows.is_none(), r.estimated_rows);
    a.compensations
        .cmp(&b.compensations)
        .then_with(|| rows(a).cmp(&rows(b)))
        .then_with(|| a.view.to_string().cmp(&b.view.to_string()))
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;

    use datafusion_common::TableReference;

    use super::{rank, RewriteAlternative};
    use crate::plan::{ColumnRefFactory, LogicalPlan, PlanBuilder};

    fn alternative(name: &str, compensations: usize, estimated_rows: Option<u64>) -> RewriteAlternative {
        let mut factory = ColumnRefFactory::new();
        let view = TableReference::bare(name).resolve("datafusion", "public");
        let plan: LogicalPlan = PlanBuilder::scan(&mut factory, view.clone(), &[])
            .map(PlanBuilder::build)
            .unwrap();
        RewriteAlternative {
            view,
            plan,
            factory,
            compensations,
            estimated_rows,
        }
    }

    #[test]
    fn ranking() {
        let mut alternatives = vec![
            alternative("d", 2, Some(1)),
            alternative("c", 1, None),
            alternative("b", 1, Some(100)),
            alternative("a", 1, None),
            alternative("e", 1, Some(10)),
        ];
        alternatives.sort_by(rank);

        assert_eq!(
            alternatives
                .iter()
                .map(|a| a.view.table.to_string())
                .collect::<Vec<_>>(),
            vec!["e", "b", "a", "c", "d"]
        );
        assert_eq!(rank(&alternatives[0], &alternatives[0]), Ordering::Equal);
    }
}
