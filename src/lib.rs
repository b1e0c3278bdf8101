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

#![deny(missing_docs)]

//! `datafusion-mv-rewrite` answers queries from materialized views and keeps track of
//! which parts of those views are stale.
//!
//! Plans are expressed in a small relational algebra ([`plan::LogicalPlan`]) whose columns
//! carry plan-wide identities handed out by a [`plan::ColumnRefFactory`].

/// Column identities, scalar expressions and the select-project-join-aggregate plans
/// that query rewriting reasons about.
pub mod plan;

/// Incremental view maintenance: partition ranges, the partition diff between base tables and
/// materialized views, and the staleness bookkeeping that decides what a refresh must recompute.
///
/// Base tables report their partitions through [`PartitionMetadataSource`](materialized::partition_metadata::PartitionMetadataSource)s,
/// registered per table in a [`PartitionMetadataRegistry`](materialized::partition_metadata::PartitionMetadataRegistry).
/// Materialized views live in a [`MaterializedViewRegistry`](materialized::MaterializedViewRegistry),
/// which is itself the metadata source for views defined on other views.
pub mod materialized;

/// An implementation of Query Rewriting, an optimization that rewrites queries to make use of materialized views.
pub mod rewrite;

use datafusion_common::TableReference;

/// Configuration options for materialized view related features.
#[derive(Debug, Clone)]
pub struct MaterializedConfig {
    /// Whether or not query rewriting should exploit this materialized view.
    pub use_in_query_rewrite: bool,
    /// Trust external base tables that can't report partition changes, once they have been read.
    /// Off by default: such tables make the whole view stale.
    pub force_external_table_query_rewrite: bool,
    /// Base tables whose loads don't trigger a refresh. Partial references are
    /// resolved against the view's catalog and schema.
    pub excluded_trigger_tables: Vec<TableReference>,
}

impl Default for MaterializedConfig {
    fn default() -> Self {
        Self {
            use_in_query_rewrite: true,
            force_external_table_query_rewrite: false,
            excluded_trigger_tables: vec![],
        }
    }
}
