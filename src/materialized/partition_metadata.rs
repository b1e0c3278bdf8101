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

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;
use datafusion_common::{DataFusionError, ResolvedTableReference, Result};

use super::partition::PartitionRange;

/// How a table tracks changes to its partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// A table owned by this database. Partition versions start at 1 and increase on every load.
    Native,
    /// A table in an external catalog. Partition versions are modification times.
    External {
        /// Whether the connector reports partition-level changes at all
        tracks_partitions: bool,
    },
    /// A materialized view, versioned like a native table
    MaterializedView,
}

/// Live state of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    /// Partition name
    pub name: String,
    /// Partition id; a partition dropped and recreated under the same name gets a new id
    pub id: i64,
    /// Data version, or modification time for external tables
    pub version: i64,
    /// Range of partition column values, if the table is range partitioned
    pub range: Option<PartitionRange>,
}

/// Live partition metadata of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    /// How changes are tracked
    pub kind: TableKind,
    /// The column the table is partitioned by, if any
    pub partition_column: Option<String>,
    /// Current partitions. An unpartitioned table has a single partition.
    pub partitions: Vec<PartitionMetadata>,
}

impl TableMetadata {
    /// Partitions by name.
    pub fn partitions_by_name(&self) -> BTreeMap<&str, &PartitionMetadata> {
        self.partitions.iter().map(|p| (p.name.as_str(), p)).collect()
    }

    /// Ranges of the range partitions, by name. Partitions without a range are skipped.
    pub fn partition_ranges(&self) -> BTreeMap<String, PartitionRange> {
        self.partitions
            .iter()
            .filter_map(|p| Some((p.name.clone(), p.range.clone()?)))
            .collect()
    }
}

/// Registry that manages partition metadata sources for different tables.
/// Provides a centralized way to register and retrieve the sources
/// that report the live partitions of each table.
#[derive(Default)]
pub struct PartitionMetadataRegistry {
    metadata_sources: DashMap<String, Arc<dyn PartitionMetadataSource>>,
}

impl std::fmt::Debug for PartitionMetadataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionMetadataRegistry")
            .field(
                "metadata_sources",
                &self
                    .metadata_sources
                    .iter()
                    .map(|r| (r.key().clone(), r.value().name().to_string()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl PartitionMetadataRegistry {
    /// Registers a metadata source for a specific table.
    /// Returns the previously registered source for this table, if any
    pub fn register_source(
        &self,
        table: &ResolvedTableReference,
        source: Arc<dyn PartitionMetadataSource>,
    ) -> Option<Arc<dyn PartitionMetadataSource>> {
        self.metadata_sources.insert(table.to_string(), source)
    }

    /// Retrieves the registered [`PartitionMetadataSource`] for a specific table.
    pub fn get_source(
        &self,
        table: &ResolvedTableReference,
    ) -> Result<Arc<dyn PartitionMetadataSource>> {
        self.metadata_sources
            .get(&table.to_string())
            .map(|o| Arc::clone(o.value()))
            .ok_or_else(|| DataFusionError::Plan(format!("No metadata source for {}", table)))
    }

    /// Live partitions of `table`, from its registered source.
    pub fn table_metadata(&self, table: &ResolvedTableReference) -> Result<TableMetadata> {
        self.get_source(table)?
            .table_metadata(table)
            .map_err(|e| e.context(format!("couldn't get partitions of '{table}'")))
    }
}

/// A source of live partition metadata, used to decide which
/// materialized view partitions are stale.
///
/// A [`PartitionMetadataSource`] may report on multiple tables.
/// As such, it is the user's responsibility to register each table with the appropriate
/// [`PartitionMetadataSource`] in the [`PartitionMetadataRegistry`].
/// The [`MaterializedViewRegistry`](super::MaterializedViewRegistry) is itself a source for
/// the materialized views it holds, which is how views on views are tracked.
pub trait PartitionMetadataSource: Send + Sync {
    /// The name of this partition metadata source.
    fn name(&self) -> &str;

    /// Current partitions of `table`.
    /// Errors if the table (or its partitioning) can no longer be resolved.
    fn table_metadata(&self, table: &ResolvedTableReference) -> Result<TableMetadata>;
}
