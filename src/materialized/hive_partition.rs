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

//! Partitions of external tables laid out in the Hive partitioning scheme,
//! e.g. `s3://sip/trades/dt=2006-01-02/trades.parquet`.

use std::collections::BTreeMap;

use arrow_schema::DataType;
use datafusion_common::{DataFusionError, Result, ScalarValue};

use super::{partition::PartitionRange, partition_metadata::PartitionMetadata};

/// Value Hive writes for null partition values.
pub const HIVE_DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

// Extract partition column values from a file path, erroring if the partition column is not found.
pub(crate) fn parse_partitions_for_path<'a>(
    file_path: &'a str,
    table_partition_col: &str,
    null_if_missing: bool,
) -> Result<Option<&'a str>> {
    match file_path.split('/').find_map(|part| {
        part.split_once('=')
            .and_then(|(name, val)| (name == table_partition_col).then_some(val))
    }) {
        Some(part) => Ok(Some(part)),
        None if null_if_missing => Ok(None),
        _ => Err(DataFusionError::Execution(format!(
            "Path '{file_path}' did not contain any values corresponding to \
                    partition column '{table_partition_col}'"
        ))),
    }
}

/// The range `[value, next value)` covered by a single-valued partition.
///
/// Only dates and integers have a next value; other types, and the null partition,
/// have no range.
pub fn hive_partition_range(value: &str, data_type: &DataType) -> Result<Option<PartitionRange>> {
    if value == HIVE_DEFAULT_PARTITION {
        return Ok(None);
    }

    let lower = ScalarValue::Utf8(Some(value.to_string()))
        .cast_to(data_type)
        .map_err(|e| e.context(format!("invalid partition value '{value}'")))?;
    let upper = match &lower {
        ScalarValue::Date32(Some(days)) => ScalarValue::Date32(Some(days + 1)),
        ScalarValue::Date64(Some(ms)) => ScalarValue::Date64(Some(ms + 86_400_000)),
        _ if data_type.is_integer() => lower.add(ScalarValue::new_one(data_type)?)?,
        _ => return Ok(None),
    };

    PartitionRange::try_new(lower, upper).map(Some)
}

/// Group the files of an external table into partitions of `column`.
///
/// Each file is given with its modification time; a partition's version is the latest
/// modification time of its files, so rewriting any file makes the partition stale.
pub fn hive_partitions<'a>(
    files: impl IntoIterator<Item = (&'a str, i64)>,
    column: &str,
    data_type: &DataType,
) -> Result<Vec<PartitionMetadata>> {
    let mut latest = BTreeMap::<&str, i64>::new();
    for (path, modified) in files {
        let Some(value) = parse_partitions_for_path(path, column, false)? else {
            continue;
        };
        let version = latest.entry(value).or_insert(modified);
        *version = (*version).max(modified);
    }

    latest
        .into_iter()
        .map(|(value, version)| {
            Ok(PartitionMetadata {
                name: format!("{column}={value}"),
                // external partitions have no ids
                id: 0,
                version,
                range: hive_partition_range(value, data_type)?,
            })
        })
        .collect()
}
