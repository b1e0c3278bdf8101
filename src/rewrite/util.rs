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

use std::sync::Arc;

use itertools::Itertools;

use crate::{
    materialized::{MaterializedView, MaterializedViewRegistry},
    plan::LogicalPlan,
};

/// List every materialized view that scans at least one table scanned by `plan`.
/// Each view is listed once, in name order.
pub fn candidate_views(
    registry: &MaterializedViewRegistry,
    plan: &LogicalPlan,
) -> Vec<Arc<MaterializedView>> {
    plan.referenced_tables()
        .iter()
        .flat_map(|table| registry.views_referencing(table))
        .unique_by(|mv| mv.name().to_string())
        .sorted_by_key(|mv| mv.name().to_string())
        .collect()
}
