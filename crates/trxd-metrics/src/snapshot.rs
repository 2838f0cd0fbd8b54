// Copyright 2025 trxd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use trxd_exec::{BoosterStats, PoolStats};

/// Transaction latency summary in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Complete statistics snapshot, logged at shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub version: String,
    pub uptime_ms: u64,
    pub connections_accepted: u64,
    pub transactions_started: u64,
    pub transactions_completed: u64,
    pub transactions_failed: u64,
    pub transactions_throttled: u64,
    pub transactions_rejected: u64,
    pub protocol_errors: u64,
    pub timeouts: u64,
    pub concurrent_transactions: usize,
    pub peak_concurrent_transactions: usize,
    pub concurrency_level: usize,
    pub latency: LatencySummary,
    /// Failure count per task failure code.
    pub error_codes: BTreeMap<i32, u64>,
    pub pools: Vec<PoolStats>,
    pub booster: Option<BoosterStats>,
}

impl StatsSnapshot {
    /// Pool entry for a task class, if the class is enabled.
    pub fn pool(&self, class: &str) -> Option<&PoolStats> {
        self.pools.iter().find(|pool| pool.class == class)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
