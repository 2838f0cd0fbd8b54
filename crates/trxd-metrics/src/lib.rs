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

//! Statistics for the trxd fare server.
//!
//! # Architecture
//!
//! - [`ServerStats`]: lock-free counters and gauges updated by the dispatch
//!   loop and request tasks
//! - [`StatsSnapshot`]: serialisable point-in-time view, including the
//!   worker pool and booster gauges supplied by the caller
//!
//! # Example
//!
//! ```rust
//! use trxd_metrics::ServerStats;
//! use std::time::Instant;
//!
//! let stats = ServerStats::new();
//! let start = Instant::now();
//! stats.transaction_started();
//! stats.transaction_finished(start, true);
//!
//! let snapshot = stats.snapshot(Vec::new(), None);
//! assert_eq!(snapshot.transactions_completed, 1);
//! ```

mod registry;
mod snapshot;

pub use registry::ServerStats;
pub use snapshot::{LatencySummary, StatsSnapshot};
