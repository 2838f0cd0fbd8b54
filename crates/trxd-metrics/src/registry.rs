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
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use trxd_exec::{BoosterStats, PoolStats};

use crate::snapshot::{LatencySummary, StatsSnapshot};

const BINS_PER_DECADE: usize = 10;
const DECADES: usize = 8;
const NUM_BINS: usize = BINS_PER_DECADE * DECADES;

/// Logarithmic latency histogram covering 1us to 100s.
///
/// Each decade is split into ten linear bins; recording is a couple of
/// relaxed atomic adds.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_BINS],
    total_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        self.bins[Self::bin_of(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn bin_of(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }
        let decade = latency_us.ilog10() as usize;
        let step = 10u64.pow(decade as u32);
        let sub = (latency_us / step) as usize % BINS_PER_DECADE;
        (decade * BINS_PER_DECADE + sub).min(NUM_BINS - 1)
    }

    /// Lower bound of a bin.
    fn bin_floor(bin: usize) -> u64 {
        let decade = (bin / BINS_PER_DECADE) as u32;
        let sub = (bin % BINS_PER_DECADE).max(1) as u64;
        10u64.pow(decade) * sub
    }

    fn percentile(&self, percentile: u64) -> u64 {
        let total = self.samples.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let target = (total * percentile).div_ceil(100);
        let mut seen = 0;
        for (bin, count) in self.bins.iter().enumerate() {
            seen += count.load(Ordering::Relaxed);
            if seen >= target {
                return Self::bin_floor(bin);
            }
        }
        Self::bin_floor(NUM_BINS - 1)
    }

    fn summary(&self) -> LatencySummary {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return LatencySummary::default();
        }
        LatencySummary {
            avg_us: self.total_us.load(Ordering::Relaxed) / samples,
            p50_us: self.percentile(50),
            p95_us: self.percentile(95),
            p99_us: self.percentile(99),
        }
    }
}

/// Process-wide server statistics.
///
/// Counters are lock-free atomics on the hot path; only the per-code
/// failure map takes a lock. Snapshots are best-effort and may be slightly
/// inconsistent across counters.
#[derive(Debug)]
pub struct ServerStats {
    started: Instant,
    connections_accepted: AtomicU64,
    transactions_started: AtomicU64,
    transactions_completed: AtomicU64,
    transactions_failed: AtomicU64,
    transactions_throttled: AtomicU64,
    transactions_rejected: AtomicU64,
    protocol_errors: AtomicU64,
    timeouts: AtomicU64,
    concurrent: AtomicUsize,
    peak_concurrent: AtomicUsize,
    concurrency_level: AtomicUsize,
    latency: LatencyHistogram,
    error_codes: RwLock<BTreeMap<i32, u64>>,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            transactions_started: AtomicU64::new(0),
            transactions_completed: AtomicU64::new(0),
            transactions_failed: AtomicU64::new(0),
            transactions_throttled: AtomicU64::new(0),
            transactions_rejected: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            concurrent: AtomicUsize::new(0),
            peak_concurrent: AtomicUsize::new(0),
            concurrency_level: AtomicUsize::new(0),
            latency: LatencyHistogram::new(),
            error_codes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn record_connection(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a transaction entering the server and returns the new number
    /// of concurrent transactions.
    pub fn transaction_started(&self) -> usize {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent.fetch_max(now, Ordering::SeqCst);
        now
    }

    /// Counts a transaction leaving the server.
    pub fn transaction_finished(&self, started: Instant, success: bool) {
        let elapsed = started.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
        self.latency.record(elapsed);
        if success {
            self.transactions_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transactions_failed.fetch_add(1, Ordering::Relaxed);
        }
        let _ = self
            .concurrent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn record_throttled(&self) {
        self.transactions_throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a transaction refused before it reached a pool.
    pub fn record_rejected(&self) {
        self.transactions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error_code(&self, code: i32) {
        *self.error_codes.write().entry(code).or_insert(0) += 1;
    }

    pub fn set_concurrency_level(&self, level: usize) {
        self.concurrency_level.store(level, Ordering::Relaxed);
    }

    pub fn concurrent_transactions(&self) -> usize {
        self.concurrent.load(Ordering::SeqCst)
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Builds a snapshot, folding in pool and booster gauges.
    pub fn snapshot(&self, pools: Vec<PoolStats>, booster: Option<BoosterStats>) -> StatsSnapshot {
        StatsSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms: self.uptime_ms(),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            transactions_started: self.transactions_started.load(Ordering::Relaxed),
            transactions_completed: self.transactions_completed.load(Ordering::Relaxed),
            transactions_failed: self.transactions_failed.load(Ordering::Relaxed),
            transactions_throttled: self.transactions_throttled.load(Ordering::Relaxed),
            transactions_rejected: self.transactions_rejected.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            concurrent_transactions: self.concurrent.load(Ordering::SeqCst),
            peak_concurrent_transactions: self.peak_concurrent.load(Ordering::SeqCst),
            concurrency_level: self.concurrency_level.load(Ordering::Relaxed),
            latency: self.latency.summary(),
            error_codes: self.error_codes.read().clone(),
            pools,
            booster,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_histogram_bins() {
        assert_eq!(LatencyHistogram::bin_of(0), 0);
        assert_eq!(LatencyHistogram::bin_of(7), 7);
        assert_eq!(LatencyHistogram::bin_of(10), 11);
        assert_eq!(LatencyHistogram::bin_of(250), 22);
        assert_eq!(LatencyHistogram::bin_of(u64::MAX), NUM_BINS - 1);
        assert_eq!(LatencyHistogram::bin_floor(22), 200);
    }

    #[test]
    fn test_percentiles() {
        let histogram = LatencyHistogram::new();
        for _ in 0..90 {
            histogram.record(100);
        }
        for _ in 0..10 {
            histogram.record(50_000);
        }
        let summary = histogram.summary();
        assert_eq!(summary.p50_us, 100);
        assert_eq!(summary.p99_us, 50_000);
        assert_eq!(summary.avg_us, (90 * 100 + 10 * 50_000) / 100);
    }

    #[test]
    fn test_empty_summary_is_zero() {
        assert_eq!(LatencyHistogram::new().summary(), LatencySummary::default());
    }

    #[test]
    fn test_concurrent_transaction_gauge() {
        let stats = ServerStats::new();
        assert_eq!(stats.transaction_started(), 1);
        assert_eq!(stats.transaction_started(), 2);
        stats.transaction_finished(Instant::now(), true);
        stats.transaction_finished(Instant::now(), false);
        stats.transaction_finished(Instant::now(), false);

        let snapshot = stats.snapshot(Vec::new(), None);
        assert_eq!(snapshot.concurrent_transactions, 0);
        assert_eq!(snapshot.peak_concurrent_transactions, 2);
        assert_eq!(snapshot.transactions_completed, 1);
        assert_eq!(snapshot.transactions_failed, 2);
    }

    #[test]
    fn test_error_codes_counted() {
        let stats = Arc::new(ServerStats::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..25 {
                        stats.record_error_code(if i % 2 == 0 { 9001 } else { 7 });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot(Vec::new(), None);
        assert_eq!(snapshot.error_codes.get(&9001), Some(&50));
        assert_eq!(snapshot.error_codes.get(&7), Some(&50));
    }

    #[test]
    fn test_snapshot_serializes_with_pools() {
        let stats = ServerStats::new();
        stats.record_connection();
        stats.record_throttled();
        stats.set_concurrency_level(3);
        let pools = vec![PoolStats {
            class: "TRANSACTION".to_string(),
            max_workers: 4,
            queue_len: 2,
            active: 4,
            dispatched: 10,
            combined: 1,
            borrowed: 0,
        }];
        let snapshot = stats.snapshot(pools, Some(BoosterStats { size: 2, active: 1 }));
        assert_eq!(snapshot.pool("TRANSACTION").map(|p| p.queue_len), Some(2));

        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["connections_accepted"], 1);
        assert_eq!(json["transactions_throttled"], 1);
        assert_eq!(json["concurrency_level"], 3);
        assert_eq!(json["booster"]["active"], 1);
        assert_eq!(json["pools"][0]["class"], "TRANSACTION");
    }
}
