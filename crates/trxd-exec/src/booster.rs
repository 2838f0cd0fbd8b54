//! Shared overflow pool.
//!
//! # Architecture
//!
//! The booster owns one global set of threads. Pools that opt in register
//! with it and notify it whenever their queue grows past their threshold.
//! A woken booster thread picks the registered pool with the largest excess
//! backlog whose allotment still has room, pops one task from that pool's
//! queue and runs it. Threads are never moved between pools; only work is.
//!
//! On each adjustment tick the booster re-reads every pool's excess backlog
//! and splits its threads between them in proportion, so one flooded class
//! cannot take the whole overflow capacity while others are also behind.
//!
//! The pool registry lock is never held while a pool's queue lock is taken.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info};
use trxd_common::{Result, TrxError};

use crate::pool::PoolShared;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoosterConfig {
    pub size: usize,
    pub adjust_interval: Duration,
}

impl Default for BoosterConfig {
    fn default() -> Self {
        Self {
            size: 4,
            adjust_interval: Duration::from_millis(500),
        }
    }
}

impl BoosterConfig {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn with_adjust_interval(mut self, interval: Duration) -> Self {
        self.adjust_interval = interval;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.size == 0 {
            return Err("booster pool size must be greater than zero".to_string());
        }
        if self.adjust_interval.is_zero() {
            return Err("booster adjust interval must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Booster gauges for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoosterStats {
    pub size: usize,
    pub active: usize,
}

#[derive(Debug)]
struct Signal {
    pending: usize,
    shutdown: bool,
    last_adjust: Instant,
}

#[derive(Debug)]
pub(crate) struct BoosterShared {
    config: BoosterConfig,
    pools: Mutex<Vec<Weak<PoolShared>>>,
    signal: Mutex<Signal>,
    wake: Condvar,
    active: AtomicUsize,
}

impl BoosterShared {
    pub(crate) fn size(&self) -> usize {
        self.config.size
    }

    pub(crate) fn register(&self, pool: &Arc<PoolShared>) {
        self.pools.lock().push(Arc::downgrade(pool));
        debug!(class = %pool.class(), "pool registered with booster");
    }

    /// Called by a pool, outside its queue lock, when its backlog crossed
    /// the threshold.
    pub(crate) fn notify(&self) {
        self.signal.lock().pending += 1;
        self.wake.notify_one();
    }

    fn live_pools(&self) -> Vec<Arc<PoolShared>> {
        let mut pools = self.pools.lock();
        pools.retain(|pool| pool.strong_count() > 0);
        pools.iter().filter_map(Weak::upgrade).collect()
    }

    /// Splits the booster's threads across pools by excess backlog.
    fn rebalance(&self) {
        let pools = self.live_pools();
        let excess: Vec<usize> = pools.iter().map(|pool| pool.excess()).collect();
        let allotments = split_allotments(self.config.size, &excess);

        for ((pool, excess), allotment) in pools.iter().zip(excess).zip(allotments) {
            if allotment != pool.allotment() {
                debug!(class = %pool.class(), allotment, excess, "booster allotment adjusted");
            }
            pool.set_allotment(allotment);
        }
    }

    fn next_task(&self) -> Option<(Arc<PoolShared>, crate::task::Task)> {
        let mut pools = self.live_pools();
        pools.sort_by_key(|pool| std::cmp::Reverse(pool.excess()));
        pools
            .into_iter()
            .find_map(|pool| pool.take_for_booster().map(|task| (pool, task)))
    }

    fn worker_loop(&self) {
        loop {
            let adjust_due = {
                let mut signal = self.signal.lock();
                while signal.pending == 0 && !signal.shutdown {
                    if self
                        .wake
                        .wait_for(&mut signal, self.config.adjust_interval)
                        .timed_out()
                    {
                        break;
                    }
                }
                if signal.shutdown {
                    return;
                }
                signal.pending = signal.pending.saturating_sub(1);
                if signal.last_adjust.elapsed() >= self.config.adjust_interval {
                    signal.last_adjust = Instant::now();
                    true
                } else {
                    false
                }
            };

            if adjust_due {
                self.rebalance();
            }

            while let Some((pool, task)) = self.next_task() {
                self.active.fetch_add(1, Ordering::SeqCst);
                task.run();
                self.active.fetch_sub(1, Ordering::SeqCst);
                pool.release_borrowed();
            }
        }
    }
}

/// Proportional share of `size` threads per pool.
///
/// With no backlog anywhere every pool may use the whole booster. Otherwise
/// pools get threads in proportion to their excess, and every pool keeps at
/// least one so a fresh backlog is picked up before the next tick.
fn split_allotments(size: usize, excess: &[usize]) -> Vec<usize> {
    let total: usize = excess.iter().sum();
    excess
        .iter()
        .map(|&excess| {
            if total == 0 {
                size
            } else {
                (size * excess / total).max(1)
            }
        })
        .collect()
}

/// Elastic overflow pool shared by every booster-eligible worker pool.
#[derive(Debug)]
pub struct BoosterPool {
    shared: Arc<BoosterShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BoosterPool {
    pub fn new(config: BoosterConfig) -> Result<Self> {
        config.validate().map_err(TrxError::Config)?;

        let shared = Arc::new(BoosterShared {
            config,
            pools: Mutex::new(Vec::new()),
            signal: Mutex::new(Signal {
                pending: 0,
                shutdown: false,
                last_adjust: Instant::now(),
            }),
            wake: Condvar::new(),
            active: AtomicUsize::new(0),
        });

        let pool = Self {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::new()),
        };
        for index in 0..shared.config.size {
            let worker = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("trxd-booster-{}", index))
                .spawn(move || worker.worker_loop())
                .map_err(TrxError::Io)?;
            pool.workers.lock().push(handle);
        }

        info!(
            size = shared.config.size,
            adjust_interval_ms = shared.config.adjust_interval.as_millis() as u64,
            "booster pool started"
        );
        Ok(pool)
    }

    pub(crate) fn shared(&self) -> &Arc<BoosterShared> {
        &self.shared
    }

    /// Number of booster threads.
    pub fn size(&self) -> usize {
        self.shared.config.size
    }

    /// Booster threads currently running a borrowed task.
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BoosterStats {
        BoosterStats {
            size: self.size(),
            active: self.active(),
        }
    }

    /// Stops the booster threads after their current task.
    pub fn shutdown(&self) {
        self.shared.signal.lock().shutdown = true;
        self.shared.wake.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("booster thread panicked");
            }
        }
    }
}

impl Drop for BoosterPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::pool::{WorkerPool, WorkerPoolConfig};
    use crate::task::TaskClass;
    use std::sync::mpsc;

    #[test]
    fn test_config_validation() {
        assert!(BoosterConfig::new(0).validate().is_err());
        assert!(BoosterConfig::new(2)
            .with_adjust_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(BoosterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_booster_drains_backlog_of_blocked_pool() {
        let booster = BoosterPool::new(
            BoosterConfig::new(2).with_adjust_interval(Duration::from_millis(20)),
        )
        .unwrap();
        let pool = WorkerPool::start(
            WorkerPoolConfig::new(TaskClass::TRANSACTION, 1).with_booster_threshold(1),
            Some(Arc::clone(booster.shared())),
        )
        .unwrap();
        let executor = Executor::with_pool(Some(Arc::clone(&pool)));

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        executor
            .execute(move |_| {
                started_tx.send(()).ok();
                release_rx.recv_timeout(Duration::from_secs(10)).ok();
                Ok(())
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        for i in 0..4 {
            let done_tx = done_tx.clone();
            executor
                .execute(move |_| {
                    done_tx.send(i).ok();
                    Ok(())
                })
                .unwrap();
        }

        // The bound worker is still blocked; the booster drains down to the
        // threshold, leaving one task queued.
        let mut boosted = Vec::new();
        for _ in 0..3 {
            boosted.push(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        boosted.sort();
        assert_eq!(boosted, vec![0, 1, 2]);
        assert_eq!(pool.stats().queue_len, 1);

        release_tx.send(()).unwrap();
        executor.wait(true).unwrap();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);

        pool.shutdown();
        booster.shutdown();
        assert_eq!(booster.active(), 0);
    }

    #[test]
    fn test_pool_without_threshold_is_not_boosted() {
        let booster = BoosterPool::new(BoosterConfig::new(1)).unwrap();
        let pool = WorkerPool::start(
            WorkerPoolConfig::new(TaskClass::ASYNC, 1),
            Some(Arc::clone(booster.shared())),
        )
        .unwrap();
        assert!(booster.shared().live_pools().is_empty());
        pool.shutdown();
        booster.shutdown();
    }

    #[test]
    fn test_split_allotments() {
        assert_eq!(split_allotments(4, &[0, 0]), vec![4, 4]);
        assert_eq!(split_allotments(8, &[30, 10, 0]), vec![6, 2, 1]);
        assert_eq!(split_allotments(2, &[1, 1, 1]), vec![1, 1, 1]);
    }
}
