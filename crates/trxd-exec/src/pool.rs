//! Fixed-size worker pools, one per task class.
//!
//! # Architecture
//!
//! Each pool owns a FIFO queue behind a single lock and a fixed set of
//! worker threads blocked on a condition variable. Throttled retries are
//! pushed to the front of the queue so they run ahead of new arrivals.
//!
//! With `combine_tasks` set, a woken worker takes up to two queued tasks and
//! runs them back to back, which saves a wake-up per pair under deep
//! backlog.
//!
//! When the queue grows past the pool's booster threshold the shared
//! [`BoosterPool`](crate::BoosterPool) is notified, after the queue lock has
//! been released, and lends threads to drain the excess.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info};
use trxd_common::{Result, TrxError};

use crate::booster::BoosterShared;
use crate::task::{Task, TaskClass};

/// Configuration of one worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub class: TaskClass,
    pub max_workers: usize,
    /// Queue length above which the booster pool helps; `None` opts out.
    pub booster_threshold: Option<usize>,
    /// Drain queued tasks at shutdown instead of cancelling them.
    pub consume_backlog: bool,
    pub combine_tasks: bool,
    /// Cap on queued tasks; submissions beyond it are rejected.
    pub max_queue: Option<usize>,
}

impl WorkerPoolConfig {
    pub fn new(class: TaskClass, max_workers: usize) -> Self {
        Self {
            class,
            max_workers,
            booster_threshold: None,
            consume_backlog: true,
            combine_tasks: false,
            max_queue: None,
        }
    }

    pub fn with_booster_threshold(mut self, threshold: usize) -> Self {
        self.booster_threshold = Some(threshold);
        self
    }

    pub fn with_consume_backlog(mut self, consume: bool) -> Self {
        self.consume_backlog = consume;
        self
    }

    pub fn with_combine_tasks(mut self, combine: bool) -> Self {
        self.combine_tasks = combine;
        self
    }

    pub fn with_max_queue(mut self, max: usize) -> Self {
        self.max_queue = Some(max);
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_workers == 0 {
            return Err(format!("pool {} must have at least one worker", self.class));
        }
        if self.max_queue == Some(0) {
            return Err(format!("pool {} queue cap must be greater than zero", self.class));
        }
        Ok(())
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub class: String,
    pub max_workers: usize,
    pub queue_len: usize,
    pub active: usize,
    pub dispatched: u64,
    pub combined: u64,
    pub borrowed: usize,
}

#[derive(Debug, Default)]
struct PoolQueue {
    tasks: VecDeque<Task>,
    active: usize,
    shutdown: bool,
}

#[derive(Debug)]
pub(crate) struct PoolShared {
    config: WorkerPoolConfig,
    queue: Mutex<PoolQueue>,
    available: Condvar,
    booster: Option<Arc<BoosterShared>>,
    dispatched: AtomicU64,
    combined: AtomicU64,
    borrowed: AtomicUsize,
    allotment: AtomicUsize,
}

impl PoolShared {
    pub(crate) fn class(&self) -> &TaskClass {
        &self.config.class
    }

    pub(crate) fn booster_threshold(&self) -> Option<usize> {
        self.config.booster_threshold
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue.lock().tasks.len()
    }

    pub(crate) fn borrowed(&self) -> usize {
        self.borrowed.load(Ordering::SeqCst)
    }

    pub(crate) fn allotment(&self) -> usize {
        self.allotment.load(Ordering::SeqCst)
    }

    pub(crate) fn set_allotment(&self, allotment: usize) {
        self.allotment.store(allotment, Ordering::SeqCst);
    }

    /// Backlog above the booster threshold.
    pub(crate) fn excess(&self) -> usize {
        match self.config.booster_threshold {
            Some(threshold) => self.queue_len().saturating_sub(threshold),
            None => 0,
        }
    }

    /// Hands one task to a booster thread if the backlog is still above the
    /// threshold and the pool's allotment is not used up.
    pub(crate) fn take_for_booster(&self) -> Option<Task> {
        let threshold = self.config.booster_threshold?;
        let allotment = self.allotment();
        self.borrowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |borrowed| {
                (borrowed < allotment).then_some(borrowed + 1)
            })
            .ok()?;

        let task = {
            let mut queue = self.queue.lock();
            if (queue.shutdown && !self.config.consume_backlog) || queue.tasks.len() <= threshold {
                None
            } else {
                queue.tasks.pop_front()
            }
        };
        match task {
            Some(task) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                Some(task)
            }
            None => {
                self.release_borrowed();
                None
            }
        }
    }

    pub(crate) fn release_borrowed(&self) {
        self.borrowed.fetch_sub(1, Ordering::SeqCst);
    }

    fn next_batch(&self) -> Option<Vec<Task>> {
        let mut queue = self.queue.lock();
        loop {
            if queue.shutdown && (queue.tasks.is_empty() || !self.config.consume_backlog) {
                return None;
            }
            if !queue.tasks.is_empty() {
                break;
            }
            self.available.wait(&mut queue);
        }

        let mut batch = Vec::with_capacity(2);
        batch.extend(queue.tasks.pop_front());
        if self.config.combine_tasks {
            batch.extend(queue.tasks.pop_front());
        }
        queue.active += 1;
        Some(batch)
    }

    fn worker_loop(&self) {
        while let Some(batch) = self.next_batch() {
            if batch.len() > 1 {
                self.combined.fetch_add(1, Ordering::Relaxed);
            }
            self.dispatched.fetch_add(batch.len() as u64, Ordering::Relaxed);
            for task in batch {
                task.run();
            }
            self.queue.lock().active -= 1;
        }
        debug!(class = %self.config.class, "worker exiting");
    }
}

/// A bounded pool of worker threads bound to one task class.
#[derive(Debug)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts the pool's worker threads.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an invalid configuration and `Io` if a thread
    /// cannot be spawned.
    pub fn new(config: WorkerPoolConfig) -> Result<Arc<Self>> {
        Self::start(config, None)
    }

    pub(crate) fn start(
        config: WorkerPoolConfig,
        booster: Option<Arc<BoosterShared>>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(TrxError::Config)?;

        let booster = match config.booster_threshold {
            Some(_) => booster,
            None => None,
        };
        let allotment = booster.as_ref().map(|b| b.size()).unwrap_or(0);
        let shared = Arc::new(PoolShared {
            config,
            queue: Mutex::new(PoolQueue::default()),
            available: Condvar::new(),
            booster,
            dispatched: AtomicU64::new(0),
            combined: AtomicU64::new(0),
            borrowed: AtomicUsize::new(0),
            allotment: AtomicUsize::new(allotment),
        });

        let mut workers = Vec::with_capacity(shared.config.max_workers);
        for index in 0..shared.config.max_workers {
            let worker = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("trxd-{}-{}", shared.config.class.as_str().to_ascii_lowercase(), index))
                .spawn(move || worker.worker_loop());
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown_shared(&shared);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(TrxError::Io(e));
                }
            }
        }

        if let Some(booster) = &shared.booster {
            booster.register(&shared);
        }

        info!(
            class = %shared.config.class,
            workers = shared.config.max_workers,
            combine = shared.config.combine_tasks,
            booster_threshold = ?shared.config.booster_threshold,
            "worker pool started"
        );

        Ok(Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        }))
    }

    pub fn class(&self) -> &TaskClass {
        &self.shared.config.class
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    pub fn max_workers(&self) -> usize {
        self.shared.config.max_workers
    }

    /// Queues a task, at the front when `front` is set.
    ///
    /// # Errors
    ///
    /// `Shutdown` once the pool is stopping, `ThresholdReached` when the
    /// queue cap is hit. The rejected task is dropped, which completes it on
    /// its executor without recording a failure.
    pub fn submit(&self, task: Task, front: bool) -> Result<()> {
        let backlog = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return Err(TrxError::Shutdown);
            }
            if let Some(max) = self.shared.config.max_queue {
                if queue.tasks.len() >= max {
                    return Err(TrxError::ThresholdReached(format!(
                        "{} queue is full ({} tasks)",
                        self.shared.config.class, max
                    )));
                }
            }
            if front {
                queue.tasks.push_front(task);
            } else {
                queue.tasks.push_back(task);
            }
            queue.tasks.len()
        };

        self.shared.available.notify_one();

        if let (Some(threshold), Some(booster)) =
            (self.shared.config.booster_threshold, &self.shared.booster)
        {
            if backlog > threshold {
                booster.notify();
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let (queue_len, active) = {
            let queue = self.shared.queue.lock();
            (queue.tasks.len(), queue.active)
        };
        PoolStats {
            class: self.shared.config.class.to_string(),
            max_workers: self.shared.config.max_workers,
            queue_len,
            active,
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            combined: self.shared.combined.load(Ordering::Relaxed),
            borrowed: self.shared.borrowed(),
        }
    }

    /// Stops the pool and joins its workers.
    ///
    /// Queued tasks are drained first when `consume_backlog` is set and
    /// cancelled otherwise. Calling this twice is harmless.
    pub fn shutdown(&self) {
        let cancelled = shutdown_shared(&self.shared);
        if !cancelled.is_empty() {
            info!(
                class = %self.shared.config.class,
                count = cancelled.len(),
                "cancelling queued tasks"
            );
        }
        drop(cancelled);

        let workers = std::mem::take(&mut *self.workers.lock());
        let me = thread::current().id();
        for handle in workers {
            // The last handle can be dropped by one of our own tasks.
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(class = %self.shared.config.class, "worker thread panicked");
            }
        }
    }
}

/// Marks the pool as stopping and takes the tasks that will not run.
fn shutdown_shared(shared: &PoolShared) -> Vec<Task> {
    let cancelled = {
        let mut queue = shared.queue.lock();
        queue.shutdown = true;
        if shared.config.consume_backlog {
            Vec::new()
        } else {
            queue.tasks.drain(..).collect()
        }
    };
    shared.available.notify_all();
    cancelled
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
