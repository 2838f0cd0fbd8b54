//! Task executor with completion tracking.
//!
//! An [`Executor`] submits tasks to the worker pool of one task class and
//! lets the submitter block until every task it submitted has finished.
//!
//! # Completion accounting
//!
//! The in-flight count is incremented under the executor's lock before a
//! task is queued and decremented exactly once when the task is dropped
//! (after running, failing, panicking, being skipped, or being discarded).
//! The first failure recorded wins; later ones are logged and dropped.
//!
//! # Example
//!
//! ```
//! use trxd_exec::{Executor, PoolRegistry, TaskClass, WorkerPoolConfig};
//! use trxd_common::TaskFailure;
//!
//! let registry = PoolRegistry::builder()
//!     .pool(WorkerPoolConfig::new(TaskClass::ASYNC, 2))
//!     .build()
//!     .unwrap();
//!
//! let executor = Executor::new(&registry, &TaskClass::ASYNC);
//! executor.execute(|_| Ok(())).unwrap();
//! executor.execute(|_| Err(TaskFailure::new(12, "no fares"))).unwrap();
//!
//! let err = executor.wait(true).unwrap_err();
//! assert_eq!(err.to_string(), "Task failed: [12] no fares");
//! registry.shutdown();
//! ```

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;
use trxd_common::{Result, TaskFailure, TrxError};

use crate::context::{self, TaskContext, Transaction};
use crate::pool::WorkerPool;
use crate::registry::PoolRegistry;
use crate::task::{Task, TaskClass};

#[derive(Debug, Default)]
struct ExecutorState {
    in_flight: usize,
    first_failure: Option<TaskFailure>,
    cancelled: bool,
}

/// State shared between an executor and the tasks it submitted.
#[derive(Debug, Default)]
pub(crate) struct ExecutorShared {
    state: Mutex<ExecutorState>,
    drained: Condvar,
}

impl ExecutorShared {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&self) {
        self.state.lock().in_flight += 1;
    }

    pub(crate) fn complete(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.in_flight > 0, "completion without submission");
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.drained.notify_all();
        }
    }

    pub(crate) fn record_failure(&self, failure: TaskFailure) {
        let mut state = self.state.lock();
        if state.first_failure.is_none() {
            state.first_failure = Some(failure);
        } else {
            debug!(code = failure.code, "discarding later task failure");
        }
    }

    pub(crate) fn cancel(&self) {
        self.state.lock().cancelled = true;
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub(crate) fn first_failure(&self) -> Option<TaskFailure> {
        self.state.lock().first_failure.clone()
    }

    fn wait(&self) -> Option<TaskFailure> {
        let mut state = self.state.lock();
        while state.in_flight > 0 {
            self.drained.wait(&mut state);
        }
        state.first_failure.clone()
    }
}

/// Submits tasks to one worker pool and waits for them.
///
/// Cloning an executor shares its accounting: tasks submitted through any
/// clone are waited on by all of them.
#[derive(Debug, Clone)]
pub struct Executor {
    shared: Arc<ExecutorShared>,
    pool: Option<Arc<WorkerPool>>,
    transaction: Option<Arc<Transaction>>,
}

impl Executor {
    /// Creates an executor bound to the pool registered for `class`.
    ///
    /// A class with no pool is disabled: its tasks run synchronously on the
    /// submitting thread.
    pub fn new(registry: &PoolRegistry, class: &TaskClass) -> Self {
        Self::with_pool(registry.get(class))
    }

    pub fn with_pool(pool: Option<Arc<WorkerPool>>) -> Self {
        Self {
            shared: Arc::new(ExecutorShared::new()),
            pool,
            transaction: None,
        }
    }

    /// Transaction that top-level tasks submitted from outside any running
    /// task are numbered against.
    pub fn with_transaction(mut self, transaction: Arc<Transaction>) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    /// Submits a task at the back of the pool's queue.
    ///
    /// When called from inside a running task the new task becomes a child
    /// of that task's context.
    ///
    /// # Errors
    ///
    /// Returns `ThresholdReached` if the pool's queue is full and `Shutdown`
    /// if the pool is shutting down. A rejected task does not count as
    /// submitted.
    pub fn execute<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&Arc<TaskContext>) -> std::result::Result<(), TaskFailure> + Send + 'static,
    {
        self.submit(self.next_context(false), Box::new(work), false)
    }

    /// Submits a task ahead of everything already queued.
    pub fn execute_front<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&Arc<TaskContext>) -> std::result::Result<(), TaskFailure> + Send + 'static,
    {
        self.submit(self.next_context(false), Box::new(work), true)
    }

    /// Submits a task as an explicit child of `parent`.
    pub fn execute_in<F>(&self, parent: &Arc<TaskContext>, work: F) -> Result<()>
    where
        F: FnOnce(&Arc<TaskContext>) -> std::result::Result<(), TaskFailure> + Send + 'static,
    {
        self.submit(TaskContext::child(parent, false), Box::new(work), false)
    }

    /// Submits work that admission control redirected.
    pub(crate) fn execute_throttled<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&Arc<TaskContext>) -> std::result::Result<(), TaskFailure> + Send + 'static,
    {
        self.submit(self.next_context(true), Box::new(work), true)
    }

    /// Blocks until every submitted task has completed.
    ///
    /// # Errors
    ///
    /// With `rethrow` set, returns the first failure any task recorded.
    pub fn wait(&self, rethrow: bool) -> Result<()> {
        match self.shared.wait() {
            Some(failure) if rethrow => Err(TrxError::Task(failure)),
            _ => Ok(()),
        }
    }

    /// Makes every task that has not started yet skip its work.
    ///
    /// Running tasks are not interrupted.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    fn next_context(&self, throttled: bool) -> Arc<TaskContext> {
        match context::current() {
            Some(parent) => TaskContext::child(&parent, throttled),
            None => TaskContext::root_with(
                self.transaction.clone().or_else(context::current_transaction),
                throttled,
            ),
        }
    }

    fn submit(&self, context: Arc<TaskContext>, work: crate::task::TaskFn, front: bool) -> Result<()> {
        self.shared.begin();
        let task = Task::new(work, context, Arc::clone(&self.shared));
        match &self.pool {
            Some(pool) => pool.submit(task, front),
            None => {
                task.run();
                Ok(())
            }
        }
    }
}
