//! Admission control for top-level transactions.
//!
//! A [`ThrottlingExecutor`] sends work to a primary executor until the
//! primary's in-flight count exceeds a threshold. Past that point new work
//! is marked throttled and goes to the front of a secondary executor bound
//! to a smaller pool, so already admitted transactions keep the primary
//! pool to themselves.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;
use trxd_common::{Result, TaskFailure};

use crate::context::TaskContext;
use crate::executor::Executor;
use crate::registry::PoolRegistry;
use crate::task::TaskClass;

/// Where a submission went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Throttled,
}

#[derive(Debug, Clone)]
pub struct ThrottlingExecutor {
    primary: Executor,
    secondary: Executor,
    /// Zero disables throttling.
    threshold: usize,
    max_workers: usize,
    concurrency: Arc<AtomicUsize>,
}

impl ThrottlingExecutor {
    /// Binds the primary to `primary` and the secondary to `secondary`.
    pub fn new(
        registry: &PoolRegistry,
        primary: &TaskClass,
        secondary: &TaskClass,
        threshold: usize,
    ) -> Self {
        Self::from_executors(
            Executor::new(registry, primary),
            Executor::new(registry, secondary),
            threshold,
        )
    }

    pub fn from_executors(primary: Executor, secondary: Executor, threshold: usize) -> Self {
        let max_workers = primary.pool().map(|pool| pool.max_workers()).unwrap_or(0);
        Self {
            primary,
            secondary,
            threshold,
            max_workers,
            concurrency: Arc::new(AtomicUsize::new(max_workers)),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Primary threads considered available for new transactions, as of
    /// the last submission.
    pub fn concurrency_level(&self) -> usize {
        self.concurrency.load(Ordering::SeqCst)
    }

    pub fn primary(&self) -> &Executor {
        &self.primary
    }

    pub fn secondary(&self) -> &Executor {
        &self.secondary
    }

    /// Submits one transaction.
    ///
    /// # Errors
    ///
    /// Propagates rejections from whichever pool the task was routed to.
    pub fn execute<F>(&self, work: F) -> Result<Admission>
    where
        F: FnOnce(&Arc<TaskContext>) -> std::result::Result<(), TaskFailure> + Send + 'static,
    {
        let in_flight = self.primary.in_flight();
        self.concurrency
            .store(self.max_workers.saturating_sub(in_flight), Ordering::SeqCst);

        if self.threshold > 0 && in_flight > self.threshold {
            debug!(in_flight, threshold = self.threshold, "throttling transaction");
            self.secondary.execute_throttled(work)?;
            Ok(Admission::Throttled)
        } else {
            self.primary.execute(work)?;
            Ok(Admission::Admitted)
        }
    }

    /// Waits for both executors.
    ///
    /// # Errors
    ///
    /// With `rethrow`, the primary's first failure, else the secondary's.
    pub fn wait(&self, rethrow: bool) -> Result<()> {
        let primary = self.primary.wait(rethrow);
        let secondary = self.secondary.wait(rethrow);
        primary.and(secondary)
    }
}
