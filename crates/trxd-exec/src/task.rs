use std::borrow::Cow;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};
use trxd_common::TaskFailure;

use crate::context::{ContextScope, TaskContext};
use crate::executor::ExecutorShared;

/// Work submitted to an executor.
pub type TaskFn = Box<dyn FnOnce(&Arc<TaskContext>) -> Result<(), TaskFailure> + Send + 'static>;

/// Name of a worker pool class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskClass(Cow<'static, str>);

impl TaskClass {
    /// Top-level per-request work.
    pub const TRANSACTION: TaskClass = TaskClass(Cow::Borrowed("TRANSACTION"));
    /// Requests redirected by admission control.
    pub const THROTTLED: TaskClass = TaskClass(Cow::Borrowed("THROTTLED"));
    /// Nested work fanned out by a running transaction.
    pub const ASYNC: TaskClass = TaskClass(Cow::Borrowed("ASYNC"));

    pub fn new(name: impl Into<String>) -> Self {
        TaskClass(Cow::Owned(name.into().to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A queued unit of work together with its context and owning executor.
///
/// The owning executor is told about completion exactly once: when the task
/// is dropped, whether it ran, failed, panicked, was skipped because the
/// executor was cancelled, or was discarded by a pool that shut down.
pub struct Task {
    work: Option<TaskFn>,
    context: Arc<TaskContext>,
    owner: Option<Arc<ExecutorShared>>,
}

impl Task {
    pub(crate) fn new(work: TaskFn, context: Arc<TaskContext>, owner: Arc<ExecutorShared>) -> Self {
        Self {
            work: Some(work),
            context,
            owner: Some(owner),
        }
    }

    pub fn context(&self) -> &Arc<TaskContext> {
        &self.context
    }

    pub fn is_throttled(&self) -> bool {
        self.context.is_throttled()
    }

    /// Runs the task on the calling thread.
    ///
    /// Failures and panics are recorded on the owning executor; they never
    /// escape to the worker.
    pub fn run(mut self) {
        let Some(work) = self.work.take() else {
            return;
        };

        if self.owner.as_ref().is_some_and(|owner| owner.is_cancelled()) {
            debug!(seq = %self.context.sequence_label(), "executor cancelled, skipping task");
            return;
        }

        let outcome = {
            let _scope = ContextScope::enter(&self.context);
            let context = &self.context;
            panic::catch_unwind(AssertUnwindSafe(|| work(context)))
        };

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(failure)) => Some(failure),
            Err(payload) => Some(TaskFailure::from_panic(payload.as_ref())),
        };

        if let Some(failure) = failure {
            warn!(
                seq = %self.context.sequence_label(),
                code = failure.code,
                message = %failure.message,
                "task failed"
            );
            if let Some(owner) = &self.owner {
                owner.record_failure(failure);
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.complete();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("seq", &self.context.sequence_label())
            .field("throttled", &self.context.is_throttled())
            .field("pending", &self.work.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Transaction;

    fn owned_task<F>(owner: &Arc<ExecutorShared>, f: F) -> Task
    where
        F: FnOnce(&Arc<TaskContext>) -> Result<(), TaskFailure> + Send + 'static,
    {
        owner.begin();
        Task::new(Box::new(f), TaskContext::root(Some(Transaction::new(1))), Arc::clone(owner))
    }

    #[test]
    fn test_task_class_names() {
        assert_eq!(TaskClass::TRANSACTION.as_str(), "TRANSACTION");
        assert_eq!(TaskClass::new("async"), TaskClass::ASYNC);
    }

    #[test]
    fn test_failure_recorded_and_completed() {
        let owner = Arc::new(ExecutorShared::new());
        owned_task(&owner, |_| Err(TaskFailure::new(3, "no route"))).run();
        assert_eq!(owner.in_flight(), 0);
        assert_eq!(owner.first_failure().map(|f| f.code), Some(3));
    }

    #[test]
    fn test_panic_becomes_failure() {
        let owner = Arc::new(ExecutorShared::new());
        owned_task(&owner, |_| panic!("fare table missing")).run();
        let failure = owner.first_failure().unwrap();
        assert_eq!(failure.code, trxd_common::PANIC_FAILURE_CODE);
        assert_eq!(failure.message, "fare table missing");
        assert_eq!(owner.in_flight(), 0);
    }

    #[test]
    fn test_dropped_task_still_completes() {
        let owner = Arc::new(ExecutorShared::new());
        let task = owned_task(&owner, |_| Ok(()));
        assert_eq!(owner.in_flight(), 1);
        drop(task);
        assert_eq!(owner.in_flight(), 0);
        assert!(owner.first_failure().is_none());
    }

    #[test]
    fn test_cancelled_owner_skips_work() {
        let owner = Arc::new(ExecutorShared::new());
        owner.cancel();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        owned_task(&owner, move |_| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .run();
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(owner.in_flight(), 0);
    }
}
