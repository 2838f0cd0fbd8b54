//! Transaction context propagation.
//!
//! Every task carries an explicit [`TaskContext`] handed to it by the
//! scheduler. The context records which [`Transaction`] the work belongs to
//! and where the task sits in the transaction's task tree, as a sequence id.
//!
//! # Sequence ids
//!
//! A top-level context takes the next number from its transaction. A nested
//! context takes the next number from its parent. [`TaskContext::sequence_id`]
//! returns the path root-first, so comparing two ids lexicographically gives
//! a stable order for log sorting regardless of which thread ran first:
//!
//! ```
//! use trxd_exec::{TaskContext, Transaction};
//!
//! let trx = Transaction::new(7);
//! let root = TaskContext::root(Some(trx));
//! let first = TaskContext::child(&root, false);
//! let second = TaskContext::child(&root, false);
//! let grandchild = TaskContext::child(&second, false);
//!
//! assert_eq!(root.sequence_id(), vec![0]);
//! assert_eq!(first.sequence_id(), vec![0, 0]);
//! assert_eq!(grandchild.sequence_id(), vec![0, 1, 0]);
//! assert_eq!(grandchild.sequence_label(), "0.1.0");
//! ```
//!
//! # Thread-local boundary
//!
//! Code deep in business logic that cannot take a context parameter calls
//! [`current`] or [`current_transaction`]. The executor installs both for
//! the duration of each task through a [`ContextScope`], restoring the
//! previous values on exit so nested execution on one thread unwinds
//! correctly.

use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

/// Sequence value of a context that has no transaction attached yet.
pub const UNINITIALIZED_SEQUENCE: i32 = -1;

thread_local! {
    static CURRENT: RefCell<Option<Arc<TaskContext>>> = const { RefCell::new(None) };
    static CURRENT_TRX: RefCell<Option<Arc<Transaction>>> = const { RefCell::new(None) };
}

/// One logical request being served.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    next_top_level: AtomicI32,
}

impl Transaction {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            next_top_level: AtomicI32::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn claim_sequence(&self) -> i32 {
        self.next_top_level.fetch_add(1, Ordering::SeqCst)
    }
}

/// Execution context of one task.
#[derive(Debug)]
pub struct TaskContext {
    transaction: Mutex<Option<Arc<Transaction>>>,
    parent: Option<Arc<TaskContext>>,
    sequence: AtomicI32,
    next_child: AtomicI32,
    origin: ThreadId,
    throttled: bool,
}

impl TaskContext {
    /// Creates a top-level context.
    ///
    /// With a transaction the context claims the transaction's next
    /// top-level number; without one it stays uninitialised until
    /// [`attach_transaction`](Self::attach_transaction) is called.
    pub fn root(transaction: Option<Arc<Transaction>>) -> Arc<Self> {
        Self::root_with(transaction, false)
    }

    pub(crate) fn root_with(transaction: Option<Arc<Transaction>>, throttled: bool) -> Arc<Self> {
        let sequence = transaction
            .as_ref()
            .map(|trx| trx.claim_sequence())
            .unwrap_or(UNINITIALIZED_SEQUENCE);
        Arc::new(Self {
            transaction: Mutex::new(transaction),
            parent: None,
            sequence: AtomicI32::new(sequence),
            next_child: AtomicI32::new(0),
            origin: thread::current().id(),
            throttled,
        })
    }

    /// Creates a nested context numbered from the parent's child counter.
    pub fn child(parent: &Arc<TaskContext>, throttled: bool) -> Arc<Self> {
        let sequence = parent.next_child.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self {
            transaction: Mutex::new(parent.transaction()),
            parent: Some(Arc::clone(parent)),
            sequence: AtomicI32::new(sequence),
            next_child: AtomicI32::new(0),
            origin: thread::current().id(),
            throttled,
        })
    }

    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.transaction.lock().clone()
    }

    /// Attaches a transaction to a context created without one.
    ///
    /// An uninitialised top-level context claims its sequence number now.
    /// A context that already has a transaction keeps it.
    pub fn attach_transaction(&self, trx: Arc<Transaction>) {
        let mut slot = self.transaction.lock();
        if slot.is_some() {
            return;
        }
        if self.parent.is_none() && self.sequence.load(Ordering::SeqCst) == UNINITIALIZED_SEQUENCE {
            self.sequence.store(trx.claim_sequence(), Ordering::SeqCst);
        }
        *slot = Some(trx);
    }

    pub fn parent(&self) -> Option<&Arc<TaskContext>> {
        self.parent.as_ref()
    }

    /// This context's own number within its parent, or -1.
    pub fn sequence(&self) -> i32 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Full sequence path, root first.
    pub fn sequence_id(&self) -> Vec<i32> {
        let mut ids = vec![self.sequence()];
        let mut next = self.parent.as_ref();
        while let Some(ctx) = next {
            ids.push(ctx.sequence());
            next = ctx.parent.as_ref();
        }
        ids.reverse();
        ids
    }

    /// Dotted rendering of [`sequence_id`](Self::sequence_id) used in logs.
    pub fn sequence_label(&self) -> String {
        self.sequence_id()
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Whether the task was redirected by admission control.
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// Thread that created the context.
    pub fn origin(&self) -> ThreadId {
        self.origin
    }
}

/// Context of the task running on this thread, if any.
pub fn current() -> Option<Arc<TaskContext>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Transaction active on this thread.
///
/// Falls back to the current context's transaction when no explicit scope
/// is active, which is the case on the thread that created the context.
pub fn current_transaction() -> Option<Arc<Transaction>> {
    CURRENT_TRX
        .with(|cell| cell.borrow().clone())
        .or_else(|| current().and_then(|ctx| ctx.transaction()))
}

/// Installs a context as current for the lifetime of the guard.
///
/// The current transaction is only activated when the context runs away
/// from the thread that created it; on the origin thread an ancestor
/// already owns that scope.
pub struct ContextScope {
    previous: Option<Arc<TaskContext>>,
    previous_trx: Option<Option<Arc<Transaction>>>,
}

impl ContextScope {
    pub fn enter(ctx: &Arc<TaskContext>) -> Self {
        let previous = CURRENT.with(|cell| cell.replace(Some(Arc::clone(ctx))));
        let previous_trx = if thread::current().id() != ctx.origin {
            let trx = ctx.transaction();
            Some(CURRENT_TRX.with(|cell| cell.replace(trx)))
        } else {
            None
        };
        Self {
            previous,
            previous_trx,
        }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|cell| *cell.borrow_mut() = previous);
        if let Some(previous_trx) = self.previous_trx.take() {
            CURRENT_TRX.with(|cell| *cell.borrow_mut() = previous_trx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_contexts_number_from_transaction() {
        let trx = Transaction::new(1);
        let a = TaskContext::root(Some(Arc::clone(&trx)));
        let b = TaskContext::root(Some(Arc::clone(&trx)));
        assert_eq!(a.sequence_id(), vec![0]);
        assert_eq!(b.sequence_id(), vec![1]);
    }

    #[test]
    fn test_nth_child_gets_zero_based_index() {
        let trx = Transaction::new(1);
        let _skip = TaskContext::root(Some(Arc::clone(&trx)));
        let _skip = TaskContext::root(Some(Arc::clone(&trx)));
        let _skip = TaskContext::root(Some(Arc::clone(&trx)));
        let parent = TaskContext::root(Some(trx));
        let a = parent.sequence();
        assert_eq!(a, 3);

        let children: Vec<_> = (0..4).map(|_| TaskContext::child(&parent, false)).collect();
        let n = children.len();
        assert_eq!(children[n - 1].sequence_id(), vec![a, n as i32 - 1]);

        let grandchild = TaskContext::child(&children[n - 1], false);
        assert_eq!(grandchild.sequence_id(), vec![a, n as i32 - 1, 0]);
    }

    #[test]
    fn test_sequence_ids_sort_root_first() {
        let trx = Transaction::new(1);
        let root = TaskContext::root(Some(trx));
        let c0 = TaskContext::child(&root, false);
        let c1 = TaskContext::child(&root, false);
        let c0_0 = TaskContext::child(&c0, false);

        let mut ids = vec![c1.sequence_id(), c0_0.sequence_id(), c0.sequence_id()];
        ids.sort();
        assert_eq!(ids, vec![vec![0, 0], vec![0, 0, 0], vec![0, 1]]);
    }

    #[test]
    fn test_uninitialized_until_attached() {
        let ctx = TaskContext::root(None);
        assert_eq!(ctx.sequence(), UNINITIALIZED_SEQUENCE);
        assert!(ctx.transaction().is_none());

        let trx = Transaction::new(9);
        let _other = TaskContext::root(Some(Arc::clone(&trx)));
        ctx.attach_transaction(Arc::clone(&trx));
        assert_eq!(ctx.sequence(), 1);
        assert_eq!(ctx.transaction().map(|t| t.id()), Some(9));

        ctx.attach_transaction(Transaction::new(10));
        assert_eq!(ctx.transaction().map(|t| t.id()), Some(9));
        assert_eq!(ctx.sequence(), 1);
    }

    #[test]
    fn test_scope_restores_parent_on_exit() {
        let outer = TaskContext::root(Some(Transaction::new(1)));
        let inner = TaskContext::child(&outer, false);
        assert!(current().is_none());
        {
            let _outer_scope = ContextScope::enter(&outer);
            {
                let _inner_scope = ContextScope::enter(&inner);
                assert!(Arc::ptr_eq(&current().unwrap(), &inner));
            }
            assert!(Arc::ptr_eq(&current().unwrap(), &outer));
        }
        assert!(current().is_none());
    }

    #[test]
    fn test_transaction_activated_off_origin_thread() {
        let ctx = TaskContext::root(Some(Transaction::new(42)));
        let seen = thread::spawn(move || {
            let before = CURRENT_TRX.with(|cell| cell.borrow().is_some());
            let during = {
                let _scope = ContextScope::enter(&ctx);
                CURRENT_TRX.with(|cell| cell.borrow().as_ref().map(|t| t.id()))
            };
            let after = CURRENT_TRX.with(|cell| cell.borrow().is_some());
            (before, during, after)
        })
        .join()
        .unwrap();
        assert_eq!(seen, (false, Some(42), false));
    }

    #[test]
    fn test_transaction_not_activated_on_origin_thread() {
        let ctx = TaskContext::root(Some(Transaction::new(5)));
        let _scope = ContextScope::enter(&ctx);
        assert!(CURRENT_TRX.with(|cell| cell.borrow().is_none()));
        assert_eq!(current_transaction().map(|t| t.id()), Some(5));
    }
}
