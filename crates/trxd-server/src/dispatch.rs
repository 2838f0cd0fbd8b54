//! Per-listener request dispatch.
//!
//! Each listener gets one thread running [`Dispatcher::run`]: accept a
//! connection, wrap it in a request task for a fresh transaction, and hand
//! it to the throttling executor. After every accepted transaction the
//! process-wide shutdown thresholds are checked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use trxd_exec::{Admission, ThrottlingExecutor, Transaction};
use trxd_metrics::ServerStats;

use crate::acceptor::ConnectionAcceptor;
use crate::request::RequestHandler;
use crate::server::ShutdownSignal;
use crate::thresholds::ThresholdMonitor;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Counts one transaction as concurrent for as long as it is alive.
struct TransactionGuard {
    stats: Arc<ServerStats>,
    started: Instant,
    success: bool,
}

impl TransactionGuard {
    fn start(stats: Arc<ServerStats>) -> Self {
        stats.transaction_started();
        Self {
            stats,
            started: Instant::now(),
            success: false,
        }
    }

    fn succeed(&mut self) {
        self.success = true;
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.stats.transaction_finished(self.started, self.success);
    }
}

/// State shared by the dispatch threads of one server.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    acceptor: Arc<ConnectionAcceptor>,
    executor: ThrottlingExecutor,
    handler: Arc<RequestHandler>,
    stats: Arc<ServerStats>,
    monitor: Arc<ThresholdMonitor>,
    signal: Arc<ShutdownSignal>,
    next_transaction: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(
        acceptor: Arc<ConnectionAcceptor>,
        executor: ThrottlingExecutor,
        handler: Arc<RequestHandler>,
        stats: Arc<ServerStats>,
        monitor: Arc<ThresholdMonitor>,
        signal: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            acceptor,
            executor,
            handler,
            stats,
            monitor,
            signal,
            next_transaction: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Accepts and dispatches connections on listener `index` until the
    /// acceptor starts exiting.
    pub fn run(&self, index: usize) {
        info!(listener = index, "dispatch loop started");
        while !self.acceptor.is_exiting() {
            match self.acceptor.accept(index) {
                Ok(Some(connection)) => self.dispatch(connection),
                // Exiting, or the listener was closed and reopens on the
                // next accept.
                Ok(None) => continue,
                Err(e) => {
                    if self.acceptor.is_exiting() {
                        break;
                    }
                    error!(listener = index, error = %e, "accept failed");
                    thread::sleep(ACCEPT_RETRY_DELAY);
                }
            }
        }
        info!(listener = index, "dispatch loop stopped");
    }

    fn dispatch(&self, connection: crate::acceptor::Connection) {
        self.stats.record_connection();
        let id = self.next_transaction.fetch_add(1, Ordering::SeqCst);
        let transaction = Transaction::new(id);
        let mut guard = TransactionGuard::start(Arc::clone(&self.stats));
        let handler = Arc::clone(&self.handler);
        let listener = connection.listener_index();

        let submitted = self.executor.execute(move |ctx| {
            ctx.attach_transaction(transaction);
            handler.handle(ctx, connection)?;
            guard.succeed();
            Ok(())
        });
        self.stats
            .set_concurrency_level(self.executor.concurrency_level());

        match submitted {
            Ok(Admission::Admitted) => debug!(listener, transaction = id, "transaction admitted"),
            Ok(Admission::Throttled) => debug!(listener, transaction = id, "transaction throttled"),
            Err(e) => {
                // The task and its connection were dropped unrun.
                self.stats.record_rejected();
                warn!(listener, transaction = id, error = %e, "transaction rejected");
            }
        }

        if let Some(breach) = self.monitor.record_transaction() {
            if !self.signal.is_triggered() {
                warn!(%breach, "shutdown threshold reached");
            }
            self.signal.trigger();
        }
    }
}
