//! Server assembly and lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ServerConfig ──► PoolRegistry (TRANSACTION / THROTTLED / ASYNC + booster)
//!              ──► LoadBalancerClient ──► ConnectionAcceptor (N listeners)
//!                                              │
//!                     one thread per listener: Dispatcher::run
//!                                              │
//!                     ThrottlingExecutor ──► RequestHandler ──► RequestProcessor
//! ```
//!
//! Shutdown runs in order: listeners stop accepting and are deregistered,
//! dispatch threads are joined, outstanding transactions drain, then the
//! pools stop.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trxd_server::{EchoProcessor, Server, ServerConfig};
//!
//! let server = Server::builder(ServerConfig::default())
//!     .processor(Arc::new(EchoProcessor))
//!     .start()
//!     .unwrap();
//! server.wait();
//! let snapshot = server.shutdown();
//! println!("{}", snapshot.transactions_completed);
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{error, info};
use trxd_common::compress::{PassThrough, PayloadCompressor};
use trxd_common::{Result, TrxError};
use trxd_exec::{PoolRegistry, TaskClass, ThrottlingExecutor};
use trxd_metrics::{ServerStats, StatsSnapshot};

use crate::acceptor::ConnectionAcceptor;
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::lb::{LbCommandRunner, LoadBalancerClient, ProcessRunner};
use crate::processor::{EchoProcessor, RequestProcessor};
use crate::request::RequestHandler;
use crate::thresholds::{MemorySampler, StatmSampler, ThresholdMonitor};

/// One-shot flag the process waits on before shutting down.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut triggered = self.triggered.lock();
        if !*triggered {
            *triggered = true;
            self.cond.notify_all();
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock()
    }

    pub fn wait(&self) {
        let mut triggered = self.triggered.lock();
        while !*triggered {
            self.cond.wait(&mut triggered);
        }
    }

    /// Returns whether the signal fired within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut triggered = self.triggered.lock();
        if !*triggered {
            let _ = self.cond.wait_for(&mut triggered, timeout);
        }
        *triggered
    }
}

pub struct ServerBuilder {
    config: ServerConfig,
    processor: Arc<dyn RequestProcessor>,
    compressor: Arc<dyn PayloadCompressor>,
    runner: Arc<dyn LbCommandRunner>,
    sampler: Box<dyn MemorySampler>,
}

impl ServerBuilder {
    pub fn processor(mut self, processor: Arc<dyn RequestProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn compressor(mut self, compressor: Arc<dyn PayloadCompressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Replaces the process runner used for load balancer scripts.
    pub fn lb_runner(mut self, runner: Arc<dyn LbCommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn memory_sampler(mut self, sampler: Box<dyn MemorySampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Starts the pools, opens and registers every listener and spawns one
    /// dispatch thread per listener.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, when a pool cannot start or when any
    /// listener cannot be bound. Nothing keeps running after a failure.
    pub fn start(self) -> Result<Server> {
        let config = self.config;
        config.validate().map_err(TrxError::Config)?;

        let mut registry = PoolRegistry::builder();
        for pool in &config.pools {
            registry = registry.pool(pool.clone());
        }
        if let Some(booster) = &config.booster {
            registry = registry.booster(booster.clone());
        }
        let registry = Arc::new(registry.build()?);

        let load_balancer = config.load_balancer.is_enabled().then(|| {
            Arc::new(LoadBalancerClient::with_runner(
                config.load_balancer.clone(),
                Arc::clone(&self.runner),
            ))
        });

        let acceptor = match ConnectionAcceptor::new(config.acceptor.clone(), load_balancer.clone())
            .and_then(|acceptor| acceptor.open().map(|()| acceptor))
        {
            Ok(acceptor) => Arc::new(acceptor),
            Err(e) => {
                registry.shutdown();
                return Err(e);
            }
        };
        acceptor.register();

        let stats = Arc::new(ServerStats::new());
        let executor = ThrottlingExecutor::new(
            &registry,
            &TaskClass::TRANSACTION,
            &TaskClass::THROTTLED,
            config.throttle.threshold,
        );
        stats.set_concurrency_level(executor.concurrency_level());

        let handler = RequestHandler::new(self.processor, Arc::clone(&registry), Arc::clone(&stats))
            .with_compressor(self.compressor)
            .with_throttle_delay(config.throttle.delay);
        let signal = Arc::new(ShutdownSignal::new());
        let monitor = Arc::new(ThresholdMonitor::with_sampler(config.thresholds.clone(), self.sampler));
        let dispatcher = Dispatcher::new(
            Arc::clone(&acceptor),
            executor.clone(),
            Arc::new(handler),
            Arc::clone(&stats),
            monitor,
            Arc::clone(&signal),
        );

        let server = Server {
            registry,
            acceptor,
            load_balancer,
            stats,
            executor,
            signal,
            dispatchers: Mutex::new(Vec::new()),
        };

        for index in 0..server.acceptor.num_listeners() {
            let dispatcher = dispatcher.clone();
            let spawned = thread::Builder::new()
                .name(format!("trxd-listener-{}", index))
                .spawn(move || dispatcher.run(index));
            match spawned {
                Ok(handle) => server.dispatchers.lock().push(handle),
                Err(e) => {
                    server.shutdown();
                    return Err(TrxError::Io(e));
                }
            }
        }

        info!(
            ports = ?server.local_ports(),
            throttle_threshold = config.throttle.threshold,
            load_balancer = server.load_balancer.is_some(),
            "server started"
        );
        Ok(server)
    }
}

/// A running server.
pub struct Server {
    registry: Arc<PoolRegistry>,
    acceptor: Arc<ConnectionAcceptor>,
    load_balancer: Option<Arc<LoadBalancerClient>>,
    stats: Arc<ServerStats>,
    executor: ThrottlingExecutor,
    signal: Arc<ShutdownSignal>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        let runner = ProcessRunner::new(config.load_balancer.script_timeout);
        ServerBuilder {
            config,
            processor: Arc::new(EchoProcessor),
            compressor: Arc::new(PassThrough),
            runner: Arc::new(runner),
            sampler: Box::new(StatmSampler::new()),
        }
    }

    /// Bound port of every listener.
    pub fn local_ports(&self) -> Vec<u16> {
        self.acceptor.local_ports()
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    pub fn load_balancer(&self) -> Option<&Arc<LoadBalancerClient>> {
        self.load_balancer.as_ref()
    }

    /// Fires when a shutdown threshold is crossed; anything else may
    /// trigger it too.
    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        Arc::clone(&self.signal)
    }

    /// Blocks until the shutdown signal fires.
    pub fn wait(&self) {
        self.signal.wait();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .snapshot(self.registry.pool_stats(), self.registry.booster_stats())
    }

    /// Stops the server and returns the final statistics.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) -> StatsSnapshot {
        self.signal.trigger();
        self.acceptor.shutdown();

        let dispatchers: Vec<_> = self.dispatchers.lock().drain(..).collect();
        for handle in dispatchers {
            if handle.join().is_err() {
                error!("dispatch thread panicked");
            }
        }

        if let Err(e) = self.executor.wait(false) {
            error!(error = %e, "draining transactions failed");
        }
        let snapshot = self.stats();
        self.registry.shutdown();

        match snapshot.to_json() {
            Ok(json) => info!(stats = %json, "server stopped"),
            Err(_) => info!(
                completed = snapshot.transactions_completed,
                failed = snapshot.transactions_failed,
                "server stopped"
            ),
        }
        snapshot
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.acceptor.is_exiting() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("ports", &self.local_ports())
            .field("load_balancer", &self.load_balancer)
            .finish()
    }
}
