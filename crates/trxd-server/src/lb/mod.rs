//! Load balancer client.
//!
//! Listening ports are published to an external balancer pool through a
//! script ([`script`]). Registration is retried a bounded number of times;
//! deregistration falls back to disabling the member directly on the
//! balancer's control plane ([`icontrol`]) when the script fails. Neither
//! outcome is ever fatal: a port that cannot be registered keeps serving
//! unregistered, and shutdown proceeds whatever the balancer says.
//!
//! # Example
//!
//! ```no_run
//! use trxd_server::config::LoadBalancerConfig;
//! use trxd_server::lb::LoadBalancerClient;
//!
//! let config = LoadBalancerConfig::new()
//!     .with_script("/opt/lb/bigip.sh")
//!     .with_pool("fares")
//!     .with_device("lb01")
//!     .with_system_type("prod");
//! let client = LoadBalancerClient::new(config);
//! if client.register_member(53501).is_ok() {
//!     // serve...
//!     let _ = client.deregister_member(53501);
//! }
//! ```

pub mod credentials;
pub mod icontrol;
pub mod membership;
pub mod script;

use std::net::IpAddr;
use std::sync::Arc;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};
use trxd_common::{Result, TrxError};

use crate::config::LoadBalancerConfig;
pub use credentials::PoolCredentials;
pub use icontrol::IControlClient;
pub use membership::{PoolMember, PoolMembership};
pub use script::{CommandOutcome, ExitKind, LbCommandRunner, ProcessRunner};

/// Fallback client plus the address this host is registered under.
#[derive(Debug)]
struct Fallback {
    client: IControlClient,
    address: IpAddr,
}

pub struct LoadBalancerClient {
    config: LoadBalancerConfig,
    pool: Option<String>,
    embedded_credentials: Option<PoolCredentials>,
    runner: Arc<dyn LbCommandRunner>,
    membership: PoolMembership,
    fallback: Mutex<Option<Arc<Fallback>>>,
    /// Set once registration is abandoned for good; wakes retry waits.
    stopped: Mutex<bool>,
    stop_cond: Condvar,
}

impl std::fmt::Debug for LoadBalancerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancerClient")
            .field("pool", &self.pool)
            .field("device", &self.config.device)
            .field("members", &self.membership.len())
            .finish()
    }
}

impl LoadBalancerClient {
    /// Creates a client that runs the configured script as a child process,
    /// bounded by the configured script timeout.
    pub fn new(config: LoadBalancerConfig) -> Self {
        let runner = ProcessRunner::new(config.script_timeout);
        Self::with_runner(config, Arc::new(runner))
    }

    pub fn with_runner(config: LoadBalancerConfig, runner: Arc<dyn LbCommandRunner>) -> Self {
        let (embedded_credentials, pool) = match config.pool.as_deref() {
            Some(configured) => {
                let (credentials, pool) = credentials::split_pool(configured);
                (credentials, Some(pool.to_string()))
            }
            None => (None, None),
        };
        Self {
            config,
            pool,
            embedded_credentials,
            runner,
            membership: PoolMembership::new(),
            fallback: Mutex::new(None),
            stopped: Mutex::new(false),
            stop_cond: Condvar::new(),
        }
    }

    /// Whether pool, device and system type are all configured.
    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Pool name without embedded credentials.
    pub fn pool_name(&self) -> Option<&str> {
        self.pool.as_deref()
    }

    pub fn membership(&self) -> &PoolMembership {
        &self.membership
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.lock().is_some()
    }

    /// Abandons registrations in progress and refuses new ones. A retry
    /// wait returns at once; a script already running finishes first.
    /// Deregistration keeps working.
    pub fn stop_registration(&self) {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            *stopped = true;
            self.stop_cond.notify_all();
        }
    }

    pub fn is_registration_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps the retry delay; returns `false` if registration was stopped.
    fn retry_wait(&self) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped && !self.config.retry_delay.is_zero() {
            let _ = self.stop_cond.wait_for(&mut stopped, self.config.retry_delay);
        }
        !*stopped
    }

    /// Registers `port` in the configured pool.
    ///
    /// The script is tried up to the configured number of attempts with the
    /// retry delay in between. The port joins the membership set only once
    /// a call succeeds. The first success also prepares the control-plane
    /// fallback used by [`deregister_member`](Self::deregister_member).
    ///
    /// # Errors
    ///
    /// Returns `LoadBalancer` when the client is not configured, every
    /// attempt failed, or registration was stopped. The captured script
    /// output is logged.
    pub fn register_member(&self, port: u16) -> Result<()> {
        let pool = self.enabled_pool()?;
        let args = script::register_args(&self.config, pool, port);
        let attempts = self.config.attempts.max(1);
        let mut diagnostics = Vec::new();

        for attempt in 1..=attempts {
            if self.is_registration_stopped() {
                debug!(pool, port, attempt, "registration stopped");
                return Err(TrxError::LoadBalancer(format!(
                    "registration of port {} in pool {} stopped",
                    port, pool
                )));
            }
            match self.runner.run(&self.config.script, &args) {
                Ok(outcome) if outcome.is_success() => {
                    self.membership.insert(PoolMember {
                        pool: pool.to_string(),
                        port,
                        conn_limit: self.config.conn_limit,
                        conn_limit_basis: self.config.conn_limit_basis.clone(),
                    });
                    info!(pool, port, attempt, "registered with load balancer");
                    self.ensure_fallback();
                    return Ok(());
                }
                Ok(outcome) => {
                    warn!(pool, port, attempt, status = ?outcome.status, "load balancer registration failed");
                    diagnostics = outcome.output;
                }
                Err(e) => {
                    warn!(pool, port, attempt, error = %e, "load balancer registration failed");
                    diagnostics = vec![e.to_string()];
                }
            }
            if attempt < attempts && !self.retry_wait() {
                debug!(pool, port, attempt, "registration stopped");
                return Err(TrxError::LoadBalancer(format!(
                    "registration of port {} in pool {} stopped",
                    port, pool
                )));
            }
        }

        for line in &diagnostics {
            error!(pool, port, "{}", line);
        }
        Err(TrxError::LoadBalancer(format!(
            "registration of port {} in pool {} failed after {} attempts",
            port, pool, attempts
        )))
    }

    /// Removes `port` from the configured pool without waiting for its
    /// connections to drain.
    ///
    /// Falls back to disabling the member through the control plane when
    /// the script fails.
    ///
    /// # Errors
    ///
    /// Returns an error only when both mechanisms failed; callers log it and
    /// carry on shutting down.
    pub fn deregister_member(&self, port: u16) -> Result<()> {
        let pool = self.enabled_pool()?;
        let args = script::deregister_args(&self.config, pool, port, false);

        let script_error = match self.runner.run(&self.config.script, &args) {
            Ok(outcome) if outcome.is_success() => {
                self.membership.remove(pool, port);
                info!(pool, port, "deregistered from load balancer");
                return Ok(());
            }
            Ok(outcome) => {
                for line in &outcome.output {
                    warn!(pool, port, "{}", line);
                }
                format!("script exited with {:?}", outcome.status)
            }
            Err(e) => e.to_string(),
        };
        warn!(pool, port, error = %script_error, "load balancer deregistration failed, trying control plane");

        let fallback = self.fallback.lock().clone();
        let Some(fallback) = fallback else {
            error!(pool, port, "no control plane fallback available");
            return Err(TrxError::LoadBalancer(format!(
                "deregistration of port {} from pool {} failed: {}",
                port, pool, script_error
            )));
        };

        match fallback.client.disable_member(pool, fallback.address, port) {
            Ok(()) => {
                self.membership.remove(pool, port);
                info!(pool, port, address = %fallback.address, "member disabled through control plane");
                Ok(())
            }
            Err(e) => {
                error!(pool, port, error = %e, "control plane disable failed");
                Err(e)
            }
        }
    }

    fn enabled_pool(&self) -> Result<&str> {
        match self.pool.as_deref() {
            Some(pool) if self.is_enabled() => Ok(pool),
            _ => Err(TrxError::LoadBalancer(
                "load balancer pool, device and system type must all be configured".to_string(),
            )),
        }
    }

    /// Prepares the control-plane client once. Failure leaves the fallback
    /// unavailable and is retried on the next successful registration.
    fn ensure_fallback(&self) {
        let mut slot = self.fallback.lock();
        if slot.is_some() {
            return;
        }
        match self.build_fallback() {
            Ok(fallback) => {
                debug!(endpoint = fallback.client.endpoint(), address = %fallback.address, "control plane fallback ready");
                *slot = Some(Arc::new(fallback));
            }
            Err(e) => warn!(error = %e, "control plane fallback unavailable"),
        }
    }

    fn build_fallback(&self) -> Result<Fallback> {
        let host = self
            .config
            .control_host
            .as_deref()
            .or(self.config.device.as_deref())
            .ok_or_else(|| TrxError::LoadBalancer("no control plane host".to_string()))?;

        let credentials = match (&self.embedded_credentials, &self.config.credentials_command) {
            (Some(credentials), _) => credentials.clone(),
            (None, Some(command)) => credentials::fetch_credentials(self.runner.as_ref(), command)?,
            (None, None) => {
                return Err(TrxError::LoadBalancer(
                    "no control plane credentials configured".to_string(),
                ))
            }
        };

        let address = match self.config.member_address {
            Some(address) => address,
            None => credentials::local_address(host)?,
        };
        let client = IControlClient::new(host, credentials, self.config.fallback_timeout)?;
        Ok(Fallback { client, address })
    }
}
