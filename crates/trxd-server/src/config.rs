//! Typed server configuration.
//!
//! Every struct has sensible defaults, `with_*` builder methods and a
//! `validate()` check. [`ServerConfig::from_provider`] reads all of them
//! from a [`ConfigProvider`] using these groups:
//!
//! | group | keys |
//! |---|---|
//! | `SERVER_SOCKET_ADP` | `PORT`, `HOST`, `NUM_LISTENERS`, `LINGER`, `LINGER_TIME`, `KEEP_ALIVE`, `RECEIVE_BUFFER_SIZE`, `SEND_BUFFER_SIZE`, `READ_TIMEOUT`, `LEGACY_FRAMES` |
//! | `LOAD_BALANCER` | `SCRIPT`, `POOL`, `DEVICE`, `SYSTYPE`, `CONN_LIMIT`, `CONN_LIMIT_BASIS`, `LOG_FILE`, `HOST`, `CREDENTIALS_COMMAND`, `REGISTER_POST_FACTO`, `ATTEMPTS`, `RETRY_DELAY_MS`, `FALLBACK_TIMEOUT_MS`, `SCRIPT_TIMEOUT_MS` |
//! | `TSE_SERVER` | `TRX_THRESHOLD`, `TRX_THRESHOLD_DELAY`, `MAX_TRANSACTIONS`, `MEMORY_CEILING_MB` |
//! | `THREAD_POOL` | `<CLASS>_SIZE`, `<CLASS>_BOOST`, `<CLASS>_COMBINE`, `<CLASS>_CONSUME_BACKLOG`, `<CLASS>_MAX_QUEUE` |
//! | `BOOSTER_POOL` | `SIZE`, `ADJUST_INTERVAL_MS` |

use std::net::IpAddr;
use std::time::Duration;

use trxd_common::config::ConfigProvider;
use trxd_common::transport::{Codec, SocketOptions};
use trxd_common::{Result, TrxError};
use trxd_exec::{BoosterConfig, TaskClass, WorkerPoolConfig};

pub const SOCKET_GROUP: &str = "SERVER_SOCKET_ADP";
pub const LOAD_BALANCER_GROUP: &str = "LOAD_BALANCER";
pub const SERVER_GROUP: &str = "TSE_SERVER";
pub const THREAD_POOL_GROUP: &str = "THREAD_POOL";
pub const BOOSTER_GROUP: &str = "BOOSTER_POOL";

/// Default base port of the first listener.
pub const DEFAULT_PORT: u16 = 53501;

/// Listening socket configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptorConfig {
    /// Port of listener 0; listener `i` binds `base_port + i`. Zero binds
    /// every listener to an ephemeral port.
    pub base_port: u16,
    pub host: IpAddr,
    pub num_listeners: usize,
    pub socket: SocketOptions,
    /// Per-call read/write timeout on accepted connections.
    pub read_timeout: Option<Duration>,
    pub legacy_frames: bool,
    /// Register a lazily opened listener with the load balancer.
    pub register_post_facto: bool,
    pub backlog: i32,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_PORT,
            host: IpAddr::from([0, 0, 0, 0]),
            num_listeners: 1,
            socket: SocketOptions::default(),
            read_timeout: Some(Duration::from_secs(30)),
            legacy_frames: false,
            register_post_facto: false,
            backlog: 128,
        }
    }
}

impl AcceptorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_num_listeners(mut self, count: usize) -> Self {
        self.num_listeners = count;
        self
    }

    pub fn with_socket_options(mut self, options: SocketOptions) -> Self {
        self.socket = options;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_legacy_frames(mut self, legacy: bool) -> Self {
        self.legacy_frames = legacy;
        self
    }

    pub fn with_register_post_facto(mut self, register: bool) -> Self {
        self.register_post_facto = register;
        self
    }

    pub fn codec(&self) -> Codec {
        if self.legacy_frames {
            Codec::legacy()
        } else {
            Codec::standard()
        }
    }

    /// Port for listener `index`, or 0 for an ephemeral port.
    pub fn port_for(&self, index: usize) -> u16 {
        if self.base_port == 0 {
            0
        } else {
            self.base_port.saturating_add(index as u16)
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.num_listeners == 0 {
            return Err("at least one listener is required".to_string());
        }
        if self.base_port != 0 && usize::from(self.base_port) + self.num_listeners - 1 > 65535 {
            return Err(format!(
                "{} listeners starting at port {} run past 65535",
                self.num_listeners, self.base_port
            ));
        }
        Ok(())
    }
}

/// External load balancer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerConfig {
    pub script: String,
    /// Pool name, optionally prefixed with `user:password@`.
    pub pool: Option<String>,
    pub device: Option<String>,
    pub system_type: Option<String>,
    pub conn_limit: u32,
    pub conn_limit_basis: String,
    pub log_file: String,
    /// Control-plane host for the direct fallback; defaults to the device.
    pub control_host: Option<String>,
    /// Command printing `user:password` for the fallback.
    pub credentials_command: Option<String>,
    /// Address this host is registered under; resolved when unset.
    pub member_address: Option<IpAddr>,
    pub attempts: u32,
    pub retry_delay: Duration,
    pub fallback_timeout: Duration,
    /// Longest a single script run may take before it is killed.
    pub script_timeout: Duration,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            script: "bigip.sh".to_string(),
            pool: None,
            device: None,
            system_type: None,
            conn_limit: 0,
            conn_limit_basis: "0".to_string(),
            log_file: "bigip.log".to_string(),
            control_host: None,
            credentials_command: None,
            member_address: None,
            attempts: 3,
            retry_delay: Duration::from_secs(5),
            fallback_timeout: Duration::from_secs(30),
            script_timeout: Duration::from_secs(60),
        }
    }
}

impl LoadBalancerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_system_type(mut self, system_type: impl Into<String>) -> Self {
        self.system_type = Some(system_type.into());
        self
    }

    pub fn with_conn_limit(mut self, limit: u32, basis: impl Into<String>) -> Self {
        self.conn_limit = limit;
        self.conn_limit_basis = basis.into();
        self
    }

    pub fn with_log_file(mut self, log_file: impl Into<String>) -> Self {
        self.log_file = log_file.into();
        self
    }

    pub fn with_control_host(mut self, host: impl Into<String>) -> Self {
        self.control_host = Some(host.into());
        self
    }

    pub fn with_credentials_command(mut self, command: impl Into<String>) -> Self {
        self.credentials_command = Some(command.into());
        self
    }

    pub fn with_member_address(mut self, address: IpAddr) -> Self {
        self.member_address = Some(address);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout = timeout;
        self
    }

    pub fn with_script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout = timeout;
        self
    }

    /// Registration happens only when pool, device and system type are set.
    pub fn is_enabled(&self) -> bool {
        self.pool.is_some() && self.device.is_some() && self.system_type.is_some()
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.attempts == 0 {
            return Err("load balancer attempts must be at least 1".to_string());
        }
        if self.is_enabled() && self.script.trim().is_empty() {
            return Err("load balancer script is required when registration is enabled".to_string());
        }
        if self.fallback_timeout.is_zero() {
            return Err("fallback timeout must be greater than zero".to_string());
        }
        if self.script_timeout.is_zero() {
            return Err("script timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Admission control for top-level transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// In-flight transactions above which new ones are throttled; 0 disables.
    pub threshold: usize,
    /// How long a throttled transaction waits before it is answered with an
    /// error.
    pub delay: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            threshold: 0,
            delay: Duration::from_millis(2000),
        }
    }
}

impl ThrottleConfig {
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Limits past which the server starts a graceful shutdown so a supervisor
/// can restart it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownThresholds {
    pub max_transactions: Option<u64>,
    pub memory_ceiling_mb: Option<u64>,
}

impl ShutdownThresholds {
    pub fn with_max_transactions(mut self, max: u64) -> Self {
        self.max_transactions = Some(max);
        self
    }

    pub fn with_memory_ceiling_mb(mut self, ceiling: u64) -> Self {
        self.memory_ceiling_mb = Some(ceiling);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.max_transactions.is_some() || self.memory_ceiling_mb.is_some()
    }
}

/// Everything the server needs at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub acceptor: AcceptorConfig,
    pub load_balancer: LoadBalancerConfig,
    pub throttle: ThrottleConfig,
    pub thresholds: ShutdownThresholds,
    pub pools: Vec<WorkerPoolConfig>,
    pub booster: Option<BoosterConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            acceptor: AcceptorConfig::default(),
            load_balancer: LoadBalancerConfig::default(),
            throttle: ThrottleConfig::default(),
            thresholds: ShutdownThresholds::default(),
            pools: vec![
                WorkerPoolConfig::new(TaskClass::TRANSACTION, 8),
                WorkerPoolConfig::new(TaskClass::THROTTLED, 1),
                WorkerPoolConfig::new(TaskClass::ASYNC, 8),
            ],
            booster: None,
        }
    }
}

impl ServerConfig {
    /// Reads the configuration, falling back to defaults for missing keys.
    ///
    /// # Errors
    ///
    /// Returns `Config` when a value is out of range or the result fails
    /// validation.
    pub fn from_provider(provider: &dyn ConfigProvider) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            acceptor: read_acceptor(provider, defaults.acceptor)?,
            load_balancer: read_load_balancer(provider, defaults.load_balancer)?,
            throttle: read_throttle(provider, defaults.throttle)?,
            thresholds: read_thresholds(provider)?,
            pools: read_pools(provider, &defaults.pools)?,
            booster: read_booster(provider)?,
        };
        config.validate().map_err(TrxError::Config)?;
        Ok(config)
    }

    pub fn pool(&self, class: &TaskClass) -> Option<&WorkerPoolConfig> {
        self.pools.iter().find(|pool| &pool.class == class)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        self.acceptor.validate()?;
        self.load_balancer.validate()?;
        for pool in &self.pools {
            pool.validate()?;
        }
        if let Some(booster) = &self.booster {
            booster.validate()?;
        }
        Ok(())
    }
}

fn int_in<T: TryFrom<i64>>(
    provider: &dyn ConfigProvider,
    group: &str,
    name: &str,
) -> Result<Option<T>> {
    match provider.get_int(group, name) {
        None => Ok(None),
        Some(value) => T::try_from(value).map(Some).map_err(|_| {
            TrxError::Config(format!("{}/{} value {} is out of range", group, name, value))
        }),
    }
}

fn read_acceptor(provider: &dyn ConfigProvider, mut config: AcceptorConfig) -> Result<AcceptorConfig> {
    let group = SOCKET_GROUP;
    if let Some(port) = int_in::<u16>(provider, group, "PORT")? {
        config.base_port = port;
    }
    if let Some(host) = provider.get_string(group, "HOST") {
        config.host = host.trim().parse()?;
    }
    if let Some(count) = int_in::<usize>(provider, group, "NUM_LISTENERS")? {
        config.num_listeners = count;
    }
    let linger = provider.get_bool(group, "LINGER").unwrap_or(false);
    let linger_time = int_in::<u64>(provider, group, "LINGER_TIME")?.unwrap_or(0);
    config.socket.linger = linger.then(|| Duration::from_secs(linger_time));
    if let Some(keep_alive) = provider.get_bool(group, "KEEP_ALIVE") {
        config.socket.keep_alive = keep_alive;
    }
    config.socket.receive_buffer_size =
        int_in::<usize>(provider, group, "RECEIVE_BUFFER_SIZE")?.filter(|size| *size > 0);
    config.socket.send_buffer_size =
        int_in::<usize>(provider, group, "SEND_BUFFER_SIZE")?.filter(|size| *size > 0);
    if let Some(secs) = int_in::<u64>(provider, group, "READ_TIMEOUT")? {
        config.read_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(legacy) = provider.get_bool(group, "LEGACY_FRAMES") {
        config.legacy_frames = legacy;
    }
    if let Some(post_facto) = provider.get_bool(LOAD_BALANCER_GROUP, "REGISTER_POST_FACTO") {
        config.register_post_facto = post_facto;
    }
    Ok(config)
}

fn read_load_balancer(
    provider: &dyn ConfigProvider,
    mut config: LoadBalancerConfig,
) -> Result<LoadBalancerConfig> {
    let group = LOAD_BALANCER_GROUP;
    let non_empty = |name: &str| provider.get_string(group, name).filter(|v| !v.trim().is_empty());

    if let Some(script) = non_empty("SCRIPT") {
        config.script = script;
    }
    config.pool = non_empty("POOL");
    config.device = non_empty("DEVICE");
    config.system_type = non_empty("SYSTYPE");
    if let Some(limit) = int_in::<u32>(provider, group, "CONN_LIMIT")? {
        config.conn_limit = limit;
    }
    if let Some(basis) = non_empty("CONN_LIMIT_BASIS") {
        config.conn_limit_basis = basis;
    }
    if let Some(log_file) = non_empty("LOG_FILE") {
        config.log_file = log_file;
    }
    config.control_host = non_empty("HOST");
    config.credentials_command = non_empty("CREDENTIALS_COMMAND");
    if let Some(address) = non_empty("MEMBER_ADDRESS") {
        config.member_address = Some(address.trim().parse()?);
    }
    if let Some(attempts) = int_in::<u32>(provider, group, "ATTEMPTS")? {
        config.attempts = attempts;
    }
    if let Some(ms) = int_in::<u64>(provider, group, "RETRY_DELAY_MS")? {
        config.retry_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = int_in::<u64>(provider, group, "FALLBACK_TIMEOUT_MS")? {
        config.fallback_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = int_in::<u64>(provider, group, "SCRIPT_TIMEOUT_MS")? {
        config.script_timeout = Duration::from_millis(ms);
    }
    Ok(config)
}

fn read_throttle(provider: &dyn ConfigProvider, mut config: ThrottleConfig) -> Result<ThrottleConfig> {
    if let Some(threshold) = int_in::<usize>(provider, SERVER_GROUP, "TRX_THRESHOLD")? {
        config.threshold = threshold;
    }
    if let Some(ms) = int_in::<u64>(provider, SERVER_GROUP, "TRX_THRESHOLD_DELAY")? {
        config.delay = Duration::from_millis(ms);
    }
    Ok(config)
}

fn read_thresholds(provider: &dyn ConfigProvider) -> Result<ShutdownThresholds> {
    Ok(ShutdownThresholds {
        max_transactions: int_in::<u64>(provider, SERVER_GROUP, "MAX_TRANSACTIONS")?
            .filter(|max| *max > 0),
        memory_ceiling_mb: int_in::<u64>(provider, SERVER_GROUP, "MEMORY_CEILING_MB")?
            .filter(|ceiling| *ceiling > 0),
    })
}

/// Reads the pool of every known class. A size of zero disables the class.
fn read_pools(
    provider: &dyn ConfigProvider,
    defaults: &[WorkerPoolConfig],
) -> Result<Vec<WorkerPoolConfig>> {
    let group = THREAD_POOL_GROUP;
    let mut pools = Vec::new();
    for default in defaults {
        let class = default.class.as_str();
        let key = |suffix: &str| format!("{}_{}", class, suffix);

        let size = int_in::<usize>(provider, group, &key("SIZE"))?.unwrap_or(default.max_workers);
        if size == 0 {
            continue;
        }
        let mut pool = default.clone();
        pool.max_workers = size;
        pool.booster_threshold = int_in::<usize>(provider, group, &key("BOOST"))?
            .filter(|threshold| *threshold > 0)
            .or(default.booster_threshold);
        if let Some(combine) = provider.get_bool(group, &key("COMBINE")) {
            pool.combine_tasks = combine;
        }
        if let Some(consume) = provider.get_bool(group, &key("CONSUME_BACKLOG")) {
            pool.consume_backlog = consume;
        }
        pool.max_queue = int_in::<usize>(provider, group, &key("MAX_QUEUE"))?
            .filter(|max| *max > 0)
            .or(default.max_queue);
        pools.push(pool);
    }
    Ok(pools)
}

fn read_booster(provider: &dyn ConfigProvider) -> Result<Option<BoosterConfig>> {
    let size = int_in::<usize>(provider, BOOSTER_GROUP, "SIZE")?.unwrap_or(0);
    if size == 0 {
        return Ok(None);
    }
    let mut booster = BoosterConfig::new(size);
    if let Some(ms) = int_in::<u64>(provider, BOOSTER_GROUP, "ADJUST_INTERVAL_MS")? {
        booster.adjust_interval = Duration::from_millis(ms);
    }
    Ok(Some(booster))
}
