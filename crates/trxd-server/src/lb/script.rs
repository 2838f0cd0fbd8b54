//! Registration through the external load balancer script.
//!
//! The script is run synchronously and its standard output is captured so
//! it can be logged when the call fails:
//!
//! ```text
//! <script> -connlimit N -connlimitBasis:BASIS -logfile F <systype> <device> register <pool> <port>
//! <script> [-remove -waitnoconn:30] -logfile F <systype> <device> deregister <pool> <port>
//! ```

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;
use trxd_common::{Result, TrxError};

use crate::config::LoadBalancerConfig;

/// How the external command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Code(i32),
    Signal(i32),
    Unknown,
}

/// Result of one external command run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: ExitKind,
    /// Captured output lines, surfaced as diagnostics on failure.
    pub output: Vec<String>,
}

impl CommandOutcome {
    pub fn new(status: ExitKind, output: Vec<String>) -> Self {
        Self { status, output }
    }

    /// Exit code 0 and termination by signal 127 or 128 count as success.
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            ExitKind::Code(0) | ExitKind::Signal(127) | ExitKind::Signal(128)
        )
    }
}

/// Runs load balancer commands.
///
/// [`ProcessRunner`] is the real implementation; tests substitute scripted
/// fakes.
pub trait LbCommandRunner: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the command could not be started, and
    /// `Timeout` when it ran past its time limit and was killed.
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutcome>;
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long output is collected after the command exits. A background
/// child of the script may hold the pipes open indefinitely.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// Spawns the command as a child process and waits for it, killing it once
/// the time limit passes.
#[derive(Debug, Clone, Copy)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl LbCommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutcome> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TrxError::LoadBalancer(format!("Failed to run {}: {}", program, e)))?;

        let (tx, rx) = mpsc::channel();
        let mut streams = 0;
        if let Some(stdout) = child.stdout.take() {
            collect_lines(0, stdout, tx.clone());
            streams += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            collect_lines(1, stderr, tx.clone());
            streams += 1;
        }
        drop(tx);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    if let Err(e) = child.kill() {
                        warn!(program, error = %e, "could not kill load balancer command");
                    }
                    let _ = child.wait();
                    let timeout_ms = self.timeout.as_millis() as u64;
                    warn!(program, timeout_ms, "load balancer command timed out and was killed");
                    return Err(TrxError::Timeout(timeout_ms));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(TrxError::LoadBalancer(format!(
                        "Failed to wait for {}: {}",
                        program, e
                    )))
                }
            }
        };

        let grace = Instant::now() + OUTPUT_GRACE;
        let mut captured = Vec::with_capacity(streams);
        while captured.len() < streams {
            let remaining = grace.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(stream) => captured.push(stream),
                Err(_) => break,
            }
        }
        captured.sort_by_key(|(index, _)| *index);
        let lines = captured.into_iter().flat_map(|(_, lines)| lines).collect();
        Ok(CommandOutcome::new(exit_kind(&status), lines))
    }
}

/// Reads `stream` to its end on a helper thread and sends the lines tagged
/// with `index`.
fn collect_lines<R: Read + Send + 'static>(
    index: usize,
    stream: R,
    tx: mpsc::Sender<(usize, Vec<String>)>,
) {
    thread::spawn(move || {
        let lines = BufReader::new(stream)
            .split(b'\n')
            .map_while(|line| line.ok())
            .map(|line| String::from_utf8_lossy(&line).trim_end_matches('\r').to_string())
            .collect();
        tx.send((index, lines)).ok();
    });
}

#[cfg(unix)]
fn exit_kind(status: &std::process::ExitStatus) -> ExitKind {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => ExitKind::Code(code),
        (None, Some(signal)) => ExitKind::Signal(signal),
        (None, None) => ExitKind::Unknown,
    }
}

#[cfg(not(unix))]
fn exit_kind(status: &std::process::ExitStatus) -> ExitKind {
    status.code().map(ExitKind::Code).unwrap_or(ExitKind::Unknown)
}

/// Arguments for registering `port` in `pool`.
pub fn register_args(config: &LoadBalancerConfig, pool: &str, port: u16) -> Vec<String> {
    let mut args = vec![
        "-connlimit".to_string(),
        config.conn_limit.to_string(),
        format!("-connlimitBasis:{}", config.conn_limit_basis),
    ];
    args.extend(target_args(config, "register", pool, port));
    args
}

/// Arguments for removing `port` from `pool`.
///
/// With `wait_for_connections` the load balancer keeps the member until it
/// has had no connections for 30 seconds.
pub fn deregister_args(
    config: &LoadBalancerConfig,
    pool: &str,
    port: u16,
    wait_for_connections: bool,
) -> Vec<String> {
    let mut args = Vec::new();
    if wait_for_connections {
        args.push("-remove".to_string());
        args.push("-waitnoconn:30".to_string());
    }
    args.extend(target_args(config, "deregister", pool, port));
    args
}

fn target_args(config: &LoadBalancerConfig, action: &str, pool: &str, port: u16) -> Vec<String> {
    vec![
        "-logfile".to_string(),
        config.log_file.clone(),
        config.system_type.clone().unwrap_or_default(),
        config.device.clone().unwrap_or_default(),
        action.to_string(),
        pool.to_string(),
        port.to_string(),
    ]
}
