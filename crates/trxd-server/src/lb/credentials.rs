//! Credentials and addressing for the control-plane fallback.

use std::fmt;
use std::net::{IpAddr, UdpSocket};

use trxd_common::{Result, TrxError};

use super::script::LbCommandRunner;

/// Control-plane login.
#[derive(Clone, PartialEq, Eq)]
pub struct PoolCredentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for PoolCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolCredentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl PoolCredentials {
    /// Parses `user:password`. The password may itself contain colons.
    pub fn parse(text: &str) -> Option<Self> {
        let (user, password) = text.trim().split_once(':')?;
        if user.is_empty() {
            return None;
        }
        Some(Self {
            user: user.to_string(),
            password: password.to_string(),
        })
    }
}

/// Splits a configured pool into optional embedded credentials and the bare
/// pool name: `user:password@pool` or just `pool`.
pub fn split_pool(pool: &str) -> (Option<PoolCredentials>, &str) {
    match pool.rsplit_once('@') {
        Some((login, pool)) => (PoolCredentials::parse(login), pool),
        None => (None, pool),
    }
}

/// Runs the credential lookup command through the shell and parses the
/// first non-empty line of its output.
///
/// # Errors
///
/// Returns `LoadBalancer` if the command fails or prints nothing usable.
pub fn fetch_credentials(runner: &dyn LbCommandRunner, command: &str) -> Result<PoolCredentials> {
    let outcome = runner.run("/bin/sh", &["-c".to_string(), command.to_string()])?;
    if !outcome.is_success() {
        return Err(TrxError::LoadBalancer(format!(
            "credential lookup exited with {:?}",
            outcome.status
        )));
    }
    outcome
        .output
        .iter()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| PoolCredentials::parse(line))
        .ok_or_else(|| TrxError::LoadBalancer("credential lookup printed no user:password".to_string()))
}

/// The local address the kernel would use to reach `host`.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn local_address(host: &str) -> Result<IpAddr> {
    let target = if host.contains(':') && host.parse::<IpAddr>().is_err() {
        host.to_string()
    } else {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:443", v6),
            _ => format!("{}:443", host),
        }
    };
    let bind = if target.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind)?;
    socket
        .connect(&target)
        .map_err(|e| TrxError::LoadBalancer(format!("Failed to resolve route to {}: {}", host, e)))?;
    Ok(socket.local_addr()?.ip())
}
