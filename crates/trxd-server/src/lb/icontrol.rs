//! Direct control-plane fallback.
//!
//! When the script cannot deregister a member, the member's session state is
//! flipped to disabled with one SOAP call to the balancer's iControl portal.
//! The portal reports application failures in the body, often with a 200
//! status, so the response is scanned for an `error_string` marker as well.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;
use trxd_common::{Result, TrxError};

use super::credentials::PoolCredentials;

const PORTAL_PATH: &str = "/iControl/iControlPortal.cgi";
const SOAP_ACTION: &str = "urn:iControl:LocalLB/PoolMember";

/// Blocking client for one balancer's iControl portal.
#[derive(Debug)]
pub struct IControlClient {
    client: Client,
    endpoint: String,
    credentials: PoolCredentials,
    timeout: Duration,
}

impl IControlClient {
    /// Creates a client for `host` (`name` or `name:port`, port 443 when
    /// omitted).
    ///
    /// Certificate and host name verification are off: the portal sits on
    /// the internal network behind a self-signed certificate.
    ///
    /// # Errors
    ///
    /// Returns `LoadBalancer` if the HTTP client cannot be built.
    pub fn new(host: &str, credentials: PoolCredentials, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| TrxError::LoadBalancer(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: portal_url(host),
            credentials,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Disables new sessions to `address:port` in `pool`.
    ///
    /// # Errors
    ///
    /// `Timeout` if the portal does not answer in time, `LoadBalancer` on any
    /// other transport failure, non-success status or `error_string` reply.
    pub fn disable_member(&self, pool: &str, address: IpAddr, port: u16) -> Result<()> {
        let envelope = session_disable_envelope(pool, address, port);
        debug!(endpoint = %self.endpoint, pool, %address, port, "sending iControl disable");

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.credentials.user, Some(&self.credentials.password))
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(envelope)
            .send()
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        let body = response.text().map_err(|e| self.map_error(e))?;

        if let Some(message) = find_error_string(&body) {
            return Err(TrxError::LoadBalancer(format!(
                "iControl rejected disable of {}:{} in {}: {}",
                address, port, pool, message
            )));
        }
        if !status.is_success() {
            return Err(TrxError::LoadBalancer(format!(
                "iControl returned HTTP {} for {}:{} in {}",
                status, address, port, pool
            )));
        }
        Ok(())
    }

    fn map_error(&self, err: reqwest::Error) -> TrxError {
        if err.is_timeout() {
            TrxError::Timeout(self.timeout.as_millis() as u64)
        } else {
            TrxError::LoadBalancer(format!("iControl request to {} failed: {}", self.endpoint, err))
        }
    }
}

fn portal_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    format!("https://{}{}", host, PORTAL_PATH)
}

/// SOAP body for `LocalLB.PoolMember.set_session_enabled_state` with one
/// member set to `STATE_DISABLED`.
pub fn session_disable_envelope(pool: &str, address: IpAddr, port: u16) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
            "<SOAP-ENV:Envelope",
            " xmlns:SOAP-ENV=\"http://schemas.xmlsoap.org/soap/envelope/\"",
            " xmlns:SOAP-ENC=\"http://schemas.xmlsoap.org/soap/encoding/\"",
            " xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\"",
            " xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\"",
            " xmlns:iControl=\"urn:iControl\"",
            " SOAP-ENV:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\n",
            "<SOAP-ENV:Body>\n",
            "<m:set_session_enabled_state xmlns:m=\"urn:iControl:LocalLB/PoolMember\">\n",
            "<pool_names SOAP-ENC:arrayType=\"xsd:string[1]\"><item>{pool}</item></pool_names>\n",
            "<session_states SOAP-ENC:arrayType=\"iControl:LocalLB.PoolMember.MemberSessionState[][1]\">",
            "<item SOAP-ENC:arrayType=\"iControl:LocalLB.PoolMember.MemberSessionState[1]\">",
            "<item><member><address>{address}</address><port>{port}</port></member>",
            "<session_state>STATE_DISABLED</session_state></item>",
            "</item></session_states>\n",
            "</m:set_session_enabled_state>\n",
            "</SOAP-ENV:Body>\n",
            "</SOAP-ENV:Envelope>\n"
        ),
        pool = xml_escape(pool),
        address = address,
        port = port
    )
}

/// Extracts the text following an `error_string` marker, if any.
pub fn find_error_string(body: &str) -> Option<String> {
    let start = body.find("error_string")? + "error_string".len();
    let rest = body[start..].trim_start_matches(|c: char| c == ' ' || c == ':' || c == '>');
    let end = rest.find(['<', '\n']).unwrap_or(rest.len());
    let message = rest[..end].trim();
    Some(if message.is_empty() {
        "unspecified error".to_string()
    } else {
        message.to_string()
    })
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
