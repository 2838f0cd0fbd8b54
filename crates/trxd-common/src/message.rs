//! Wire-level request/response envelope.
//!
//! A [`Message`] is built fresh for every request/response pair. The payload
//! is kept exactly as it travelled on the wire, including the trailing NUL
//! terminator every sender reserves; [`Message::body`] gives the payload
//! without it.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use crate::error::TrxError;

/// Four-byte command code carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command(pub [u8; 4]);

impl Command {
    pub const REQUEST: Command = Command(*b"RQST");
    pub const RESPONSE: Command = Command(*b"RESP");
    /// Request whose payload is independently compressed.
    pub const COMPRESSED_REQUEST: Command = Command(*b"RQDF");
    /// Response whose payload is independently compressed.
    pub const COMPRESSED_RESPONSE: Command = Command(*b"REDF");
    /// Best-effort error answer produced by the framework itself.
    pub const ERROR: Command = Command(*b"ERRR");

    /// Builds a command from the first four bytes of `bytes`, padding with
    /// spaces when fewer are given.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut code = [b' '; 4];
        for (dst, src) in code.iter_mut().zip(bytes) {
            *dst = *src;
        }
        Command(code)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    /// Whether the payload of this command goes through the compression codec.
    pub fn is_compressed(&self) -> bool {
        *self == Self::COMPRESSED_REQUEST || *self == Self::COMPRESSED_RESPONSE
    }

    /// The command used to answer a request carrying `self`.
    pub fn response(&self) -> Command {
        if *self == Self::COMPRESSED_REQUEST {
            Self::COMPRESSED_RESPONSE
        } else {
            Self::RESPONSE
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl FromStr for Command {
    type Err = TrxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 4 {
            return Err(TrxError::Protocol(format!(
                "command must be 1 to 4 bytes, got '{}'",
                s
            )));
        }
        Ok(Command::from_bytes(s.as_bytes()))
    }
}

/// Request/response envelope: command, schema version/revision and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    /// Schema version as it appears on the wire (ASCII digits).
    pub version: Vec<u8>,
    /// Schema revision as it appears on the wire (ASCII digits).
    pub revision: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a message with an empty revision.
    ///
    /// # Arguments
    ///
    /// * `command` - The command code
    /// * `version` - The schema version, e.g. `"0010"`
    /// * `payload` - The payload without any terminator
    pub fn new(command: Command, version: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            version: version.as_bytes().to_vec(),
            revision: Vec::new(),
            payload: payload.into(),
        }
    }

    pub fn with_revision(mut self, revision: &str) -> Self {
        self.revision = revision.as_bytes().to_vec();
        self
    }

    /// Creates an empty envelope to be filled in by the decoder.
    pub fn empty() -> Self {
        Self {
            command: Command([0; 4]),
            version: Vec::new(),
            revision: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Builds the framework's error answer.
    ///
    /// The payload is a small XML element the transform layer on the client
    /// side already understands.
    pub fn error(code: i32, text: &str) -> Self {
        let escaped = text
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
            .replace('"', "&quot;");
        let payload = format!("<Error code=\"{}\" message=\"{}\"/>", code, escaped);
        Self::new(Command::ERROR, "0001", payload)
    }

    /// Appends bytes read from the wire to the payload.
    pub fn append(&mut self, bytes: &[u8]) {
        self.payload.extend_from_slice(bytes);
    }

    /// The payload without the single trailing NUL terminator, if present.
    pub fn body(&self) -> &[u8] {
        match self.payload.split_last() {
            Some((0, rest)) => rest,
            _ => &self.payload,
        }
    }

    pub fn version_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.version)
    }

    pub fn revision_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.revision)
    }
}
