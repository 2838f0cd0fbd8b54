//! Wire transport for the fare server.
//!
//! # Architecture
//!
//! Every connection is a blocking stream socket. Each read or write may
//! carry its own deadline, and a missed deadline is reported as
//! [`TrxError::Timeout`](crate::TrxError::Timeout) rather than a hard
//! transport failure.
//!
//! Two frame formats share the transport:
//!
//! - **Standard**: `[u32 header size = 16][u32 payload size][4-byte command][4-byte version][4-byte revision][payload]`
//! - **Legacy**: `[u32 total size][4-byte command][2-byte version][2-byte revision][payload]`
//!
//! All integers are big-endian. Payloads carry a trailing NUL terminator.
//!
//! # Components
//!
//! - **[`Codec`]**: frame encode/decode for both formats
//! - **[`WireSocket`]**: a blocking socket bound to one codec
//! - **[`SocketOptions`]**: linger, keep-alive and buffer sizes
//! - **[`TcpTransport`]**: client-side connect plus request/response helper
//!
//! # Example
//!
//! ```no_run
//! use trxd_common::transport::{Codec, TcpTransport};
//! use trxd_common::{Command, Message};
//!
//! let transport = TcpTransport::new(Codec::standard());
//! let mut socket = transport.connect("127.0.0.1:53501").unwrap();
//! let request = Message::new(Command::REQUEST, "0010", "<FareQuote/>");
//! let response = transport.send_request(&mut socket, &request).unwrap();
//! ```

pub mod codec;
pub mod socket;
pub mod tcp;

pub use codec::{Codec, LegacyCodec, StandardCodec, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use socket::{SocketOptions, WireSocket};
pub use tcp::TcpTransport;
