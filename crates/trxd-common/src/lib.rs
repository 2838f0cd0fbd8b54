//! Shared types and wire transport for the trxd fare-server framework.
//!
//! # Overview
//!
//! This crate holds everything both sides of a connection need:
//!
//! - **Errors**: [`TrxError`] taxonomy and [`TaskFailure`]
//! - **Messages**: the [`Message`] envelope and its [`Command`] code
//! - **Transport**: standard and legacy frame codecs over blocking sockets
//! - **Configuration**: the [`ConfigProvider`](config::ConfigProvider) seam
//! - **Compression**: the [`PayloadCompressor`](compress::PayloadCompressor) seam
//!
//! # Architecture
//!
//! - **Transport**: blocking TCP, one thread per read or write
//! - **Framing**: big-endian length-prefixed binary header plus NUL-terminated payload
//! - **Max Payload Size**: 100 MB
//!
//! # Example
//!
//! ```
//! use trxd_common::transport::Codec;
//! use trxd_common::{Command, Message};
//!
//! let request = Message::new(Command::REQUEST, "0010", "<PricingRequest/>");
//! let frame = Codec::standard().encode(&request);
//! assert_eq!(&frame[8..12], b"RQST");
//! ```

pub mod compress;
pub mod config;
pub mod error;
pub mod message;
pub mod transport;

pub use error::{Result, TaskFailure, TrxError, PANIC_FAILURE_CODE, THRESHOLD_REACHED_CODE};
pub use message::{Command, Message};
