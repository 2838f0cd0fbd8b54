//! trxd server
//!
//! Accepts framed requests on one or more listening ports and runs each one
//! as a transaction on the worker pools of `trxd-exec`.
//!
//! # Components
//!
//! - [`acceptor`] - listening sockets, lazy open, loopback shutdown wake
//! - [`lb`] - load balancer registration with a control-plane fallback
//! - [`dispatch`] - per-listener accept loop feeding the throttling executor
//! - [`request`] - the request task: read, process, respond
//! - [`thresholds`] - transaction count and memory limits
//! - [`server`] - assembly and ordered shutdown

pub mod acceptor;
pub mod config;
pub mod dispatch;
pub mod lb;
pub mod processor;
pub mod request;
pub mod server;
pub mod thresholds;

pub use acceptor::{Connection, ConnectionAcceptor, SlotState};
pub use config::{AcceptorConfig, LoadBalancerConfig, ServerConfig, ShutdownThresholds, ThrottleConfig};
pub use lb::LoadBalancerClient;
pub use processor::{EchoProcessor, RequestContext, RequestProcessor};
pub use request::RequestHandler;
pub use server::{Server, ServerBuilder, ShutdownSignal};
pub use thresholds::{MemorySampler, StatmSampler, ThresholdBreach, ThresholdMonitor};
