use thiserror::Error;

/// Code recorded when a task panics instead of returning a failure.
pub const PANIC_FAILURE_CODE: i32 = -1;

/// Code carried by the error response sent to throttled transactions.
pub const THRESHOLD_REACHED_CODE: i32 = 9001;

/// A failure raised by a unit of work running on a worker pool.
///
/// The executor that submitted the task keeps the first one recorded and
/// hands it back from `wait(true)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub code: i32,
    pub message: String,
}

impl TaskFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Builds a failure from the payload of a caught panic.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self::new(PANIC_FAILURE_CODE, message)
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for TaskFailure {}

#[derive(Error, Debug)]
pub enum TrxError {
    /// Socket open/bind/listen/accept/read/write failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unknown frame header.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection closed by peer")]
    PeerClosed,

    #[error("Load balancer error: {0}")]
    LoadBalancer(String),

    #[error("Task failed: {0}")]
    Task(TaskFailure),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Threshold reached: {0}")]
    ThresholdReached(String),

    #[error("Shutting down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrxError {
    /// Whether this error is the distinguished timeout result.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TrxError::Timeout(_))
    }
}

impl From<TaskFailure> for TrxError {
    fn from(failure: TaskFailure) -> Self {
        TrxError::Task(failure)
    }
}

impl From<std::net::AddrParseError> for TrxError {
    fn from(err: std::net::AddrParseError) -> Self {
        TrxError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TrxError>;
