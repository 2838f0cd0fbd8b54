//! The unit of work run for every accepted connection.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use trxd_common::compress::{PassThrough, PayloadCompressor};
use trxd_common::{Message, TaskFailure, TrxError, THRESHOLD_REACHED_CODE};
use trxd_exec::{PoolRegistry, TaskContext};
use trxd_metrics::ServerStats;

use crate::acceptor::Connection;
use crate::processor::{RequestContext, RequestProcessor};

/// Code of failures raised by the connection itself rather than the
/// processor: unreadable requests and unwritable responses.
pub const CONNECTION_FAILURE_CODE: i32 = -2;

/// Reads one request, runs the processor and writes the response.
pub struct RequestHandler {
    processor: Arc<dyn RequestProcessor>,
    compressor: Arc<dyn PayloadCompressor>,
    registry: Arc<PoolRegistry>,
    stats: Arc<ServerStats>,
    throttle_delay: Duration,
}

impl RequestHandler {
    pub fn new(
        processor: Arc<dyn RequestProcessor>,
        registry: Arc<PoolRegistry>,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            processor,
            compressor: Arc::new(PassThrough),
            registry,
            stats,
            throttle_delay: Duration::from_millis(2000),
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn PayloadCompressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_throttle_delay(mut self, delay: Duration) -> Self {
        self.throttle_delay = delay;
        self
    }

    /// Serves one connection on behalf of the task `ctx`.
    ///
    /// A throttled task does not process its request: it waits the
    /// throttle delay and answers with a threshold error.
    ///
    /// # Errors
    ///
    /// Returns the failure that ended the transaction. Unreadable requests
    /// close the connection without a response; processor failures get a
    /// best-effort error response first.
    pub fn handle(&self, ctx: &Arc<TaskContext>, mut connection: Connection) -> Result<(), TaskFailure> {
        if ctx.is_throttled() {
            self.stats.record_throttled();
            // Consume the request so closing does not reset the connection
            // under the error response.
            if let Err(e) = connection.read_request() {
                return Err(self.connection_failure(&connection, "reading throttled request", e));
            }
            thread::sleep(self.throttle_delay);
            let failure = TaskFailure::new(THRESHOLD_REACHED_CODE, "transaction threshold reached");
            return Err(self.answer_with_error(&mut connection, failure));
        }

        let request = match connection.read_request() {
            Ok(request) => request,
            Err(e) => return Err(self.connection_failure(&connection, "reading request", e)),
        };
        let request = match self.inflate(request) {
            Ok(request) => request,
            Err(e) => return Err(self.connection_failure(&connection, "decompressing request", e)),
        };

        debug!(
            seq = %ctx.sequence_label(),
            command = %request.command,
            version = %request.version_str(),
            bytes = request.payload.len(),
            "processing request"
        );

        let request_ctx = RequestContext {
            task: ctx,
            registry: &self.registry,
        };
        let processed = catch_unwind(AssertUnwindSafe(|| self.processor.process(&request_ctx, &request)))
            .unwrap_or_else(|panic| Err(TaskFailure::from_panic(panic.as_ref())));
        let body = match processed {
            Ok(body) => body,
            Err(failure) => return Err(self.answer_with_error(&mut connection, failure)),
        };

        let response = match self.build_response(&request, &body) {
            Ok(response) => response,
            Err(e) => {
                let failure = TaskFailure::new(CONNECTION_FAILURE_CODE, e.to_string());
                return Err(self.answer_with_error(&mut connection, failure));
            }
        };
        connection
            .write_response(&response)
            .map_err(|e| self.connection_failure(&connection, "writing response", e))?;
        Ok(())
    }

    fn inflate(&self, mut request: Message) -> trxd_common::Result<Message> {
        let body = if request.command.is_compressed() {
            self.compressor.decompress(request.body())?
        } else {
            request.body().to_vec()
        };
        request.payload = body;
        Ok(request)
    }

    fn build_response(&self, request: &Message, body: &[u8]) -> trxd_common::Result<Message> {
        let command = request.command.response();
        let payload = if command.is_compressed() {
            self.compressor.compress(body)?
        } else {
            body.to_vec()
        };
        Ok(Message {
            command,
            version: request.version.clone(),
            revision: request.revision.clone(),
            payload,
        })
    }

    /// Sends the error frame for `failure`, ignoring write errors.
    fn answer_with_error(&self, connection: &mut Connection, failure: TaskFailure) -> TaskFailure {
        self.stats.record_error_code(failure.code);
        if let Err(e) = connection.write_response(&Message::error(failure.code, &failure.message)) {
            debug!(peer = ?connection.peer_addr(), error = %e, "could not send error response");
        }
        failure
    }

    fn connection_failure(&self, connection: &Connection, action: &str, err: TrxError) -> TaskFailure {
        match &err {
            TrxError::Timeout(_) => self.stats.record_timeout(),
            TrxError::Protocol(_) => self.stats.record_protocol_error(),
            _ => {}
        }
        warn!(
            listener = connection.listener_index(),
            peer = ?connection.peer_addr(),
            error = %err,
            "{} failed, closing connection",
            action
        );
        TaskFailure::new(CONNECTION_FAILURE_CODE, err.to_string())
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("throttle_delay", &self.throttle_delay)
            .finish()
    }
}
