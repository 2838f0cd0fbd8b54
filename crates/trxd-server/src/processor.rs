//! The seam between the framework and the business logic that answers a
//! request.

use std::sync::Arc;

use trxd_common::{Message, TaskFailure};
use trxd_exec::{PoolRegistry, TaskContext};

/// What a processor can see about the request it is serving.
pub struct RequestContext<'a> {
    /// Context of the request task; sub-tasks spawned from here become its
    /// children.
    pub task: &'a Arc<TaskContext>,
    /// Pools available for fanning work out.
    pub registry: &'a Arc<PoolRegistry>,
}

/// Turns one decoded request into a response payload.
///
/// `request.payload` is the request body: the wire terminator is already
/// removed and compressed payloads are already inflated. Use it directly;
/// [`Message::body`] would strip a second trailing NUL that belongs to the
/// body. Returning a failure makes the server answer with
/// an error frame carrying the failure's code.
pub trait RequestProcessor: Send + Sync {
    fn process(&self, ctx: &RequestContext<'_>, request: &Message) -> Result<Vec<u8>, TaskFailure>;
}

impl<F> RequestProcessor for F
where
    F: Fn(&RequestContext<'_>, &Message) -> Result<Vec<u8>, TaskFailure> + Send + Sync,
{
    fn process(&self, ctx: &RequestContext<'_>, request: &Message) -> Result<Vec<u8>, TaskFailure> {
        self(ctx, request)
    }
}

/// Answers every request with its own body.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoProcessor;

impl RequestProcessor for EchoProcessor {
    fn process(&self, _ctx: &RequestContext<'_>, request: &Message) -> Result<Vec<u8>, TaskFailure> {
        Ok(request.payload.clone())
    }
}
