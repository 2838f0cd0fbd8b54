//! Payload compression seam for `RQDF`/`REDF` frames.
//!
//! The frame codec never looks inside payloads. Requests arriving with a
//! compressed command are inflated before the processor sees them, and the
//! matching response is deflated before it is written back.

use crate::error::Result;

pub trait PayloadCompressor: Send + Sync {
    fn compress(&self, payload: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Leaves payloads untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl PayloadCompressor for PassThrough {
    fn compress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }
}
