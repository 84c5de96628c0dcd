//! TaskHandler port - the work a worker performs for one task.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::TaskEnvelope;

#[derive(Debug, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

/// Computes the result payload for one task.
///
/// The worker loop takes care of decoding, replying with the same task id and
/// settling the delivery; a handler only maps input bytes to output bytes.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<Vec<u8>, HandlerError>;
}
