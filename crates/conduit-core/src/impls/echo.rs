use async_trait::async_trait;

use crate::domain::TaskEnvelope;
use crate::ports::{HandlerError, TaskHandler};

/// Replies with the task payload unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<Vec<u8>, HandlerError> {
        Ok(envelope.payload().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;

    #[tokio::test]
    async fn echoes_payload() {
        let envelope = TaskEnvelope::new(TaskId::random(), b"{\"n\":1}".to_vec());
        let out = EchoHandler.handle(&envelope).await.unwrap();
        assert_eq!(out, b"{\"n\":1}");
    }
}
