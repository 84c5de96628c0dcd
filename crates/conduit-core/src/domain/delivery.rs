//! Deliveries handed out by a consumer and the handle that settles them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::errors::BridgeError;
use crate::ports::Acknowledger;

/// Capability to acknowledge or reject one delivery.
///
/// Clones share a single settled flag: the first `ack`/`reject` reaches the
/// broker, every later call on any clone is a no-op.
#[derive(Clone)]
pub struct AckHandle {
    acker: Arc<dyn Acknowledger>,
    settled: Arc<AtomicBool>,
}

impl AckHandle {
    pub fn new(acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            acker,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Acknowledge. Returns `Ok(false)` when the delivery was already settled.
    pub async fn ack(&self) -> Result<bool, BridgeError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.acker.ack().await.map_err(BridgeError::Acknowledge)?;
        Ok(true)
    }

    /// Reject, optionally asking the broker to requeue.
    /// Returns `Ok(false)` when the delivery was already settled.
    pub async fn reject(&self, requeue: bool) -> Result<bool, BridgeError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.acker
            .reject(requeue)
            .await
            .map_err(BridgeError::Acknowledge)?;
        Ok(true)
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// One message received from a subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    body: Vec<u8>,
    delivery_tag: u64,
    redelivered: bool,
    ack: AckHandle,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            delivery_tag,
            redelivered,
            ack: AckHandle::new(acker),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker already handed this message to someone before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn ack_handle(&self) -> AckHandle {
        self.ack.clone()
    }

    pub async fn ack(&self) -> Result<bool, BridgeError> {
        self.ack.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<bool, BridgeError> {
        self.ack.reject(requeue).await
    }
}
