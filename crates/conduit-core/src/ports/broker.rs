//! Broker port - the client surface of a message broker.
//!
//! The bridge never talks to a broker directly; it goes through these traits.
//! They mirror the AMQP client model (connection -> channel -> declare,
//! publish, consume, acknowledge) closely enough that an AMQP adapter is a
//! thin wrapper, while [`crate::impls::InMemoryBroker`] implements the same
//! contract in-process.
//!
//! # Contract
//! - `connect` either returns a usable connection or an error; a failed
//!   attempt leaves nothing open.
//! - `notify_close` resolves with the reason when the broker or transport
//!   closes the connection. When the client closes it, the receiver sees the
//!   sender dropped instead.
//! - Consume streams end when their connection or channel closes.
//! - Deliveries are never auto-acknowledged; unsettled deliveries go back to
//!   their queue when the consuming connection goes away.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::Delivery;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("connection to {0} refused")]
    ConnectionRefused(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{0}")]
    Other(String),
}

/// Message handed to [`BrokerChannel::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publishing {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// Ask the broker to store the message durably.
    pub persistent: bool,
}

impl Publishing {
    pub fn persistent(body: impl Into<Vec<u8>>, content_type: &str) -> Self {
        Self {
            body: body.into(),
            content_type: Some(content_type.to_string()),
            persistent: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survives broker restarts.
    pub durable: bool,
    /// Owned by the declaring connection and deleted with it.
    pub exclusive: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
        }
    }

    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes to queues bound with a key equal to the routing key.
    Direct,
    /// Copies every message to all bound queues.
    Fanout,
}

/// Stream of deliveries from one consumer registration.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Settles a single delivery on the broker.
///
/// Implementations do not need to be idempotent; [`crate::domain::AckHandle`]
/// guarantees each one is called at most once.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue; an empty name asks the broker to generate one.
    /// Returns the effective queue name.
    async fn declare_queue(&self, name: &str, options: QueueOptions)
    -> Result<String, BrokerError>;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Returns once the broker has accepted the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Publishing,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Register interest in the connection being closed from the far side.
    fn notify_close(&self) -> oneshot::Receiver<BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Entry point: dials a broker address.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}
