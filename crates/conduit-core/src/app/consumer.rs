//! Consumer - establishes a live delivery stream under a backoff campaign.

use futures::StreamExt;
use tracing::{Instrument, Span, debug, info, warn};

use crate::app::connection::{ConnectionManager, Link};
use crate::app::publisher::error_chain;
use crate::backoff::BackoffPolicy;
use crate::domain::{BridgeError, Delivery, Role, TaskId, Topology};
use crate::ports::DeliveryStream;

pub struct Consumer {
    manager: ConnectionManager,
    policy: BackoffPolicy,
    source: Topology,
}

impl Consumer {
    /// `manager` should have been built for [`Role::Consumer`].
    pub fn new(manager: ConnectionManager, policy: BackoffPolicy, source: Topology) -> Self {
        debug_assert_eq!(manager.role(), Role::Consumer);
        Self {
            manager,
            policy,
            source,
        }
    }

    pub fn source(&self) -> &Topology {
        &self.source
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Retry until the broker hands out a delivery stream for the source, or
    /// fail with [`BridgeError::SubscribeExhausted`].
    pub async fn subscribe(&self) -> Result<Subscription, BridgeError> {
        self.subscribe_inner()
            .instrument(self.manager.span().clone())
            .await
    }

    async fn subscribe_inner(&self) -> Result<Subscription, BridgeError> {
        let mut backoff = self.policy.start();
        let mut last_error: Option<String> = None;

        loop {
            let Some(wait) = backoff.next() else {
                warn!(source = %self.source, attempts = backoff.attempts(), "subscribe retries exhausted");
                return Err(BridgeError::SubscribeExhausted {
                    source_name: self.source.to_string(),
                    attempts: backoff.attempts(),
                    last_error,
                });
            };
            tokio::time::sleep(wait).await;

            let link = match self.manager.connect(&self.source).await {
                Ok(link) => link,
                Err(e) => {
                    warn!(source = %self.source, error = %e, "could not reconnect");
                    last_error = Some(error_chain(&e));
                    continue;
                }
            };

            let tag = format!("conduit-{}", TaskId::random().as_ulid());
            match link.channel().consume(link.queue(), &tag).await {
                Ok(stream) => {
                    info!(source = %self.source, queue = link.queue(), consumer_tag = %tag, "subscribed");
                    return Ok(Subscription {
                        stream,
                        link,
                        span: self.manager.span().clone(),
                    });
                }
                Err(e) => {
                    let e = BridgeError::Broker(e);
                    warn!(source = %self.source, error = %e, "could not start consuming");
                    last_error = Some(error_chain(&e));
                    self.manager.invalidate(&link).await;
                }
            }
        }
    }

    pub async fn close(&self) {
        self.manager.close().await;
    }
}

/// A live delivery stream bound to one connection generation.
///
/// [`next`](Subscription::next) returns `None` as soon as the stream ends or
/// its connection is reported lost; the owner then subscribes again.
pub struct Subscription {
    stream: DeliveryStream,
    link: Link,
    span: Span,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        self.link.queue()
    }

    pub fn generation(&self) -> u64 {
        self.link.generation()
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        if !self.link.is_alive() {
            return None;
        }
        let delivery = tokio::select! {
            biased;
            d = self.stream.next() => d,
            _ = self.link.lost() => None,
        };
        if delivery.is_none() {
            debug!(parent: &self.span, generation = self.link.generation(), "subscription ended");
        }
        delivery
    }
}
