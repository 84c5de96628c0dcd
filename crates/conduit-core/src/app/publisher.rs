//! Publisher - persistent sends retried under a backoff campaign.

use tracing::{Instrument, debug, warn};

use crate::app::connection::ConnectionManager;
use crate::backoff::BackoffPolicy;
use crate::domain::{BridgeError, CONTENT_TYPE_JSON, Role, Topology};
use crate::ports::Publishing;

pub struct Publisher {
    manager: ConnectionManager,
    policy: BackoffPolicy,
}

impl Publisher {
    /// `manager` should have been built for [`Role::Publisher`].
    pub fn new(manager: ConnectionManager, policy: BackoffPolicy) -> Self {
        debug_assert_eq!(manager.role(), Role::Publisher);
        Self { manager, policy }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Publish `payload` to `destination`, retrying until the broker accepts
    /// it or the backoff budget runs out.
    ///
    /// Every attempt is preceded by the next backoff wait. A publish that races
    /// a connection loss counts as a failed attempt.
    pub async fn send(&self, destination: &Topology, payload: &[u8]) -> Result<(), BridgeError> {
        self.send_inner(destination, payload)
            .instrument(self.manager.span().clone())
            .await
    }

    async fn send_inner(&self, destination: &Topology, payload: &[u8]) -> Result<(), BridgeError> {
        let mut backoff = self.policy.start();
        let mut last_error: Option<String> = None;

        loop {
            let Some(wait) = backoff.next() else {
                warn!(%destination, attempts = backoff.attempts(), "publish retries exhausted");
                return Err(BridgeError::PublishExhausted {
                    destination: destination.to_string(),
                    attempts: backoff.attempts(),
                    last_error,
                });
            };
            tokio::time::sleep(wait).await;

            let mut link = match self.manager.connect(destination).await {
                Ok(link) => link,
                Err(e) => {
                    warn!(%destination, error = %e, "could not reconnect");
                    last_error = Some(error_chain(&e));
                    continue;
                }
            };

            let message = Publishing::persistent(payload, CONTENT_TYPE_JSON);
            let channel = link.channel().clone();
            let result = tokio::select! {
                r = channel.publish(destination.exchange(), destination.routing_key(), message) => {
                    r.map_err(BridgeError::Broker)
                }
                _ = link.lost() => Err(BridgeError::ConnectionLost),
            };

            match result {
                Ok(()) => {
                    debug!(%destination, bytes = payload.len(), "sent");
                    return Ok(());
                }
                Err(e) => {
                    warn!(%destination, error = %e, "failed to send");
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

/// `outer: inner` rendering of an error and its sources.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}
