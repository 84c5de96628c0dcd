//! What a role declares on the broker before using it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the broker's default (direct-to-queue) exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Topology declaration: a durable point-to-point queue, or a fanout exchange
/// for broadcast.
///
/// Consumers of a fanout exchange get their own exclusive, server-named queue
/// bound to it; publishers only declare the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    Queue(String),
    Fanout(String),
}

impl Topology {
    pub fn queue(name: impl Into<String>) -> Self {
        Topology::Queue(name.into())
    }

    pub fn fanout(exchange: impl Into<String>) -> Self {
        Topology::Fanout(exchange.into())
    }

    /// Exchange a publisher targets for this destination.
    pub fn exchange(&self) -> &str {
        match self {
            Topology::Queue(_) => DEFAULT_EXCHANGE,
            Topology::Fanout(exchange) => exchange,
        }
    }

    /// Routing key a publisher uses for this destination.
    pub fn routing_key(&self) -> &str {
        match self {
            Topology::Queue(name) => name,
            Topology::Fanout(_) => "",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Topology::Queue(name) | Topology::Fanout(name) => name,
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Queue(name) => write!(f, "queue:{name}"),
            Topology::Fanout(exchange) => write!(f, "fanout:{exchange}"),
        }
    }
}
