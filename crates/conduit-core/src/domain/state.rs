//! Connection state machine shared by both broker roles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one role's broker session.
///
/// Transitions:
/// - Disconnected -> Connecting -> Ready
/// - Connecting -> Disconnected (connect failed)
/// - Ready -> Disconnected (transport closed or an operation failed)
/// - Ready -> Draining -> Disconnected (explicit close)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Draining,
}

impl ConnectionState {
    /// Only a ready session may publish or consume.
    pub fn is_ready(self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

/// Which side of the conversation a connection manager serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Publisher,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => f.write_str("publisher"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}
