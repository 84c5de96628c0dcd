//! Error taxonomy of the bridge and its mapping onto caller-visible kinds.

use std::time::Duration;

use thiserror::Error;

use super::TaskId;
use crate::ports::BrokerError;

/// Coarse classification used by the inbound boundary to build a response.
///
/// Every variant maps to one distinct response, so a caller can always tell
/// which part of the bridge failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connect,
    PublishExhausted,
    SubscribeExhausted,
    CorrelationTimeout,
    Decode,
    Encode,
    DuplicateTask,
    ConnectionLost,
    Broker,
    Acknowledge,
    RouterClosed,
    InvalidConfig,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connect => "connect_error",
            ErrorKind::PublishExhausted => "publish_exhausted",
            ErrorKind::SubscribeExhausted => "subscribe_exhausted",
            ErrorKind::CorrelationTimeout => "correlation_timeout",
            ErrorKind::Decode => "decode_error",
            ErrorKind::Encode => "encode_error",
            ErrorKind::DuplicateTask => "duplicate_task",
            ErrorKind::ConnectionLost => "connection_lost",
            ErrorKind::Broker => "broker_error",
            ErrorKind::Acknowledge => "acknowledge_error",
            ErrorKind::RouterClosed => "router_closed",
            ErrorKind::InvalidConfig => "invalid_config",
        }
    }

    /// Whether the request itself was at fault (as opposed to the bridge).
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            ErrorKind::Decode | ErrorKind::Encode | ErrorKind::DuplicateTask
        )
    }

    /// Process exit code used by the CLI boundary.
    ///
    /// 2 for client errors, 3 for configuration, 4 for timeouts and 1 for
    /// everything else on the server side.
    pub fn exit_code(self) -> i32 {
        match self {
            kind if kind.is_client_error() => 2,
            ErrorKind::InvalidConfig => 3,
            ErrorKind::CorrelationTimeout => 4,
            _ => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("could not connect to broker")]
    Connect(#[source] BrokerError),

    #[error("gave up publishing to {destination} after {attempts} attempts (last error: {})", .last_error.as_deref().unwrap_or("none"))]
    PublishExhausted {
        destination: String,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("gave up subscribing to {source_name} after {attempts} attempts (last error: {})", .last_error.as_deref().unwrap_or("none"))]
    SubscribeExhausted {
        source_name: String,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("no reply for {task_id} within {timeout:?}")]
    CorrelationTimeout { task_id: TaskId, timeout: Duration },

    #[error("could not decode delivery: {0}")]
    Decode(String),

    #[error("could not encode task: {0}")]
    Encode(String),

    #[error("{0} is already awaiting a reply")]
    DuplicateTask(TaskId),

    #[error("connection lost while the operation was in flight")]
    ConnectionLost,

    #[error("broker operation failed")]
    Broker(#[from] BrokerError),

    #[error("could not settle delivery")]
    Acknowledge(#[source] BrokerError),

    #[error("router closed before a reply arrived")]
    RouterClosed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Connect(_) => ErrorKind::Connect,
            BridgeError::PublishExhausted { .. } => ErrorKind::PublishExhausted,
            BridgeError::SubscribeExhausted { .. } => ErrorKind::SubscribeExhausted,
            BridgeError::CorrelationTimeout { .. } => ErrorKind::CorrelationTimeout,
            BridgeError::Decode(_) => ErrorKind::Decode,
            BridgeError::Encode(_) => ErrorKind::Encode,
            BridgeError::DuplicateTask(_) => ErrorKind::DuplicateTask,
            BridgeError::ConnectionLost => ErrorKind::ConnectionLost,
            BridgeError::Broker(_) => ErrorKind::Broker,
            BridgeError::Acknowledge(_) => ErrorKind::Acknowledge,
            BridgeError::RouterClosed => ErrorKind::RouterClosed,
            BridgeError::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_timeout_are_server_errors() {
        let exhausted = BridgeError::PublishExhausted {
            destination: "queue:tasks".into(),
            attempts: 3,
            last_error: Some("connection refused".into()),
        };
        let timeout = BridgeError::CorrelationTimeout {
            task_id: TaskId::random(),
            timeout: Duration::from_millis(50),
        };

        assert!(!exhausted.kind().is_client_error());
        assert!(!timeout.kind().is_client_error());
        assert_eq!(exhausted.kind().exit_code(), 1);
        assert_eq!(timeout.kind().exit_code(), 4);
        assert!(exhausted.to_string().contains("connection refused"));
    }

    #[test]
    fn malformed_input_is_a_client_error() {
        let err = BridgeError::Decode("expected value".into());
        assert!(err.kind().is_client_error());
        assert_eq!(err.kind().exit_code(), 2);
    }

    #[test]
    fn every_kind_has_a_distinct_label() {
        let kinds = [
            ErrorKind::Connect,
            ErrorKind::PublishExhausted,
            ErrorKind::SubscribeExhausted,
            ErrorKind::CorrelationTimeout,
            ErrorKind::Decode,
            ErrorKind::Encode,
            ErrorKind::DuplicateTask,
            ErrorKind::ConnectionLost,
            ErrorKind::Broker,
            ErrorKind::Acknowledge,
            ErrorKind::RouterClosed,
            ErrorKind::InvalidConfig,
        ];
        let labels: std::collections::HashSet<_> = kinds.iter().map(|k| k.as_str()).collect();
        assert_eq!(labels.len(), kinds.len());
    }
}
