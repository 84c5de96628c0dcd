use serde::{Deserialize, Serialize};

use super::TaskId;
use super::errors::BridgeError;

/// Content type attached to every published envelope.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A request handed to the router: correlation id plus opaque payload.
///
/// Immutable once built. The router owns it from `submit` until the request
/// resolves or times out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    id: TaskId,
    payload: Vec<u8>,
}

impl Task {
    pub fn new(id: TaskId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// Task with a freshly minted id.
    pub fn with_payload(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(TaskId::random(), payload)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_envelope(self) -> TaskEnvelope {
        TaskEnvelope::new(self.id, self.payload)
    }
}

/// Wire form of a task or of its result.
///
/// Requests and replies share this shape: workers answer with the same
/// `task_id` and their result as `payload`, which is what lets the router
/// correlate replies arriving on a shared stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    task_id: TaskId,
    payload: Vec<u8>,
}

impl TaskEnvelope {
    pub fn new(task_id: TaskId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_id,
            payload: payload.into(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        serde_json::to_vec(self).map_err(|e| BridgeError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        serde_json::from_slice(bytes).map_err(|e| BridgeError::Decode(e.to_string()))
    }
}

impl From<Task> for TaskEnvelope {
    fn from(task: Task) -> Self {
        task.into_envelope()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(b"".to_vec())]
    #[case::text(b"{\"query\":\"koi\"}".to_vec())]
    #[case::binary(vec![0, 159, 146, 150, 255, 10, 13])]
    fn envelope_recovers_id_and_bytes_exactly(#[case] payload: Vec<u8>) {
        let task = Task::with_payload(payload.clone());
        let id = task.id();

        let bytes = task.into_envelope().encode().unwrap();
        let decoded = TaskEnvelope::decode(&bytes).unwrap();

        assert_eq!(decoded.task_id(), id);
        assert_eq!(decoded.payload(), payload.as_slice());
    }

    #[test]
    fn wire_shape_uses_task_id_and_payload_keys() {
        let task = Task::with_payload(vec![1, 2]);
        let bytes = TaskEnvelope::from(task.clone()).encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["task_id"], task.id().as_ulid().to_string());
        assert_eq!(value["payload"], serde_json::json!([1, 2]));
    }

    #[rstest]
    #[case::not_json(b"hello".as_slice())]
    #[case::missing_id(br#"{"payload":[]}"#.as_slice())]
    #[case::bad_id(br#"{"task_id":"nope","payload":[]}"#.as_slice())]
    fn malformed_bodies_are_decode_errors(#[case] body: &[u8]) {
        let err = TaskEnvelope::decode(body).unwrap_err();
        assert!(matches!(err, BridgeError::Decode(_)));
    }
}
