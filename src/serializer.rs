//! Payload serialization.
//!
//! The backend never looks inside task, result or event bodies; it asks a
//! [`Serializer`] for bytes on the way out and for values on the way in.
//! [`JsonSerializer`] is the default.

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;

use crate::{Event, Result, TaskInstance, TaskResult};

pub trait Serializer: Send + Sync {
    // ---
    fn dumps_task_instance(&self, task: &TaskInstance) -> Result<Bytes>;

    fn loads_task_instance(&self, body: &[u8]) -> Result<TaskInstance>;

    /// Encode a result of `task`.
    fn dumps_task_result(&self, task: &TaskInstance, result: &TaskResult) -> Result<Bytes>;

    fn loads_task_result(&self, body: &[u8]) -> Result<TaskResult>;

    /// Encode a raw message payload.
    fn dumps(&self, payload: &Value) -> Result<Bytes>;

    fn loads(&self, body: &[u8]) -> Result<Value>;

    fn dumps_event(&self, event: &Event) -> Result<Bytes>;

    fn loads_event(&self, body: &[u8]) -> Result<Event>;
}

/// Shared serializer pointer.
pub type SerializerPtr = Arc<dyn Serializer>;

/// JSON wire format via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn dumps_task_instance(&self, task: &TaskInstance) -> Result<Bytes> {
        Ok(serde_json::to_vec(task)?.into())
    }

    fn loads_task_instance(&self, body: &[u8]) -> Result<TaskInstance> {
        Ok(serde_json::from_slice(body)?)
    }

    fn dumps_task_result(&self, _task: &TaskInstance, result: &TaskResult) -> Result<Bytes> {
        Ok(serde_json::to_vec(result)?.into())
    }

    fn loads_task_result(&self, body: &[u8]) -> Result<TaskResult> {
        Ok(serde_json::from_slice(body)?)
    }

    fn dumps(&self, payload: &Value) -> Result<Bytes> {
        Ok(serde_json::to_vec(payload)?.into())
    }

    fn loads(&self, body: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(body)?)
    }

    fn dumps_event(&self, event: &Event) -> Result<Bytes> {
        Ok(serde_json::to_vec(event)?.into())
    }

    fn loads_event(&self, body: &[u8]) -> Result<Event> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::BackendError;
    use serde_json::json;

    #[test]
    fn test_task_instance_survives_wire() {
        // ---
        let mut task = TaskInstance::new("add", "math").with_args(json!([1, 2]));
        task.data.priority = 7;
        task.data.ttl = Some(std::time::Duration::from_secs(30));

        let body = JsonSerializer.dumps_task_instance(&task).unwrap();
        let back = JsonSerializer.loads_task_instance(&body).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        // ---
        let err = JsonSerializer.loads_task_result(b"{not json").unwrap_err();
        assert!(matches!(err, BackendError::Serialization(_)));
        assert!(!err.is_retryable());
    }
}
