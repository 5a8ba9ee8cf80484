//! Task, result, message and event models.
//!
//! These are the values the orchestration layer hands to the backend and
//! gets back from it. Their wire form is owned by the
//! [`Serializer`](crate::Serializer); the backend itself only reads the
//! fields that drive routing and delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::{ResultQueueMode, TaskId};

/// Well-known keys of [`TaskData::extra`].
pub mod keys {
    /// Id of the backend that submitted the task.
    pub const BACKEND_ID: &str = "backend:id";
    /// Graph the task belongs to.
    pub const GRAPH_ID: &str = "graph:id";
    /// Set on the graph task itself.
    pub const GRAPH_GRAPH: &str = "graph:graph";
    /// Result queue mode chosen at submission.
    pub const RESULTS_QUEUE_MODE: &str = "amqp:results_queue_mode";
    /// Reply address recorded by the consuming worker.
    pub const REPLY_TO: &str = "amqp:reply_to";
    /// Durability override for the per-task result queue.
    pub const RESULT_QUEUE_DURABLE: &str = "amqp:result_queue_durable";
}

/// Submission parameters of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    // ---
    pub task_id: TaskId,

    /// Destination queue, also the routing key on the tasks exchange.
    pub queue: String,

    #[serde(default)]
    pub priority: u8,

    /// Task message expiry.
    #[serde(default)]
    pub ttl: Option<Duration>,

    /// Result message expiry.
    #[serde(default)]
    pub result_ttl: Option<Duration>,

    #[serde(default)]
    pub result_return: bool,

    #[serde(default)]
    pub ack_late: bool,

    /// Backend hints, see [`keys`].
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl TaskData {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            task_id: TaskId::generate(),
            queue: queue.into(),
            priority: 0,
            ttl: None,
            result_ttl: None,
            result_return: true,
            ack_late: false,
            extra: Map::new(),
        }
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn extra_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(Value::as_bool)
    }

    /// Result queue mode stamped on the task, or `default`.
    ///
    /// An unrecognised value falls back to `default` as well.
    pub fn results_queue_mode(&self, default: ResultQueueMode) -> ResultQueueMode {
        // ---
        self.extra
            .get(keys::RESULTS_QUEUE_MODE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(default)
    }

    pub fn set_results_queue_mode(&mut self, mode: ResultQueueMode) {
        // ---
        let value = serde_json::to_value(mode).unwrap_or(Value::Null);
        self.extra.insert(keys::RESULTS_QUEUE_MODE.into(), value);
    }

    /// True when the task takes part in a graph.
    pub fn is_graph(&self) -> bool {
        self.extra.contains_key(keys::GRAPH_ID) || self.extra.contains_key(keys::GRAPH_GRAPH)
    }
}

/// A task ready to be sent or executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    // ---
    pub task_name: String,

    /// Handler produces a stream of results rather than one.
    #[serde(default)]
    pub streaming: bool,

    #[serde(default)]
    pub args: Value,

    pub data: TaskData,
}

impl TaskInstance {
    pub fn new(task_name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            streaming: false,
            args: Value::Null,
            data: TaskData::new(queue),
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.data.task_id
    }

    /// True when the task yields several results terminated by a closed marker.
    pub fn is_stream(&self) -> bool {
        self.streaming || self.data.is_graph()
    }
}

/// Kind of a task-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// End of a result stream.
    Closed,
    /// Handler failure, delivered to the caller like any other result.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    #[serde(default)]
    pub message: String,
}

/// One result of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskResult {
    // ---
    #[serde(default)]
    pub res: Option<Value>,

    #[serde(default)]
    pub exc: Option<TaskError>,

    /// `(sequence id, index)` for results of a stream.
    #[serde(default)]
    pub idx: Option<(String, u64)>,
}

impl TaskResult {
    pub fn ok(res: Value) -> Self {
        Self {
            res: Some(res),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            exc: Some(TaskError {
                kind: TaskErrorKind::Failed,
                message: message.into(),
            }),
            ..Self::default()
        }
    }

    /// End-of-stream marker.
    pub fn closed(idx: Option<(String, u64)>) -> Self {
        Self {
            res: None,
            exc: Some(TaskError {
                kind: TaskErrorKind::Closed,
                message: String::new(),
            }),
            idx,
        }
    }

    pub fn with_idx(mut self, seq: impl Into<String>, index: u64) -> Self {
        self.idx = Some((seq.into(), index));
        self
    }

    pub fn is_closed(&self) -> bool {
        matches!(&self.exc, Some(e) if e.kind == TaskErrorKind::Closed)
    }
}

/// An ad hoc message published to an arbitrary exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    // ---
    pub message_id: Uuid,
    pub exchange: String,
    pub data: Value,
    pub priority: Option<u8>,
    pub ttl: Option<Duration>,

    /// Consumer acknowledges only after the handler completes.
    pub ack_late: bool,
}

impl Message {
    pub fn new(exchange: impl Into<String>, data: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            exchange: exchange.into(),
            data,
            priority: None,
            ttl: None,
            ack_late: false,
        }
    }
}

/// A fire-and-forget notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    // ---
    pub event_id: Uuid,
    pub event_type: String,
    pub dt: DateTime<Utc>,
    #[serde(default)]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            dt: Utc::now(),
            ttl: None,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_results_queue_mode_override() {
        // ---
        let mut task = TaskInstance::new("add", "math");
        assert_eq!(
            task.data.results_queue_mode(ResultQueueMode::Common),
            ResultQueueMode::Common
        );

        task.data.set_results_queue_mode(ResultQueueMode::Separate);
        assert_eq!(
            task.data.extra_str(keys::RESULTS_QUEUE_MODE),
            Some("separate")
        );
        assert_eq!(
            task.data.results_queue_mode(ResultQueueMode::Common),
            ResultQueueMode::Separate
        );

        task.data
            .extra
            .insert(keys::RESULTS_QUEUE_MODE.into(), json!("bogus"));
        assert_eq!(
            task.data.results_queue_mode(ResultQueueMode::DirectReplyTo),
            ResultQueueMode::DirectReplyTo
        );
    }

    #[test]
    fn test_stream_detection() {
        // ---
        let mut task = TaskInstance::new("gen", "q");
        assert!(!task.is_stream());

        task.streaming = true;
        assert!(task.is_stream());

        let mut task = TaskInstance::new("step", "q");
        task.data.extra.insert(keys::GRAPH_ID.into(), json!("g1"));
        assert!(task.data.is_graph());
        assert!(task.is_stream());
    }

    #[test]
    fn test_closed_marker() {
        // ---
        let closed = TaskResult::closed(Some(("s".into(), 3)));
        assert!(closed.is_closed());
        assert!(!TaskResult::ok(json!(1)).is_closed());
        assert!(!TaskResult::failed("boom").is_closed());
    }
}
