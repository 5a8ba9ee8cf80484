use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::BackendError;

/// Unique task identifier.
///
/// Doubles as the AMQP `message_id` and `correlation_id` of both the task
/// message and every result published for it, which is what the result
/// router demultiplexes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new unique task ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for TaskId {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| BackendError::Transport(format!("invalid task id '{s}': {e}")))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_generate_unique() {
        // ---
        let id1 = TaskId::generate();
        let id2 = TaskId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_parse_display() {
        // ---
        let id = TaskId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 36); // Standard UUID format
        assert_eq!(s.parse::<TaskId>().unwrap(), id);
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }
}
