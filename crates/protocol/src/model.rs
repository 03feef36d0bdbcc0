use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who is expected to pick a task up: a core-managed worker process or the
/// owning app's own external handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Worker,
    External,
}

impl HandlerKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            HandlerKind::Worker => "worker",
            HandlerKind::External => "external",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "worker" => Some(HandlerKind::Worker),
            "external" => Some(HandlerKind::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Waiting,
    Started,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub owner_identifier: String,
    pub handler_identifier: HandlerKind,
    pub handler_id: Option<String>,
    pub task_identifier: String,
    pub triggering_event_id: Option<String>,
    pub input_data: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
}

impl Task {
    /// State is derived from timestamps; a terminal timestamp wins over `started_at`.
    pub fn state(&self) -> TaskState {
        if self.error_at.is_some() {
            TaskState::Failed
        } else if self.completed_at.is_some() {
            TaskState::Completed
        } else if self.started_at.is_some() {
            TaskState::Started
        } else {
            TaskState::Waiting
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub emitter_identifier: String,
    pub event_identifier: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}
