//! Task model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, ErrorKind};

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Registered, waiting for a worker or for its resource key
    Pending,
    /// Executing on a worker
    Running,
    /// Finished without error
    Success,
    /// Finished with an error
    Failed,
    /// Stopped at a checkpoint, or never started
    Cancelled,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failed | TaskState::Cancelled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Success => write!(f, "success"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Normalized failure of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    /// Machine readable code; the errno name for engine failures
    pub code: String,
    pub component: String,
    pub message: String,
    pub resource_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
}

impl TaskError {
    pub fn from_error(err: &Error, resource_key: &str) -> Self {
        Self {
            kind: err.kind(),
            code: err.code(),
            component: err.component().to_string(),
            message: err.to_string(),
            resource_key: resource_key.to_string(),
            errno: err.errno(),
        }
    }

    /// The worker panicked before returning
    pub fn panicked(message: impl Into<String>, resource_key: &str) -> Self {
        Self {
            kind: ErrorKind::Internal,
            code: "panic".to_string(),
            component: "task".to_string(),
            message: message.into(),
            resource_key: resource_key.to_string(),
            errno: None,
        }
    }

    pub fn cancelled(resource_key: &str) -> Self {
        Self::from_error(&Error::Cancelled, resource_key)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Snapshot of a task as seen by pollers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    /// Operation name, e.g. `rbd/create`
    pub name: String,
    /// At most one live task per key
    pub resource_key: String,
    pub metadata: serde_json::Value,
    pub state: TaskState,
    /// Percent, 0 to 100
    pub progress: u8,
    pub begin_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds left, estimated from progress while running
    pub eta_secs: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
}

impl TaskInfo {
    pub fn new(name: impl Into<String>, resource_key: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            resource_key: resource_key.into(),
            metadata,
            state: TaskState::Pending,
            progress: 0,
            begin_time: Utc::now(),
            start_time: None,
            end_time: None,
            eta_secs: None,
            result: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// elapsed * (100 - progress) / progress; unknown until some progress is made
pub fn estimate_eta(elapsed_secs: f64, progress: u8) -> Option<f64> {
    if progress == 0 || progress >= 100 {
        return None;
    }
    let p = f64::from(progress);
    Some(elapsed_secs * (100.0 - p) / p)
}
