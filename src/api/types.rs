//! API request/response types
//!
//! Mutation payloads are the service's own request types; only the
//! envelope and small bodies live here.

use serde::{Deserialize, Serialize};

use crate::models::TaskInfo;

// === Queries ===

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PoolQuery {
    #[serde(default)]
    pub pool_name: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TaskQuery {
    /// Task name; a trailing `*` matches a prefix
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: bool,
}

// === Bodies ===

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub snapshot_name: String,
}

/// The body may be omitted entirely
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MoveTrashRequest {
    /// Seconds before purge may remove the entry
    #[serde(default)]
    pub delay: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RestoreTrashRequest {
    /// Empty restores under the original name
    #[serde(default)]
    pub new_image_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateNamespaceRequest {
    pub namespace: String,
}

// === Responses ===

#[derive(Debug, Serialize, Deserialize)]
pub struct CloneFormatResponse {
    pub clone_format_version: u8,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub component: String,
    /// Present when the error ended a task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
