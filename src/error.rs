//! Error types for the block image manager

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{errno, EngineError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid image spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown image feature: {0}")]
    UnknownFeature(String),

    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Trash entry not found: {0}")]
    TrashEntryNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("{message}")]
    ReferentialConflict { code: String, message: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Task {task_id} is already running for {resource_key}")]
    DuplicateInFlight { resource_key: String, task_id: String },

    #[error("Trash entry {0} has not expired yet, use force to remove it")]
    NotExpired(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Storage engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Uniform error taxonomy exposed to API clients and task pollers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidSpec,
    InvalidRequest,
    PoolNotFound,
    NamespaceNotFound,
    ImageNotFound,
    SnapshotNotFound,
    TrashEntryNotFound,
    TaskNotFound,
    PermissionDenied,
    Busy,
    ReferentialConflict,
    AlreadyExists,
    DuplicateInFlight,
    NotExpired,
    Cancelled,
    RemoteEngineError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidSpec => "invalid_spec",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::PoolNotFound => "pool_not_found",
            ErrorKind::NamespaceNotFound => "namespace_not_found",
            ErrorKind::ImageNotFound => "image_not_found",
            ErrorKind::SnapshotNotFound => "snapshot_not_found",
            ErrorKind::TrashEntryNotFound => "trash_entry_not_found",
            ErrorKind::TaskNotFound => "task_not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Busy => "busy",
            ErrorKind::ReferentialConflict => "referential_conflict",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::DuplicateInFlight => "duplicate_in_flight",
            ErrorKind::NotExpired => "not_expired",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::RemoteEngineError => "remote_engine_error",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Io and Json errors are not `Clone`; copies keep their kind and message
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::InvalidSpec(m) => Error::InvalidSpec(m.clone()),
            Error::InvalidRequest(m) => Error::InvalidRequest(m.clone()),
            Error::UnknownFeature(m) => Error::UnknownFeature(m.clone()),
            Error::PoolNotFound(m) => Error::PoolNotFound(m.clone()),
            Error::NamespaceNotFound(m) => Error::NamespaceNotFound(m.clone()),
            Error::ImageNotFound(m) => Error::ImageNotFound(m.clone()),
            Error::SnapshotNotFound(m) => Error::SnapshotNotFound(m.clone()),
            Error::TrashEntryNotFound(m) => Error::TrashEntryNotFound(m.clone()),
            Error::TaskNotFound(m) => Error::TaskNotFound(m.clone()),
            Error::PermissionDenied(m) => Error::PermissionDenied(m.clone()),
            Error::Busy(m) => Error::Busy(m.clone()),
            Error::ReferentialConflict { code, message } => Error::ReferentialConflict {
                code: code.clone(),
                message: message.clone(),
            },
            Error::AlreadyExists(m) => Error::AlreadyExists(m.clone()),
            Error::DuplicateInFlight {
                resource_key,
                task_id,
            } => Error::DuplicateInFlight {
                resource_key: resource_key.clone(),
                task_id: task_id.clone(),
            },
            Error::NotExpired(m) => Error::NotExpired(m.clone()),
            Error::Cancelled => Error::Cancelled,
            Error::Engine(e) => Error::Engine(e.clone()),
            Error::Config(m) => Error::Config(m.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Json(e) => Error::Internal(format!("JSON error: {e}")),
            Error::Internal(m) => Error::Internal(m.clone()),
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidSpec(_) => ErrorKind::InvalidSpec,
            Error::InvalidRequest(_) | Error::UnknownFeature(_) => ErrorKind::InvalidRequest,
            Error::PoolNotFound(_) => ErrorKind::PoolNotFound,
            Error::NamespaceNotFound(_) => ErrorKind::NamespaceNotFound,
            Error::ImageNotFound(_) => ErrorKind::ImageNotFound,
            Error::SnapshotNotFound(_) => ErrorKind::SnapshotNotFound,
            Error::TrashEntryNotFound(_) => ErrorKind::TrashEntryNotFound,
            Error::TaskNotFound(_) => ErrorKind::TaskNotFound,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Busy(_) => ErrorKind::Busy,
            Error::ReferentialConflict { .. } => ErrorKind::ReferentialConflict,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::DuplicateInFlight { .. } => ErrorKind::DuplicateInFlight,
            Error::NotExpired(_) => ErrorKind::NotExpired,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Engine(e) if e.errno == errno::ECANCELED => ErrorKind::Cancelled,
            Error::Engine(_) => ErrorKind::RemoteEngineError,
            Error::Config(_) | Error::Io(_) | Error::Json(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Machine readable code; engine failures keep the errno name
    pub fn code(&self) -> String {
        match self {
            Error::Engine(e) => e.errno_name().to_string(),
            Error::ReferentialConflict { code, .. } => code.clone(),
            other => other.kind().as_str().to_string(),
        }
    }

    /// Which part of the system the error belongs to
    pub fn component(&self) -> &'static str {
        match self {
            Error::PoolNotFound(_) | Error::NamespaceNotFound(_) => "pool",
            Error::TaskNotFound(_) | Error::DuplicateInFlight { .. } | Error::Cancelled => "task",
            Error::Config(_) => "config",
            _ => "rbd",
        }
    }

    /// Native errno of the storage engine, when the failure came from it
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Engine(e) => Some(e.errno),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PoolNotFound
                | ErrorKind::NamespaceNotFound
                | ErrorKind::ImageNotFound
                | ErrorKind::SnapshotNotFound
                | ErrorKind::TrashEntryNotFound
                | ErrorKind::TaskNotFound
        )
    }

    pub fn referential(code: &str, message: impl Into<String>) -> Self {
        Error::ReferentialConflict {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_keep_errno() {
        let err = Error::from(EngineError::new(errno::EINVAL, "bad order"));
        assert_eq!(err.kind(), ErrorKind::RemoteEngineError);
        assert_eq!(err.code(), "EINVAL");
        assert_eq!(err.errno(), Some(errno::EINVAL));
        assert_eq!(err.component(), "rbd");
    }

    #[test]
    fn test_cancelled_engine_call_is_cancellation() {
        let err = Error::from(EngineError::new(errno::ECANCELED, "aborted"));
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_pool_errors_belong_to_pool_component() {
        let err = Error::PoolNotFound("rbd".into());
        assert_eq!(err.component(), "pool");
        assert!(err.is_not_found());
        assert_eq!(err.code(), "pool_not_found");
    }

    #[test]
    fn test_referential_conflict_code() {
        let err = Error::referential("namespace_contains_images", "Namespace contains images");
        assert_eq!(err.kind(), ErrorKind::ReferentialConflict);
        assert_eq!(err.code(), "namespace_contains_images");
        assert_eq!(err.to_string(), "Namespace contains images");
    }

    #[test]
    fn test_clone_keeps_kind_and_message() {
        let err = Error::referential("snapshot_in_use", "in use");
        let copy = err.clone();
        assert_eq!(copy.code(), "snapshot_in_use");
        assert_eq!(copy.to_string(), "in use");

        let json = serde_json::from_str::<u32>("x").unwrap_err();
        let err = Error::from(json);
        assert_eq!(err.clone().kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DuplicateInFlight).unwrap();
        assert_eq!(json, "\"duplicate_in_flight\"");
    }
}
