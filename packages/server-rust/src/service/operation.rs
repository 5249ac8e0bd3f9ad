//! Engine error taxonomy and the uniform result envelope.

use deep_lynx_core::{IdentityKey, MappingError, NodeId, ValidationFailure};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// Categorical error code exposed to callers. Never a transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    ValidationFailed,
    Conflict,
    NotFound,
    Unavailable,
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::ValidationFailed => "validation_failed",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

/// Errors returned by the engine, coordinator and processor.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
    #[error("identity {key} belongs to node {owner}")]
    IdentityConflict { key: IdentityKey, owner: NodeId },
    #[error("more than one current node carries {key}")]
    DuplicateCurrent { key: IdentityKey },
    #[error("node {node_id} cannot change metatype")]
    MetatypeReassignment { node_id: NodeId },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("constraint violated: {detail}")]
    ConstraintViolation { detail: String },
    #[error("storage temporarily unavailable: {message}")]
    TransientStorage { message: String },
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Category of this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) | Self::Mapping(_) => ErrorCode::ValidationFailed,
            Self::IdentityConflict { .. } | Self::ConstraintViolation { .. } => ErrorCode::Conflict,
            Self::MetatypeReassignment { .. } => ErrorCode::InvalidRequest,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::TransientStorage { .. } => ErrorCode::Unavailable,
            Self::DuplicateCurrent { .. } => ErrorCode::Internal,
        }
    }

    /// Whether repeating the same call later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConstraintViolation { .. } | Self::TransientStorage { .. }
        )
    }

    /// Structured description stored on permanently failed staged records.
    #[must_use]
    pub fn detail(&self) -> serde_json::Value {
        let mut detail = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        let extra = match self {
            Self::Validation(failure) => serde_json::to_value(&failure.errors).ok(),
            Self::Mapping(err) => serde_json::to_value(err).ok(),
            _ => None,
        };
        if let (Some(extra), Some(map)) = (extra, detail.as_object_mut()) {
            map.insert("errors".to_string(), extra);
        }
        detail
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { entity, id } => Self::NotFound { entity, id },
            StorageError::UniqueViolation { constraint } => Self::ConstraintViolation {
                detail: format!("unique constraint {constraint} violated"),
            },
            StorageError::ForeignKey { detail } | StorageError::Conflict { detail } => {
                Self::ConstraintViolation { detail }
            }
            StorageError::AlreadyProcessed => Self::ConstraintViolation {
                detail: "staged record already processed".to_string(),
            },
            StorageError::Unavailable(source) => {
                tracing::error!(error = %source, "storage backend failure");
                Self::TransientStorage {
                    message: "storage backend unavailable".to_string(),
                }
            }
        }
    }
}

/// Error half of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: ErrorCode,
}

/// Uniform result shape: `{"value": ...}` or `{"error": {"message", "code"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Value { value: T },
    Error { error: ErrorBody },
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Value { .. })
    }

    /// Error code of a failed envelope.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Value { .. } => None,
            Self::Error { error } => Some(error.code),
        }
    }
}

impl<T> From<Result<T, EngineError>> for Envelope<T> {
    fn from(result: Result<T, EngineError>) -> Self {
        match result {
            Ok(value) => Self::Value { value },
            Err(err) => Self::Error {
                error: ErrorBody {
                    message: err.to_string(),
                    code: err.code(),
                },
            },
        }
    }
}
