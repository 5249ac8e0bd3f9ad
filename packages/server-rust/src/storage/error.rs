//! Errors raised by storage backends.
//!
//! Backends report what went wrong in storage terms. The service layer
//! re-classifies these into [`EngineError`](crate::service::EngineError)
//! categories at its boundary.

/// Failure of a single storage operation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("unique constraint {constraint} violated")]
    UniqueViolation { constraint: String },
    #[error("referential integrity violated: {detail}")]
    ForeignKey { detail: String },
    #[error("concurrent modification: {detail}")]
    Conflict { detail: String },
    #[error("staged record already processed")]
    AlreadyProcessed,
    #[error("storage backend unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

impl StorageError {
    /// Shorthand for [`StorageError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`StorageError::UniqueViolation`].
    pub fn unique(constraint: &str) -> Self {
        Self::UniqueViolation {
            constraint: constraint.to_string(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_entity() {
        let err = StorageError::not_found("node", "abc");
        assert_eq!(err.to_string(), "node abc not found");
        assert_eq!(
            StorageError::unique("nodes_current_original").to_string(),
            "unique constraint nodes_current_original violated"
        );
    }

    #[test]
    fn anyhow_errors_become_unavailable() {
        let err: StorageError = anyhow::anyhow!("connection reset").into();
        assert!(matches!(err, StorageError::Unavailable(_)));
    }
}
