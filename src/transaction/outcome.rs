//! Commit outcomes.
//!
//! A commit either went through, lost a serializable conflict, or failed
//! for good.

use crate::backend::{BackendError, ErrorCategory, FailureClass, FailureClassifier};
use crate::transaction::error::{TransactionError, TransactionResult};

/// Result of a physical commit.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// The transaction is durable.
    Committed,
    /// Serialization or lock conflict; the attempt must be redone.
    Conflict(BackendError),
    /// Non-retryable failure with a stable category.
    Fatal {
        category: ErrorCategory,
        error: BackendError,
    },
}

impl CommitOutcome {
    /// Classify a failed commit.
    pub fn from_failure(classifier: &dyn FailureClassifier, error: BackendError) -> Self {
        match classifier.classify(&error) {
            FailureClass::RetryableConflict => CommitOutcome::Conflict(error),
            FailureClass::Fatal(category) => CommitOutcome::Fatal { category, error },
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }

    /// Whether the caller should roll back to the savepoint and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommitOutcome::Conflict(_))
    }

    /// Convert into the error-propagating form used by the coordinator.
    pub fn into_result(self) -> TransactionResult<()> {
        match self {
            CommitOutcome::Committed => Ok(()),
            CommitOutcome::Conflict(source) => Err(TransactionError::Retryable { source }),
            CommitOutcome::Fatal { category, error } => Err(TransactionError::Fatal {
                category,
                source: error,
            }),
        }
    }
}
