//! Transaction error types.

use thiserror::Error;

use crate::backend::{BackendError, ErrorCategory};

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur during transaction operations.
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    /// The backend reported a serialization or lock conflict at commit.
    ///
    /// The transaction is still open. Roll back to the savepoint and redo
    /// the whole attempt.
    #[error("serialization conflict, please retry transaction: {source}")]
    Retryable {
        #[source]
        source: BackendError,
    },

    /// Any other persistence failure. Not retried.
    #[error("{category} failure: {source}")]
    Fatal {
        category: ErrorCategory,
        #[source]
        source: BackendError,
    },

    /// An operation was invoked on an invalidated or finalized transaction.
    #[error("illegal transaction lifecycle use: {0}")]
    IllegalLifecycle(String),

    /// A lifecycle observer refused completion.
    #[error("transaction observer failed before completion: {0}")]
    Observer(String),
}

impl TransactionError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransactionError::Retryable { .. })
    }

    /// Failure category, for errors that came from the backend.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            TransactionError::Fatal { category, .. } => Some(*category),
            _ => None,
        }
    }

    /// Wrap a backend error as fatal, categorized by its SQLSTATE.
    pub fn fatal(source: BackendError) -> Self {
        let category = ErrorCategory::from_sqlstate(&source.sqlstate());
        Self::Fatal { category, source }
    }

    pub(crate) fn illegal(message: impl Into<String>) -> Self {
        Self::IllegalLifecycle(message.into())
    }
}
