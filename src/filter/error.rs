//! Filter and handler error types.

use std::io;

use thiserror::Error;

use crate::backend::{BackendError, ErrorCategory};
use crate::session::SessionError;
use crate::transaction::TransactionError;

/// Result type for downstream handlers.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Result type for the filter.
pub type FilterResult<T> = Result<T, FilterError>;

/// Errors a downstream handler can return.
///
/// Only a retryable [`TransactionError`] makes the filter replay the attempt;
/// everything else aborts the request.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HandlerError::Transaction(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            HandlerError::Transaction(e) => e.category(),
            HandlerError::Backend(e) => Some(ErrorCategory::from_sqlstate(&e.sqlstate())),
            HandlerError::Session(SessionError::Transaction(e)) => e.category(),
            _ => None,
        }
    }

    /// Shorthand for [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Errors surfaced by [`RequestTransactionFilter`](super::RequestTransactionFilter).
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("failed to create session: {0}")]
    Session(#[source] SessionError),

    #[error("failed to buffer request body: {0}")]
    RequestBody(#[source] io::Error),

    #[error("failed to begin request transaction: {0}")]
    Begin(#[source] SessionError),

    #[error("handler failed on attempt {attempt}: {source}")]
    Handler {
        attempt: u32,
        #[source]
        source: HandlerError,
    },

    #[error("commit failed on attempt {attempt}: {source}")]
    Commit {
        attempt: u32,
        #[source]
        source: TransactionError,
    },

    #[error("rollback to savepoint failed on attempt {attempt}: {source}")]
    Rollback {
        attempt: u32,
        #[source]
        source: TransactionError,
    },

    /// Every attempt lost a serialization conflict. No response was written.
    #[error("conflict, please retry: gave up after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: HandlerError,
    },

    #[error("failed to write response: {0}")]
    Response(#[source] io::Error),
}

impl FilterError {
    /// Failure category, when the error came from the backend.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            FilterError::Session(SessionError::Transaction(e))
            | FilterError::Begin(SessionError::Transaction(e))
            | FilterError::Commit { source: e, .. }
            | FilterError::Rollback { source: e, .. } => e.category(),
            FilterError::Session(SessionError::Connect(_)) => Some(ErrorCategory::ConnectionLost),
            FilterError::Handler { source, .. } => source.category(),
            _ => None,
        }
    }

    /// The attempt the error happened on, if it happened inside the loop.
    pub fn attempt(&self) -> Option<u32> {
        match self {
            FilterError::Handler { attempt, .. }
            | FilterError::Commit { attempt, .. }
            | FilterError::Rollback { attempt, .. } => Some(*attempt),
            FilterError::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// HTTP status a caller should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            FilterError::RetriesExhausted { .. } => 409,
            FilterError::RequestBody(_) => 400,
            _ => match self.category() {
                Some(ErrorCategory::ConstraintViolation) => 409,
                Some(ErrorCategory::ConnectionLost) | Some(ErrorCategory::Timeout) => 503,
                _ => 500,
            },
        }
    }
}
