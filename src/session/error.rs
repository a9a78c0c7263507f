//! Session error types.

use thiserror::Error;

use crate::backend::BackendError;
use crate::transaction::TransactionError;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised while opening, using or closing a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// the connection factory could not open a connection
    #[error("failed to open connection: {0}")]
    Connect(#[from] BackendError),

    /// a transaction operation failed
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// the session was used after close
    #[error("session {0} is closed")]
    Closed(String),

    /// a secondary resource failed to close
    #[error("failed to close resource {name}: {message}")]
    Resource { name: String, message: String },
}
