//! Backend error types
//!
//! Every failure reported by a SQL connection is a `BackendError`. Errors that
//! originate in the database carry the SQLSTATE the server reported, which is
//! what the classifier uses to decide between retry and abort.

use thiserror::Error;

use crate::backend::types::SqlState;

/// the error type for connection and statement operations
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// the server rejected a statement or commit
    #[error("database error [{state}]: {message}")]
    Database { state: SqlState, message: String },

    /// a native statement could not be parsed
    #[error("syntax error: {0}")]
    Syntax(String),

    /// the statement is valid SQL but not supported by this backend
    #[error("unsupported statement: {0}")]
    Unsupported(String),

    /// the connection was already closed
    #[error("connection {0} is closed")]
    ConnectionClosed(usize),

    /// an operation needed an open transaction but there is none
    #[error("no transaction is in progress")]
    NoTransaction,

    /// a transaction was begun while one was already open
    #[error("a transaction is already in progress")]
    TransactionInProgress,

    /// the savepoint does not exist in the current transaction
    #[error("savepoint does not exist: {0}")]
    UnknownSavepoint(String),

    /// I/O error from the driver transport
    #[error("io error: {0}")]
    Io(String),
}

impl BackendError {
    /// build a server error with an explicit SQLSTATE
    pub fn database(state: impl Into<SqlState>, message: impl Into<String>) -> Self {
        BackendError::Database {
            state: state.into(),
            message: message.into(),
        }
    }

    /// build a serializable conflict error
    pub fn serialization_failure(message: impl Into<String>) -> Self {
        Self::database(SqlState::SERIALIZATION_FAILURE, message)
    }

    /// The SQLSTATE for this error.
    ///
    /// Client-side failures are mapped onto the state a server would have
    /// reported for the same condition, so classification has one input.
    pub fn sqlstate(&self) -> SqlState {
        match self {
            BackendError::Database { state, .. } => state.clone(),
            BackendError::Syntax(_) => SqlState::new(SqlState::SYNTAX_ERROR),
            BackendError::Unsupported(_) => SqlState::new(SqlState::FEATURE_NOT_SUPPORTED),
            BackendError::ConnectionClosed(_) => {
                SqlState::new(SqlState::CONNECTION_DOES_NOT_EXIST)
            }
            BackendError::NoTransaction => SqlState::new(SqlState::NO_ACTIVE_SQL_TRANSACTION),
            BackendError::TransactionInProgress => {
                SqlState::new(SqlState::ACTIVE_SQL_TRANSACTION)
            }
            BackendError::UnknownSavepoint(_) => SqlState::new(SqlState::INVALID_SAVEPOINT),
            BackendError::Io(_) => SqlState::new(SqlState::CONNECTION_FAILURE),
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(e.to_string())
    }
}

impl From<sqlparser::parser::ParserError> for BackendError {
    fn from(e: sqlparser::parser::ParserError) -> Self {
        BackendError::Syntax(e.to_string())
    }
}

/// result type alias for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_mapping() {
        let conflict = BackendError::serialization_failure("restart transaction");
        assert!(conflict.sqlstate().is(SqlState::SERIALIZATION_FAILURE));

        assert_eq!(BackendError::ConnectionClosed(3).sqlstate().class(), "08");
        assert_eq!(BackendError::Syntax("x".into()).sqlstate().class(), "42");
        assert_eq!(BackendError::NoTransaction.sqlstate().class(), "25");
    }

    #[test]
    fn test_display_includes_state() {
        let err = BackendError::database("23505", "duplicate key value");
        assert_eq!(err.to_string(), "database error [23505]: duplicate key value");
    }
}
