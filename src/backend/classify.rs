//! Failure classification.
//!
//! Maps a backend error onto the only decision the transaction layer needs:
//! redo the whole attempt, or give up with a stable category.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::error::BackendError;
use crate::backend::types::SqlState;

/// Stable category of a non-retryable persistence failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// unique, foreign-key, check or not-null violation
    ConstraintViolation,
    /// the connection to the server was lost or never existed
    ConnectionLost,
    /// the statement was cancelled by a timeout
    Timeout,
    /// malformed or unsupported SQL
    Syntax,
    /// transaction or savepoint state was not what the statement required
    InvalidState,
    /// anything else the driver reported
    Driver,
}

impl ErrorCategory {
    /// Categorize by SQLSTATE.
    pub fn from_sqlstate(state: &SqlState) -> Self {
        if state.is(SqlState::QUERY_CANCELED) {
            return ErrorCategory::Timeout;
        }
        match state.class() {
            "23" => ErrorCategory::ConstraintViolation,
            "08" => ErrorCategory::ConnectionLost,
            "42" | "0A" => ErrorCategory::Syntax,
            "25" | "3B" => ErrorCategory::InvalidState,
            _ => ErrorCategory::Driver,
        }
    }

    /// short machine-readable name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ConstraintViolation => "constraint_violation",
            ErrorCategory::ConnectionLost => "connection_lost",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Syntax => "syntax",
            ErrorCategory::InvalidState => "invalid_state",
            ErrorCategory::Driver => "driver",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a failed commit means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// lock or serialization conflict; roll back to the savepoint and redo
    RetryableConflict,
    /// give up; surface the category to the caller
    Fatal(ErrorCategory),
}

/// Maps backend errors to a [`FailureClass`].
pub trait FailureClassifier: Send + Sync {
    /// classify a failed statement or commit
    fn classify(&self, error: &BackendError) -> FailureClass;
}

/// Classifier for PostgreSQL-compatible SQLSTATE codes.
///
/// `40001` (serialization failure), `40P01` (deadlock) and `55P03`
/// (lock not available) are retryable; everything else is fatal and
/// categorized by [`ErrorCategory::from_sqlstate`].
#[derive(Debug, Clone, Default)]
pub struct SqlStateClassifier {
    extra_retryable: Vec<SqlState>,
}

impl SqlStateClassifier {
    /// Create the default classifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat an additional SQLSTATE as a retryable conflict.
    pub fn with_retryable(mut self, state: impl Into<SqlState>) -> Self {
        self.extra_retryable.push(state.into());
        self
    }

    fn is_conflict(&self, state: &SqlState) -> bool {
        state.is(SqlState::SERIALIZATION_FAILURE)
            || state.is(SqlState::DEADLOCK_DETECTED)
            || state.is(SqlState::LOCK_NOT_AVAILABLE)
            || self.extra_retryable.iter().any(|s| s == state)
    }
}

impl FailureClassifier for SqlStateClassifier {
    fn classify(&self, error: &BackendError) -> FailureClass {
        let state = error.sqlstate();
        if self.is_conflict(&state) {
            FailureClass::RetryableConflict
        } else {
            FailureClass::Fatal(ErrorCategory::from_sqlstate(&state))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflicts_are_retryable() {
        let classifier = SqlStateClassifier::new();
        for code in ["40001", "40P01", "55P03"] {
            let err = BackendError::database(code, "conflict");
            assert_eq!(classifier.classify(&err), FailureClass::RetryableConflict);
        }
    }

    #[test]
    fn test_fatal_categories() {
        let classifier = SqlStateClassifier::new();
        let cases = [
            ("23505", ErrorCategory::ConstraintViolation),
            ("23503", ErrorCategory::ConstraintViolation),
            ("08006", ErrorCategory::ConnectionLost),
            ("57014", ErrorCategory::Timeout),
            ("42601", ErrorCategory::Syntax),
            ("25P01", ErrorCategory::InvalidState),
            ("XX000", ErrorCategory::Driver),
        ];
        for (code, category) in cases {
            let err = BackendError::database(code, "boom");
            assert_eq!(classifier.classify(&err), FailureClass::Fatal(category), "{}", code);
        }
    }

    #[test]
    fn test_client_side_errors_classified() {
        let classifier = SqlStateClassifier::new();
        assert_eq!(
            classifier.classify(&BackendError::ConnectionClosed(1)),
            FailureClass::Fatal(ErrorCategory::ConnectionLost)
        );
        assert_eq!(
            classifier.classify(&BackendError::UnknownSavepoint("sp".into())),
            FailureClass::Fatal(ErrorCategory::InvalidState)
        );
    }

    #[test]
    fn test_extra_retryable_state() {
        let classifier = SqlStateClassifier::new().with_retryable("XX001");
        let err = BackendError::database("XX001", "retry me");
        assert_eq!(classifier.classify(&err), FailureClass::RetryableConflict);
    }
}
