//! Type-safe wrappers for values that cross the backend boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A five-character SQLSTATE code reported by the backend driver.
///
/// The first two characters are the class (`23` integrity constraint,
/// `40` transaction rollback, ...), which is what most classification
/// decisions look at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqlState(String);

impl SqlState {
    /// serialization_failure: the transaction lost a serializable conflict
    pub const SERIALIZATION_FAILURE: &'static str = "40001";
    /// deadlock_detected
    pub const DEADLOCK_DETECTED: &'static str = "40P01";
    /// lock_not_available
    pub const LOCK_NOT_AVAILABLE: &'static str = "55P03";
    /// unique_violation
    pub const UNIQUE_VIOLATION: &'static str = "23505";
    /// connection_failure
    pub const CONNECTION_FAILURE: &'static str = "08006";
    /// connection_does_not_exist
    pub const CONNECTION_DOES_NOT_EXIST: &'static str = "08003";
    /// query_canceled (statement timeout)
    pub const QUERY_CANCELED: &'static str = "57014";
    /// active_sql_transaction
    pub const ACTIVE_SQL_TRANSACTION: &'static str = "25001";
    /// no_active_sql_transaction
    pub const NO_ACTIVE_SQL_TRANSACTION: &'static str = "25P01";
    /// invalid_savepoint_specification
    pub const INVALID_SAVEPOINT: &'static str = "3B001";
    /// syntax_error
    pub const SYNTAX_ERROR: &'static str = "42601";
    /// feature_not_supported
    pub const FEATURE_NOT_SUPPORTED: &'static str = "0A000";

    /// Create a SQLSTATE from its code. Codes are normalized to upper case.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_ascii_uppercase())
    }

    /// the full five-character code
    pub fn code(&self) -> &str {
        &self.0
    }

    /// the two-character class prefix
    pub fn class(&self) -> &str {
        self.0.get(..2).unwrap_or(&self.0)
    }

    /// check whether this state equals the given code
    pub fn is(&self, code: &str) -> bool {
        self.0.eq_ignore_ascii_case(code)
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SqlState {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// A validated savepoint identifier.
///
/// Savepoint names are spliced into native SQL, so they are restricted to
/// plain identifiers:
/// - 1-63 characters
/// - ASCII letters, digits and underscores
/// - Must start with a letter or underscore
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SavepointName(String);

impl SavepointName {
    /// The savepoint name a serializable backend recognizes as its restart marker.
    pub const DEFAULT: &'static str = "cockroach_restart";

    /// create a new SavepointName, validating the input
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), InvalidNameError> {
        let mut chars = name.chars();
        let first = chars.next().ok_or(InvalidNameError::Empty)?;

        if name.len() > 63 {
            return Err(InvalidNameError::TooLong(name.len()));
        }

        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(InvalidNameError::InvalidStart(first));
        }

        for (i, c) in name.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && c != '_' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        Ok(())
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `SAVEPOINT <name>;`
    pub fn create_sql(&self) -> String {
        format!("SAVEPOINT {};", self.0)
    }

    /// `RELEASE SAVEPOINT <name>; COMMIT;`
    pub fn release_and_commit_sql(&self) -> String {
        format!("RELEASE SAVEPOINT {}; COMMIT;", self.0)
    }

    /// `ROLLBACK TO SAVEPOINT <name>;`
    pub fn rollback_to_sql(&self) -> String {
        format!("ROLLBACK TO SAVEPOINT {};", self.0)
    }
}

impl Default for SavepointName {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for SavepointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SavepointName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SavepointName> for String {
    fn from(name: SavepointName) -> Self {
        name.0
    }
}

/// Error returned when an identifier fails validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidStart(char),
    InvalidCharacter { char: char, position: usize },
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidStart(c) => write!(f, "name cannot start with '{}'", c),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
        }
    }
}

impl std::error::Error for InvalidNameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_name_valid() {
        assert!(SavepointName::new("cockroach_restart").is_ok());
        assert!(SavepointName::new("_sp1").is_ok());
        assert!(SavepointName::new("Attempt42").is_ok());
    }

    #[test]
    fn test_savepoint_name_invalid() {
        assert_eq!(SavepointName::new(""), Err(InvalidNameError::Empty));
        assert!(matches!(
            SavepointName::new("1sp"),
            Err(InvalidNameError::InvalidStart('1'))
        ));
        assert!(matches!(
            SavepointName::new("sp; DROP TABLE users"),
            Err(InvalidNameError::InvalidCharacter { char: ';', position: 2 })
        ));
        assert!(SavepointName::new("a".repeat(64)).is_err());
    }

    #[test]
    fn test_savepoint_sql() {
        let name = SavepointName::default();
        assert_eq!(name.create_sql(), "SAVEPOINT cockroach_restart;");
        assert_eq!(
            name.release_and_commit_sql(),
            "RELEASE SAVEPOINT cockroach_restart; COMMIT;"
        );
        assert_eq!(name.rollback_to_sql(), "ROLLBACK TO SAVEPOINT cockroach_restart;");
    }

    #[test]
    fn test_sqlstate_class() {
        let state = SqlState::new("40p01");
        assert_eq!(state.code(), "40P01");
        assert_eq!(state.class(), "40");
        assert!(state.is(SqlState::DEADLOCK_DETECTED));
    }

    #[test]
    fn test_savepoint_name_deserialize_validates() {
        let ok: SavepointName = serde_json::from_str("\"sp_main\"").unwrap();
        assert_eq!(ok.as_str(), "sp_main");
        assert!(serde_json::from_str::<SavepointName>("\"bad name\"").is_err());
    }
}
