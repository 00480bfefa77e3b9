/// Error Module
///
/// This module defines the error types shared by the pool, connections,
/// statements and result sets. Usage errors (bad indexes, unknown columns,
/// malformed URLs) are raised locally; errors reported by a backend keep the
/// backend's message verbatim.
use thiserror::Error;

/// Broad classification of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed connection URL
    Parse,
    /// The pool could not hand out a connection
    Connection,
    /// The backend rejected a statement or failed while running it
    SqlExecution,
    /// Statement parameter index outside `[1, parameter_count]`
    ParameterIndex,
    /// Result column index outside `[1, column_count]`
    ColumnIndex,
    /// Unknown result column name
    ColumnName,
    /// A value cannot be represented as the requested type
    Conversion,
    /// Configuration could not be loaded or is inconsistent
    Config,
    /// File system errors
    Io,
}

/// Error type for every fallible operation in dbkit.
///
/// Each variant carries a complete, human-readable message.
#[derive(Error, Debug)]
pub enum DbError {
    /// The connection URL could not be parsed
    #[error("Invalid URL: {0}")]
    Parse(String),

    /// Pool start failure, exhausted pool, checkout timeout or closed connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Errors reported by the database backend
    #[error("SQL error: {0}")]
    SqlExecution(String),

    /// Prepared statement parameter index out of range
    #[error("Parameter index {index} is out of range [1, {count}]")]
    ParameterIndex { index: usize, count: usize },

    /// Result set column index out of range
    #[error("Column index {index} is out of range [1, {count}]")]
    ColumnIndex { index: usize, count: usize },

    /// Result set column name not found
    #[error("Invalid column name '{0}'")]
    ColumnName(String),

    /// Value conversion errors
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Returns the taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::Parse(_) => ErrorKind::Parse,
            DbError::Connection(_) => ErrorKind::Connection,
            DbError::SqlExecution(_) => ErrorKind::SqlExecution,
            DbError::ParameterIndex { .. } => ErrorKind::ParameterIndex,
            DbError::ColumnIndex { .. } => ErrorKind::ColumnIndex,
            DbError::ColumnName(_) => ErrorKind::ColumnName,
            DbError::Conversion(_) => ErrorKind::Conversion,
            DbError::Config(_) => ErrorKind::Config,
            DbError::Io(_) => ErrorKind::Io,
        }
    }

    /// The message without the kind prefix added by `Display`.
    pub fn message(&self) -> String {
        match self {
            DbError::Parse(msg)
            | DbError::Connection(msg)
            | DbError::SqlExecution(msg)
            | DbError::Conversion(msg)
            | DbError::Config(msg) => msg.clone(),
            DbError::ColumnName(name) => format!("Invalid column name '{}'", name),
            DbError::Io(e) => e.to_string(),
            other => other.to_string(),
        }
    }

    /// True for errors detected locally, without a backend round trip.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Parse
                | ErrorKind::ParameterIndex
                | ErrorKind::ColumnIndex
                | ErrorKind::ColumnName
        )
    }
}

impl From<toml::de::Error> for DbError {
    fn from(e: toml::de::Error) -> Self {
        DbError::Config(e.to_string())
    }
}

/// Type alias for Result to use DbError as the error type.
pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let sql_err = DbError::SqlExecution("no such table: zild_t".to_string());
        assert_eq!(sql_err.to_string(), "SQL error: no such table: zild_t");

        let index_err = DbError::ParameterIndex { index: 3, count: 2 };
        assert_eq!(index_err.to_string(), "Parameter index 3 is out of range [1, 2]");

        let name_err = DbError::ColumnName("nonexistingcolumnname".to_string());
        assert!(name_err.to_string().contains("nonexistingcolumnname"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(DbError::Parse("x".into()).kind(), ErrorKind::Parse);
        assert_eq!(
            DbError::ColumnIndex { index: 0, count: 2 }.kind(),
            ErrorKind::ColumnIndex
        );
        assert!(DbError::ColumnName("x".into()).is_usage_error());
        assert!(!DbError::SqlExecution("x".into()).is_usage_error());
        assert_eq!(DbError::Connection("timed out".into()).message(), "timed out");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let db_err: DbError = io_err.into();
        match db_err {
            DbError::Io(_) => {}
            _ => panic!("Expected IO error"),
        }

        let toml_err = toml::from_str::<toml::Value>("[pool").unwrap_err();
        let db_err: DbError = toml_err.into();
        assert_eq!(db_err.kind(), ErrorKind::Config);
    }
}
