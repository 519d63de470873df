//! Error types for routed-db.
//!
//! Configuration and routing mistakes surface at the call that made them.
//! Driver failures keep the message and SQLSTATE reported by sqlx.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String, suggestion: String },

    #[error("Engine not found: {engine}")]
    KeyNotFound { engine: String },

    #[error("Unknown engine '{engine}' requested by {source_hint}")]
    UnknownEngine { engine: String, source_hint: String },

    #[error("Session {session_id} has been removed from its scope")]
    SessionClosed { session_id: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Bad engine URI, option bag entry or routing setup.
    pub fn configuration(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// No engine registered under `engine`.
    pub fn key_not_found(engine: impl Into<String>) -> Self {
        Self::KeyNotFound {
            engine: engine.into(),
        }
    }

    /// A routing decision named an engine that does not exist.
    pub fn unknown_engine(engine: impl Into<String>, source_hint: impl Into<String>) -> Self {
        Self::UnknownEngine {
            engine: engine.into(),
            source_hint: source_hint.into(),
        }
    }

    pub fn session_closed(session_id: impl Into<String>) -> Self {
        Self::SessionClosed {
            session_id: session_id.into(),
        }
    }

    /// Connection or pool failure.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Error raised by the database while running a statement.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Caller passed an entity, column or parameter that cannot be used.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Remediation hint attached to the error, if any.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Configuration { suggestion, .. }
            | Self::Connection { suggestion, .. }
            | Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// SQLSTATE or vendor code reported by the driver.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Whether the same call may succeed if retried.
    ///
    /// Configuration and routing errors never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;

        match err {
            E::Configuration(source) => DbError::configuration(
                source.to_string(),
                "Check the engine URI and its query options",
            ),
            E::Database(db_err) => DbError::database(
                db_err.message(),
                db_err.code().map(|c| c.into_owned()),
                "Check the statement against the engine's schema",
            ),
            E::RowNotFound => DbError::database(
                "Statement returned no rows",
                None,
                "Use a query that tolerates an empty result",
            ),
            E::PoolTimedOut => DbError::timeout("pool acquire", 30),
            E::PoolClosed => DbError::connection(
                "Engine pool is closed",
                "The Database handle was closed; connect again",
            ),
            E::Io(_) | E::Tls(_) | E::Protocol(_) => DbError::connection(
                err.to_string(),
                "Check that the database server is reachable",
            ),
            E::TypeNotFound { type_name } => {
                DbError::schema(format!("Unknown type {type_name}"), type_name)
            }
            E::ColumnNotFound(column) => {
                DbError::schema(format!("Unknown column {column}"), column)
            }
            E::ColumnIndexOutOfBounds { .. }
            | E::ColumnDecode { .. }
            | E::Decode(_)
            | E::WorkerCrashed => DbError::internal(err.to_string()),
            other => DbError::internal(format!("sqlx: {other}")),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::configuration("No databases configured", "Pass a default URI");
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_key_not_found_display() {
        let err = DbError::key_not_found("analytics");
        assert_eq!(err.to_string(), "Engine not found: analytics");
    }

    #[test]
    fn test_unknown_engine_display() {
        let err = DbError::unknown_engine("replica9", "bind hint");
        let msg = err.to_string();
        assert!(msg.contains("replica9"));
        assert!(msg.contains("bind hint"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert_eq!(DbError::key_not_found("x").suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::configuration("bad", "fix").is_retryable());
        assert!(!DbError::unknown_engine("x", "hint").is_retryable());
        assert!(!DbError::key_not_found("x").is_retryable());
    }

    #[test]
    fn test_row_not_found_maps_to_database_error() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::Database { .. }));
    }

    #[test]
    fn test_sql_state_accessor() {
        let err = DbError::database("duplicate key", Some("23505".to_string()), "fix");
        assert_eq!(err.sql_state(), Some("23505"));
        assert_eq!(DbError::internal("x").sql_state(), None);
    }

    #[test]
    fn test_pool_closed_maps_to_connection_error() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, DbError::Connection { .. }));
    }
}
