//! Error types for the database middleware.
//!
//! Structural failures (bad configuration, unreachable pool, unknown driver,
//! invalid transaction state) are returned as `Err(DbError)`. Statement
//! failures inside DML/DDL/raw execution paths are folded into
//! `QueryResult::failure` by the callers instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Pool error: {message}")]
    Pool { message: String },

    #[error("Query failed: {message}")]
    Query {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Record error: {message} (table: {table})")]
    Record { message: String, table: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("Unknown database driver: {driver}")]
    DriverNotFound { driver: String },

    #[error("{feature} is not supported by {backend}")]
    UnsupportedFeature { feature: String, backend: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Database connection '{name}' not found")]
    ConnectionNotFound { name: String },

    #[error("No database connections available")]
    NoConnections,

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool {
            message: message.into(),
        }
    }

    /// Create a query error with optional SQL state.
    pub fn query(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql_state,
        }
    }

    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    pub fn record(message: impl Into<String>, table: impl Into<String>) -> Self {
        Self::Record {
            message: message.into(),
            table: table.into(),
        }
    }

    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn driver_not_found(driver: impl Into<String>) -> Self {
        Self::DriverNotFound {
            driver: driver.into(),
        }
    }

    /// Create an error for an operation the chosen backend cannot perform.
    pub fn unsupported(feature: impl Into<String>, backend: impl Into<String>) -> Self {
        Self::UnsupportedFeature {
            feature: feature.into(),
            backend: backend.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn connection_not_found(name: impl Into<String>) -> Self {
        Self::ConnectionNotFound { name: name.into() }
    }

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

    /// Stable name of the error kind, suitable for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Pool { .. } => "pool",
            Self::Query { .. } => "query",
            Self::Schema { .. } => "schema",
            Self::Record { .. } => "record",
            Self::Transaction { .. } => "transaction",
            Self::Cache { .. } => "cache",
            Self::DriverNotFound { .. } => "driver_not_found",
            Self::UnsupportedFeature { .. } => "unsupported_feature",
            Self::Timeout { .. } => "timeout",
            Self::ConnectionNotFound { .. } | Self::NoConnections => "database",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Internal { .. } => "internal",
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Pool { .. } | Self::Timeout { .. }
        )
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection settings and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::query(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::query("No rows returned", None),
            sqlx::Error::PoolTimedOut => {
                DbError::pool("Timed out waiting for a free connection (pool exhausted)")
            }
            sqlx::Error::PoolClosed => DbError::pool("Connection pool is closed"),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::schema(
                format!("Type not found: {}", type_name),
                type_name.to_string(),
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::query(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::query(format!("Failed to decode column {}: {}", index, source), None)
            }
            sqlx::Error::Decode(source) => DbError::query(format!("Decode error: {}", source), None),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::internal(format!("I/O error: {}", err))
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
        assert_eq!(err.suggestion(), Some("Check credentials"));
    }

    #[test]
    fn test_no_connections_message() {
        assert_eq!(
            DbError::NoConnections.to_string(),
            "No database connections available"
        );
        assert_eq!(
            DbError::connection_not_found("analytics").to_string(),
            "Database connection 'analytics' not found"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(DbError::driver_not_found("oracle").kind(), "driver_not_found");
        assert_eq!(
            DbError::unsupported("ADD FOREIGN KEY", "SQLite").kind(),
            "unsupported_feature"
        );
        assert_eq!(DbError::transaction("not active", "tx").kind(), "transaction");
        assert_eq!(DbError::NoConnections.kind(), "database");
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::pool("exhausted").is_retryable());
        assert!(!DbError::schema("bad", "users").is_retryable());
    }

    #[test]
    fn test_sqlx_pool_errors_map_to_pool() {
        assert!(matches!(
            DbError::from(sqlx::Error::PoolTimedOut),
            DbError::Pool { .. }
        ));
        assert!(matches!(
            DbError::from(sqlx::Error::PoolClosed),
            DbError::Pool { .. }
        ));
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_query() {
        assert!(matches!(
            DbError::from(sqlx::Error::RowNotFound),
            DbError::Query { .. }
        ));
    }
}
