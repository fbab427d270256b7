//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pools and pooled connections
//! - Per-backend SQL generation (dialects)
//! - Schema management and catalog introspection
//! - Record operations and raw SQL execution
//! - Transactions with savepoints
//! - Type mappings and parameter binding
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod dialect;
pub mod executor;
pub mod params;
pub mod pool;
pub mod record;
pub mod schema;
pub mod transaction;
pub mod types;

pub use dialect::Dialect;
pub use executor::{DEFAULT_STREAM_BATCH_SIZE, SqlExecutor};
pub use pool::{Connection, DbConnection, DbPool, Pool};
pub use record::RecordManager;
pub use schema::SchemaManager;
pub use transaction::Transaction;
