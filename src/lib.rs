//! DB Middleware Library
//!
//! Driver-agnostic database access for SQLite, PostgreSQL and MySQL:
//! connection pools, an LRU + TTL query cache, transactions with
//! savepoints, per-dialect DDL/DML generation and raw SQL execution, all
//! orchestrated by [`DatabaseService`].

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod service;

pub use cache::{CacheManager, CacheStats, QueryCache};
pub use config::{Config, DatabaseConfig, ServiceConfig};
pub use error::{DbError, DbResult};
pub use service::{DatabaseConnection, DatabaseService};
