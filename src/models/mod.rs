//! Data models for the database middleware.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod schema;

pub use connection::{ConnectionTestResult, DatabaseType, TransactionInfo, TransactionState};
pub use query::{Filter, FindOptions, QueryParam, QueryResult, Row, Values};
pub use schema::{
    AlterAction, ColumnChanges, ColumnDef, ColumnType, DefaultValue, ForeignKeyAction,
    ForeignKeyDef, IndexDef, IndexType, RelationDef, RelationType, TableDef,
};
