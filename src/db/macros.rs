//! Backend dispatch macros.
//!
//! Pools and pooled connections are enums with one variant per backend.
//! These macros expand a per-variant body into the full `match`, so each
//! call site reads as one linear block instead of three near-identical arms.

/// Match on a `DbPool` and evaluate a body per backend.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => p.size(),
///     Postgres(p) => p.size(),
///     SQLite(p) => p.size(),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Match on a `DbConnection` and evaluate a body per backend.
///
/// The bound identifier is the backend's `PoolConnection`; dereference it
/// (`&mut **c`) to reach the raw connection for `sqlx::Executor` calls.
#[macro_export]
macro_rules! impl_conn_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::pool::DbConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_conn_dispatch;
pub use impl_db_dispatch;
