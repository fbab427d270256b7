//! Connection pool and pooled connections.
//!
//! Each named connection owns one backend-specific sqlx pool (MySqlPool,
//! PgPool, SqlitePool) so every backend keeps its full type support.
//! A [`Connection`] is an exclusively owned checkout from that pool; the
//! pool-level convenience methods acquire, run one statement and release
//! on every exit path.

use crate::config::DatabaseConfig;
use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, QueryResult, Row};
use futures_util::future::BoxFuture;
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::{
    MySql, MySqlPool, PgPool, Postgres, Sqlite, SqlitePool, mysql::MySqlConnectOptions,
    mysql::MySqlPoolOptions, postgres::PgConnectOptions, postgres::PgPoolOptions,
    sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions,
};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Probe timeout used by `test_connection`.
pub const PROBE_TIMEOUT_SECS: u64 = 10;

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    pub async fn close(&self) {
        impl_db_dispatch!(self, {
            MySql(p) => p.close().await,
            Postgres(p) => p.close().await,
            SQLite(p) => p.close().await,
        })
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Open connections, idle and checked out.
    pub fn size(&self) -> u32 {
        impl_db_dispatch!(self, {
            MySql(p) => p.size(),
            Postgres(p) => p.size(),
            SQLite(p) => p.size(),
        })
    }

    pub fn num_idle(&self) -> usize {
        impl_db_dispatch!(self, {
            MySql(p) => p.num_idle(),
            Postgres(p) => p.num_idle(),
            SQLite(p) => p.num_idle(),
        })
    }

    async fn acquire(&self) -> Result<DbConnection, sqlx::Error> {
        Ok(impl_db_dispatch!(self, {
            MySql(p) => DbConnection::MySql(p.acquire().await?),
            Postgres(p) => DbConnection::Postgres(p.acquire().await?),
            SQLite(p) => DbConnection::SQLite(p.acquire().await?),
        }))
    }
}

/// A live connection checked out of a [`DbPool`].
#[derive(Debug)]
pub enum DbConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

// =============================================================================
// Connection
// =============================================================================

/// Exclusively owned pooled connection.
///
/// Dropping it returns the underlying connection to the pool. If a
/// transaction is still open at that point a rollback is spawned first.
#[derive(Debug)]
pub struct Connection {
    inner: Option<DbConnection>,
    db_type: DatabaseType,
    command_timeout: Duration,
    in_transaction: bool,
}

impl Connection {
    fn new(inner: DbConnection, db_type: DatabaseType, command_timeout: Duration) -> Self {
        Self {
            inner: Some(inner),
            db_type,
            command_timeout,
            in_transaction: false,
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn live(&mut self) -> DbResult<&mut DbConnection> {
        self.inner
            .as_mut()
            .ok_or_else(|| DbError::pool("Connection has been closed"))
    }

    /// Run a statement, returning `(rows_affected, last_insert_id)`.
    ///
    /// Statement errors are raised; see [`Connection::execute`] for the
    /// variant that folds them into a `QueryResult`.
    pub async fn run(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<(u64, Option<i64>)> {
        let limit = self.command_timeout;
        debug!(sql = %sql, params = params.len(), "Executing statement");
        impl_conn_dispatch!(self.live()?, {
            MySql(c) => mysql::execute(&mut **c, sql, params, limit).await,
            Postgres(c) => postgres::execute(&mut **c, sql, params, limit).await,
            SQLite(c) => sqlite::execute(&mut **c, sql, params, limit).await,
        })
    }

    /// Execute a statement; failures come back as `QueryResult::failure`.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.live()?;
        let start = Instant::now();
        Ok(match self.run(sql, params).await {
            Ok((affected, last_id)) => {
                QueryResult::ok(affected, elapsed_ms(start)).with_last_insert_id(last_id)
            }
            Err(e) => {
                debug!(error = %e, "Statement failed");
                QueryResult::failure(e.to_string(), elapsed_ms(start))
            }
        })
    }

    /// Execute a row-returning statement (e.g. `INSERT .. RETURNING`).
    ///
    /// `affected_rows` is the number of rows returned.
    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.live()?;
        let start = Instant::now();
        Ok(match self.fetch_all(sql, params).await {
            Ok(rows) => QueryResult::ok(rows.len() as u64, elapsed_ms(start)).with_rows(rows),
            Err(e) => {
                debug!(error = %e, "Query failed");
                QueryResult::failure(e.to_string(), elapsed_ms(start))
            }
        })
    }

    pub async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let limit = self.command_timeout;
        debug!(sql = %sql, params = params.len(), "Fetching rows");
        impl_conn_dispatch!(self.live()?, {
            MySql(c) => mysql::fetch_all(&mut **c, sql, params, limit).await,
            Postgres(c) => postgres::fetch_all(&mut **c, sql, params, limit).await,
            SQLite(c) => sqlite::fetch_all(&mut **c, sql, params, limit).await,
        })
    }

    pub async fn fetch_one(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        let limit = self.command_timeout;
        impl_conn_dispatch!(self.live()?, {
            MySql(c) => mysql::fetch_optional(&mut **c, sql, params, limit).await,
            Postgres(c) => postgres::fetch_optional(&mut **c, sql, params, limit).await,
            SQLite(c) => sqlite::fetch_optional(&mut **c, sql, params, limit).await,
        })
    }

    /// First column of the first row.
    pub async fn fetch_value(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<JsonValue>> {
        Ok(self
            .fetch_one(sql, params)
            .await?
            .and_then(|row| row.into_iter().next().map(|(_, v)| v)))
    }

    /// Open a transaction. Returns `false` if one is already open.
    pub async fn begin_transaction(&mut self) -> DbResult<bool> {
        if self.in_transaction {
            return Ok(false);
        }
        let begin = crate::db::dialect::Dialect::new(self.db_type).begin_sql();
        self.run(begin, &[]).await?;
        self.in_transaction = true;
        Ok(true)
    }

    /// Commit the open transaction. Returns `false` if none is open.
    ///
    /// On error the transaction stays marked open so release rolls it back.
    pub async fn commit(&mut self) -> DbResult<bool> {
        if !self.in_transaction {
            return Ok(false);
        }
        self.run("COMMIT", &[]).await?;
        self.in_transaction = false;
        Ok(true)
    }

    /// Roll back the open transaction. Returns `false` if none is open.
    pub async fn rollback(&mut self) -> DbResult<bool> {
        if !self.in_transaction {
            return Ok(false);
        }
        self.in_transaction = false;
        self.run("ROLLBACK", &[]).await?;
        Ok(true)
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// When a transaction is already open the closure joins it and the
    /// outer scope decides the outcome.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let ids = conn
    ///     .transaction(|tx| Box::pin(async move {
    ///         tx.run("INSERT INTO t (v) VALUES (1)", &[]).await?;
    ///         tx.run("INSERT INTO t (v) VALUES (2)", &[]).await
    ///     }))
    ///     .await?;
    /// ```
    pub async fn transaction<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, DbResult<T>>,
    {
        if self.in_transaction {
            return f(self).await;
        }

        self.begin_transaction().await?;
        match f(self).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed transaction scope failed");
                }
                Err(e)
            }
        }
    }

    /// Liveness check with a trivial query.
    pub async fn ping(&mut self) -> bool {
        self.run("SELECT 1", &[]).await.is_ok()
    }

    /// Close the underlying connection instead of returning it to the pool.
    pub async fn disconnect(&mut self) {
        let Some(conn) = self.inner.take() else {
            return;
        };
        self.in_transaction = false;
        let result = impl_conn_dispatch!(conn, {
            MySql(c) => c.close().await,
            Postgres(c) => c.close().await,
            SQLite(c) => c.close().await,
        });
        if let Err(e) = result {
            debug!(error = %e, "Error while closing connection");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }
        let Some(mut conn) = self.inner.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = impl_conn_dispatch!(&mut conn, {
                        MySql(c) => sqlx::Executor::execute(&mut **c, "ROLLBACK").await.map(|_| ()),
                        Postgres(c) => sqlx::Executor::execute(&mut **c, "ROLLBACK").await.map(|_| ()),
                        SQLite(c) => sqlx::Executor::execute(&mut **c, "ROLLBACK").await.map(|_| ()),
                    });
                    match result {
                        Ok(()) => warn!("Open transaction rolled back on connection drop"),
                        Err(e) => warn!(error = %e, "Rollback on connection drop failed"),
                    }
                });
            }
            Err(_) => warn!("Connection dropped outside a runtime with an open transaction"),
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn timeout_error(operation: &str, limit: Duration) -> DbError {
    DbError::timeout(operation, limit.as_secs())
}

// =============================================================================
// Pool
// =============================================================================

/// Lazily initialized pool for one configured database.
#[derive(Debug)]
pub struct Pool {
    config: DatabaseConfig,
    db_type: DatabaseType,
    inner: RwLock<Option<DbPool>>,
}

impl Pool {
    /// Create an uninitialized pool; fails on an unknown driver.
    pub fn new(config: DatabaseConfig) -> DbResult<Self> {
        let db_type = config.db_type()?;
        Ok(Self {
            config,
            db_type,
            inner: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Open the backend pool. Calling it again is a no-op.
    pub async fn initialize(&self) -> DbResult<()> {
        let mut inner = self.inner.write().await;
        if inner.is_some() {
            return Ok(());
        }

        let pool = create_pool(&self.config, self.db_type).await?;
        info!(
            connection = %self.config.name,
            db_type = %self.db_type,
            target = %self.config.display_target(),
            "Connection pool initialized"
        );
        *inner = Some(pool);
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(pool) = self.inner.write().await.take() {
            pool.close().await;
            info!(connection = %self.config.name, "Connection pool closed");
        }
    }

    async fn pool(&self) -> DbResult<DbPool> {
        self.inner.read().await.clone().ok_or_else(|| {
            DbError::pool(format!(
                "Pool for '{}' is not initialized",
                self.config.name
            ))
        })
    }

    /// Check out a connection, waiting up to `pool_timeout` when exhausted.
    pub async fn acquire(&self) -> DbResult<Connection> {
        let pool = self.pool().await?;
        let conn = pool.acquire().await.map_err(|e| match e {
            sqlx::Error::PoolTimedOut => DbError::pool(format!(
                "Timed out after {}s waiting for a connection to '{}' (pool_max_size = {})",
                self.config.pool_timeout, self.config.name, self.config.pool_max_size
            )),
            other => DbError::from(other),
        })?;
        Ok(Connection::new(
            conn,
            self.db_type,
            self.config.command_timeout_duration(),
        ))
    }

    /// Return a connection to the pool.
    ///
    /// An open transaction is rolled back first. When the pool already holds
    /// `pool_max_idle` idle connections the connection is closed instead.
    pub async fn release(&self, mut conn: Connection) {
        if conn.in_transaction() {
            warn!(connection = %self.config.name, "Releasing connection with an open transaction");
            if let Err(e) = conn.rollback().await {
                warn!(error = %e, "Rollback on release failed; discarding connection");
                conn.disconnect().await;
                return;
            }
        }

        let idle = self.idle_size().await;
        if idle >= self.config.pool_max_idle as usize && !self.is_memory() {
            debug!(connection = %self.config.name, idle, "Idle limit reached, closing connection");
            conn.disconnect().await;
        }
    }

    fn is_memory(&self) -> bool {
        self.db_type == DatabaseType::SQLite && self.config.resolved_path().is_none()
    }

    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let mut conn = self.acquire().await?;
        let result = conn.execute(sql, params).await;
        self.release(conn).await;
        result
    }

    pub async fn fetch_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        let mut conn = self.acquire().await?;
        let result = conn.fetch_one(sql, params).await;
        self.release(conn).await;
        result
    }

    pub async fn fetch_all(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let mut conn = self.acquire().await?;
        let result = conn.fetch_all(sql, params).await;
        self.release(conn).await;
        result
    }

    pub async fn fetch_value(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<JsonValue>> {
        let mut conn = self.acquire().await?;
        let result = conn.fetch_value(sql, params).await;
        self.release(conn).await;
        result
    }

    /// Open connections; zero before `initialize`.
    pub async fn size(&self) -> u32 {
        self.inner.read().await.as_ref().map(DbPool::size).unwrap_or(0)
    }

    pub async fn idle_size(&self) -> usize {
        self.inner
            .read()
            .await
            .as_ref()
            .map(DbPool::num_idle)
            .unwrap_or(0)
    }

    /// Connect once, run `SELECT 1` and disconnect, without creating a pool.
    pub async fn probe(config: &DatabaseConfig) -> DbResult<()> {
        use sqlx::Connection as _;

        let db_type = config.db_type()?;
        let limit = Duration::from_secs(PROBE_TIMEOUT_SECS);
        let connect_err = |e: sqlx::Error| {
            DbError::connection(
                format!("Failed to connect: {}", e),
                connection_suggestion(db_type, &e),
            )
        };

        let probe = async {
            match db_type {
                DatabaseType::MySQL => {
                    let mut conn = sqlx::MySqlConnection::connect_with(&mysql_options(config))
                        .await
                        .map_err(connect_err)?;
                    sqlx::Executor::execute(&mut conn, "SELECT 1").await?;
                    conn.close().await?;
                }
                DatabaseType::PostgreSQL => {
                    let mut conn = sqlx::PgConnection::connect_with(&postgres_options(config))
                        .await
                        .map_err(connect_err)?;
                    sqlx::Executor::execute(&mut conn, "SELECT 1").await?;
                    conn.close().await?;
                }
                DatabaseType::SQLite => {
                    let mut conn = sqlx::SqliteConnection::connect_with(&sqlite_options(config, false)?)
                        .await
                        .map_err(connect_err)?;
                    sqlx::Executor::execute(&mut conn, "SELECT 1").await?;
                    conn.close().await?;
                }
            }
            Ok::<(), DbError>(())
        };

        match timeout(limit, probe).await {
            Ok(result) => result,
            Err(_) => Err(DbError::connection(
                format!("Connection attempt timed out after {}s", PROBE_TIMEOUT_SECS),
                format!("Check that the {} server is reachable", db_type),
            )),
        }
    }

    /// Create a SQLite database file and run `init_sql` on it.
    ///
    /// The caller checks that the file does not exist yet.
    pub async fn create_sqlite_file(config: &DatabaseConfig, init_sql: &str) -> DbResult<()> {
        use sqlx::Connection as _;

        let mut conn = sqlx::SqliteConnection::connect_with(&sqlite_options(config, true)?)
            .await
            .map_err(|e| {
                DbError::connection(
                    format!("Failed to create database: {}", e),
                    connection_suggestion(DatabaseType::SQLite, &e),
                )
            })?;
        sqlx::Executor::execute(&mut conn, init_sql).await?;
        conn.close().await?;
        Ok(())
    }
}

// =============================================================================
// Pool construction
// =============================================================================

fn mysql_options(config: &DatabaseConfig) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.port_or_default())
        .charset(&config.charset);
    if let Some(user) = &config.user {
        options = options.username(user);
    }
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    if let Some(database) = &config.database {
        options = options.database(database);
    }
    options
}

fn postgres_options(config: &DatabaseConfig) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port_or_default());
    if let Some(user) = &config.user {
        options = options.username(user);
    }
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    if let Some(database) = &config.database {
        options = options.database(database);
    }
    options
}

/// `create` controls whether a missing database file may be created.
fn sqlite_options(config: &DatabaseConfig, create: bool) -> DbResult<SqliteConnectOptions> {
    let options = match config.resolved_path() {
        Some(path) => SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create),
        None => SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            DbError::connection(
                format!("Invalid SQLite options: {}", e),
                "Use a file path or ':memory:'",
            )
        })?,
    };
    Ok(options.foreign_keys(true))
}

fn sqlite_pool_options(config: &DatabaseConfig, memory: bool) -> SqlitePoolOptions {
    // Every in-memory connection is a separate database, so keep exactly one alive.
    if memory {
        SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new()
            .min_connections(config.pool_min_size)
            .max_connections(config.pool_max_size)
    }
}

async fn create_pool(config: &DatabaseConfig, db_type: DatabaseType) -> DbResult<DbPool> {
    let acquire_timeout = config.pool_timeout_duration();
    let connect_timeout = config.connect_timeout_duration();
    let connect_err = |e: sqlx::Error| {
        DbError::connection(
            format!("Failed to connect: {}", e),
            connection_suggestion(db_type, &e),
        )
    };
    let timed_out = || {
        DbError::connection(
            format!(
                "Connection attempt timed out after {}s",
                config.connect_timeout
            ),
            format!("Check that the {} server is reachable", db_type),
        )
    };

    match db_type {
        DatabaseType::MySQL => {
            let connect = MySqlPoolOptions::new()
                .min_connections(config.pool_min_size)
                .max_connections(config.pool_max_size)
                .acquire_timeout(acquire_timeout)
                .connect_with(mysql_options(config));
            let pool = timeout(connect_timeout, connect)
                .await
                .map_err(|_| timed_out())?
                .map_err(connect_err)?;
            Ok(DbPool::MySql(pool))
        }
        DatabaseType::PostgreSQL => {
            let connect = PgPoolOptions::new()
                .min_connections(config.pool_min_size)
                .max_connections(config.pool_max_size)
                .acquire_timeout(acquire_timeout)
                .connect_with(postgres_options(config));
            let pool = timeout(connect_timeout, connect)
                .await
                .map_err(|_| timed_out())?
                .map_err(connect_err)?;
            Ok(DbPool::Postgres(pool))
        }
        DatabaseType::SQLite => {
            let memory = config.resolved_path().is_none();
            if let Some(parent) = config.resolved_path().as_deref().and_then(|p| p.parent()) {
                tokio::fs::create_dir_all(parent).await?;
            }

            let connect = sqlite_pool_options(config, memory)
                .acquire_timeout(acquire_timeout)
                .connect_with(sqlite_options(config, true)?);
            let pool = timeout(connect_timeout, connect)
                .await
                .map_err(|_| timed_out())?
                .map_err(connect_err)?;
            Ok(DbPool::SQLite(pool))
        }
    }
}

/// Generate a helpful suggestion for connection errors.
pub(crate) fn connection_suggestion(db_type: DatabaseType, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!(
            "Check that the {} server is running and accessible",
            db_type
        );
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the user and password of the connection".to_string();
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    match db_type {
        DatabaseType::PostgreSQL => {
            "Verify host, port (default 5432), database and credentials".to_string()
        }
        DatabaseType::MySQL => {
            "Verify host, port (default 3306), database and credentials".to_string()
        }
        DatabaseType::SQLite => "Verify the file path exists and is accessible".to_string(),
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each generated module provides the same interface adapted to its backend.
// Parameterless statements go through the raw executor so statements that
// cannot be prepared (e.g. CREATE TRIGGER bodies) still run.

macro_rules! backend_ops {
    ($module:ident, $db:ty, $bind:path, |$res:ident| $last_id:expr) => {
        mod $module {
            use super::*;

            type Conn = <$db as sqlx::Database>::Connection;

            pub async fn execute(
                conn: &mut Conn,
                sql: &str,
                params: &[QueryParam],
                limit: Duration,
            ) -> DbResult<(u64, Option<i64>)> {
                let result = if params.is_empty() {
                    timeout(limit, sqlx::Executor::execute(&mut *conn, sql)).await
                } else {
                    let mut query = sqlx::query(sql);
                    for param in params {
                        query = $bind(query, param);
                    }
                    timeout(limit, query.execute(&mut *conn)).await
                };

                match result {
                    Ok(Ok($res)) => Ok(($res.rows_affected(), $last_id)),
                    Ok(Err(e)) => Err(DbError::from(e)),
                    Err(_) => Err(timeout_error("statement execution", limit)),
                }
            }

            pub async fn fetch_all(
                conn: &mut Conn,
                sql: &str,
                params: &[QueryParam],
                limit: Duration,
            ) -> DbResult<Vec<Row>> {
                let result = if params.is_empty() {
                    timeout(limit, sqlx::Executor::fetch_all(&mut *conn, sql)).await
                } else {
                    let mut query = sqlx::query(sql);
                    for param in params {
                        query = $bind(query, param);
                    }
                    timeout(limit, query.fetch_all(&mut *conn)).await
                };

                match result {
                    Ok(Ok(rows)) => Ok(rows.iter().map(RowToJson::to_json_map).collect()),
                    Ok(Err(e)) => Err(DbError::from(e)),
                    Err(_) => Err(timeout_error("query execution", limit)),
                }
            }

            pub async fn fetch_optional(
                conn: &mut Conn,
                sql: &str,
                params: &[QueryParam],
                limit: Duration,
            ) -> DbResult<Option<Row>> {
                let result = if params.is_empty() {
                    timeout(limit, sqlx::Executor::fetch_optional(&mut *conn, sql)).await
                } else {
                    let mut query = sqlx::query(sql);
                    for param in params {
                        query = $bind(query, param);
                    }
                    timeout(limit, query.fetch_optional(&mut *conn)).await
                };

                match result {
                    Ok(Ok(row)) => Ok(row.as_ref().map(RowToJson::to_json_map)),
                    Ok(Err(e)) => Err(DbError::from(e)),
                    Err(_) => Err(timeout_error("query execution", limit)),
                }
            }
        }
    };
}

backend_ops!(mysql, sqlx::MySql, bind_mysql_param, |r| {
    Some(r.last_insert_id())
        .filter(|id| *id > 0)
        .map(|id| id as i64)
});
backend_ops!(postgres, sqlx::Postgres, bind_postgres_param, |_r| None);
backend_ops!(sqlite, sqlx::Sqlite, bind_sqlite_param, |r| {
    Some(r.last_insert_rowid()).filter(|id| *id > 0)
});

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn file_pool(dir: &TempDir) -> Pool {
        let path = dir.path().join("pool.db");
        let pool = Pool::new(DatabaseConfig::sqlite("test", path.to_string_lossy())).unwrap();
        pool.initialize().await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_unknown_driver_rejected() {
        let err = Pool::new(DatabaseConfig::new("x", "oracle")).unwrap_err();
        assert!(matches!(err, DbError::DriverNotFound { .. }));
    }

    #[tokio::test]
    async fn test_acquire_before_initialize_fails() {
        let pool = Pool::new(DatabaseConfig::sqlite_memory("mem")).unwrap();
        assert!(matches!(pool.acquire().await, Err(DbError::Pool { .. })));
        assert_eq!(pool.size().await, 0);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;
        pool.initialize().await.unwrap();
        assert!(pool.is_initialized().await);
        pool.close().await;
        assert!(!pool.is_initialized().await);
    }

    #[tokio::test]
    async fn test_execute_failure_is_a_value() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;

        let result = pool.execute("INSERT INTO missing VALUES (1)", &[]).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("missing"));

        // The connection went back to the pool despite the failure.
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_fetch_helpers() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;
        pool.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[])
            .await
            .unwrap();
        let inserted = pool
            .execute("INSERT INTO t (v) VALUES (?)", &[QueryParam::from("a")])
            .await
            .unwrap();
        assert_eq!(inserted.affected_rows, 1);
        assert_eq!(inserted.last_insert_id, Some(1));

        let row = pool.fetch_one("SELECT id, v FROM t", &[]).await.unwrap().unwrap();
        assert_eq!(row["v"], serde_json::json!("a"));
        let count = pool.fetch_value("SELECT COUNT(*) FROM t", &[]).await.unwrap();
        assert_eq!(count, Some(serde_json::json!(1)));
        assert!(pool.fetch_one("SELECT * FROM t WHERE id = 9", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scoped_transaction_rolls_back_on_error() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;
        pool.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let result: DbResult<()> = conn
            .transaction(|tx| {
                Box::pin(async move {
                    tx.run("INSERT INTO t (v) VALUES (1)", &[]).await?;
                    Err(DbError::invalid_input("abort"))
                })
            })
            .await;
        assert!(result.is_err());
        assert!(!conn.in_transaction());
        pool.release(conn).await;

        let count = pool.fetch_value("SELECT COUNT(*) FROM t", &[]).await.unwrap();
        assert_eq!(count, Some(serde_json::json!(0)));
    }

    #[tokio::test]
    async fn test_commit_without_begin_is_noop() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;
        let mut conn = pool.acquire().await.unwrap();
        assert!(!conn.commit().await.unwrap());
        assert!(!conn.rollback().await.unwrap());
        assert!(conn.begin_transaction().await.unwrap());
        assert!(!conn.begin_transaction().await.unwrap());
        assert!(conn.commit().await.unwrap());
        assert!(conn.ping().await);
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_size_never_exceeds_max() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bounded.db");
        let mut config = DatabaseConfig::sqlite("bounded", path.to_string_lossy());
        config.pool_min_size = 1;
        config.pool_max_size = 2;
        config.pool_timeout = 1;
        let pool = Pool::new(config).unwrap();
        pool.initialize().await.unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert!(pool.size().await <= 2);
        assert!(matches!(pool.acquire().await, Err(DbError::Pool { .. })));

        pool.release(a).await;
        pool.release(b).await;
        assert!(pool.size().await <= 2);
    }

    #[test]
    fn test_sqlite_pool_sizing() {
        let mut config = DatabaseConfig::sqlite("sized", "sized.db");
        config.pool_min_size = 3;
        config.pool_max_size = 6;

        let file = sqlite_pool_options(&config, false);
        assert_eq!(file.get_min_connections(), 3);
        assert_eq!(file.get_max_connections(), 6);

        let memory = sqlite_pool_options(&config, true);
        assert_eq!(memory.get_min_connections(), 1);
        assert_eq!(memory.get_max_connections(), 1);
    }

    #[tokio::test]
    async fn test_probe_missing_sqlite_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.db");
        let config = DatabaseConfig::sqlite("absent", path.to_string_lossy());
        assert!(Pool::probe(&config).await.is_err());
        assert!(!path.exists());
    }
}
