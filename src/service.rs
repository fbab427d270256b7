//! Service orchestration.
//!
//! [`DatabaseService`] owns every named [`DatabaseConnection`] and the shared
//! [`CacheManager`]. The first connection added becomes the default; every
//! convenience method takes an optional connection name and otherwise
//! targets that default.
//!
//! Mutating record and schema operations, and raw `execute`/`execute_script`,
//! invalidate the connection's query cache when they succeed. Writes made
//! through a [`Transaction`] are not tracked; clear the cache after
//! committing one. Reads are not cached unless the caller asks for it
//! through [`DatabaseConnection::fetch_all_cached`].

use crate::cache::{CacheManager, CacheStats};
use crate::config::{DatabaseConfig, ServiceConfig};
use crate::db::{Pool, RecordManager, SchemaManager, SqlExecutor, Transaction};
use crate::error::{DbError, DbResult};
use crate::models::{
    AlterAction, ColumnDef, ConnectionTestResult, DatabaseType, Filter, FindOptions,
    ForeignKeyDef, IndexDef, QueryParam, QueryResult, Row, TableDef, Values,
};
use futures_util::stream::BoxStream;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{Instrument, Span, debug, info, info_span, warn};

/// Marker table written by `create_database`.
const INIT_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS _init (id INTEGER PRIMARY KEY)";

/// One named database: its pool plus the managers that operate on it.
#[derive(Debug)]
pub struct DatabaseConnection {
    name: String,
    pool: Arc<Pool>,
    schema: SchemaManager,
    records: RecordManager,
    sql: SqlExecutor,
    cache: Option<Arc<CacheManager>>,
    cache_ttl: u64,
    span: Span,
}

impl DatabaseConnection {
    /// Wire the managers around an initialized pool.
    ///
    /// `cache` is kept only when the connection's config enables caching.
    pub fn new(pool: Arc<Pool>, cache: Option<Arc<CacheManager>>) -> Self {
        let config = pool.config();
        let cache = cache.filter(|_| config.cache_enabled);
        if let Some(manager) = &cache {
            manager.get_cache(&config.name);
        }

        Self {
            span: info_span!("connection", connection = %config.name, db_type = %pool.db_type()),
            name: config.name.clone(),
            cache_ttl: config.cache_ttl,
            schema: SchemaManager::new(Arc::clone(&pool)),
            records: RecordManager::new(Arc::clone(&pool)),
            sql: SqlExecutor::new(Arc::clone(&pool)),
            pool,
            cache,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.db_type()
    }

    pub fn config(&self) -> &DatabaseConfig {
        self.pool.config()
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn schema(&self) -> &SchemaManager {
        &self.schema
    }

    pub fn records(&self) -> &RecordManager {
        &self.records
    }

    pub fn sql(&self) -> &SqlExecutor {
        &self.sql
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Span every operation on this connection runs in.
    pub fn span(&self) -> &Span {
        &self.span
    }

    fn invalidate(&self, table: &str, result: &QueryResult) {
        if !result.success {
            return;
        }
        if let Some(cache) = &self.cache {
            let removed = cache.invalidate(&self.name, table);
            if removed > 0 {
                debug!(connection = %self.name, table = %table, removed, "Invalidated cached results");
            }
        }
    }

    fn clear_cached(&self) {
        if let Some(cache) = &self.cache {
            cache.clear(&self.name);
        }
    }

    // ---------------------------------------------------------------------
    // Schema
    // ---------------------------------------------------------------------

    pub async fn create_table(&self, table: &TableDef) -> DbResult<QueryResult> {
        self.schema.create_table(table).instrument(self.span.clone()).await
    }

    pub async fn drop_table(&self, table: &str, cascade: bool) -> DbResult<QueryResult> {
        let result = self.schema.drop_table(table, cascade).instrument(self.span.clone()).await?;
        self.invalidate(table, &result);
        Ok(result)
    }

    pub async fn alter_table(&self, table: &str, actions: &[AlterAction]) -> DbResult<QueryResult> {
        let result = self.schema.alter_table(table, actions).instrument(self.span.clone()).await?;
        self.invalidate(table, &result);
        Ok(result)
    }

    pub async fn rename_table(&self, old_name: &str, new_name: &str) -> DbResult<QueryResult> {
        let result = self
            .schema
            .rename_table(old_name, new_name)
            .instrument(self.span.clone())
            .await?;
        self.invalidate(old_name, &result);
        Ok(result)
    }

    pub async fn add_column(&self, table: &str, column: &ColumnDef) -> DbResult<QueryResult> {
        self.schema.add_column(table, column).instrument(self.span.clone()).await
    }

    pub async fn drop_column(&self, table: &str, column: &str) -> DbResult<QueryResult> {
        let result = self.schema.drop_column(table, column).instrument(self.span.clone()).await?;
        self.invalidate(table, &result);
        Ok(result)
    }

    pub async fn create_index(&self, table: &str, index: &IndexDef) -> DbResult<QueryResult> {
        self.schema.create_index(table, index).instrument(self.span.clone()).await
    }

    pub async fn drop_index(&self, name: &str, table: Option<&str>) -> DbResult<QueryResult> {
        self.schema.drop_index(name, table).instrument(self.span.clone()).await
    }

    pub async fn create_view(
        &self,
        name: &str,
        query: &str,
        or_replace: bool,
    ) -> DbResult<QueryResult> {
        self.schema.create_view(name, query, or_replace).instrument(self.span.clone()).await
    }

    pub async fn drop_view(&self, name: &str, if_exists: bool) -> DbResult<QueryResult> {
        self.schema.drop_view(name, if_exists).instrument(self.span.clone()).await
    }

    pub async fn add_foreign_key(&self, table: &str, fk: &ForeignKeyDef) -> DbResult<QueryResult> {
        self.schema.add_foreign_key(table, fk).instrument(self.span.clone()).await
    }

    pub async fn drop_foreign_key(&self, table: &str, name: &str) -> DbResult<QueryResult> {
        self.schema.drop_foreign_key(table, name).instrument(self.span.clone()).await
    }

    pub async fn table_exists(&self, table: &str) -> DbResult<bool> {
        self.schema.table_exists(table).instrument(self.span.clone()).await
    }

    pub async fn list_tables(&self) -> DbResult<Vec<String>> {
        self.schema.list_tables().instrument(self.span.clone()).await
    }

    pub async fn list_indexes(&self, table: &str) -> DbResult<Vec<IndexDef>> {
        self.schema.list_indexes(table).instrument(self.span.clone()).await
    }

    pub async fn list_foreign_keys(&self, table: &str) -> DbResult<Vec<ForeignKeyDef>> {
        self.schema.list_foreign_keys(table).instrument(self.span.clone()).await
    }

    pub async fn get_table_schema(&self, table: &str) -> DbResult<TableDef> {
        self.schema.get_table_schema(table).instrument(self.span.clone()).await
    }

    // ---------------------------------------------------------------------
    // Records
    // ---------------------------------------------------------------------

    pub async fn insert(
        &self,
        table: &str,
        data: &Values,
        returning: Option<&[String]>,
    ) -> DbResult<QueryResult> {
        let result = self
            .records
            .insert(table, data, returning)
            .instrument(self.span.clone())
            .await?;
        self.invalidate(table, &result);
        Ok(result)
    }

    pub async fn insert_many(&self, table: &str, rows: &[Values]) -> DbResult<QueryResult> {
        let result = self.records.insert_many(table, rows).instrument(self.span.clone()).await?;
        self.invalidate(table, &result);
        Ok(result)
    }

    pub async fn update(&self, table: &str, data: &Values, filter: &Filter) -> DbResult<QueryResult> {
        let result = self.records.update(table, data, filter).instrument(self.span.clone()).await?;
        self.invalidate(table, &result);
        Ok(result)
    }

    pub async fn delete(&self, table: &str, filter: &Filter) -> DbResult<QueryResult> {
        let result = self.records.delete(table, filter).instrument(self.span.clone()).await?;
        self.invalidate(table, &result);
        Ok(result)
    }

    pub async fn upsert(
        &self,
        table: &str,
        data: &Values,
        conflict_keys: &[String],
        update_columns: Option<&[String]>,
    ) -> DbResult<QueryResult> {
        let result = self
            .records
            .upsert(table, data, conflict_keys, update_columns)
            .instrument(self.span.clone())
            .await?;
        self.invalidate(table, &result);
        Ok(result)
    }

    pub async fn find_one(&self, table: &str, options: &FindOptions) -> DbResult<Option<Row>> {
        self.records.find_one(table, options).instrument(self.span.clone()).await
    }

    pub async fn find_many(&self, table: &str, options: &FindOptions) -> DbResult<Vec<Row>> {
        self.records.find_many(table, options).instrument(self.span.clone()).await
    }

    pub async fn count(&self, table: &str, filter: &Filter) -> DbResult<u64> {
        self.records.count(table, filter).instrument(self.span.clone()).await
    }

    pub async fn exists(&self, table: &str, filter: &Filter) -> DbResult<bool> {
        self.records.exists(table, filter).instrument(self.span.clone()).await
    }

    pub fn stream(
        &self,
        table: &str,
        options: FindOptions,
        batch_size: Option<u64>,
    ) -> BoxStream<'static, DbResult<Row>> {
        self.records.stream(table, options, batch_size)
    }

    // ---------------------------------------------------------------------
    // Raw SQL
    // ---------------------------------------------------------------------

    /// Raw statement. The affected tables are unknown, so a success clears
    /// this connection's whole cache.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let result = self
            .sql
            .execute(sql, params)
            .instrument(self.span.clone())
            .await?;
        if result.success {
            self.clear_cached();
        }
        Ok(result)
    }

    pub async fn execute_script(&self, script: &str) -> DbResult<Vec<QueryResult>> {
        let results = self
            .sql
            .execute_script(script)
            .instrument(self.span.clone())
            .await?;
        if results.iter().any(|result| result.success) {
            self.clear_cached();
        }
        Ok(results)
    }

    pub async fn fetch_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        self.sql.fetch_one(sql, params).instrument(self.span.clone()).await
    }

    pub async fn fetch_all(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.sql.fetch_all(sql, params).instrument(self.span.clone()).await
    }

    pub async fn fetch_value(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<JsonValue>> {
        self.sql.fetch_value(sql, params).instrument(self.span.clone()).await
    }

    /// `fetch_all` through the query cache.
    ///
    /// Falls through to the database when caching is off for this
    /// connection. `ttl` overrides the connection's `cache_ttl`.
    pub async fn fetch_all_cached(
        &self,
        sql: &str,
        params: &[QueryParam],
        ttl: Option<u64>,
    ) -> DbResult<Vec<Row>> {
        let Some(cache) = &self.cache else {
            return self.sql.fetch_all(sql, params).instrument(self.span.clone()).await;
        };

        if let Some(JsonValue::Array(cached)) = cache.get(&self.name, sql, params) {
            let rows: Vec<Row> = cached
                .into_iter()
                .filter_map(|value| match value {
                    JsonValue::Object(row) => Some(row),
                    _ => None,
                })
                .collect();
            return Ok(rows);
        }

        let rows = self.sql.fetch_all(sql, params).instrument(self.span.clone()).await?;
        let value = JsonValue::Array(rows.iter().cloned().map(JsonValue::Object).collect());
        cache.set(
            &self.name,
            sql,
            value,
            params,
            Some(ttl.unwrap_or(self.cache_ttl)),
        );
        Ok(rows)
    }

    pub fn stream_sql(
        &self,
        sql: &str,
        params: Vec<QueryParam>,
        batch_size: u64,
    ) -> BoxStream<'static, DbResult<Row>> {
        self.sql.stream(sql, params, batch_size)
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    /// An idle transaction bound to this connection's pool.
    ///
    /// Its writes bypass the query cache; see [`DatabaseService::clear_cache`].
    pub fn transaction(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.pool))
    }

    /// A transaction that has already begun.
    pub async fn begin_transaction(&self) -> DbResult<Transaction> {
        let mut tx = self.transaction();
        tx.begin().await?;
        Ok(tx)
    }

    // ---------------------------------------------------------------------
    // Connection state
    // ---------------------------------------------------------------------

    /// Whether a pooled connection answers a trivial query.
    pub async fn ping(&self) -> bool {
        match self.pool.acquire().await {
            Ok(mut conn) => {
                let alive = conn.ping().await;
                self.pool.release(conn).await;
                alive
            }
            Err(_) => false,
        }
    }

    pub async fn pool_size(&self) -> u32 {
        self.pool.size().await
    }

    pub async fn pool_idle(&self) -> usize {
        self.pool.idle_size().await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Default)]
struct Registry {
    connections: HashMap<String, Arc<DatabaseConnection>>,
    /// Names in the order they were added.
    order: Vec<String>,
    default: Option<String>,
}

impl Registry {
    fn insert(&mut self, connection: Arc<DatabaseConnection>) {
        let name = connection.name().to_string();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.order.push(name.clone());
        self.connections.insert(name, connection);
    }

    fn remove(&mut self, name: &str) -> Option<Arc<DatabaseConnection>> {
        let connection = self.connections.remove(name)?;
        self.order.retain(|n| n != name);
        if self.default.as_deref() == Some(name) {
            self.default = self.order.first().cloned();
        }
        Some(connection)
    }
}

/// Owns every named connection and the shared query cache.
#[derive(Debug)]
pub struct DatabaseService {
    registry: RwLock<Registry>,
    cache: Arc<CacheManager>,
}

impl Default for DatabaseService {
    fn default() -> Self {
        Self::new(CacheManager::default())
    }
}

impl DatabaseService {
    /// An empty service using `cache` for every connection.
    pub fn new(cache: CacheManager) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            cache: Arc::new(cache),
        }
    }

    /// Build the service and connect every configured database.
    ///
    /// The first database becomes the default connection. If any database
    /// fails to connect, the ones already opened are closed again and the
    /// error is returned.
    pub async fn initialize(config: ServiceConfig) -> DbResult<Self> {
        config.validate()?;
        let cache = CacheManager::new(
            config.cache_max_size,
            config.cache_ttl,
            config.cache_cleanup_duration(),
        );
        if config.cache_enabled {
            cache.start_all();
        } else {
            cache.disable();
        }

        let service = Self::new(cache);
        for database in config.databases {
            if let Err(e) = service.add_connection(database).await {
                service.close_all().await;
                return Err(e);
            }
        }

        info!(
            connections = service.registry.read().await.connections.len(),
            cache_enabled = config.cache_enabled,
            "Database service initialized"
        );
        Ok(service)
    }

    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Open a pool for `config` and register it under `config.name`.
    pub async fn add_connection(&self, config: DatabaseConfig) -> DbResult<Arc<DatabaseConnection>> {
        config.validate()?;
        let name = config.name.clone();

        if self.registry.read().await.connections.contains_key(&name) {
            return Err(DbError::connection(
                format!("Connection '{}' already exists", name),
                "Remove it first or use a different connection name",
            ));
        }

        info!(
            connection = %name,
            driver = %config.driver,
            target = %config.display_target(),
            "Adding database connection"
        );

        let pool = Arc::new(Pool::new(config)?);
        pool.initialize().await?;
        let connection = Arc::new(DatabaseConnection::new(pool, Some(Arc::clone(&self.cache))));

        // Re-check after the pool was opened; a concurrent add may have won.
        let duplicate = {
            let mut registry = self.registry.write().await;
            if registry.connections.contains_key(&name) {
                true
            } else {
                registry.insert(Arc::clone(&connection));
                false
            }
        };

        if duplicate {
            connection.close().await;
            return Err(DbError::connection(
                format!("Connection '{}' already exists", name),
                "Concurrent connection attempt detected. Try again with a different name.",
            ));
        }

        Ok(connection)
    }

    /// Add a connection described by a loose JSON object.
    ///
    /// Missing fields take their defaults, as in a configuration file.
    pub async fn add_dynamic_connection(
        &self,
        config: JsonValue,
    ) -> DbResult<Arc<DatabaseConnection>> {
        let config: DatabaseConfig = serde_json::from_value(config)
            .map_err(|e| DbError::invalid_input(format!("Invalid connection config: {}", e)))?;
        self.add_connection(config).await
    }

    /// Close and forget `name`. Returns `false` if it was not registered.
    ///
    /// Removing the default connection promotes the next one in the order
    /// they were added.
    pub async fn remove_connection(&self, name: &str) -> bool {
        let removed = self.registry.write().await.remove(name);
        let Some(connection) = removed else {
            return false;
        };

        connection.close().await;
        self.cache.remove(name).await;
        info!(connection = %name, "Database connection removed");
        true
    }

    /// Close every pool and stop cache cleanup.
    pub async fn close_all(&self) {
        let connections: Vec<_> = {
            let mut registry = self.registry.write().await;
            registry.default = None;
            registry.order.clear();
            registry.connections.drain().collect()
        };

        for (name, connection) in connections {
            info!(connection = %name, "Closing connection");
            connection.close().await;
        }
        self.cache.stop_all().await;
        info!("All connections closed");
    }

    /// Resolve `name`, or the default connection when `None`.
    pub async fn connection(&self, name: Option<&str>) -> DbResult<Arc<DatabaseConnection>> {
        let registry = self.registry.read().await;
        let name = match name {
            Some(name) => name,
            None => registry.default.as_deref().ok_or(DbError::NoConnections)?,
        };
        registry
            .connections
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::connection_not_found(name))
    }

    pub async fn has_connection(&self, name: &str) -> bool {
        self.registry.read().await.connections.contains_key(name)
    }

    /// Registered names in the order they were added.
    pub async fn connection_names(&self) -> Vec<String> {
        self.registry.read().await.order.clone()
    }

    pub async fn default_connection(&self) -> Option<String> {
        self.registry.read().await.default.clone()
    }

    pub async fn is_connected(&self, name: Option<&str>) -> bool {
        self.connection(name).await.is_ok()
    }

    // ---------------------------------------------------------------------
    // Cache controls
    // ---------------------------------------------------------------------

    pub fn get_cache_stats(&self) -> BTreeMap<String, CacheStats> {
        self.cache.all_stats()
    }

    pub fn enable_cache(&self) {
        self.cache.enable();
    }

    pub fn disable_cache(&self) {
        self.cache.disable();
    }

    /// Clear one connection's cache, or every cache when `name` is `None`.
    pub fn clear_cache(&self, name: Option<&str>) {
        match name {
            Some(name) => self.cache.clear(name),
            None => self.cache.clear_all(),
        }
    }

    // ---------------------------------------------------------------------
    // Out-of-band helpers
    // ---------------------------------------------------------------------

    /// Try `config` without registering it.
    ///
    /// Never fails: problems are reported in the result. A SQLite file that
    /// does not exist is reported rather than created.
    pub async fn test_connection(&self, config: &DatabaseConfig) -> ConnectionTestResult {
        let db_type = match config.db_type() {
            Ok(db_type) => db_type,
            Err(e) => return ConnectionTestResult::failure(e.to_string()),
        };

        if db_type == DatabaseType::SQLite
            && let Some(path) = config.resolved_path()
        {
            if !path.exists() {
                return ConnectionTestResult::failure(format!(
                    "Database file not found: {}",
                    path.display()
                ))
                .with_detail("file_exists", false);
            }
            return match Pool::probe(config).await {
                Ok(()) => ConnectionTestResult::success(format!(
                    "Successfully connected to SQLite database: {}",
                    path.display()
                ))
                .with_detail("file_exists", true)
                .with_detail("resolved_path", path.display().to_string()),
                Err(e) => {
                    warn!(error = %e, "Connection test failed");
                    ConnectionTestResult::failure(e.to_string()).with_detail("file_exists", true)
                }
            };
        }

        match Pool::probe(config).await {
            Ok(()) => ConnectionTestResult::success(format!(
                "Successfully connected to {}: {}",
                db_type.display_name(),
                config.display_target()
            )),
            Err(e) => {
                warn!(error = %e, "Connection test failed");
                let result = ConnectionTestResult::failure(e.to_string());
                match e.suggestion() {
                    Some(suggestion) => result.with_detail("suggestion", suggestion),
                    None => result,
                }
            }
        }
    }

    /// Create a new SQLite database file holding an `_init` marker table.
    ///
    /// Refuses to touch an existing file. Other backends are unsupported.
    pub async fn create_database(&self, config: &DatabaseConfig) -> DbResult<ConnectionTestResult> {
        let db_type = config.db_type()?;
        if db_type != DatabaseType::SQLite {
            return Err(DbError::unsupported("create_database", db_type.display_name()));
        }
        let Some(path) = config.resolved_path() else {
            return Err(DbError::invalid_input(
                "create_database needs a file path; in-memory databases cannot be created",
            ));
        };

        if path.exists() {
            return Ok(ConnectionTestResult::failure(format!(
                "Database file already exists: {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        Pool::create_sqlite_file(config, INIT_TABLE_SQL).await?;
        info!(path = %path.display(), "Created new SQLite database");

        Ok(ConnectionTestResult::success(format!(
            "Successfully created new SQLite database: {}",
            path.display()
        ))
        .with_detail("resolved_path", path.display().to_string()))
    }

    // ---------------------------------------------------------------------
    // Convenience methods; `connection: None` targets the default
    // ---------------------------------------------------------------------

    pub async fn create_table(
        &self,
        table: &TableDef,
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection).await?.create_table(table).await
    }

    pub async fn drop_table(
        &self,
        table: &str,
        cascade: bool,
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection)
            .await?
            .drop_table(table, cascade)
            .await
    }

    pub async fn alter_table(
        &self,
        table: &str,
        actions: &[AlterAction],
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection)
            .await?
            .alter_table(table, actions)
            .await
    }

    pub async fn create_index(
        &self,
        table: &str,
        index: &IndexDef,
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection)
            .await?
            .create_index(table, index)
            .await
    }

    pub async fn drop_index(
        &self,
        name: &str,
        table: Option<&str>,
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection)
            .await?
            .drop_index(name, table)
            .await
    }

    pub async fn create_view(
        &self,
        name: &str,
        query: &str,
        or_replace: bool,
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection)
            .await?
            .create_view(name, query, or_replace)
            .await
    }

    pub async fn drop_view(
        &self,
        name: &str,
        if_exists: bool,
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection)
            .await?
            .drop_view(name, if_exists)
            .await
    }

    pub async fn add_foreign_key(
        &self,
        table: &str,
        fk: &ForeignKeyDef,
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection)
            .await?
            .add_foreign_key(table, fk)
            .await
    }

    pub async fn drop_foreign_key(
        &self,
        table: &str,
        name: &str,
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection)
            .await?
            .drop_foreign_key(table, name)
            .await
    }

    pub async fn table_exists(&self, table: &str, connection: Option<&str>) -> DbResult<bool> {
        self.connection(connection).await?.table_exists(table).await
    }

    pub async fn list_tables(&self, connection: Option<&str>) -> DbResult<Vec<String>> {
        self.connection(connection).await?.list_tables().await
    }

    pub async fn list_indexes(
        &self,
        table: &str,
        connection: Option<&str>,
    ) -> DbResult<Vec<IndexDef>> {
        self.connection(connection).await?.list_indexes(table).await
    }

    pub async fn list_foreign_keys(
        &self,
        table: &str,
        connection: Option<&str>,
    ) -> DbResult<Vec<ForeignKeyDef>> {
        self.connection(connection)
            .await?
            .list_foreign_keys(table)
            .await
    }

    pub async fn get_table_schema(
        &self,
        table: &str,
        connection: Option<&str>,
    ) -> DbResult<TableDef> {
        self.connection(connection)
            .await?
            .get_table_schema(table)
            .await
    }

    pub async fn insert(
        &self,
        table: &str,
        data: &Values,
        returning: Option<&[String]>,
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection)
            .await?
            .insert(table, data, returning)
            .await
    }

    pub async fn insert_many(
        &self,
        table: &str,
        rows: &[Values],
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection)
            .await?
            .insert_many(table, rows)
            .await
    }

    pub async fn update(
        &self,
        table: &str,
        data: &Values,
        filter: &Filter,
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection)
            .await?
            .update(table, data, filter)
            .await
    }

    pub async fn delete(
        &self,
        table: &str,
        filter: &Filter,
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection).await?.delete(table, filter).await
    }

    pub async fn upsert(
        &self,
        table: &str,
        data: &Values,
        conflict_keys: &[String],
        update_columns: Option<&[String]>,
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection)
            .await?
            .upsert(table, data, conflict_keys, update_columns)
            .await
    }

    pub async fn find_one(
        &self,
        table: &str,
        options: &FindOptions,
        connection: Option<&str>,
    ) -> DbResult<Option<Row>> {
        self.connection(connection)
            .await?
            .find_one(table, options)
            .await
    }

    pub async fn find_many(
        &self,
        table: &str,
        options: &FindOptions,
        connection: Option<&str>,
    ) -> DbResult<Vec<Row>> {
        self.connection(connection)
            .await?
            .find_many(table, options)
            .await
    }

    pub async fn count(
        &self,
        table: &str,
        filter: &Filter,
        connection: Option<&str>,
    ) -> DbResult<u64> {
        self.connection(connection).await?.count(table, filter).await
    }

    pub async fn exists(
        &self,
        table: &str,
        filter: &Filter,
        connection: Option<&str>,
    ) -> DbResult<bool> {
        self.connection(connection).await?.exists(table, filter).await
    }

    pub async fn stream(
        &self,
        table: &str,
        options: FindOptions,
        batch_size: Option<u64>,
        connection: Option<&str>,
    ) -> DbResult<BoxStream<'static, DbResult<Row>>> {
        Ok(self
            .connection(connection)
            .await?
            .stream(table, options, batch_size))
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[QueryParam],
        connection: Option<&str>,
    ) -> DbResult<QueryResult> {
        self.connection(connection).await?.execute(sql, params).await
    }

    pub async fn execute_script(
        &self,
        script: &str,
        connection: Option<&str>,
    ) -> DbResult<Vec<QueryResult>> {
        self.connection(connection)
            .await?
            .execute_script(script)
            .await
    }

    pub async fn fetch_one(
        &self,
        sql: &str,
        params: &[QueryParam],
        connection: Option<&str>,
    ) -> DbResult<Option<Row>> {
        self.connection(connection)
            .await?
            .fetch_one(sql, params)
            .await
    }

    pub async fn fetch_all(
        &self,
        sql: &str,
        params: &[QueryParam],
        connection: Option<&str>,
    ) -> DbResult<Vec<Row>> {
        self.connection(connection)
            .await?
            .fetch_all(sql, params)
            .await
    }

    pub async fn fetch_value(
        &self,
        sql: &str,
        params: &[QueryParam],
        connection: Option<&str>,
    ) -> DbResult<Option<JsonValue>> {
        self.connection(connection)
            .await?
            .fetch_value(sql, params)
            .await
    }

    pub async fn begin_transaction(&self, connection: Option<&str>) -> DbResult<Transaction> {
        self.connection(connection).await?.begin_transaction().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sqlite(dir: &TempDir, name: &str) -> DatabaseConfig {
        let path = dir.path().join(format!("{}.db", name));
        let mut config = DatabaseConfig::sqlite(name, path.to_string_lossy());
        config.pool_min_size = 1;
        config.pool_max_size = 2;
        config
    }

    fn values(value: JsonValue) -> Values {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[tokio::test]
    async fn test_no_connections_error() {
        let service = DatabaseService::default();
        let err = service.connection(None).await.unwrap_err();
        assert!(matches!(err, DbError::NoConnections));
        assert!(!service.is_connected(None).await);
    }

    #[tokio::test]
    async fn test_unknown_connection_name() {
        let service = DatabaseService::default();
        let err = service.connection(Some("ghost")).await.unwrap_err();
        assert!(matches!(err, DbError::ConnectionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_first_connection_is_default() {
        let dir = TempDir::new().unwrap();
        let service = DatabaseService::default();
        service.add_connection(sqlite(&dir, "one")).await.unwrap();
        service.add_connection(sqlite(&dir, "two")).await.unwrap();

        assert_eq!(service.default_connection().await.as_deref(), Some("one"));
        assert_eq!(service.connection_names().await, vec!["one", "two"]);
        assert_eq!(service.connection(None).await.unwrap().name(), "one");
        service.close_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let dir = TempDir::new().unwrap();
        let service = DatabaseService::default();
        service.add_connection(sqlite(&dir, "one")).await.unwrap();
        let err = service.add_connection(sqlite(&dir, "one")).await.unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        service.close_all().await;
    }

    #[tokio::test]
    async fn test_unknown_driver_rejected() {
        let service = DatabaseService::default();
        let err = service
            .add_connection(DatabaseConfig::new("odd", "oracle"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::DriverNotFound { .. }));
        assert!(!service.has_connection("odd").await);
    }

    #[tokio::test]
    async fn test_remove_default_promotes_next() {
        let dir = TempDir::new().unwrap();
        let service = DatabaseService::default();
        for name in ["a", "b", "c"] {
            service.add_connection(sqlite(&dir, name)).await.unwrap();
        }

        assert!(service.remove_connection("a").await);
        assert_eq!(service.default_connection().await.as_deref(), Some("b"));
        assert!(!service.remove_connection("a").await);

        assert!(service.remove_connection("c").await);
        assert_eq!(service.default_connection().await.as_deref(), Some("b"));
        assert!(service.remove_connection("b").await);
        assert_eq!(service.default_connection().await, None);
    }

    #[tokio::test]
    async fn test_dynamic_connection_from_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dyn.db");
        let service = DatabaseService::default();
        let conn = service
            .add_dynamic_connection(json!({
                "name": "dyn",
                "driver": "sqlite",
                "path": path.to_string_lossy(),
            }))
            .await
            .unwrap();
        assert_eq!(conn.db_type(), DatabaseType::SQLite);
        assert!(conn.ping().await);
        service.close_all().await;
    }

    #[tokio::test]
    async fn test_mutation_invalidates_cached_reads() {
        let dir = TempDir::new().unwrap();
        let service = DatabaseService::default();
        let conn = service.add_connection(sqlite(&dir, "main")).await.unwrap();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[])
            .await
            .unwrap();

        let sql = "SELECT v FROM t ORDER BY id";
        assert!(conn.fetch_all_cached(sql, &[], None).await.unwrap().is_empty());
        assert_eq!(service.get_cache_stats()["main"].size, 1);

        let result = service
            .insert("t", &values(json!({"v": "a"})), None, None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(service.get_cache_stats()["main"].size, 0);

        let rows = conn.fetch_all_cached(sql, &[], None).await.unwrap();
        assert_eq!(rows.len(), 1);
        service.close_all().await;
    }

    #[tokio::test]
    async fn test_failed_mutation_keeps_cache() {
        let dir = TempDir::new().unwrap();
        let service = DatabaseService::default();
        let conn = service.add_connection(sqlite(&dir, "main")).await.unwrap();
        conn.execute("CREATE TABLE t (v TEXT NOT NULL)", &[]).await.unwrap();
        conn.fetch_all_cached("SELECT v FROM t", &[], None).await.unwrap();

        let result = service
            .insert("t", &values(json!({"v": null})), None, None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(service.get_cache_stats()["main"].size, 1);
        service.close_all().await;
    }

    #[tokio::test]
    async fn test_write_while_disabled_invalidates() {
        let dir = TempDir::new().unwrap();
        let service = DatabaseService::default();
        let conn = service.add_connection(sqlite(&dir, "main")).await.unwrap();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[])
            .await
            .unwrap();

        let sql = "SELECT v FROM t";
        assert!(conn.fetch_all_cached(sql, &[], None).await.unwrap().is_empty());

        service.disable_cache();
        let result = service
            .insert("t", &values(json!({"v": "a"})), None, None)
            .await
            .unwrap();
        assert!(result.success);
        service.enable_cache();

        let rows = conn.fetch_all_cached(sql, &[], None).await.unwrap();
        assert_eq!(rows.len(), 1);
        service.close_all().await;
    }

    #[tokio::test]
    async fn test_raw_write_clears_cache() {
        let dir = TempDir::new().unwrap();
        let service = DatabaseService::default();
        let conn = service.add_connection(sqlite(&dir, "main")).await.unwrap();
        conn.execute("CREATE TABLE t (v TEXT)", &[]).await.unwrap();

        let sql = "SELECT v FROM t";
        conn.fetch_all_cached(sql, &[], None).await.unwrap();
        assert_eq!(service.get_cache_stats()["main"].size, 1);

        conn.execute("INSERT INTO t (v) VALUES ('a')", &[]).await.unwrap();
        assert_eq!(service.get_cache_stats()["main"].size, 0);
        conn.fetch_all_cached(sql, &[], None).await.unwrap();

        let results = conn
            .execute_script("INSERT INTO t (v) VALUES ('b'); INSERT INTO t (v) VALUES ('c');")
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.success));
        let rows = conn.fetch_all_cached(sql, &[], None).await.unwrap();
        assert_eq!(rows.len(), 3);
        service.close_all().await;
    }

    #[tokio::test]
    async fn test_cache_disabled_per_connection() {
        let dir = TempDir::new().unwrap();
        let service = DatabaseService::default();
        let mut config = sqlite(&dir, "nocache");
        config.cache_enabled = false;
        let conn = service.add_connection(config).await.unwrap();
        assert!(!conn.cache_enabled());
        assert!(service.get_cache_stats().is_empty());
        service.close_all().await;
    }

    #[tokio::test]
    async fn test_test_connection_missing_sqlite_file() {
        let dir = TempDir::new().unwrap();
        let service = DatabaseService::default();
        let config = sqlite(&dir, "absent");
        let result = service.test_connection(&config).await;
        assert!(!result.success);
        assert_eq!(result.details["file_exists"], json!(false));
        assert!(!dir.path().join("absent.db").exists());
    }

    #[tokio::test]
    async fn test_create_database_then_test() {
        let dir = TempDir::new().unwrap();
        let service = DatabaseService::default();
        let path = dir.path().join("nested/deeper/new.db");
        let config = DatabaseConfig::sqlite("new", path.to_string_lossy());

        let created = service.create_database(&config).await.unwrap();
        assert!(created.success, "{}", created.message);
        assert!(path.exists());

        let again = service.create_database(&config).await.unwrap();
        assert!(!again.success);

        let tested = service.test_connection(&config).await;
        assert!(tested.success, "{}", tested.message);
        assert_eq!(tested.details["file_exists"], json!(true));
    }

    #[tokio::test]
    async fn test_create_database_rejects_network_backend() {
        let service = DatabaseService::default();
        let err = service
            .create_database(&DatabaseConfig::new("pg", "postgres"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UnsupportedFeature { .. }));
    }
}
