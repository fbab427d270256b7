//! Record management (DML).
//!
//! `RecordManager` builds parameterized statements through [`Dialect`] and
//! runs them on the pool. Mutations return a `QueryResult` whose failure
//! branch carries statement errors; reads return rows directly and raise on
//! failure.

use crate::db::dialect::Dialect;
use crate::db::executor::{DEFAULT_STREAM_BATCH_SIZE, paged_stream};
use crate::db::pool::{Connection, Pool};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Filter, FindOptions, QueryParam, QueryResult, Row, Values};
use futures_util::stream::BoxStream;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RecordManager {
    pool: Arc<Pool>,
    dialect: Dialect,
}

impl RecordManager {
    pub fn new(pool: Arc<Pool>) -> Self {
        let dialect = Dialect::new(pool.db_type());
        Self { pool, dialect }
    }

    /// Insert one row.
    ///
    /// PostgreSQL returns the written row (`returning` columns, or all).
    /// SQLite re-reads the row by rowid only when `returning` is given.
    /// MySQL echoes `data` back as the single row.
    pub async fn insert(
        &self,
        table: &str,
        data: &Values,
        returning: Option<&[String]>,
    ) -> DbResult<QueryResult> {
        require_data(table, data)?;
        let mut conn = self.pool.acquire().await?;
        let result = insert_row(&mut conn, self.dialect, table, data, returning).await;
        self.pool.release(conn).await;
        result
    }

    /// Insert every row in one transaction.
    ///
    /// The first failing row rolls the whole batch back and its failure is
    /// returned. Each row is rendered from its own keys, so rows may differ in
    /// the columns they set.
    pub async fn insert_many(&self, table: &str, rows: &[Values]) -> DbResult<QueryResult> {
        if rows.is_empty() {
            return Ok(QueryResult::ok(0, 0));
        }
        if let Some(position) = rows.iter().position(Values::is_empty) {
            return Err(DbError::record(
                format!("Row {} has no columns", position + 1),
                table,
            ));
        }

        let start = Instant::now();
        let mut conn = self.pool.acquire().await?;
        let result = insert_batch(&mut conn, self.dialect, table, rows, start).await;
        self.pool.release(conn).await;
        result
    }

    pub async fn update(&self, table: &str, data: &Values, filter: &Filter) -> DbResult<QueryResult> {
        require_data(table, data)?;
        if filter.is_all() {
            warn!(table = %table, "UPDATE without a filter affects every row");
        }
        let (sql, params) = self.dialect.update_sql(table, data, filter);
        self.pool.execute(&sql, &params).await
    }

    pub async fn delete(&self, table: &str, filter: &Filter) -> DbResult<QueryResult> {
        if filter.is_all() {
            warn!(table = %table, "DELETE without a filter removes every row");
        }
        let (sql, params) = self.dialect.delete_sql(table, filter);
        self.pool.execute(&sql, &params).await
    }

    /// First matching row; any limit in `options` is replaced by 1.
    pub async fn find_one(&self, table: &str, options: &FindOptions) -> DbResult<Option<Row>> {
        let options = FindOptions {
            limit: Some(1),
            ..options.clone()
        };
        let (sql, params) = self.dialect.select_sql(table, &options);
        self.pool.fetch_one(&sql, &params).await
    }

    pub async fn find_many(&self, table: &str, options: &FindOptions) -> DbResult<Vec<Row>> {
        let (sql, params) = self.dialect.select_sql(table, options);
        self.pool.fetch_all(&sql, &params).await
    }

    pub async fn count(&self, table: &str, filter: &Filter) -> DbResult<u64> {
        let (sql, params) = self.dialect.count_sql(table, filter);
        let value = self.pool.fetch_value(&sql, &params).await?;
        Ok(value.as_ref().map(count_value).unwrap_or(0))
    }

    pub async fn exists(&self, table: &str, filter: &Filter) -> DbResult<bool> {
        let (sql, params) = self.dialect.exists_sql(table, filter);
        Ok(self.pool.fetch_one(&sql, &params).await?.is_some())
    }

    /// Insert, or update the row that collides on `conflict_keys`.
    ///
    /// `update_columns` defaults to every non-key column in `data`.
    /// `affected_rows` follows the backend: PostgreSQL counts the returned
    /// row, SQLite reports 1, MySQL reports 1 for an insert, 2 for a changed
    /// row and 0 for an unchanged one.
    pub async fn upsert(
        &self,
        table: &str,
        data: &Values,
        conflict_keys: &[String],
        update_columns: Option<&[String]>,
    ) -> DbResult<QueryResult> {
        require_data(table, data)?;
        if conflict_keys.is_empty() {
            return Err(DbError::record("Upsert needs at least one conflict key", table));
        }
        if let Some(missing) = conflict_keys.iter().find(|k| !data.contains_key(k.as_str())) {
            return Err(DbError::record(
                format!("Conflict key '{}' is not in the data", missing),
                table,
            ));
        }

        let (sql, params) = self
            .dialect
            .upsert_sql(table, data, conflict_keys, update_columns);
        debug!(table = %table, keys = ?conflict_keys, "Upserting row");

        let mut conn = self.pool.acquire().await?;
        let result = match self.dialect.db_type() {
            DatabaseType::PostgreSQL => conn.query(&sql, &params).await,
            DatabaseType::MySQL | DatabaseType::SQLite => conn.execute(&sql, &params).await,
        };
        self.pool.release(conn).await;
        result
    }

    /// Stream matching rows, `batch_size` per round trip.
    ///
    /// `limit`/`offset` in `options` are ignored; paging owns them. Pass an
    /// `order_by` for a stable order across pages.
    pub fn stream(
        &self,
        table: &str,
        options: FindOptions,
        batch_size: Option<u64>,
    ) -> BoxStream<'static, DbResult<Row>> {
        let dialect = self.dialect;
        let table = table.to_string();
        let (_, params) = dialect.where_clause(&options.filter, 0);

        paged_stream(
            Arc::clone(&self.pool),
            params,
            batch_size.unwrap_or(DEFAULT_STREAM_BATCH_SIZE),
            move |limit, offset| {
                let page = FindOptions {
                    limit: Some(limit),
                    offset: Some(offset),
                    ..options.clone()
                };
                dialect.select_sql(&table, &page).0
            },
        )
    }
}

fn require_data(table: &str, data: &Values) -> DbResult<()> {
    if data.is_empty() {
        return Err(DbError::record("No column values given", table));
    }
    Ok(())
}

async fn insert_row(
    conn: &mut Connection,
    dialect: Dialect,
    table: &str,
    data: &Values,
    returning: Option<&[String]>,
) -> DbResult<QueryResult> {
    let (sql, params) = dialect.insert_sql(table, data);

    match dialect.db_type() {
        DatabaseType::PostgreSQL => {
            let sql = format!("{}{}", sql, dialect.returning_clause(returning));
            let result = conn.query(&sql, &params).await?;
            let id = result
                .first_row()
                .and_then(|row| row.values().next())
                .and_then(JsonValue::as_i64);
            Ok(result.with_last_insert_id(id))
        }
        DatabaseType::SQLite => {
            let mut result = conn.execute(&sql, &params).await?;
            if let (true, Some(columns), Some(rowid)) =
                (result.success, returning, result.last_insert_id)
            {
                let projection = if columns.is_empty() {
                    "*".to_string()
                } else {
                    columns.join(", ")
                };
                let select = format!("SELECT {} FROM {} WHERE rowid = ?", projection, table);
                result.rows = conn
                    .fetch_one(&select, &[QueryParam::Int(rowid)])
                    .await?
                    .into_iter()
                    .collect();
            }
            Ok(result)
        }
        DatabaseType::MySQL => {
            let result = conn.execute(&sql, &params).await?;
            if result.success {
                return Ok(result.with_rows(vec![data.clone()]));
            }
            Ok(result)
        }
    }
}

async fn insert_batch(
    conn: &mut Connection,
    dialect: Dialect,
    table: &str,
    rows: &[Values],
    start: Instant,
) -> DbResult<QueryResult> {
    conn.begin_transaction().await?;

    let mut affected = 0;
    for (index, row) in rows.iter().enumerate() {
        let (sql, params) = dialect.insert_sql(table, row);
        let result = conn.execute(&sql, &params).await?;
        if !result.success {
            warn!(table = %table, row = index + 1, "Batch insert failed, rolling back");
            conn.rollback().await?;
            return Ok(result);
        }
        affected += result.affected_rows;
    }

    conn.commit().await?;
    debug!(table = %table, rows = affected, "Batch insert committed");
    Ok(QueryResult::ok(affected, start.elapsed().as_millis() as u64))
}

fn count_value(value: &JsonValue) -> u64 {
    match value {
        JsonValue::Number(n) => n.as_u64().unwrap_or(0),
        JsonValue::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}
