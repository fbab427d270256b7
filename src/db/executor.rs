//! Raw SQL execution.
//!
//! `SqlExecutor` is the pass-through for caller-written SQL: single
//! statements, multi-statement scripts run atomically, and paged streams
//! for results too large to materialize at once.

use crate::db::dialect::Dialect;
use crate::db::pool::{Connection, Pool};
use crate::error::DbResult;
use crate::models::{QueryParam, QueryResult, Row};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rows fetched per page when streaming.
pub const DEFAULT_STREAM_BATCH_SIZE: u64 = 1000;

#[derive(Debug, Clone)]
pub struct SqlExecutor {
    pool: Arc<Pool>,
    dialect: Dialect,
}

impl SqlExecutor {
    pub fn new(pool: Arc<Pool>) -> Self {
        let dialect = Dialect::new(pool.db_type());
        Self { pool, dialect }
    }

    /// Execute one statement. Statement errors come back as a failed `QueryResult`.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.pool.execute(sql, params).await
    }

    /// Split `script` into statements and run them in one transaction.
    ///
    /// Execution stops at the first failing statement and the transaction is
    /// rolled back; the returned list ends with that failure. Note that MySQL
    /// commits implicitly around DDL, so DDL there is not undone.
    pub async fn execute_script(&self, script: &str) -> DbResult<Vec<QueryResult>> {
        let statements = self.dialect.split_script(script);
        if statements.is_empty() {
            return Ok(Vec::new());
        }
        debug!(statements = statements.len(), "Executing script");

        let mut conn = self.pool.acquire().await?;
        let result = run_script(&mut conn, &statements).await;
        self.pool.release(conn).await;
        result
    }

    pub async fn fetch_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        self.pool.fetch_one(sql, params).await
    }

    pub async fn fetch_all(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.pool.fetch_all(sql, params).await
    }

    pub async fn fetch_value(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<JsonValue>> {
        self.pool.fetch_value(sql, params).await
    }

    /// Stream the rows of an arbitrary query, `batch_size` rows per round trip.
    ///
    /// The query is wrapped as a subquery with `LIMIT/OFFSET`, so it should
    /// carry its own `ORDER BY` for a stable page order.
    pub fn stream(
        &self,
        sql: &str,
        params: Vec<QueryParam>,
        batch_size: u64,
    ) -> BoxStream<'static, DbResult<Row>> {
        let dialect = self.dialect;
        let sql = sql.to_string();
        paged_stream(
            Arc::clone(&self.pool),
            params,
            batch_size,
            move |limit, offset| dialect.page_sql(&sql, limit, offset),
        )
    }
}

pub(crate) async fn run_script(
    conn: &mut Connection,
    statements: &[String],
) -> DbResult<Vec<QueryResult>> {
    conn.begin_transaction().await?;

    let mut results = Vec::with_capacity(statements.len());
    for (index, statement) in statements.iter().enumerate() {
        let result = conn.execute(statement, &[]).await?;
        let failed = !result.success;
        results.push(result);
        if failed {
            warn!(
                statement = index + 1,
                total = statements.len(),
                "Script statement failed, rolling back"
            );
            conn.rollback().await?;
            return Ok(results);
        }
    }

    conn.commit().await?;
    Ok(results)
}

/// Page through a query until a short page signals the end.
///
/// `page_sql(limit, offset)` renders the SQL for one page. Each page is a
/// separate acquire/release on the pool. A fetch error is yielded once and
/// ends the stream.
pub(crate) fn paged_stream<F>(
    pool: Arc<Pool>,
    params: Vec<QueryParam>,
    batch_size: u64,
    page_sql: F,
) -> BoxStream<'static, DbResult<Row>>
where
    F: Fn(u64, u64) -> String + Send + Sync + 'static,
{
    let batch_size = batch_size.max(1);

    stream::unfold(
        (Some(0u64), pool, params, page_sql),
        move |(offset, pool, params, page_sql)| async move {
            let offset = offset?;
            let sql = page_sql(batch_size, offset);
            match pool.fetch_all(&sql, &params).await {
                Ok(rows) => {
                    let next = if (rows.len() as u64) < batch_size {
                        None
                    } else {
                        Some(offset + batch_size)
                    };
                    let page: Vec<DbResult<Row>> = rows.into_iter().map(Ok).collect();
                    Some((page, (next, pool, params, page_sql)))
                }
                Err(e) => Some((vec![Err(e)], (None, pool, params, page_sql))),
            }
        },
    )
    .map(stream::iter)
    .flatten()
    .boxed()
}
