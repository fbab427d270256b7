//! Explicit transactions with savepoints.
//!
//! A [`Transaction`] holds one pooled connection from `begin` until
//! `commit`/`rollback`, and tracks its savepoint stack and operation count.
//!
//! State machine: `idle -> active -> {committed | rolled_back}`. `begin` on
//! an active transaction is a successful no-op; `commit`/`rollback` outside
//! the active state return `false` without side effects. Savepoint calls
//! outside the active state are errors.

use crate::db::pool::{Connection, Pool};
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, QueryResult, Row, TransactionInfo, TransactionState};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Transaction {
    id: String,
    pool: Arc<Pool>,
    conn: Option<Connection>,
    state: TransactionState,
    savepoints: Vec<String>,
    savepoint_counter: u64,
    operations: u64,
    started_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("connection", &self.pool.name())
            .field("state", &self.state)
            .field("savepoints", &self.savepoints)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pool,
            conn: None,
            state: TransactionState::Idle,
            savepoints: Vec::new(),
            savepoint_counter: 0,
            operations: 0,
            started_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn savepoints(&self) -> &[String] {
        &self.savepoints
    }

    pub fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id.clone(),
            connection: self.pool.name().to_string(),
            state: self.state,
            savepoints: self.savepoints.clone(),
            operations: self.operations,
            started_at: self.started_at,
        }
    }

    /// Start the transaction. Already active: returns `Ok(true)` and does nothing.
    pub async fn begin(&mut self) -> DbResult<bool> {
        if self.is_active() {
            return Ok(true);
        }

        let mut conn = self.pool.acquire().await?;
        if let Err(e) = conn.begin_transaction().await {
            self.pool.release(conn).await;
            return Err(e);
        }

        self.conn = Some(conn);
        self.state = TransactionState::Active;
        self.savepoints.clear();
        self.savepoint_counter = 0;
        self.operations = 0;
        self.started_at = Some(Utc::now());
        debug!(transaction = %self.id, connection = %self.pool.name(), "Transaction started");
        Ok(true)
    }

    /// Commit. Not active: returns `Ok(false)` and does nothing.
    pub async fn commit(&mut self) -> DbResult<bool> {
        if !self.is_active() {
            return Ok(false);
        }
        let Some(mut conn) = self.conn.take() else {
            self.state = TransactionState::RolledBack;
            return Ok(false);
        };

        let result = conn.commit().await;
        self.pool.release(conn).await;
        self.savepoints.clear();
        match result {
            Ok(_) => {
                self.state = TransactionState::Committed;
                debug!(transaction = %self.id, operations = self.operations, "Transaction committed");
                Ok(true)
            }
            Err(e) => {
                // release() rolled back what the failed COMMIT left open
                self.state = TransactionState::RolledBack;
                Err(DbError::transaction(
                    format!("Commit failed: {}", e),
                    &self.id,
                ))
            }
        }
    }

    /// Roll back. Not active: returns `Ok(false)` and does nothing.
    pub async fn rollback(&mut self) -> DbResult<bool> {
        if !self.is_active() {
            return Ok(false);
        }
        self.state = TransactionState::RolledBack;
        self.savepoints.clear();
        let Some(mut conn) = self.conn.take() else {
            return Ok(false);
        };

        let result = conn.rollback().await;
        self.pool.release(conn).await;
        match result {
            Ok(_) => {
                debug!(transaction = %self.id, "Transaction rolled back");
                Ok(true)
            }
            Err(e) => Err(DbError::transaction(
                format!("Rollback failed: {}", e),
                &self.id,
            )),
        }
    }

    fn active_conn(&mut self, operation: &str) -> DbResult<&mut Connection> {
        if !self.is_active() {
            return Err(DbError::transaction(
                format!("Cannot {}: no active transaction", operation),
                &self.id,
            ));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::transaction("Transaction lost its connection", &self.id))
    }

    /// Create a savepoint, generating `sp_<n>` when no name is given.
    pub async fn savepoint(&mut self, name: Option<&str>) -> DbResult<String> {
        self.active_conn("create savepoint")?;
        let name = match name {
            Some(name) => validate_savepoint_name(name)?.to_string(),
            None => format!("sp_{}", self.savepoint_counter + 1),
        };

        let conn = self.active_conn("create savepoint")?;
        conn.run(&format!("SAVEPOINT {}", name), &[]).await?;
        self.savepoint_counter += 1;
        self.savepoints.push(name.clone());
        debug!(transaction = %self.id, savepoint = %name, "Savepoint created");
        Ok(name)
    }

    /// Roll back to `name`, discarding every savepoint created after it.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.active_conn("rollback to savepoint")?;
        let pos = self.savepoint_position(name)?;

        let conn = self.active_conn("rollback to savepoint")?;
        conn.run(&format!("ROLLBACK TO SAVEPOINT {}", name), &[])
            .await?;
        self.savepoints.truncate(pos + 1);
        Ok(())
    }

    /// Release `name`, removing only that entry from the savepoint list.
    pub async fn release_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.active_conn("release savepoint")?;
        let pos = self.savepoint_position(name)?;

        let conn = self.active_conn("release savepoint")?;
        conn.run(&format!("RELEASE SAVEPOINT {}", name), &[]).await?;
        self.savepoints.remove(pos);
        Ok(())
    }

    fn savepoint_position(&self, name: &str) -> DbResult<usize> {
        self.savepoints
            .iter()
            .position(|sp| sp == name)
            .ok_or_else(|| {
                DbError::transaction(format!("Savepoint '{}' does not exist", name), &self.id)
            })
    }

    /// Execute inside the transaction; statement failures are returned as data.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let conn = self.active_conn("execute")?;
        let result = conn.execute(sql, params).await?;
        self.operations += 1;
        Ok(result)
    }

    pub async fn fetch_one(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        let conn = self.active_conn("fetch")?;
        let row = conn.fetch_one(sql, params).await?;
        self.operations += 1;
        Ok(row)
    }

    pub async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let conn = self.active_conn("fetch")?;
        let rows = conn.fetch_all(sql, params).await?;
        self.operations += 1;
        Ok(rows)
    }

    pub async fn fetch_value(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<JsonValue>> {
        let conn = self.active_conn("fetch")?;
        let value = conn.fetch_value(sql, params).await?;
        self.operations += 1;
        Ok(value)
    }

    /// Begin, run `f`, then commit on `Ok` or roll back on `Err`.
    pub async fn scoped<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, DbResult<T>>,
    {
        self.begin().await?;
        match f(self).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(transaction = %self.id, error = %rollback_err, "Rollback after failed scope failed");
                }
                Err(e)
            }
        }
    }
}

/// Savepoint names are interpolated into SQL, so only identifiers pass.
fn validate_savepoint_name(name: &str) -> DbResult<&str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(DbError::invalid_input(format!(
            "Invalid savepoint name '{}'",
            name
        )))
    }
}
