//! Schema management (DDL) and catalog introspection.
//!
//! `SchemaManager` runs the DDL produced by [`Dialect`] and reads table
//! definitions back from each backend's catalog.
//!
//! # Architecture
//!
//! Catalog queries are organized in the `queries` submodule with constants for
//! each database type. Backend-specific readers live in their respective
//! submodules (postgres, mysql, sqlite), each providing the same interface and
//! returning the crate's `ColumnDef`/`IndexDef`/`ForeignKeyDef` values.

use crate::db::dialect::Dialect;
use crate::db::executor::run_script;
use crate::db::pool::Pool;
use crate::error::{DbError, DbResult};
use crate::models::{
    AlterAction, ColumnDef, ColumnType, DatabaseType, DefaultValue, ForeignKeyAction,
    ForeignKeyDef, IndexDef, IndexType, QueryParam, QueryResult, Row, TableDef,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info};

/// DDL operations and catalog reads for one connection.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    pool: Arc<Pool>,
    dialect: Dialect,
}

impl SchemaManager {
    pub fn new(pool: Arc<Pool>) -> Self {
        let dialect = Dialect::new(pool.db_type());
        Self { pool, dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Create a table with its indexes.
    ///
    /// The definition is validated first; a structurally invalid `TableDef`
    /// is an error, while a statement the backend rejects is a failed result.
    pub async fn create_table(&self, table: &TableDef) -> DbResult<QueryResult> {
        table.validate()?;
        info!(
            table = %table.name,
            columns = table.columns.len(),
            indexes = table.indexes.len(),
            "Creating table"
        );
        self.run(self.dialect.create_table_sql(table)).await
    }

    pub async fn drop_table(&self, table: &str, cascade: bool) -> DbResult<QueryResult> {
        info!(table = %table, cascade, "Dropping table");
        self.run(vec![self.dialect.drop_table_sql(table, cascade)])
            .await
    }

    /// Apply `actions` in order. Support is checked for the whole list before
    /// anything runs, so an unsupported action leaves the table untouched.
    pub async fn alter_table(&self, table: &str, actions: &[AlterAction]) -> DbResult<QueryResult> {
        let statements = self.dialect.alter_table_sql(table, actions)?;
        info!(
            table = %table,
            actions = ?actions.iter().map(AlterAction::kind).collect::<Vec<_>>(),
            "Altering table"
        );
        self.run(statements).await
    }

    pub async fn rename_table(&self, old_name: &str, new_name: &str) -> DbResult<QueryResult> {
        info!(from = %old_name, to = %new_name, "Renaming table");
        self.run(vec![self.dialect.rename_table_sql(old_name, new_name)])
            .await
    }

    pub async fn add_column(&self, table: &str, column: &ColumnDef) -> DbResult<QueryResult> {
        self.run(vec![self.dialect.add_column_sql(table, column)])
            .await
    }

    pub async fn drop_column(&self, table: &str, column: &str) -> DbResult<QueryResult> {
        self.run(vec![self.dialect.drop_column_sql(table, column)])
            .await
    }

    pub async fn create_index(&self, table: &str, index: &IndexDef) -> DbResult<QueryResult> {
        if index.columns.is_empty() {
            return Err(DbError::schema(
                "Index must cover at least one column",
                &index.name,
            ));
        }
        self.run(vec![self.dialect.create_index_sql(table, index)])
            .await
    }

    /// Drop an index. MySQL needs the owning `table`.
    pub async fn drop_index(&self, name: &str, table: Option<&str>) -> DbResult<QueryResult> {
        let sql = self.dialect.drop_index_sql(name, table)?;
        self.run(vec![sql]).await
    }

    pub async fn create_view(
        &self,
        name: &str,
        query: &str,
        or_replace: bool,
    ) -> DbResult<QueryResult> {
        self.run(self.dialect.create_view_sql(name, query, or_replace))
            .await
    }

    pub async fn drop_view(&self, name: &str, if_exists: bool) -> DbResult<QueryResult> {
        self.run(vec![self.dialect.drop_view_sql(name, if_exists)])
            .await
    }

    /// Add a foreign key constraint. SQLite cannot do this without a table
    /// rebuild and fails with `UnsupportedFeature` before touching the database.
    pub async fn add_foreign_key(&self, table: &str, fk: &ForeignKeyDef) -> DbResult<QueryResult> {
        let sql = self.dialect.add_foreign_key_sql(table, fk)?;
        self.run(vec![sql]).await
    }

    pub async fn drop_foreign_key(&self, table: &str, name: &str) -> DbResult<QueryResult> {
        let sql = self.dialect.drop_foreign_key_sql(table, name)?;
        self.run(vec![sql]).await
    }

    pub async fn table_exists(&self, table: &str) -> DbResult<bool> {
        let sql = match self.dialect.db_type() {
            DatabaseType::PostgreSQL => queries::postgres::TABLE_EXISTS,
            DatabaseType::MySQL => queries::mysql::TABLE_EXISTS,
            DatabaseType::SQLite => queries::sqlite::TABLE_EXISTS,
        };
        let value = self.pool.fetch_value(sql, &[QueryParam::from(table)]).await?;
        Ok(value.as_ref().is_some_and(truthy))
    }

    pub async fn index_exists(&self, name: &str) -> DbResult<bool> {
        let sql = match self.dialect.db_type() {
            DatabaseType::PostgreSQL => queries::postgres::INDEX_EXISTS,
            DatabaseType::MySQL => queries::mysql::INDEX_EXISTS,
            DatabaseType::SQLite => queries::sqlite::INDEX_EXISTS,
        };
        let value = self.pool.fetch_value(sql, &[QueryParam::from(name)]).await?;
        Ok(value.as_ref().is_some_and(truthy))
    }

    /// Base tables in the current schema/database, sorted by name.
    pub async fn list_tables(&self) -> DbResult<Vec<String>> {
        let sql = match self.dialect.db_type() {
            DatabaseType::PostgreSQL => queries::postgres::LIST_TABLES,
            DatabaseType::MySQL => queries::mysql::LIST_TABLES,
            DatabaseType::SQLite => queries::sqlite::LIST_TABLES,
        };
        let rows = self.pool.fetch_all(sql, &[]).await?;
        Ok(rows.iter().filter_map(|r| str_field(r, "name")).collect())
    }

    pub async fn list_columns(&self, table: &str) -> DbResult<Vec<ColumnDef>> {
        Ok(self.describe_columns(table).await?.0)
    }

    /// Secondary indexes of `table`. Primary keys and indexes backing
    /// constraints are left out where the catalog can tell them apart.
    pub async fn list_indexes(&self, table: &str) -> DbResult<Vec<IndexDef>> {
        match self.dialect.db_type() {
            DatabaseType::PostgreSQL => postgres::list_indexes(&self.pool, table).await,
            DatabaseType::MySQL => mysql::list_indexes(&self.pool, table).await,
            DatabaseType::SQLite => sqlite::list_indexes(&self.pool, table).await,
        }
    }

    pub async fn list_foreign_keys(&self, table: &str) -> DbResult<Vec<ForeignKeyDef>> {
        match self.dialect.db_type() {
            DatabaseType::PostgreSQL => postgres::list_foreign_keys(&self.pool, table).await,
            DatabaseType::MySQL => mysql::list_foreign_keys(&self.pool, table).await,
            DatabaseType::SQLite => sqlite::list_foreign_keys(&self.pool, table).await,
        }
    }

    /// Rebuild a `TableDef` from the catalog.
    ///
    /// Native type names are kept in `ColumnDef::native_type`; the logical
    /// type is inferred from them and is lossy on SQLite.
    pub async fn get_table_schema(&self, table: &str) -> DbResult<TableDef> {
        if !self.table_exists(table).await? {
            return Err(DbError::schema("Table does not exist", table));
        }

        let (columns, primary_key) = self.describe_columns(table).await?;
        let mut def = TableDef::new(table).with_if_not_exists(false);
        def.columns = columns;
        def.primary_key = primary_key;
        def.indexes = self.list_indexes(table).await?;
        def.foreign_keys = self.list_foreign_keys(table).await?;

        debug!(
            table = %table,
            columns = def.columns.len(),
            indexes = def.indexes.len(),
            foreign_keys = def.foreign_keys.len(),
            "Read table schema"
        );
        Ok(def)
    }

    async fn describe_columns(&self, table: &str) -> DbResult<(Vec<ColumnDef>, Vec<String>)> {
        match self.dialect.db_type() {
            DatabaseType::PostgreSQL => postgres::describe_columns(&self.pool, table).await,
            DatabaseType::MySQL => mysql::describe_columns(&self.pool, table).await,
            DatabaseType::SQLite => sqlite::describe_columns(&self.pool, table).await,
        }
    }

    /// Run DDL statements on one connection. Several statements run as a
    /// script so a failure part-way rolls back on backends with
    /// transactional DDL.
    async fn run(&self, statements: Vec<String>) -> DbResult<QueryResult> {
        debug!(statements = ?statements, "Executing DDL");
        let mut conn = self.pool.acquire().await?;
        let result = match statements.as_slice() {
            [single] => conn.execute(single, &[]).await,
            _ => run_script(&mut conn, &statements).await.map(fold_results),
        };
        self.pool.release(conn).await;
        result
    }
}

/// Collapse per-statement results into one: the first failure, or the sums.
fn fold_results(results: Vec<QueryResult>) -> QueryResult {
    let elapsed = results.iter().map(|r| r.execution_time_ms).sum();
    match results.iter().find(|r| !r.success) {
        Some(failed) => QueryResult::failure(failed.error.clone().unwrap_or_default(), elapsed),
        None => QueryResult::ok(results.iter().map(|r| r.affected_rows).sum(), elapsed),
    }
}

// =============================================================================
// Catalog Queries
// =============================================================================
//
// Centralized SQL for schema introspection. Each database has its own
// submodule with queries adapted to its system catalogs. PostgreSQL columns
// are cast to text so catalog domains decode as plain strings.

mod queries {
    pub mod postgres {
        pub const TABLE_EXISTS: &str = r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema()
                AND table_name = $1
                AND table_type = 'BASE TABLE'
            ) AS present
            "#;

        pub const INDEX_EXISTS: &str = r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_indexes
                WHERE schemaname = current_schema() AND indexname = $1
            ) AS present
            "#;

        pub const LIST_TABLES: &str = r#"
            SELECT table_name::text AS name
            FROM information_schema.tables
            WHERE table_schema = current_schema()
            AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT
            c.column_name::text AS column_name,
            format_type(a.atttypid, a.atttypmod) AS column_type,
            c.is_nullable::text AS is_nullable,
            c.column_default::text AS column_default,
            COALESCE(pk.position, 0)::int AS pk_position,
            (c.is_identity::text = 'YES') AS is_identity,
            col_description(t.oid, a.attnum) AS column_comment
        FROM information_schema.columns c
        JOIN pg_class t ON t.relname = c.table_name
        JOIN pg_namespace n ON n.oid = t.relnamespace AND n.nspname = c.table_schema
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attname = c.column_name
        LEFT JOIN (
            SELECT kcu.column_name, kcu.ordinal_position::int AS position
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.table_name = $1
            AND tc.table_schema = current_schema()
            AND tc.constraint_type = 'PRIMARY KEY'
        ) pk ON c.column_name = pk.column_name
        WHERE c.table_name = $1 AND c.table_schema = current_schema()
        ORDER BY c.ordinal_position
        "#;

        pub const UNIQUE_COLUMNS: &str = r#"
        SELECT kcu.column_name::text AS column_name
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
            AND tc.table_schema = kcu.table_schema
        WHERE tc.table_name = $1
        AND tc.table_schema = current_schema()
        AND tc.constraint_type = 'UNIQUE'
        AND (
            SELECT COUNT(*) FROM information_schema.key_column_usage k2
            WHERE k2.constraint_name = tc.constraint_name
            AND k2.table_schema = tc.table_schema
        ) = 1
        "#;

        pub const DESCRIBE_FOREIGN_KEYS: &str = r#"
        SELECT
            tc.constraint_name::text AS constraint_name,
            kcu.column_name::text AS column_name,
            rkcu.table_name::text AS foreign_table_name,
            rkcu.column_name::text AS foreign_column_name,
            rc.delete_rule::text AS delete_rule,
            rc.update_rule::text AS update_rule
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
            AND tc.table_schema = kcu.table_schema
        JOIN information_schema.referential_constraints rc
            ON rc.constraint_name = tc.constraint_name
            AND rc.constraint_schema = tc.table_schema
        JOIN information_schema.key_column_usage rkcu
            ON rkcu.constraint_name = rc.unique_constraint_name
            AND rkcu.constraint_schema = rc.unique_constraint_schema
            AND rkcu.ordinal_position = kcu.position_in_unique_constraint
        WHERE tc.table_name = $1
        AND tc.table_schema = current_schema()
        AND tc.constraint_type = 'FOREIGN KEY'
        ORDER BY tc.constraint_name, kcu.ordinal_position
        "#;

        pub const DESCRIBE_INDEXES: &str = r#"
        SELECT
            i.relname::text AS index_name,
            string_agg(a.attname::text, ',' ORDER BY array_position(ix.indkey, a.attnum)) AS column_names,
            ix.indisunique AS is_unique,
            ix.indisprimary AS is_primary,
            EXISTS (SELECT 1 FROM pg_constraint con WHERE con.conindid = ix.indexrelid) AS is_constraint,
            am.amname::text AS index_algorithm
        FROM pg_index ix
        JOIN pg_class i ON i.oid = ix.indexrelid
        JOIN pg_class t ON t.oid = ix.indrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        LEFT JOIN pg_am am ON am.oid = i.relam
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
        WHERE t.relname = $1 AND n.nspname = current_schema()
        GROUP BY i.relname, ix.indexrelid, ix.indisunique, ix.indisprimary, am.amname
        ORDER BY i.relname
        "#;
    }

    pub mod mysql {
        pub const TABLE_EXISTS: &str = r#"
            SELECT COUNT(*) AS count FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE()
            AND TABLE_NAME = ?
            AND TABLE_TYPE = 'BASE TABLE'
            "#;

        pub const INDEX_EXISTS: &str = r#"
            SELECT COUNT(*) AS count FROM information_schema.STATISTICS
            WHERE TABLE_SCHEMA = DATABASE() AND INDEX_NAME = ?
            "#;

        pub const LIST_TABLES: &str = r#"
            SELECT CONVERT(TABLE_NAME USING utf8) AS name
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE()
            AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
            "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT
            CONVERT(COLUMN_NAME USING utf8) AS COLUMN_NAME,
            CONVERT(COLUMN_TYPE USING utf8) AS COLUMN_TYPE,
            CONVERT(IS_NULLABLE USING utf8) AS IS_NULLABLE,
            CONVERT(COLUMN_DEFAULT USING utf8) AS COLUMN_DEFAULT,
            CONVERT(COLUMN_KEY USING utf8) AS COLUMN_KEY,
            CONVERT(EXTRA USING utf8) AS EXTRA,
            CONVERT(COLUMN_COMMENT USING utf8) AS COLUMN_COMMENT
        FROM information_schema.columns
        WHERE TABLE_NAME = ? AND TABLE_SCHEMA = DATABASE()
        ORDER BY ORDINAL_POSITION
        "#;

        pub const DESCRIBE_FOREIGN_KEYS: &str = r#"
        SELECT
            CONVERT(k.CONSTRAINT_NAME USING utf8) AS CONSTRAINT_NAME,
            CONVERT(k.COLUMN_NAME USING utf8) AS COLUMN_NAME,
            CONVERT(k.REFERENCED_TABLE_NAME USING utf8) AS REFERENCED_TABLE_NAME,
            CONVERT(k.REFERENCED_COLUMN_NAME USING utf8) AS REFERENCED_COLUMN_NAME,
            CONVERT(r.DELETE_RULE USING utf8) AS DELETE_RULE,
            CONVERT(r.UPDATE_RULE USING utf8) AS UPDATE_RULE
        FROM information_schema.KEY_COLUMN_USAGE k
        JOIN information_schema.REFERENTIAL_CONSTRAINTS r
            ON r.CONSTRAINT_SCHEMA = k.TABLE_SCHEMA
            AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME
        WHERE k.TABLE_NAME = ?
        AND k.TABLE_SCHEMA = DATABASE()
        AND k.REFERENCED_TABLE_NAME IS NOT NULL
        ORDER BY k.CONSTRAINT_NAME, k.ORDINAL_POSITION
        "#;

        pub const DESCRIBE_INDEXES: &str = r#"
        SELECT
            CONVERT(INDEX_NAME USING utf8) AS INDEX_NAME,
            CONVERT(GROUP_CONCAT(COLUMN_NAME ORDER BY SEQ_IN_INDEX) USING utf8) AS COLUMN_NAMES,
            (NON_UNIQUE = 0) AS IS_UNIQUE,
            CONVERT(INDEX_TYPE USING utf8) AS INDEX_ALGORITHM
        FROM information_schema.STATISTICS
        WHERE TABLE_NAME = ? AND TABLE_SCHEMA = DATABASE()
        GROUP BY INDEX_NAME, NON_UNIQUE, INDEX_TYPE
        ORDER BY INDEX_NAME
        "#;
    }

    pub mod sqlite {
        pub const TABLE_EXISTS: &str =
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?";

        pub const INDEX_EXISTS: &str =
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'index' AND name = ?";

        pub const LIST_TABLES: &str = r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table'
            AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#;

        pub const TABLE_SQL: &str =
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?";

        pub const DESCRIBE_COLUMNS: &str = r#"
            SELECT name, type, "notnull" AS not_null, dflt_value, pk
            FROM pragma_table_info(?)
            ORDER BY cid
            "#;

        pub const LIST_INDEXES: &str = r#"
            SELECT name, "unique" AS is_unique, origin
            FROM pragma_index_list(?)
            ORDER BY name
            "#;

        pub const INDEX_COLUMNS: &str = "SELECT name FROM pragma_index_info(?) ORDER BY seqno";

        pub const DESCRIBE_FOREIGN_KEYS: &str = r#"
            SELECT id, "table" AS ref_table, "from" AS from_column, "to" AS to_column,
                   on_update, on_delete
            FROM pragma_foreign_key_list(?)
            ORDER BY id, seq
            "#;
    }
}

// =============================================================================
// PostgreSQL Implementation
// =============================================================================

mod postgres {
    use super::*;

    pub async fn describe_columns(
        pool: &Pool,
        table: &str,
    ) -> DbResult<(Vec<ColumnDef>, Vec<String>)> {
        let params = [QueryParam::from(table)];
        let rows = pool
            .fetch_all(queries::postgres::DESCRIBE_COLUMNS, &params)
            .await?;
        let unique: Vec<String> = pool
            .fetch_all(queries::postgres::UNIQUE_COLUMNS, &params)
            .await?
            .iter()
            .filter_map(|r| str_field(r, "column_name"))
            .collect();

        let mut primary_key = Vec::new();
        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = str_field(row, "column_name").unwrap_or_default();
            let native = str_field(row, "column_type").unwrap_or_default();
            let pk_position = int_field(row, "pk_position");
            let raw_default = str_field(row, "column_default");

            let serial = raw_default
                .as_deref()
                .is_some_and(|d| d.starts_with("nextval("));
            let mut column = typed_column(&name, &native);
            column.nullable = pk_position == 0 && truthy_field(row, "is_nullable");
            column.auto_increment = serial || truthy_field(row, "is_identity");
            column.unique = unique.contains(&name);
            column.comment = str_field(row, "column_comment");
            if !serial {
                column.default = raw_default.map(|d| parse_default(&d, column.column_type, false));
            }
            if pk_position > 0 {
                column.primary_key = true;
                primary_key.push((pk_position, name));
            }
            columns.push(column);
        }

        primary_key.sort_by_key(|(position, _)| *position);
        Ok((columns, primary_key.into_iter().map(|(_, n)| n).collect()))
    }

    pub async fn list_indexes(pool: &Pool, table: &str) -> DbResult<Vec<IndexDef>> {
        let rows = pool
            .fetch_all(queries::postgres::DESCRIBE_INDEXES, &[QueryParam::from(table)])
            .await?;

        Ok(rows
            .iter()
            .filter(|r| !truthy_field(r, "is_primary") && !truthy_field(r, "is_constraint"))
            .map(|r| {
                IndexDef::new(
                    str_field(r, "index_name").unwrap_or_default(),
                    split_list(str_field(r, "column_names")),
                )
                .with_unique(truthy_field(r, "is_unique"))
                .with_index_type(IndexType::parse(
                    &str_field(r, "index_algorithm").unwrap_or_default(),
                ))
                .with_table(table)
            })
            .collect())
    }

    pub async fn list_foreign_keys(pool: &Pool, table: &str) -> DbResult<Vec<ForeignKeyDef>> {
        let rows = pool
            .fetch_all(
                queries::postgres::DESCRIBE_FOREIGN_KEYS,
                &[QueryParam::from(table)],
            )
            .await?;
        Ok(group_foreign_keys(&rows, |r| ForeignKeyRow {
            name: str_field(r, "constraint_name"),
            column: str_field(r, "column_name").unwrap_or_default(),
            ref_table: str_field(r, "foreign_table_name").unwrap_or_default(),
            ref_column: str_field(r, "foreign_column_name").unwrap_or_default(),
            on_delete: str_field(r, "delete_rule"),
            on_update: str_field(r, "update_rule"),
        }))
    }
}

// =============================================================================
// MySQL Implementation
// =============================================================================

mod mysql {
    use super::*;

    pub async fn describe_columns(
        pool: &Pool,
        table: &str,
    ) -> DbResult<(Vec<ColumnDef>, Vec<String>)> {
        let rows = pool
            .fetch_all(queries::mysql::DESCRIBE_COLUMNS, &[QueryParam::from(table)])
            .await?;

        let mut primary_key = Vec::new();
        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = str_field(row, "COLUMN_NAME").unwrap_or_default();
            let native = str_field(row, "COLUMN_TYPE").unwrap_or_default();
            let key = str_field(row, "COLUMN_KEY").unwrap_or_default();
            let extra = str_field(row, "EXTRA").unwrap_or_default().to_lowercase();

            let mut column = typed_column(&name, &native);
            column.primary_key = key == "PRI";
            column.nullable = !column.primary_key && truthy_field(row, "IS_NULLABLE");
            column.unique = key == "UNI";
            column.auto_increment = extra.contains("auto_increment");
            column.comment = str_field(row, "COLUMN_COMMENT").filter(|c| !c.is_empty());
            column.default = str_field(row, "COLUMN_DEFAULT").map(|raw| {
                if extra.contains("default_generated") {
                    DefaultValue::expression(raw)
                } else {
                    parse_default(&raw, column.column_type, true)
                }
            });
            if column.primary_key {
                primary_key.push(name);
            }
            columns.push(column);
        }
        Ok((columns, primary_key))
    }

    pub async fn list_indexes(pool: &Pool, table: &str) -> DbResult<Vec<IndexDef>> {
        let rows = pool
            .fetch_all(queries::mysql::DESCRIBE_INDEXES, &[QueryParam::from(table)])
            .await?;

        Ok(rows
            .iter()
            .filter(|r| str_field(r, "INDEX_NAME").as_deref() != Some("PRIMARY"))
            .map(|r| {
                IndexDef::new(
                    str_field(r, "INDEX_NAME").unwrap_or_default(),
                    split_list(str_field(r, "COLUMN_NAMES")),
                )
                .with_unique(truthy_field(r, "IS_UNIQUE"))
                .with_index_type(IndexType::parse(
                    &str_field(r, "INDEX_ALGORITHM").unwrap_or_default(),
                ))
                .with_table(table)
            })
            .collect())
    }

    pub async fn list_foreign_keys(pool: &Pool, table: &str) -> DbResult<Vec<ForeignKeyDef>> {
        let rows = pool
            .fetch_all(
                queries::mysql::DESCRIBE_FOREIGN_KEYS,
                &[QueryParam::from(table)],
            )
            .await?;
        Ok(group_foreign_keys(&rows, |r| ForeignKeyRow {
            name: str_field(r, "CONSTRAINT_NAME"),
            column: str_field(r, "COLUMN_NAME").unwrap_or_default(),
            ref_table: str_field(r, "REFERENCED_TABLE_NAME").unwrap_or_default(),
            ref_column: str_field(r, "REFERENCED_COLUMN_NAME").unwrap_or_default(),
            on_delete: str_field(r, "DELETE_RULE"),
            on_update: str_field(r, "UPDATE_RULE"),
        }))
    }
}

// =============================================================================
// SQLite Implementation
// =============================================================================

mod sqlite {
    use super::*;

    pub async fn describe_columns(
        pool: &Pool,
        table: &str,
    ) -> DbResult<(Vec<ColumnDef>, Vec<String>)> {
        let params = [QueryParam::from(table)];
        let rows = pool
            .fetch_all(queries::sqlite::DESCRIBE_COLUMNS, &params)
            .await?;
        let create_sql = pool
            .fetch_value(queries::sqlite::TABLE_SQL, &params)
            .await?
            .and_then(|v| v.as_str().map(str::to_uppercase))
            .unwrap_or_default();
        let unique = unique_columns(pool, table).await?;

        let mut primary_key = Vec::new();
        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = str_field(row, "name").unwrap_or_default();
            let native = str_field(row, "type").unwrap_or_default();
            let pk_position = int_field(row, "pk");

            let mut column = typed_column(&name, &native);
            // PRAGMA reports INTEGER PRIMARY KEY as nullable; it never is.
            column.nullable = pk_position == 0 && !truthy_field(row, "not_null");
            column.unique = unique.contains(&name);
            column.default = str_field(row, "dflt_value")
                .map(|raw| parse_default(&raw, column.column_type, false));
            if pk_position > 0 {
                column.primary_key = true;
                primary_key.push((pk_position, name));
            }
            columns.push(column);
        }

        primary_key.sort_by_key(|(position, _)| *position);
        if let [(_, pk)] = primary_key.as_slice()
            && create_sql.contains("AUTOINCREMENT")
            && let Some(column) = columns.iter_mut().find(|c| &c.name == pk)
        {
            column.auto_increment = true;
        }
        Ok((columns, primary_key.into_iter().map(|(_, n)| n).collect()))
    }

    /// Columns carrying a single-column UNIQUE constraint.
    async fn unique_columns(pool: &Pool, table: &str) -> DbResult<Vec<String>> {
        let indexes = pool
            .fetch_all(queries::sqlite::LIST_INDEXES, &[QueryParam::from(table)])
            .await?;

        let mut unique = Vec::new();
        for index in indexes.iter().filter(|r| {
            truthy_field(r, "is_unique") && str_field(r, "origin").as_deref() == Some("u")
        }) {
            let name = str_field(index, "name").unwrap_or_default();
            if let [column] = index_columns(pool, &name).await?.as_slice() {
                unique.push(column.clone());
            }
        }
        Ok(unique)
    }

    async fn index_columns(pool: &Pool, index: &str) -> DbResult<Vec<String>> {
        let rows = pool
            .fetch_all(queries::sqlite::INDEX_COLUMNS, &[QueryParam::from(index)])
            .await?;
        Ok(rows.iter().filter_map(|r| str_field(r, "name")).collect())
    }

    pub async fn list_indexes(pool: &Pool, table: &str) -> DbResult<Vec<IndexDef>> {
        let rows = pool
            .fetch_all(queries::sqlite::LIST_INDEXES, &[QueryParam::from(table)])
            .await?;

        let mut indexes = Vec::new();
        for row in &rows {
            let name = str_field(row, "name").unwrap_or_default();
            // Automatic indexes for PRIMARY KEY / UNIQUE constraints.
            if name.starts_with("sqlite_") {
                continue;
            }
            let columns = index_columns(pool, &name).await?;
            indexes.push(
                IndexDef::new(name, columns)
                    .with_unique(truthy_field(row, "is_unique"))
                    .with_table(table),
            );
        }
        Ok(indexes)
    }

    pub async fn list_foreign_keys(pool: &Pool, table: &str) -> DbResult<Vec<ForeignKeyDef>> {
        let rows = pool
            .fetch_all(
                queries::sqlite::DESCRIBE_FOREIGN_KEYS,
                &[QueryParam::from(table)],
            )
            .await?;

        // Group on the pragma's id; constraints are unnamed in SQLite.
        let mut grouped: Vec<(i64, ForeignKeyDef)> = Vec::new();
        for row in &rows {
            let id = int_field(row, "id");
            let from = str_field(row, "from_column").unwrap_or_default();
            let to = str_field(row, "to_column").unwrap_or_default();
            match grouped.last_mut() {
                Some((last, fk)) if *last == id => {
                    fk.columns.push(from);
                    fk.ref_columns.push(to);
                }
                _ => grouped.push((
                    id,
                    ForeignKeyDef::new(
                        vec![from],
                        str_field(row, "ref_table").unwrap_or_default(),
                        vec![to],
                    )
                    .with_on_delete(action_field(row, "on_delete"))
                    .with_on_update(action_field(row, "on_update")),
                )),
            }
        }

        let mut foreign_keys = Vec::with_capacity(grouped.len());
        for (_, mut fk) in grouped {
            // `REFERENCES parent` without columns points at the parent's primary key.
            if fk.ref_columns.iter().any(String::is_empty) {
                fk.ref_columns = describe_columns(pool, &fk.ref_table).await?.1;
            }
            foreign_keys.push(fk);
        }
        Ok(foreign_keys)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// One column of a foreign key as read from a catalog.
struct ForeignKeyRow {
    name: Option<String>,
    column: String,
    ref_table: String,
    ref_column: String,
    on_delete: Option<String>,
    on_update: Option<String>,
}

/// Merge per-column catalog rows into constraints; rows must be ordered by
/// constraint name then position.
fn group_foreign_keys<F>(rows: &[Row], read: F) -> Vec<ForeignKeyDef>
where
    F: Fn(&Row) -> ForeignKeyRow,
{
    let mut foreign_keys: Vec<ForeignKeyDef> = Vec::new();
    for fk_row in rows.iter().map(read) {
        match foreign_keys.last_mut() {
            Some(fk) if fk.name.is_some() && fk.name == fk_row.name => {
                fk.columns.push(fk_row.column);
                fk.ref_columns.push(fk_row.ref_column);
            }
            _ => {
                let mut fk = ForeignKeyDef::new(
                    vec![fk_row.column],
                    fk_row.ref_table,
                    vec![fk_row.ref_column],
                )
                .with_on_delete(parse_action(fk_row.on_delete.as_deref()))
                .with_on_update(parse_action(fk_row.on_update.as_deref()));
                fk.name = fk_row.name;
                foreign_keys.push(fk);
            }
        }
    }
    foreign_keys
}

/// Column with its logical type and size arguments taken from a native type name.
fn typed_column(name: &str, native: &str) -> ColumnDef {
    let column_type = ColumnType::from_native(native);
    let mut column = ColumnDef::new(name, column_type).with_native_type(native);

    let args = type_args(native);
    match (column_type, args.as_slice()) {
        (ColumnType::Varchar | ColumnType::Char, [length, ..]) => column.length = Some(*length),
        (ColumnType::Decimal, [precision, scale]) => {
            column.precision = Some(*precision);
            column.scale = Some(*scale);
        }
        (ColumnType::Decimal, [precision]) => column.precision = Some(*precision),
        _ => {}
    }
    column
}

/// Numeric arguments of a type name: `numeric(10,2)` -> `[10, 2]`.
fn type_args(native: &str) -> Vec<u32> {
    let Some((_, rest)) = native.split_once('(') else {
        return Vec::new();
    };
    rest.split(')')
        .next()
        .unwrap_or("")
        .split(',')
        .filter_map(|arg| arg.trim().parse().ok())
        .collect()
}

/// Interpret a catalog default expression.
///
/// Quoted literals lose their quotes and any `::type` cast. MySQL reports
/// string defaults without quotes, so `bare_is_text` treats an unrecognized
/// bare word as text rather than as an expression.
fn parse_default(raw: &str, column_type: ColumnType, bare_is_text: bool) -> DefaultValue {
    let trimmed = raw.trim();

    if let Some(rest) = trimmed.strip_prefix('\'') {
        let mut text = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    text.push('\'');
                    continue;
                }
                break;
            }
            text.push(c);
        }
        return literal_default(text, column_type);
    }

    let unwrapped = trimmed.trim_start_matches('(').trim_end_matches(')');
    let value = unwrapped.split("::").next().unwrap_or(unwrapped).trim();
    if value.eq_ignore_ascii_case("null") {
        return DefaultValue::Null;
    }
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
        return DefaultValue::Bool(value.eq_ignore_ascii_case("true"));
    }
    if let Ok(v) = value.parse::<i64>() {
        return numeric_default(v, column_type);
    }
    if let Ok(v) = value.parse::<f64>() {
        return DefaultValue::Float(v);
    }
    if bare_is_text && !value.to_uppercase().starts_with("CURRENT_") {
        return DefaultValue::Text(value.to_string());
    }
    DefaultValue::expression(trimmed)
}

/// A quoted literal may still spell a number or boolean for typed columns.
fn literal_default(text: String, column_type: ColumnType) -> DefaultValue {
    match column_type {
        ColumnType::Boolean => match text.to_lowercase().as_str() {
            "t" | "true" | "1" => DefaultValue::Bool(true),
            "f" | "false" | "0" => DefaultValue::Bool(false),
            _ => DefaultValue::Text(text),
        },
        ColumnType::Integer | ColumnType::BigInt | ColumnType::SmallInt => text
            .parse::<i64>()
            .map(DefaultValue::Int)
            .unwrap_or(DefaultValue::Text(text)),
        _ => DefaultValue::Text(text),
    }
}

fn numeric_default(value: i64, column_type: ColumnType) -> DefaultValue {
    match (column_type, value) {
        (ColumnType::Boolean, 0) => DefaultValue::Bool(false),
        (ColumnType::Boolean, 1) => DefaultValue::Bool(true),
        _ => DefaultValue::Int(value),
    }
}

fn parse_action(rule: Option<&str>) -> ForeignKeyAction {
    rule.map(ForeignKeyAction::parse).unwrap_or_default()
}

fn action_field(row: &Row, key: &str) -> ForeignKeyAction {
    parse_action(str_field(row, key).as_deref())
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default()
}

fn str_field(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn int_field(row: &Row, key: &str) -> i64 {
    match row.get(key) {
        Some(JsonValue::Number(n)) => n.as_i64().unwrap_or(0),
        Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(0),
        Some(JsonValue::Bool(b)) => i64::from(*b),
        _ => 0,
    }
}

/// Catalog flags arrive as booleans, 0/1 or `YES`/`NO` depending on backend.
fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_i64().is_some_and(|v| v != 0),
        JsonValue::String(s) => matches!(
            s.trim().to_ascii_uppercase().as_str(),
            "YES" | "TRUE" | "T" | "1"
        ),
        _ => false,
    }
}

fn truthy_field(row: &Row, key: &str) -> bool {
    row.get(key).is_some_and(truthy)
}
