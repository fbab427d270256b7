//! Per-backend SQL generation.
//!
//! Everything that differs textually between PostgreSQL, MySQL and SQLite
//! lives here: native type names, placeholder style, DDL syntax, upsert
//! clauses and script splitting. Generation is pure; nothing in this module
//! touches a connection.

use crate::error::{DbError, DbResult};
use crate::models::{
    AlterAction, ColumnChanges, ColumnDef, ColumnType, DatabaseType, DefaultValue, Filter,
    FindOptions, ForeignKeyDef, IndexDef, QueryParam, TableDef, Values,
};
use sqlparser::dialect::{
    Dialect as ParserDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect,
};
use sqlparser::tokenizer::{Token, Tokenizer};

/// MySQL has no "no limit" keyword; this is the documented idiom.
const MYSQL_NO_LIMIT: &str = "18446744073709551615";

/// SQL generator for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    db_type: DatabaseType,
}

impl From<DatabaseType> for Dialect {
    fn from(db_type: DatabaseType) -> Self {
        Self::new(db_type)
    }
}

impl Dialect {
    pub fn new(db_type: DatabaseType) -> Self {
        Self { db_type }
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    fn is_postgres(&self) -> bool {
        self.db_type == DatabaseType::PostgreSQL
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self.db_type {
            DatabaseType::PostgreSQL => format!("${}", index),
            DatabaseType::MySQL | DatabaseType::SQLite => "?".to_string(),
        }
    }

    /// Statement that opens a transaction.
    pub fn begin_sql(&self) -> &'static str {
        match self.db_type {
            DatabaseType::MySQL => "START TRANSACTION",
            DatabaseType::PostgreSQL | DatabaseType::SQLite => "BEGIN",
        }
    }

    // =========================================================================
    // Types and column definitions
    // =========================================================================

    pub fn native_type(&self, column_type: ColumnType) -> &'static str {
        use ColumnType::*;

        match self.db_type {
            DatabaseType::PostgreSQL => match column_type {
                Integer => "INTEGER",
                BigInt => "BIGINT",
                SmallInt => "SMALLINT",
                Float => "REAL",
                Double => "DOUBLE PRECISION",
                Decimal => "DECIMAL",
                Varchar => "VARCHAR",
                Text => "TEXT",
                Char => "CHAR",
                Boolean => "BOOLEAN",
                Date => "DATE",
                Time => "TIME",
                DateTime | Timestamp => "TIMESTAMP",
                Blob | Binary => "BYTEA",
                Json => "JSONB",
                Uuid => "UUID",
            },
            DatabaseType::MySQL => match column_type {
                Integer => "INT",
                BigInt => "BIGINT",
                SmallInt => "SMALLINT",
                Float => "FLOAT",
                Double => "DOUBLE",
                Decimal => "DECIMAL",
                Varchar => "VARCHAR",
                Text => "TEXT",
                Char => "CHAR",
                Boolean => "TINYINT(1)",
                Date => "DATE",
                Time => "TIME",
                DateTime => "DATETIME",
                Timestamp => "TIMESTAMP",
                Blob => "BLOB",
                Binary => "BINARY",
                Json => "JSON",
                Uuid => "CHAR(36)",
            },
            DatabaseType::SQLite => match column_type {
                Integer | BigInt | SmallInt | Boolean => "INTEGER",
                Float | Double | Decimal => "REAL",
                Blob | Binary => "BLOB",
                Varchar | Text | Char | Date | Time | DateTime | Timestamp | Json | Uuid => "TEXT",
            },
        }
    }

    /// Full type expression for a column, including length, precision and
    /// PostgreSQL serial types.
    pub fn column_type_sql(&self, column: &ColumnDef) -> String {
        if column.auto_increment && self.is_postgres() {
            return match column.column_type {
                ColumnType::BigInt => "BIGSERIAL".to_string(),
                _ => "SERIAL".to_string(),
            };
        }

        let base = self.native_type(column.column_type);
        match column.column_type {
            ColumnType::Varchar | ColumnType::Char => match column.length {
                Some(len) => format!("{}({})", base, len),
                None if self.db_type == DatabaseType::MySQL
                    && column.column_type == ColumnType::Varchar =>
                {
                    format!("{}(255)", base)
                }
                None => base.to_string(),
            },
            ColumnType::Decimal if self.db_type != DatabaseType::SQLite => {
                match column.precision {
                    Some(p) => format!("DECIMAL({}, {})", p, column.scale.unwrap_or(0)),
                    None => base.to_string(),
                }
            }
            _ => base.to_string(),
        }
    }

    /// Render a default as a SQL literal or expression.
    pub fn default_sql(&self, value: &DefaultValue) -> String {
        match value {
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::Bool(b) if self.is_postgres() => {
                if *b { "TRUE" } else { "FALSE" }.to_string()
            }
            DefaultValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            DefaultValue::Int(i) => i.to_string(),
            DefaultValue::Float(f) => f.to_string(),
            DefaultValue::Expression { expression } => expression.clone(),
            DefaultValue::Text(s) => quote_literal(s),
        }
    }

    /// Column definition as it appears inside `CREATE TABLE` or `ADD COLUMN`.
    ///
    /// `inline_pk` places `PRIMARY KEY` on the column itself; composite keys
    /// are emitted as a table constraint instead.
    pub fn column_sql(&self, column: &ColumnDef, inline_pk: bool) -> String {
        let mut parts = vec![column.name.clone(), self.column_type_sql(column)];

        if inline_pk {
            parts.push("PRIMARY KEY".to_string());
        }
        if column.auto_increment {
            match self.db_type {
                DatabaseType::MySQL => parts.push("AUTO_INCREMENT".to_string()),
                DatabaseType::SQLite if inline_pk => parts.push("AUTOINCREMENT".to_string()),
                _ => {}
            }
        }
        if !column.nullable && !column.primary_key {
            parts.push("NOT NULL".to_string());
        }
        if column.unique && !column.primary_key {
            parts.push("UNIQUE".to_string());
        }
        if let Some(default) = &column.default {
            parts.push(format!("DEFAULT {}", self.default_sql(default)));
        }
        if self.db_type == DatabaseType::MySQL
            && let Some(comment) = &column.comment
        {
            parts.push(format!("COMMENT {}", quote_literal(comment)));
        }

        parts.join(" ")
    }

    fn foreign_key_sql(&self, table: &str, fk: &ForeignKeyDef) -> String {
        let body = format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
            fk.columns.join(", "),
            fk.ref_table,
            fk.ref_columns.join(", "),
            fk.on_delete,
            fk.on_update
        );
        match self.db_type {
            DatabaseType::SQLite => body,
            _ => format!("CONSTRAINT {} {}", fk.constraint_name(table), body),
        }
    }

    // =========================================================================
    // Table DDL
    // =========================================================================

    /// `CREATE TABLE` followed by the table comment and index statements.
    pub fn create_table_sql(&self, table: &TableDef) -> Vec<String> {
        let pk = table.primary_key_columns();
        let inline_pk = if pk.len() == 1 { pk.first() } else { None };

        let mut defs: Vec<String> = table
            .columns
            .iter()
            .map(|c| self.column_sql(c, inline_pk == Some(&c.name)))
            .collect();
        if pk.len() > 1 {
            defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        }
        for fk in &table.foreign_keys {
            defs.push(self.foreign_key_sql(&table.name, fk));
        }

        let mut create = format!(
            "CREATE TABLE {}{} (\n    {}\n)",
            if table.if_not_exists {
                "IF NOT EXISTS "
            } else {
                ""
            },
            table.name,
            defs.join(",\n    ")
        );
        if self.db_type == DatabaseType::MySQL {
            create.push_str(" ENGINE=InnoDB");
            if let Some(comment) = &table.comment {
                create.push_str(&format!(" COMMENT={}", quote_literal(comment)));
            }
        }

        let mut statements = vec![create];
        if self.is_postgres()
            && let Some(comment) = &table.comment
        {
            statements.push(format!(
                "COMMENT ON TABLE {} IS {}",
                table.name,
                quote_literal(comment)
            ));
        }
        for index in &table.indexes {
            statements.push(self.create_index_sql(&table.name, index));
        }
        statements
    }

    pub fn drop_table_sql(&self, table: &str, cascade: bool) -> String {
        if cascade && self.db_type != DatabaseType::SQLite {
            format!("DROP TABLE IF EXISTS {} CASCADE", table)
        } else {
            format!("DROP TABLE IF EXISTS {}", table)
        }
    }

    pub fn rename_table_sql(&self, old_name: &str, new_name: &str) -> String {
        match self.db_type {
            DatabaseType::MySQL => format!("RENAME TABLE {} TO {}", old_name, new_name),
            _ => format!("ALTER TABLE {} RENAME TO {}", old_name, new_name),
        }
    }

    pub fn add_column_sql(&self, table: &str, column: &ColumnDef) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            table,
            self.column_sql(column, column.primary_key)
        )
    }

    pub fn drop_column_sql(&self, table: &str, column: &str) -> String {
        format!("ALTER TABLE {} DROP COLUMN {}", table, column)
    }

    /// Whether `ALTER TABLE` supports the given action kind on this backend.
    pub fn supports_alter(&self, action: &AlterAction) -> bool {
        matches!(
            (self.db_type, action),
            (_, AlterAction::AddColumn { .. })
                | (_, AlterAction::DropColumn { .. })
                | (_, AlterAction::RenameColumn { .. })
                | (DatabaseType::PostgreSQL, AlterAction::AlterColumn { .. })
                | (DatabaseType::MySQL, AlterAction::ModifyColumn { .. })
        )
    }

    /// Statements for a list of alter actions.
    ///
    /// The whole list is checked before anything is generated, so a single
    /// unsupported action rejects the call.
    pub fn alter_table_sql(&self, table: &str, actions: &[AlterAction]) -> DbResult<Vec<String>> {
        if actions.is_empty() {
            return Err(DbError::invalid_input("No alter actions given"));
        }
        if let Some(action) = actions.iter().find(|a| !self.supports_alter(a)) {
            return Err(DbError::unsupported(
                format!("ALTER TABLE {} column", action.kind()),
                self.db_type.display_name(),
            ));
        }

        match self.db_type {
            DatabaseType::SQLite => Ok(actions
                .iter()
                .map(|action| format!("ALTER TABLE {} {}", table, self.alter_clause(action)))
                .collect()),
            DatabaseType::MySQL => {
                let clauses: Vec<String> = actions.iter().map(|a| self.alter_clause(a)).collect();
                Ok(vec![format!("ALTER TABLE {} {}", table, clauses.join(", "))])
            }
            DatabaseType::PostgreSQL => {
                let mut combined = Vec::new();
                let mut renames = Vec::new();
                for action in actions {
                    match action {
                        AlterAction::RenameColumn { .. } => renames.push(format!(
                            "ALTER TABLE {} {}",
                            table,
                            self.alter_clause(action)
                        )),
                        AlterAction::AlterColumn { name, changes } => {
                            combined.extend(self.pg_alter_column_clauses(name, changes)?)
                        }
                        _ => combined.push(self.alter_clause(action)),
                    }
                }

                let mut statements = Vec::new();
                if !combined.is_empty() {
                    statements.push(format!("ALTER TABLE {} {}", table, combined.join(", ")));
                }
                statements.extend(renames);
                Ok(statements)
            }
        }
    }

    fn alter_clause(&self, action: &AlterAction) -> String {
        match action {
            AlterAction::AddColumn { column } => {
                format!("ADD COLUMN {}", self.column_sql(column, column.primary_key))
            }
            AlterAction::DropColumn { name } => format!("DROP COLUMN {}", name),
            AlterAction::ModifyColumn { column } => {
                format!("MODIFY COLUMN {}", self.column_sql(column, false))
            }
            AlterAction::RenameColumn { old_name, new_name } => {
                format!("RENAME COLUMN {} TO {}", old_name, new_name)
            }
            // Expanded separately; only PostgreSQL accepts it.
            AlterAction::AlterColumn { name, .. } => format!("ALTER COLUMN {}", name),
        }
    }

    fn pg_alter_column_clauses(&self, name: &str, changes: &ColumnChanges) -> DbResult<Vec<String>> {
        if changes.is_empty() {
            return Err(DbError::invalid_input(format!(
                "ALTER COLUMN {} has no changes",
                name
            )));
        }

        let mut clauses = Vec::new();
        if let Some(column_type) = changes.column_type {
            let mut column = ColumnDef::new(name, column_type);
            column.length = changes.length;
            let type_sql = self.column_type_sql(&column);
            clauses.push(format!(
                "ALTER COLUMN {} TYPE {} USING {}::{}",
                name, type_sql, name, type_sql
            ));
        }
        match changes.nullable {
            Some(true) => clauses.push(format!("ALTER COLUMN {} DROP NOT NULL", name)),
            Some(false) => clauses.push(format!("ALTER COLUMN {} SET NOT NULL", name)),
            None => {}
        }
        if let Some(default) = &changes.default {
            clauses.push(format!(
                "ALTER COLUMN {} SET DEFAULT {}",
                name,
                self.default_sql(default)
            ));
        } else if changes.drop_default {
            clauses.push(format!("ALTER COLUMN {} DROP DEFAULT", name));
        }
        Ok(clauses)
    }

    // =========================================================================
    // Indexes, views and constraints
    // =========================================================================

    pub fn create_index_sql(&self, table: &str, index: &IndexDef) -> String {
        let unique = if index.unique { "UNIQUE " } else { "" };
        let columns = index.columns.join(", ");
        match self.db_type {
            DatabaseType::PostgreSQL => format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} USING {} ({})",
                unique,
                index.name,
                table,
                index.index_type.as_sql(),
                columns
            ),
            DatabaseType::MySQL => format!(
                "CREATE {}INDEX {} ON {} ({})",
                unique, index.name, table, columns
            ),
            DatabaseType::SQLite => format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                unique, index.name, table, columns
            ),
        }
    }

    /// MySQL scopes index names to a table, so it needs `table`.
    pub fn drop_index_sql(&self, name: &str, table: Option<&str>) -> DbResult<String> {
        match self.db_type {
            DatabaseType::MySQL => match table {
                Some(table) => Ok(format!("DROP INDEX {} ON {}", name, table)),
                None => Err(DbError::invalid_input(
                    "MySQL requires the table name to drop an index",
                )),
            },
            _ => Ok(format!("DROP INDEX IF EXISTS {}", name)),
        }
    }

    /// SQLite has no `OR REPLACE` for views; the old view is dropped first.
    pub fn create_view_sql(&self, name: &str, query: &str, or_replace: bool) -> Vec<String> {
        match (self.db_type, or_replace) {
            (DatabaseType::SQLite, true) => vec![
                format!("DROP VIEW IF EXISTS {}", name),
                format!("CREATE VIEW {} AS {}", name, query),
            ],
            (_, true) => vec![format!("CREATE OR REPLACE VIEW {} AS {}", name, query)],
            (_, false) => vec![format!("CREATE VIEW {} AS {}", name, query)],
        }
    }

    pub fn drop_view_sql(&self, name: &str, if_exists: bool) -> String {
        if if_exists {
            format!("DROP VIEW IF EXISTS {}", name)
        } else {
            format!("DROP VIEW {}", name)
        }
    }

    pub fn add_foreign_key_sql(&self, table: &str, fk: &ForeignKeyDef) -> DbResult<String> {
        self.require_fk_alter("add foreign key")?;
        Ok(format!(
            "ALTER TABLE {} ADD {}",
            table,
            self.foreign_key_sql(table, fk)
        ))
    }

    pub fn drop_foreign_key_sql(&self, table: &str, name: &str) -> DbResult<String> {
        self.require_fk_alter("drop foreign key")?;
        Ok(match self.db_type {
            DatabaseType::MySQL => format!("ALTER TABLE {} DROP FOREIGN KEY {}", table, name),
            _ => format!("ALTER TABLE {} DROP CONSTRAINT {}", table, name),
        })
    }

    fn require_fk_alter(&self, feature: &str) -> DbResult<()> {
        if self.db_type == DatabaseType::SQLite {
            return Err(DbError::unsupported(
                format!("{} (requires table rebuild)", feature),
                self.db_type.display_name(),
            ));
        }
        Ok(())
    }

    // =========================================================================
    // DML
    // =========================================================================

    /// WHERE clause (with leading space) and its parameters.
    ///
    /// `bound` is the number of parameters already placed before the clause,
    /// so PostgreSQL numbering continues after a SET list.
    pub fn where_clause(&self, filter: &Filter, bound: usize) -> (String, Vec<QueryParam>) {
        match filter {
            Filter::All => (String::new(), Vec::new()),
            Filter::Eq(values) if values.is_empty() => (String::new(), Vec::new()),
            Filter::Eq(values) => {
                let mut params = Vec::new();
                let conditions: Vec<String> = values
                    .iter()
                    .map(|(column, value)| {
                        if value.is_null() {
                            format!("{} IS NULL", column)
                        } else {
                            params.push(QueryParam::from(value));
                            format!("{} = {}", column, self.placeholder(bound + params.len()))
                        }
                    })
                    .collect();
                (format!(" WHERE {}", conditions.join(" AND ")), params)
            }
            Filter::Raw { clause, .. } if clause.trim().is_empty() => (String::new(), Vec::new()),
            Filter::Raw { clause, params } => {
                let clause = if self.is_postgres() && bound > 0 {
                    shift_placeholders(clause, bound)
                } else {
                    clause.clone()
                };
                (format!(" WHERE {}", clause), params.clone())
            }
        }
    }

    /// `INSERT INTO t (..) VALUES (..)` and its parameters.
    pub fn insert_sql(&self, table: &str, data: &Values) -> (String, Vec<QueryParam>) {
        let columns: Vec<&str> = data.keys().map(String::as_str).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        let params = data.values().map(QueryParam::from).collect();
        (
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                placeholders.join(", ")
            ),
            params,
        )
    }

    /// ` RETURNING ..` suffix; `None` returns every column.
    pub fn returning_clause(&self, columns: Option<&[String]>) -> String {
        match columns {
            Some(cols) if !cols.is_empty() => format!(" RETURNING {}", cols.join(", ")),
            _ => " RETURNING *".to_string(),
        }
    }

    pub fn update_sql(&self, table: &str, data: &Values, filter: &Filter) -> (String, Vec<QueryParam>) {
        let assignments: Vec<String> = data
            .keys()
            .enumerate()
            .map(|(i, column)| format!("{} = {}", column, self.placeholder(i + 1)))
            .collect();
        let mut params: Vec<QueryParam> = data.values().map(QueryParam::from).collect();
        let (where_sql, where_params) = self.where_clause(filter, params.len());
        params.extend(where_params);
        (
            format!("UPDATE {} SET {}{}", table, assignments.join(", "), where_sql),
            params,
        )
    }

    pub fn delete_sql(&self, table: &str, filter: &Filter) -> (String, Vec<QueryParam>) {
        let (where_sql, params) = self.where_clause(filter, 0);
        (format!("DELETE FROM {}{}", table, where_sql), params)
    }

    pub fn select_sql(&self, table: &str, options: &FindOptions) -> (String, Vec<QueryParam>) {
        let projection = match &options.columns {
            Some(cols) if !cols.is_empty() => cols.join(", "),
            _ => "*".to_string(),
        };
        let (where_sql, params) = self.where_clause(&options.filter, 0);

        let mut sql = format!("SELECT {} FROM {}{}", projection, table, where_sql);
        if let Some(order_by) = &options.order_by {
            sql.push_str(&format!(" ORDER BY {}", order_by));
        }
        sql.push_str(&self.limit_offset(options.limit, options.offset));
        (sql, params)
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(l), Some(o)) => format!(" LIMIT {} OFFSET {}", l, o),
            (Some(l), None) => format!(" LIMIT {}", l),
            (None, Some(o)) => match self.db_type {
                DatabaseType::PostgreSQL => format!(" OFFSET {}", o),
                DatabaseType::MySQL => format!(" LIMIT {} OFFSET {}", MYSQL_NO_LIMIT, o),
                DatabaseType::SQLite => format!(" LIMIT -1 OFFSET {}", o),
            },
            (None, None) => String::new(),
        }
    }

    pub fn count_sql(&self, table: &str, filter: &Filter) -> (String, Vec<QueryParam>) {
        let (where_sql, params) = self.where_clause(filter, 0);
        (format!("SELECT COUNT(*) AS count FROM {}{}", table, where_sql), params)
    }

    pub fn exists_sql(&self, table: &str, filter: &Filter) -> (String, Vec<QueryParam>) {
        let (where_sql, params) = self.where_clause(filter, 0);
        (
            format!("SELECT 1 AS present FROM {}{} LIMIT 1", table, where_sql),
            params,
        )
    }

    /// Insert-or-update keyed on `conflict_keys`.
    ///
    /// `update_columns` defaults to every data column that is not a conflict
    /// key. PostgreSQL returns the written row.
    pub fn upsert_sql(
        &self,
        table: &str,
        data: &Values,
        conflict_keys: &[String],
        update_columns: Option<&[String]>,
    ) -> (String, Vec<QueryParam>) {
        let (insert, params) = self.insert_sql(table, data);
        let updates: Vec<String> = match update_columns {
            Some(cols) => cols.to_vec(),
            None => data
                .keys()
                .filter(|k| !conflict_keys.contains(k))
                .cloned()
                .collect(),
        };
        let keys = conflict_keys.join(", ");

        let sql = match self.db_type {
            DatabaseType::PostgreSQL => {
                let action = if updates.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    let set: Vec<String> = updates
                        .iter()
                        .map(|c| format!("{} = EXCLUDED.{}", c, c))
                        .collect();
                    format!("DO UPDATE SET {}", set.join(", "))
                };
                format!("{} ON CONFLICT ({}) {} RETURNING *", insert, keys, action)
            }
            DatabaseType::SQLite => {
                let action = if updates.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    let set: Vec<String> = updates
                        .iter()
                        .map(|c| format!("{} = excluded.{}", c, c))
                        .collect();
                    format!("DO UPDATE SET {}", set.join(", "))
                };
                format!("{} ON CONFLICT({}) {}", insert, keys, action)
            }
            DatabaseType::MySQL => {
                let set: Vec<String> = if updates.is_empty() {
                    conflict_keys
                        .iter()
                        .take(1)
                        .map(|c| format!("{} = {}", c, c))
                        .collect()
                } else {
                    updates
                        .iter()
                        .map(|c| format!("{} = VALUES({})", c, c))
                        .collect()
                };
                format!("{} ON DUPLICATE KEY UPDATE {}", insert, set.join(", "))
            }
        };
        (sql, params)
    }

    /// Wrap an arbitrary query for one page of a stream.
    pub fn page_sql(&self, query: &str, limit: u64, offset: u64) -> String {
        let trimmed = query.trim().trim_end_matches(';');
        format!(
            "SELECT * FROM ({}) AS _stream LIMIT {} OFFSET {}",
            trimmed, limit, offset
        )
    }

    // =========================================================================
    // Scripts
    // =========================================================================

    fn parser_dialect(&self) -> Box<dyn ParserDialect> {
        match self.db_type {
            DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
            DatabaseType::MySQL => Box::new(MySqlDialect {}),
            DatabaseType::SQLite => Box::new(SQLiteDialect {}),
        }
    }

    /// Split a script into statements on top-level semicolons.
    ///
    /// Tokenizes with the backend's lexer so semicolons inside literals,
    /// quoted identifiers and comments are ignored. Falls back to a
    /// quote-aware scan if the lexer rejects the input.
    pub fn split_script(&self, script: &str) -> Vec<String> {
        let dialect = self.parser_dialect();
        let tokens = match Tokenizer::new(dialect.as_ref(), script)
            .with_unescape(false)
            .tokenize()
        {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::debug!(error = %e, "Tokenizer rejected script, using fallback split");
                return split_on_semicolons(script);
            }
        };

        let mut statements = Vec::new();
        let mut current = String::new();
        let mut has_content = false;
        for token in tokens {
            match token {
                Token::SemiColon => {
                    if has_content {
                        statements.push(current.trim().to_string());
                    }
                    current.clear();
                    has_content = false;
                }
                Token::EOF => {}
                other => {
                    if !matches!(other, Token::Whitespace(_)) {
                        has_content = true;
                    }
                    current.push_str(&other.to_string());
                }
            }
        }
        if has_content {
            statements.push(current.trim().to_string());
        }
        statements
    }
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Renumber `$n` placeholders by `by`, leaving quoted text untouched.
fn shift_placeholders(clause: &str, by: usize) -> String {
    let mut out = String::with_capacity(clause.len() + 8);
    let mut chars = clause.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (Some(_), c) => out.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                out.push(c);
            }
            (None, '$') if chars.peek().is_some_and(|d| d.is_ascii_digit()) => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(*d);
                    chars.next();
                }
                let n: usize = digits.parse().unwrap_or(0);
                out.push_str(&format!("${}", n + by));
            }
            (None, c) => out.push(c),
        }
    }
    out
}

/// Quote-aware `;` split used when the tokenizer fails.
fn split_on_semicolons(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in script.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if matches!(c, '\'' | '"' | '`') => quote = Some(c),
            None if c == ';' => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
                continue;
            }
            None => {}
        }
        current.push(c);
    }
    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ForeignKeyAction, IndexType};
    use serde_json::json;

    fn users_table() -> TableDef {
        TableDef::new("users")
            .with_column(
                ColumnDef::new("id", ColumnType::Integer)
                    .with_primary_key(true)
                    .with_auto_increment(true),
            )
            .with_column(
                ColumnDef::new("email", ColumnType::Varchar)
                    .with_length(100)
                    .with_nullable(false)
                    .with_unique(true),
            )
            .with_column(
                ColumnDef::new("active", ColumnType::Boolean).with_default(DefaultValue::Bool(true)),
            )
    }

    fn values(pairs: &[(&str, serde_json::Value)]) -> Values {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_native_types_per_backend() {
        let pg = Dialect::new(DatabaseType::PostgreSQL);
        let my = Dialect::new(DatabaseType::MySQL);
        let lite = Dialect::new(DatabaseType::SQLite);

        assert_eq!(pg.native_type(ColumnType::Boolean), "BOOLEAN");
        assert_eq!(my.native_type(ColumnType::Boolean), "TINYINT(1)");
        assert_eq!(lite.native_type(ColumnType::Boolean), "INTEGER");
        assert_eq!(pg.native_type(ColumnType::Json), "JSONB");
        assert_eq!(my.native_type(ColumnType::Uuid), "CHAR(36)");
        assert_eq!(lite.native_type(ColumnType::DateTime), "TEXT");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::new(DatabaseType::PostgreSQL).placeholder(3), "$3");
        assert_eq!(Dialect::new(DatabaseType::MySQL).placeholder(3), "?");
        assert_eq!(Dialect::new(DatabaseType::SQLite).placeholder(1), "?");
    }

    #[test]
    fn test_create_table_sqlite() {
        let sql = Dialect::new(DatabaseType::SQLite).create_table_sql(&users_table());
        assert_eq!(sql.len(), 1);
        assert!(sql[0].starts_with("CREATE TABLE IF NOT EXISTS users ("));
        assert!(sql[0].contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql[0].contains("email TEXT(100) NOT NULL UNIQUE"));
        assert!(sql[0].contains("active INTEGER DEFAULT 1"));
    }

    #[test]
    fn test_create_table_postgres_serial_and_comment() {
        let table = users_table().with_comment("app users");
        let sql = Dialect::new(DatabaseType::PostgreSQL).create_table_sql(&table);
        assert!(sql[0].contains("id SERIAL PRIMARY KEY"));
        assert!(sql[0].contains("email VARCHAR(100) NOT NULL UNIQUE"));
        assert!(sql[0].contains("active BOOLEAN DEFAULT TRUE"));
        assert_eq!(sql[1], "COMMENT ON TABLE users IS 'app users'");
    }

    #[test]
    fn test_create_table_mysql_suffix() {
        let table = users_table().with_comment("it's users");
        let sql = Dialect::new(DatabaseType::MySQL).create_table_sql(&table);
        assert_eq!(sql.len(), 1);
        assert!(sql[0].contains("id INT PRIMARY KEY AUTO_INCREMENT"));
        assert!(sql[0].ends_with(") ENGINE=InnoDB COMMENT='it''s users'"));
    }

    #[test]
    fn test_composite_primary_key_and_foreign_key() {
        let table = TableDef::new("memberships")
            .with_column(ColumnDef::new("user_id", ColumnType::Integer))
            .with_column(ColumnDef::new("group_id", ColumnType::Integer))
            .with_primary_key(vec!["user_id".into(), "group_id".into()])
            .with_foreign_key(
                ForeignKeyDef::new(vec!["user_id".into()], "users", vec!["id".into()])
                    .with_on_delete(ForeignKeyAction::Cascade),
            )
            .with_index(IndexDef::new("idx_group", vec!["group_id".into()]));

        let pg = Dialect::new(DatabaseType::PostgreSQL).create_table_sql(&table);
        assert!(pg[0].contains("PRIMARY KEY (user_id, group_id)"));
        assert!(pg[0].contains(
            "CONSTRAINT fk_memberships_user_id FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE ON UPDATE RESTRICT"
        ));
        assert_eq!(
            pg[1],
            "CREATE INDEX IF NOT EXISTS idx_group ON memberships USING btree (group_id)"
        );

        let lite = Dialect::new(DatabaseType::SQLite).create_table_sql(&table);
        assert!(lite[0].contains("FOREIGN KEY (user_id) REFERENCES users (id)"));
        assert!(!lite[0].contains("CONSTRAINT"));
    }

    #[test]
    fn test_default_text_is_escaped() {
        let d = Dialect::new(DatabaseType::SQLite);
        assert_eq!(d.default_sql(&DefaultValue::text("O'Brien")), "'O''Brien'");
        assert_eq!(
            d.default_sql(&DefaultValue::expression("CURRENT_TIMESTAMP")),
            "CURRENT_TIMESTAMP"
        );
    }

    #[test]
    fn test_decimal_precision() {
        let col = ColumnDef::new("price", ColumnType::Decimal).with_precision(10, 2);
        assert_eq!(
            Dialect::new(DatabaseType::MySQL).column_type_sql(&col),
            "DECIMAL(10, 2)"
        );
        assert_eq!(
            Dialect::new(DatabaseType::SQLite).column_type_sql(&col),
            "REAL"
        );
    }

    #[test]
    fn test_drop_and_rename_table() {
        let pg = Dialect::new(DatabaseType::PostgreSQL);
        let my = Dialect::new(DatabaseType::MySQL);
        let lite = Dialect::new(DatabaseType::SQLite);

        assert_eq!(pg.drop_table_sql("t", true), "DROP TABLE IF EXISTS t CASCADE");
        assert_eq!(lite.drop_table_sql("t", true), "DROP TABLE IF EXISTS t");
        assert_eq!(my.rename_table_sql("a", "b"), "RENAME TABLE a TO b");
        assert_eq!(lite.rename_table_sql("a", "b"), "ALTER TABLE a RENAME TO b");
    }

    #[test]
    fn test_alter_support_checked_up_front() {
        let lite = Dialect::new(DatabaseType::SQLite);
        let actions = vec![
            AlterAction::AddColumn {
                column: ColumnDef::new("age", ColumnType::Integer),
            },
            AlterAction::ModifyColumn {
                column: ColumnDef::new("age", ColumnType::BigInt),
            },
        ];
        let err = lite.alter_table_sql("users", &actions).unwrap_err();
        assert!(matches!(err, DbError::UnsupportedFeature { .. }));

        let sql = lite.alter_table_sql("users", &actions[..1]).unwrap();
        assert_eq!(sql, vec!["ALTER TABLE users ADD COLUMN age INTEGER"]);
    }

    #[test]
    fn test_alter_postgres_combines_and_separates_renames() {
        let pg = Dialect::new(DatabaseType::PostgreSQL);
        let actions = vec![
            AlterAction::AlterColumn {
                name: "age".into(),
                changes: ColumnChanges {
                    column_type: Some(ColumnType::BigInt),
                    nullable: Some(false),
                    ..Default::default()
                },
            },
            AlterAction::DropColumn { name: "tmp".into() },
            AlterAction::RenameColumn {
                old_name: "mail".into(),
                new_name: "email".into(),
            },
        ];
        let sql = pg.alter_table_sql("users", &actions).unwrap();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE users ALTER COLUMN age TYPE BIGINT USING age::BIGINT, ALTER COLUMN age SET NOT NULL, DROP COLUMN tmp",
                "ALTER TABLE users RENAME COLUMN mail TO email",
            ]
        );
    }

    #[test]
    fn test_alter_mysql_single_statement() {
        let my = Dialect::new(DatabaseType::MySQL);
        let actions = vec![
            AlterAction::ModifyColumn {
                column: ColumnDef::new("name", ColumnType::Varchar)
                    .with_length(200)
                    .with_nullable(false),
            },
            AlterAction::RenameColumn {
                old_name: "a".into(),
                new_name: "b".into(),
            },
        ];
        let sql = my.alter_table_sql("t", &actions).unwrap();
        assert_eq!(
            sql,
            vec!["ALTER TABLE t MODIFY COLUMN name VARCHAR(200) NOT NULL, RENAME COLUMN a TO b"]
        );
    }

    #[test]
    fn test_index_sql_per_backend() {
        let idx = IndexDef::new("idx_email", vec!["email".into()])
            .with_unique(true)
            .with_index_type(IndexType::Hash);
        assert_eq!(
            Dialect::new(DatabaseType::PostgreSQL).create_index_sql("users", &idx),
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_email ON users USING hash (email)"
        );
        assert_eq!(
            Dialect::new(DatabaseType::MySQL).create_index_sql("users", &idx),
            "CREATE UNIQUE INDEX idx_email ON users (email)"
        );
        assert!(
            Dialect::new(DatabaseType::MySQL)
                .drop_index_sql("idx_email", None)
                .is_err()
        );
        assert_eq!(
            Dialect::new(DatabaseType::SQLite)
                .drop_index_sql("idx_email", None)
                .unwrap(),
            "DROP INDEX IF EXISTS idx_email"
        );
    }

    #[test]
    fn test_sqlite_rejects_foreign_key_alter() {
        let fk = ForeignKeyDef::new(vec!["user_id".into()], "users", vec!["id".into()]);
        let err = Dialect::new(DatabaseType::SQLite)
            .add_foreign_key_sql("posts", &fk)
            .unwrap_err();
        assert!(matches!(err, DbError::UnsupportedFeature { .. }));
        assert_eq!(
            Dialect::new(DatabaseType::MySQL)
                .drop_foreign_key_sql("posts", "fk_posts_user_id")
                .unwrap(),
            "ALTER TABLE posts DROP FOREIGN KEY fk_posts_user_id"
        );
    }

    #[test]
    fn test_view_sql() {
        assert_eq!(
            Dialect::new(DatabaseType::SQLite).create_view_sql("v", "SELECT 1", true),
            vec!["DROP VIEW IF EXISTS v", "CREATE VIEW v AS SELECT 1"]
        );
        assert_eq!(
            Dialect::new(DatabaseType::PostgreSQL).create_view_sql("v", "SELECT 1", true),
            vec!["CREATE OR REPLACE VIEW v AS SELECT 1"]
        );
    }

    #[test]
    fn test_where_clause_null_is_never_bound() {
        let pg = Dialect::new(DatabaseType::PostgreSQL);
        let filter = Filter::eq(values(&[
            ("deleted_at", json!(null)),
            ("email", json!("a@x.com")),
        ]));
        let (sql, params) = pg.where_clause(&filter, 0);
        assert_eq!(sql, " WHERE deleted_at IS NULL AND email = $1");
        assert_eq!(params, vec![QueryParam::String("a@x.com".into())]);
    }

    #[test]
    fn test_update_numbers_where_after_set() {
        let pg = Dialect::new(DatabaseType::PostgreSQL);
        let (sql, params) = pg.update_sql(
            "users",
            &values(&[("name", json!("b")), ("age", json!(3))]),
            &Filter::eq(values(&[("id", json!(7))])),
        );
        assert_eq!(sql, "UPDATE users SET name = $1, age = $2 WHERE id = $3");
        assert_eq!(params.len(), 3);

        let (sql, _) = pg.update_sql(
            "users",
            &values(&[("name", json!("b"))]),
            &Filter::raw("id = $1 AND note <> '$1'", vec![QueryParam::Int(1)]),
        );
        assert_eq!(sql, "UPDATE users SET name = $1 WHERE id = $2 AND note <> '$1'");
    }

    #[test]
    fn test_select_sql_offset_without_limit() {
        let opts = FindOptions::new().with_order_by("id").with_offset(5);
        let (sql, _) = Dialect::new(DatabaseType::SQLite).select_sql("t", &opts);
        assert_eq!(sql, "SELECT * FROM t ORDER BY id LIMIT -1 OFFSET 5");
        let (sql, _) = Dialect::new(DatabaseType::PostgreSQL).select_sql("t", &opts);
        assert_eq!(sql, "SELECT * FROM t ORDER BY id OFFSET 5");
    }

    #[test]
    fn test_upsert_sql_per_backend() {
        let data = values(&[("id", json!(1)), ("name", json!("a"))]);
        let keys = vec!["id".to_string()];

        let (pg, _) = Dialect::new(DatabaseType::PostgreSQL).upsert_sql("t", &data, &keys, None);
        assert_eq!(
            pg,
            "INSERT INTO t (id, name) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name RETURNING *"
        );
        let (lite, _) = Dialect::new(DatabaseType::SQLite).upsert_sql("t", &data, &keys, None);
        assert_eq!(
            lite,
            "INSERT INTO t (id, name) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET name = excluded.name"
        );
        let (my, _) = Dialect::new(DatabaseType::MySQL).upsert_sql("t", &data, &keys, None);
        assert_eq!(
            my,
            "INSERT INTO t (id, name) VALUES (?, ?) ON DUPLICATE KEY UPDATE name = VALUES(name)"
        );
    }

    #[test]
    fn test_split_script_respects_literals_and_comments() {
        let script = "CREATE TABLE t (v TEXT);\n-- a; comment\nINSERT INTO t VALUES ('a;b');\n\n;";
        let statements = Dialect::new(DatabaseType::SQLite).split_script(script);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "CREATE TABLE t (v TEXT)");
        assert!(statements[1].ends_with("INSERT INTO t VALUES ('a;b')"));
    }

    #[test]
    fn test_fallback_split() {
        let statements = split_on_semicolons("SELECT ';'; SELECT 2;");
        assert_eq!(statements, vec!["SELECT ';'", "SELECT 2"]);
    }

    #[test]
    fn test_page_sql() {
        let d = Dialect::new(DatabaseType::PostgreSQL);
        assert_eq!(
            d.page_sql("SELECT * FROM t;", 100, 200),
            "SELECT * FROM (SELECT * FROM t) AS _stream LIMIT 100 OFFSET 200"
        );
    }
}
