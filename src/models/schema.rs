//! Schema definition models.
//!
//! Value types describing columns, indexes, foreign keys and tables. They are
//! built by callers for DDL and filled in by catalog introspection.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};

/// Logical column type, mapped to a native type name per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    BigInt,
    SmallInt,
    Float,
    Double,
    Decimal,
    Varchar,
    Text,
    Char,
    Boolean,
    Date,
    Time,
    DateTime,
    Timestamp,
    Blob,
    Binary,
    Json,
    Uuid,
}

impl ColumnType {
    /// Infer the logical type from a native catalog type name.
    ///
    /// Lossy by nature: SQLite storage classes collapse several logical
    /// types into one, so `INTEGER` always comes back as `Integer`.
    pub fn from_native(native: &str) -> Self {
        let lower = native.trim().to_lowercase();
        if lower == "tinyint(1)" {
            return Self::Boolean;
        }
        let base = lower.split('(').next().unwrap_or("").trim();

        match base {
            "bigint" | "int8" | "bigserial" => Self::BigInt,
            "smallint" | "int2" | "smallserial" => Self::SmallInt,
            "bool" | "boolean" => Self::Boolean,
            "double" | "double precision" | "float8" => Self::Double,
            "real" | "float" | "float4" => Self::Float,
            "decimal" | "numeric" => Self::Decimal,
            "varchar" | "character varying" | "nvarchar" => Self::Varchar,
            "char" | "character" | "bpchar" | "nchar" => Self::Char,
            "date" => Self::Date,
            "datetime" => Self::DateTime,
            "json" | "jsonb" => Self::Json,
            "uuid" => Self::Uuid,
            "bytea" => Self::Blob,
            "binary" | "varbinary" => Self::Binary,
            _ if base.starts_with("timestamp") => Self::Timestamp,
            _ if base.starts_with("time") => Self::Time,
            _ if base.ends_with("blob") => Self::Blob,
            _ if base.ends_with("text") => Self::Text,
            _ if base.contains("int") || base.contains("serial") => Self::Integer,
            _ => Self::Text,
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::BigInt => "bigint",
            Self::SmallInt => "smallint",
            Self::Float => "float",
            Self::Double => "double",
            Self::Decimal => "decimal",
            Self::Varchar => "varchar",
            Self::Text => "text",
            Self::Char => "char",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Time => "time",
            Self::DateTime => "datetime",
            Self::Timestamp => "timestamp",
            Self::Blob => "blob",
            Self::Binary => "binary",
            Self::Json => "json",
            Self::Uuid => "uuid",
        };
        f.write_str(name)
    }
}

/// Column default as written in DDL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Raw SQL expression emitted verbatim, e.g. `CURRENT_TIMESTAMP`.
    Expression { expression: String },
    Text(String),
}

impl DefaultValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn expression(expression: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Type name as reported by the catalog; only set on introspected columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_type: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ColumnDef {
    /// Create a nullable column with no constraints.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default: None,
            primary_key: false,
            auto_increment: false,
            unique: false,
            length: None,
            precision: None,
            scale: None,
            comment: None,
            native_type: None,
        }
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Primary key columns are never nullable.
    pub fn with_primary_key(mut self, primary_key: bool) -> Self {
        self.primary_key = primary_key;
        if primary_key {
            self.nullable = false;
        }
        self
    }

    pub fn with_auto_increment(mut self, auto_increment: bool) -> Self {
        self.auto_increment = auto_increment;
        self
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Set the length (VARCHAR/CHAR).
    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    /// Set precision and scale (DECIMAL).
    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_native_type(mut self, native_type: impl Into<String>) -> Self {
        self.native_type = Some(native_type.into());
        self
    }
}

/// Index access method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    #[default]
    BTree,
    Hash,
    Gin,
    Gist,
}

impl IndexType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::BTree => "btree",
            Self::Hash => "hash",
            Self::Gin => "gin",
            Self::Gist => "gist",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "hash" => Self::Hash,
            "gin" => Self::Gin,
            "gist" => Self::Gist,
            _ => Self::BTree,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub index_type: IndexType,
    /// Owning table; filled in when the index is created standalone or introspected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            unique: false,
            index_type: IndexType::BTree,
            table: None,
        }
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn with_index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type;
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

/// Foreign key referential action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyAction {
    NoAction,
    #[default]
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ForeignKeyAction {
    /// Parse from a catalog rule string ("CASCADE", "SET NULL", ...).
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "CASCADE" => Self::Cascade,
            "SET NULL" => Self::SetNull,
            "SET DEFAULT" => Self::SetDefault,
            "NO ACTION" => Self::NoAction,
            _ => Self::Restrict,
        }
    }
}

impl std::fmt::Display for ForeignKeyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAction => write!(f, "NO ACTION"),
            Self::Restrict => write!(f, "RESTRICT"),
            Self::Cascade => write!(f, "CASCADE"),
            Self::SetNull => write!(f, "SET NULL"),
            Self::SetDefault => write!(f, "SET DEFAULT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
    #[serde(default)]
    pub on_delete: ForeignKeyAction,
    #[serde(default)]
    pub on_update: ForeignKeyAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ForeignKeyDef {
    pub fn new(
        columns: Vec<String>,
        ref_table: impl Into<String>,
        ref_columns: Vec<String>,
    ) -> Self {
        Self {
            columns,
            ref_table: ref_table.into(),
            ref_columns,
            on_delete: ForeignKeyAction::Restrict,
            on_update: ForeignKeyAction::Restrict,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn with_on_update(mut self, action: ForeignKeyAction) -> Self {
        self.on_update = action;
        self
    }

    /// Constraint name, falling back to `fk_{table}_{columns}`.
    pub fn constraint_name(&self, table: &str) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("fk_{}_{}", table, self.columns.join("_")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Explicit primary key; when empty, columns flagged `primary_key` are used.
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default = "default_true")]
    pub if_not_exists: bool,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            comment: None,
            if_not_exists: true,
        }
    }

    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self.mark_primary_key_not_null();
        self
    }

    /// Composite primary key; the named columns become non-nullable.
    pub fn with_primary_key(mut self, columns: Vec<String>) -> Self {
        self.primary_key = columns;
        self.mark_primary_key_not_null();
        self
    }

    fn mark_primary_key_not_null(&mut self) {
        for column in &mut self.columns {
            if self.primary_key.contains(&column.name) {
                column.nullable = false;
            }
        }
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_foreign_key(mut self, foreign_key: ForeignKeyDef) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_if_not_exists(mut self, if_not_exists: bool) -> Self {
        self.if_not_exists = if_not_exists;
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Effective primary key column names.
    pub fn primary_key_columns(&self) -> Vec<String> {
        if !self.primary_key.is_empty() {
            return self.primary_key.clone();
        }
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Check structural invariants before any SQL is generated.
    pub fn validate(&self) -> DbResult<()> {
        if self.name.trim().is_empty() {
            return Err(DbError::schema("Table name cannot be empty", ""));
        }
        if self.columns.is_empty() {
            return Err(DbError::schema(
                "Table must define at least one column",
                &self.name,
            ));
        }
        for pk in &self.primary_key {
            if self.column(pk).is_none() {
                return Err(DbError::schema(
                    format!("Primary key column '{}' is not defined", pk),
                    &self.name,
                ));
            }
        }
        for fk in &self.foreign_keys {
            if fk.columns.len() != fk.ref_columns.len() || fk.columns.is_empty() {
                return Err(DbError::schema(
                    format!(
                        "Foreign key to '{}' must map the same number of columns",
                        fk.ref_table
                    ),
                    &self.name,
                ));
            }
        }
        Ok(())
    }
}

/// Changes applied by a PostgreSQL-style `ALTER COLUMN`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_type: Option<ColumnType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    #[serde(default)]
    pub drop_default: bool,
}

impl ColumnChanges {
    pub fn is_empty(&self) -> bool {
        self.column_type.is_none()
            && self.nullable.is_none()
            && self.default.is_none()
            && !self.drop_default
    }
}

/// One step of an `ALTER TABLE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AlterAction {
    AddColumn { column: ColumnDef },
    DropColumn { name: String },
    /// Redefine a column in place (MySQL `MODIFY COLUMN`).
    ModifyColumn { column: ColumnDef },
    /// Change type, nullability or default (PostgreSQL `ALTER COLUMN`).
    AlterColumn { name: String, changes: ColumnChanges },
    RenameColumn { old_name: String, new_name: String },
}

impl AlterAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddColumn { .. } => "add",
            Self::DropColumn { .. } => "drop",
            Self::ModifyColumn { .. } => "modify",
            Self::AlterColumn { .. } => "alter",
            Self::RenameColumn { .. } => "rename",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// Relationship between two tables, described by the keys that join them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    pub relation_type: RelationType,
    pub target_table: String,
    pub foreign_key: String,
    #[serde(default = "default_local_key")]
    pub local_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot_table: Option<String>,
}

fn default_local_key() -> String {
    "id".to_string()
}

impl RelationDef {
    pub fn new(
        name: impl Into<String>,
        relation_type: RelationType,
        target_table: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            relation_type,
            target_table: target_table.into(),
            foreign_key: foreign_key.into(),
            local_key: default_local_key(),
            pivot_table: None,
        }
    }

    pub fn with_local_key(mut self, local_key: impl Into<String>) -> Self {
        self.local_key = local_key.into();
        self
    }

    pub fn with_pivot_table(mut self, pivot_table: impl Into<String>) -> Self {
        self.pivot_table = Some(pivot_table.into());
        self
    }

    /// Foreign key constraint implied by the relation on the owning side.
    ///
    /// Only `ManyToOne` and `OneToOne` keep the key on the local table;
    /// the other kinds place it on the target or pivot table.
    pub fn to_foreign_key(&self) -> Option<ForeignKeyDef> {
        match self.relation_type {
            RelationType::ManyToOne | RelationType::OneToOne => Some(ForeignKeyDef::new(
                vec![self.foreign_key.clone()],
                &self.target_table,
                vec![self.local_key.clone()],
            )),
            RelationType::OneToMany | RelationType::ManyToMany => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_from_native() {
        assert_eq!(ColumnType::from_native("INTEGER"), ColumnType::Integer);
        assert_eq!(ColumnType::from_native("int(11)"), ColumnType::Integer);
        assert_eq!(ColumnType::from_native("tinyint(1)"), ColumnType::Boolean);
        assert_eq!(
            ColumnType::from_native("character varying(50)"),
            ColumnType::Varchar
        );
        assert_eq!(ColumnType::from_native("VARCHAR(50)"), ColumnType::Varchar);
        assert_eq!(
            ColumnType::from_native("timestamp without time zone"),
            ColumnType::Timestamp
        );
        assert_eq!(ColumnType::from_native("datetime"), ColumnType::DateTime);
        assert_eq!(ColumnType::from_native("jsonb"), ColumnType::Json);
        assert_eq!(ColumnType::from_native("mediumtext"), ColumnType::Text);
        assert_eq!(ColumnType::from_native("longblob"), ColumnType::Blob);
        assert_eq!(ColumnType::from_native("double precision"), ColumnType::Double);
    }

    #[test]
    fn test_table_def_validate_rejects_unknown_primary_key() {
        let table = TableDef::new("users")
            .with_column(ColumnDef::new("id", ColumnType::Integer))
            .with_primary_key(vec!["uid".to_string()]);
        let err = table.validate().unwrap_err();
        assert!(matches!(err, DbError::Schema { .. }));
        assert!(err.to_string().contains("uid"));
    }

    #[test]
    fn test_primary_key_columns_fall_back_to_flags() {
        let table = TableDef::new("users")
            .with_column(ColumnDef::new("id", ColumnType::Integer).with_primary_key(true))
            .with_column(ColumnDef::new("email", ColumnType::Varchar));
        assert_eq!(table.primary_key_columns(), vec!["id".to_string()]);
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_primary_key_columns_are_not_nullable() {
        let column = ColumnDef::new("id", ColumnType::Integer).with_primary_key(true);
        assert!(!column.nullable);

        let table = TableDef::new("memberships")
            .with_primary_key(vec!["user_id".to_string(), "group_id".to_string()])
            .with_column(ColumnDef::new("user_id", ColumnType::Integer))
            .with_column(ColumnDef::new("group_id", ColumnType::Integer))
            .with_column(ColumnDef::new("note", ColumnType::Text));
        assert!(!table.column("user_id").unwrap().nullable);
        assert!(!table.column("group_id").unwrap().nullable);
        assert!(table.column("note").unwrap().nullable);
    }

    #[test]
    fn test_column_def_deserialize_defaults() {
        let col: ColumnDef =
            serde_json::from_str(r#"{"name": "active", "column_type": "boolean", "default": true}"#)
                .unwrap();
        assert!(col.nullable);
        assert_eq!(col.default, Some(DefaultValue::Bool(true)));

        let col: ColumnDef = serde_json::from_str(
            r#"{"name": "created", "column_type": "timestamp", "default": {"expression": "CURRENT_TIMESTAMP"}}"#,
        )
        .unwrap();
        assert_eq!(
            col.default,
            Some(DefaultValue::expression("CURRENT_TIMESTAMP"))
        );
    }

    #[test]
    fn test_alter_action_tagged_serde() {
        let action: AlterAction =
            serde_json::from_str(r#"{"action": "drop_column", "name": "legacy"}"#).unwrap();
        assert_eq!(action.kind(), "drop");
    }

    #[test]
    fn test_foreign_key_constraint_name() {
        let fk = ForeignKeyDef::new(vec!["user_id".into()], "users", vec!["id".into()]);
        assert_eq!(fk.constraint_name("orders"), "fk_orders_user_id");
        assert_eq!(fk.on_delete, ForeignKeyAction::Restrict);
        assert_eq!(ForeignKeyAction::parse("set null"), ForeignKeyAction::SetNull);
    }

    #[test]
    fn test_relation_to_foreign_key() {
        let rel = RelationDef::new("author", RelationType::ManyToOne, "users", "author_id");
        let fk = rel.to_foreign_key().unwrap();
        assert_eq!(fk.columns, vec!["author_id".to_string()]);
        assert_eq!(fk.ref_columns, vec!["id".to_string()]);

        let rel = RelationDef::new("tags", RelationType::ManyToMany, "tags", "tag_id")
            .with_pivot_table("post_tags");
        assert!(rel.to_foreign_key().is_none());
    }
}
