//! Query-related data models.
//!
//! `QueryResult` is the single return shape for mutating, DDL and raw
//! execution paths; statement failures are carried as data in it.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One result row: column name to value, in select-list order.
pub type Row = serde_json::Map<String, JsonValue>;

/// Column/value pairs used for INSERT data, SET clauses and equality filters.
pub type Values = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Structured value bound as JSON (text on SQLite)
    Json(JsonValue),
}

impl QueryParam {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }

    /// JSON rendering, used for cache keys and echoed rows.
    pub fn to_json(&self) -> JsonValue {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int(v) => JsonValue::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::String(v) => JsonValue::String(v.clone()),
            Self::Bytes(v) => JsonValue::String(STANDARD.encode(v)),
            Self::Json(v) => v.clone(),
        }
    }
}

impl From<&JsonValue> for QueryParam {
    fn from(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => Self::String(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    pub affected_rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
    pub rows: Vec<Row>,
    /// Present iff `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Successful statement with the given affected row count.
    pub fn ok(affected_rows: u64, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            affected_rows,
            last_insert_id: None,
            rows: Vec::new(),
            error: None,
            execution_time_ms,
        }
    }

    /// Failed statement; the message is kept for the caller to inspect.
    pub fn failure(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            affected_rows: 0,
            last_insert_id: None,
            rows: Vec::new(),
            error: Some(error.into()),
            execution_time_ms,
        }
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    pub fn with_last_insert_id(mut self, id: Option<i64>) -> Self {
        self.last_insert_id = id;
        self
    }

    pub fn first_row(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// WHERE clause of a DML call.
///
/// The equality-map and raw-fragment styles are mutually exclusive per call.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Filter {
    /// No WHERE clause.
    #[default]
    All,
    /// `col = ?` for each pair, joined with AND; null values become `IS NULL`.
    Eq(Values),
    /// Raw fragment with positional parameters in the backend's placeholder style.
    Raw {
        clause: String,
        params: Vec<QueryParam>,
    },
}

impl Filter {
    pub fn eq(values: Values) -> Self {
        Self::Eq(values)
    }

    pub fn raw(clause: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self::Raw {
            clause: clause.into(),
            params,
        }
    }

    pub fn is_all(&self) -> bool {
        match self {
            Self::All => true,
            Self::Eq(values) => values.is_empty(),
            Self::Raw { clause, .. } => clause.trim().is_empty(),
        }
    }
}

impl From<Values> for Filter {
    fn from(values: Values) -> Self {
        Self::Eq(values)
    }
}

/// Options for `find_one` / `find_many`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub filter: Filter,
    /// Projection; `None` selects `*`.
    pub columns: Option<Vec<String>>,
    /// Raw ORDER BY expression, e.g. `"created_at DESC"`.
    pub order_by: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: impl Into<Filter>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(QueryParam::from("hello").type_name(), "string");
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
    }

    #[test]
    fn test_query_param_from_json() {
        assert_eq!(QueryParam::from(&json!(7)), QueryParam::Int(7));
        assert_eq!(QueryParam::from(&json!(1.5)), QueryParam::Float(1.5));
        assert_eq!(QueryParam::from(&json!(null)), QueryParam::Null);
        assert_eq!(
            QueryParam::from(&json!({"a": 1})),
            QueryParam::Json(json!({"a": 1}))
        );
    }

    #[test]
    fn test_query_result_failure_carries_error() {
        let result = QueryResult::failure("no such table: t", 3);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no such table: t"));

        let ok = QueryResult::ok(2, 1);
        assert!(ok.success);
        assert!(ok.error.is_none());
    }

    #[test]
    fn test_filter_is_all() {
        assert!(Filter::All.is_all());
        assert!(Filter::eq(Values::new()).is_all());
        assert!(!Filter::raw("id > ?", vec![QueryParam::Int(1)]).is_all());
    }

    #[test]
    fn test_find_options_builder() {
        let mut values = Values::new();
        values.insert("active".into(), json!(true));
        let opts = FindOptions::new()
            .with_filter(values)
            .with_columns(["id", "email"])
            .with_order_by("id DESC")
            .with_limit(10);
        assert!(matches!(opts.filter, Filter::Eq(_)));
        assert_eq!(opts.columns.as_ref().map(Vec::len), Some(2));
        assert_eq!(opts.limit, Some(10));
        assert!(opts.offset.is_none());
    }
}
