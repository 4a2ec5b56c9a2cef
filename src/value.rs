use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Value as seen by callers, after type conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Date(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Date(_) => "date",
            Value::Json(_) => "json",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "{}", s),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
            Value::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Value::Json(j) => write!(f, "{}", j),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Canonical text form of a stored date: RFC 3339, millisecond precision, `Z`.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Value in the storage engine's own representation.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Pass-through mapping used when no converter is registered.
    pub fn into_value(self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(i) => Value::Integer(i),
            SqlValue::Real(r) => Value::Real(r),
            SqlValue::Text(s) => Value::Text(s),
            SqlValue::Blob(b) => Value::Blob(b),
        }
    }

    /// JSON form used when rows are shipped to the engine as a JSON array.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SqlValue::Null => serde_json::Value::Null,
            SqlValue::Integer(i) => serde_json::Value::from(*i),
            SqlValue::Real(r) => serde_json::Number::from_f64(*r)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            SqlValue::Text(s) => serde_json::Value::String(s.clone()),
            // Blob rows never take the JSON path.
            SqlValue::Blob(_) => serde_json::Value::Null,
        }
    }
}

/// Column values supplied for an insert or update.
pub type Values = HashMap<String, Value>;

/// Build a [`Values`] map from `(column, value)` pairs.
pub fn values<K, V, I>(pairs: I) -> Values
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Raw row as returned by a backend, before type conversion.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawRow {
    pub columns: Vec<String>,
    pub values: Vec<SqlValue>,
}

/// Row after result mapping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryRow {
    columns: Vec<(String, Value)>,
}

impl QueryRow {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
        }
    }

    pub fn insert(&mut self, key: String, value: Value) {
        if let Some(slot) = self.columns.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.columns.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.columns.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_date(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.get(key) {
            Some(Value::Date(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn get_json(&self, key: &str) -> Option<&serde_json::Value> {
        match self.get(key) {
            Some(Value::Json(j)) => Some(j),
            _ => None,
        }
    }

    pub fn get_blob(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(Value::Blob(b)) => Some(b),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Columns and values as an unordered map.
    pub fn into_values(self) -> Values {
        self.columns.into_iter().collect()
    }
}

/// One mapped result: a full row, or the bare value under scalar projection.
#[derive(Debug, Clone, PartialEq)]
pub enum MappedRow {
    Row(QueryRow),
    Scalar(Value),
}

impl MappedRow {
    pub fn as_row(&self) -> Option<&QueryRow> {
        match self {
            MappedRow::Row(row) => Some(row),
            MappedRow::Scalar(_) => None,
        }
    }

    pub fn into_row(self) -> Option<QueryRow> {
        match self {
            MappedRow::Row(row) => Some(row),
            MappedRow::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            MappedRow::Scalar(v) => Some(v),
            MappedRow::Row(_) => None,
        }
    }

    pub fn into_scalar(self) -> Option<Value> {
        match self {
            MappedRow::Scalar(v) => Some(v),
            MappedRow::Row(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_row_preserves_order() {
        let mut row = QueryRow::new();
        row.insert("id".to_string(), Value::Integer(1));
        row.insert("name".to_string(), Value::from("a"));
        row.insert("id".to_string(), Value::Integer(2));

        let keys: Vec<&str> = row.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["id", "name"]);
        assert_eq!(row.get_i64("id"), Some(2));
        assert_eq!(row.get_string("name"), Some("a".to_string()));
        assert_eq!(row.get_bool("name"), None);
    }

    #[test]
    fn test_values_helper() {
        let v = values([("name", Value::from("a")), ("count", Value::from(3))]);
        assert_eq!(v.get("count"), Some(&Value::Integer(3)));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_sql_value_to_json() {
        assert_eq!(SqlValue::Integer(4).to_json(), serde_json::json!(4));
        assert_eq!(SqlValue::Text("x".into()).to_json(), serde_json::json!("x"));
        assert_eq!(SqlValue::Null.to_json(), serde_json::Value::Null);
    }
}
