//! Result mapping and type conversion.
//!
//! Values cross the storage boundary through a [`ConverterRegistry`]: on the
//! way in, a semantic [`Value`] becomes a [`SqlValue`]; on the way out, each
//! raw column is converted according to the semantic type the compiler
//! inferred for it.

use crate::compiler::{CompiledQuery, OutputColumn};
use crate::ddl;
use crate::error::{OrmError, Result};
use crate::schema::ColumnType;
use crate::value::{format_date, MappedRow, QueryRow, RawRow, SqlValue, Value};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Converts one semantic type to and from its storage form.
pub trait TypeConverter: Send + Sync {
    fn to_sql(&self, value: &Value) -> Result<SqlValue>;

    /// Never called with `SqlValue::Null`.
    fn from_sql(&self, value: SqlValue) -> Result<Value>;
}

/// Booleans stored as 0/1.
#[derive(Debug, Default, Clone, Copy)]
pub struct BooleanConverter;

impl TypeConverter for BooleanConverter {
    fn to_sql(&self, value: &Value) -> Result<SqlValue> {
        match value {
            Value::Bool(b) => Ok(SqlValue::Integer(*b as i64)),
            other => Ok(passthrough(other)),
        }
    }

    fn from_sql(&self, value: SqlValue) -> Result<Value> {
        match value {
            SqlValue::Integer(i) => Ok(Value::Bool(i != 0)),
            SqlValue::Real(r) => Ok(Value::Bool(r != 0.0)),
            SqlValue::Text(s) => match s.as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(OrmError::conversion(format!("not a boolean: {:?}", s))),
            },
            other => Err(OrmError::conversion(format!(
                "not a boolean: {}",
                describe(&other)
            ))),
        }
    }
}

/// Dates stored as RFC 3339 text in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct DateConverter;

impl TypeConverter for DateConverter {
    fn to_sql(&self, value: &Value) -> Result<SqlValue> {
        match value {
            Value::Date(d) => Ok(SqlValue::Text(format_date(d))),
            other => Ok(passthrough(other)),
        }
    }

    fn from_sql(&self, value: SqlValue) -> Result<Value> {
        match value {
            SqlValue::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|d| Value::Date(d.with_timezone(&Utc)))
                .map_err(|e| OrmError::conversion(format!("malformed date {:?}: {}", s, e))),
            SqlValue::Integer(ms) => DateTime::from_timestamp_millis(ms)
                .map(Value::Date)
                .ok_or_else(|| OrmError::conversion(format!("timestamp out of range: {}", ms))),
            other => Err(OrmError::conversion(format!(
                "not a date: {}",
                describe(&other)
            ))),
        }
    }
}

/// Structured values stored as JSON text (selected through `json()`).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonConverter;

impl TypeConverter for JsonConverter {
    fn to_sql(&self, value: &Value) -> Result<SqlValue> {
        match value {
            Value::Null => Ok(SqlValue::Null),
            Value::Json(j) => Ok(SqlValue::Text(j.to_string())),
            other => Ok(SqlValue::Text(ddl::json_value(other).to_string())),
        }
    }

    fn from_sql(&self, value: SqlValue) -> Result<Value> {
        match value {
            SqlValue::Text(s) => serde_json::from_str(&s)
                .map(Value::Json)
                .map_err(|e| OrmError::conversion(format!("malformed JSON: {}", e))),
            SqlValue::Integer(i) => Ok(Value::Json(i.into())),
            SqlValue::Real(r) => Ok(Value::Json(
                serde_json::Number::from_f64(r)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
            )),
            other => Err(OrmError::conversion(format!(
                "not JSON: {}",
                describe(&other)
            ))),
        }
    }
}

fn describe(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(i) => format!("integer {}", i),
        SqlValue::Real(r) => format!("real {}", r),
        SqlValue::Text(s) => format!("text {:?}", s),
        SqlValue::Blob(b) => format!("blob of {} bytes", b.len()),
    }
}

/// Storage form used when no converter is registered for a value's type.
fn passthrough(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(r) => SqlValue::Real(*r),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
        Value::Date(d) => SqlValue::Text(format_date(d)),
        Value::Json(j) => SqlValue::Text(j.to_string()),
    }
}

fn value_type(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(ColumnType::Boolean),
        Value::Integer(_) => Some(ColumnType::Integer),
        Value::Real(_) => Some(ColumnType::Real),
        Value::Text(_) => Some(ColumnType::Text),
        Value::Blob(_) => Some(ColumnType::Blob),
        Value::Date(_) => Some(ColumnType::Date),
        Value::Json(_) => Some(ColumnType::Json),
    }
}

/// Converters keyed by semantic column type.
#[derive(Clone)]
pub struct ConverterRegistry {
    converters: HashMap<ColumnType, Arc<dyn TypeConverter>>,
    customized: bool,
}

impl ConverterRegistry {
    /// Registry with the boolean, date and JSON converters.
    pub fn new() -> Self {
        let mut converters: HashMap<ColumnType, Arc<dyn TypeConverter>> = HashMap::new();
        converters.insert(ColumnType::Boolean, Arc::new(BooleanConverter));
        converters.insert(ColumnType::Date, Arc::new(DateConverter));
        converters.insert(ColumnType::Json, Arc::new(JsonConverter));
        Self {
            converters,
            customized: false,
        }
    }

    /// Registry without converters; every value passes through.
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
            customized: true,
        }
    }

    /// Replace the converter for `column_type`.
    pub fn register(&mut self, column_type: ColumnType, converter: impl TypeConverter + 'static) {
        self.converters.insert(column_type, Arc::new(converter));
        self.customized = true;
    }

    pub fn get(&self, column_type: ColumnType) -> Option<&Arc<dyn TypeConverter>> {
        self.converters.get(&column_type)
    }

    /// Whether the registry differs from the built-in set. Bulk inserts
    /// serialize values directly and are only used when it does not.
    pub fn is_customized(&self) -> bool {
        self.customized
    }

    /// Storage form of a parameter, chosen by the value's own type.
    pub fn to_sql(&self, value: &Value) -> Result<SqlValue> {
        match value_type(value).and_then(|t| self.converters.get(&t)) {
            Some(converter) => converter.to_sql(value),
            None => Ok(passthrough(value)),
        }
    }

    /// Semantic form of a stored value of a column of `column_type`.
    pub fn from_sql(&self, column_type: Option<ColumnType>, value: SqlValue) -> Result<Value> {
        if matches!(value, SqlValue::Null) {
            return Ok(Value::Null);
        }
        match column_type.and_then(|t| self.converters.get(&t)) {
            Some(converter) => converter.from_sql(value),
            None => Ok(value.into_value()),
        }
    }

    pub fn params(&self, values: &[Value]) -> Result<Vec<SqlValue>> {
        values.iter().map(|v| self.to_sql(v)).collect()
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.converters.keys().map(ColumnType::name).collect();
        types.sort_unstable();
        f.debug_struct("ConverterRegistry")
            .field("types", &types)
            .field("customized", &self.customized)
            .finish()
    }
}

/// Maps raw rows to caller-facing rows.
#[derive(Debug, Clone, Default)]
pub struct ResultMapper {
    registry: ConverterRegistry,
}

impl ResultMapper {
    pub fn new(registry: ConverterRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConverterRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ConverterRegistry {
        &mut self.registry
    }

    /// Map one raw row. Output columns line up with raw columns by
    /// position; when they don't (hand-written SQL), values pass through.
    pub fn map_row(&self, raw: RawRow, outputs: &[OutputColumn], scalar: bool) -> Result<MappedRow> {
        let typed = outputs.len() == raw.values.len();
        let mut row = QueryRow::new();
        for (index, (name, value)) in raw.columns.into_iter().zip(raw.values).enumerate() {
            let column_type = if typed { outputs[index].column_type } else { None };
            let value = self.registry.from_sql(column_type, value).map_err(|e| match e {
                OrmError::TypeConversion(msg) => {
                    OrmError::TypeConversion(format!("column {}: {}", name, msg))
                }
                other => other,
            })?;
            if scalar {
                return Ok(MappedRow::Scalar(value));
            }
            let name = if typed { outputs[index].name.clone() } else { name };
            row.insert(name, value);
        }
        if scalar {
            return Ok(MappedRow::Scalar(Value::Null));
        }
        Ok(MappedRow::Row(row))
    }

    pub fn map_rows(&self, rows: Vec<RawRow>, query: &CompiledQuery) -> Result<Vec<MappedRow>> {
        rows.into_iter()
            .map(|raw| self.map_row(raw, &query.columns, query.scalar))
            .collect()
    }
}
