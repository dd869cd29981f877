//! Values flowing through the dependency graph.
//!
//! [`Value`] is a closed set of variants. Values cross runtime boundaries
//! either untouched (native regime) or through the envelope codec in
//! [`codec`].

mod codec;

use std::fmt;

use base64::Engine as _;
use indexmap::IndexMap;

use crate::error::{Error, Result};

pub use codec::{CodecError, Payload, Regime, pack, unpack};

/// Ordered map of named values.
pub type ValueMap = IndexMap<String, Value>;

/// A value held by a cell, an input, or a graph variable.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(ValueMap),
    Table(Table),
    Image(Image),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(table) => Some(table),
            _ => None,
        }
    }

    /// The envelope tag used for this variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Table(_) => "table",
            Value::Image(_) => "image",
        }
    }

    /// Plain JSON rendering, without envelope tags.
    ///
    /// Lossy for tables (rendered as an object of columns) and images
    /// (rendered as `{mime, data}` with base64 data).
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Integer(i) => Json::from(*i),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => Json::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Value::Table(table) => Json::Object(
                table
                    .columns()
                    .map(|(name, column)| {
                        (
                            name.to_string(),
                            Json::Array(column.iter().map(Value::to_json).collect()),
                        )
                    })
                    .collect(),
            ),
            Value::Image(image) => serde_json::json!({
                "mime": image.mime,
                "data": image.to_base64(),
            }),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Boolean(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Table> for Value {
    fn from(table: Table) -> Self {
        Value::Table(table)
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Table(table) => write!(
                f,
                "table({} columns x {} rows)",
                table.column_count(),
                table.row_count()
            ),
            Value::Image(image) => write!(f, "image({}, {} bytes)", image.mime, image.data.len()),
            Value::Array(_) | Value::Object(_) => write!(f, "{}", self.to_json()),
        }
    }
}

/// Column-oriented tabular data with equal-length columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: IndexMap<String, Vec<Value>>,
    rows: usize,
}

impl Table {
    /// Build a table, rejecting columns of unequal length.
    pub fn new(columns: IndexMap<String, Vec<Value>>) -> Result<Self> {
        let mut rows = None;
        for (name, column) in &columns {
            match rows {
                None => rows = Some(column.len()),
                Some(expected) if expected != column.len() => {
                    return Err(Error::InvalidTable(format!(
                        "column '{}' has {} rows, expected {}",
                        name,
                        column.len(),
                        expected
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            columns,
            rows: rows.unwrap_or(0),
        })
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Columns in their defined order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.columns
            .iter()
            .map(|(name, column)| (name.as_str(), column.as_slice()))
    }
}

/// An encoded image such as a plot rendered by a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub mime: String,
    pub data: Vec<u8>,
}

impl Image {
    pub fn new(mime: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            data,
        }
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    pub fn from_base64(mime: impl Into<String>, encoded: &str) -> std::result::Result<Self, base64::DecodeError> {
        let data = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        Ok(Self::new(mime, data))
    }
}
