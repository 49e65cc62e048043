/// Tagged values for bound parameters and result rows
///
/// Parameters are always passed to the backing store out-of-band as [`Value`]s,
/// never interpolated into query text. Rows come back as ordered
/// `(column, Value)` pairs and are mapped to domain types through [`FromRow`],
/// so a shape mismatch is a [`DecodeError`] rather than a silent null.
///
/// # Example
///
/// ```
/// use storefront_shared::db::value::{FromRow, Row, Value};
/// use storefront_shared::db::error::DecodeError;
///
/// struct Sku {
///     code: String,
///     stock: i64,
/// }
///
/// impl FromRow for Sku {
///     fn from_row(row: &Row) -> Result<Self, DecodeError> {
///         Ok(Sku {
///             code: row.get("code")?,
///             stock: row.get("stock")?,
///         })
///     }
/// }
///
/// let mut row = Row::new();
/// row.push("code", Value::from("TSHIRT-M"));
/// row.push("stock", Value::Int(4));
///
/// let sku = Sku::from_row(&row).unwrap();
/// assert_eq!(sku.stock, 4);
/// ```

use crate::db::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single parameter or cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    /// Short type name used in decode errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::Timestamp(_) => "timestamp",
            Value::Json(_) => "json",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
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
        Value::Bytes(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
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

/// Conversion from a cell value into a Rust type
pub trait FromValue: Sized {
    /// Name reported in [`DecodeError::TypeMismatch`]
    const EXPECTED: &'static str;

    /// Returns `None` when the value has the wrong type
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_from_value {
    ($ty:ty, $expected:literal, $($pat:pat => $out:expr),+ $(,)?) => {
        impl FromValue for $ty {
            const EXPECTED: &'static str = $expected;

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    $($pat => Some($out),)+
                    _ => None,
                }
            }
        }
    };
}

impl_from_value!(bool, "bool", Value::Bool(v) => *v);
impl_from_value!(i64, "int", Value::Int(v) => *v);
impl_from_value!(f64, "float", Value::Float(v) => *v, Value::Int(v) => *v as f64);
impl_from_value!(String, "text", Value::Text(v) => v.clone());
impl_from_value!(Vec<u8>, "bytes", Value::Bytes(v) => v.clone());
impl_from_value!(Uuid, "uuid", Value::Uuid(v) => *v);
impl_from_value!(DateTime<Utc>, "timestamp", Value::Timestamp(v) => *v);
impl_from_value!(serde_json::Value, "json", Value::Json(v) => v.clone());

impl FromValue for i32 {
    const EXPECTED: &'static str = "int4";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// One result row: ordered column names and values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: Vec::with_capacity(capacity),
        }
    }

    /// Appends a column, keeping insertion order
    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        self.columns.push((column.into(), value));
    }

    /// Raw value of a column
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Typed value of a column
    ///
    /// # Errors
    ///
    /// - [`DecodeError::MissingColumn`] if the column is absent
    /// - [`DecodeError::TypeMismatch`] if the value has another type
    ///   (including NULL for a non-`Option` target)
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T, DecodeError> {
        let value = self
            .value(column)
            .ok_or_else(|| DecodeError::MissingColumn(column.to_string()))?;

        T::from_value(value).ok_or_else(|| DecodeError::TypeMismatch {
            column: column.to_string(),
            expected: T::EXPECTED,
            found: value.type_name(),
        })
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Row {
            columns: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Maps a whole row onto a domain type
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self, DecodeError> {
        Ok(row.clone())
    }
}
