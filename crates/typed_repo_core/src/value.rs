//! Typed scalar values shared by the catalog, predicates and row mapping.
//!
//! # Responsibility
//! - Define the closed set of value shapes the engine binds and reads.
//! - Convert between engine values and SQLite storage values.
//!
//! # Invariants
//! - `Value::List` only appears as an `In` operand, never as a column value.
//! - Booleans are stored as `0`/`1` integers.

use crate::repo::error::{RepoError, RepoResult};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Declared type of an entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    Text,
    Boolean,
}

impl FieldType {
    /// Value a freshly constructed entity carries for this type.
    pub fn default_value(self) -> Value {
        match self {
            Self::Integer => Value::Integer(0),
            Self::Text => Value::Text(String::new()),
            Self::Boolean => Value::Boolean(false),
        }
    }

    /// Returns whether `value` can be compared against a field of this type.
    ///
    /// `Null` is accepted for every type.
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (Self::Integer, Value::Integer(_))
                | (Self::Text, Value::Text(_))
                | (Self::Boolean, Value::Boolean(_))
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Text => "text",
            Self::Boolean => "boolean",
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-level value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
    Boolean(bool),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short type label used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Text(_) => "text",
            Self::Boolean(_) => "boolean",
            Self::List(_) => "list",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Converts into a bindable SQLite value.
    ///
    /// # Errors
    /// - `InvalidQuery` for `List`, which must be expanded by the caller.
    pub(crate) fn to_sql(&self) -> RepoResult<SqlValue> {
        match self {
            Self::Null => Ok(SqlValue::Null),
            Self::Integer(value) => Ok(SqlValue::Integer(*value)),
            Self::Text(value) => Ok(SqlValue::Text(value.clone())),
            Self::Boolean(value) => Ok(SqlValue::Integer(i64::from(*value))),
            Self::List(_) => Err(RepoError::InvalidQuery(
                "list values can only be bound to IN operands".to_string(),
            )),
        }
    }

    /// Reads a stored SQLite value as the declared field type.
    pub(crate) fn from_sql(value: SqlValue, field_type: FieldType) -> RepoResult<Self> {
        match (field_type, value) {
            (_, SqlValue::Null) => Ok(Self::Null),
            (FieldType::Integer, SqlValue::Integer(value)) => Ok(Self::Integer(value)),
            (FieldType::Text, SqlValue::Text(value)) => Ok(Self::Text(value)),
            (FieldType::Boolean, SqlValue::Integer(0)) => Ok(Self::Boolean(false)),
            (FieldType::Boolean, SqlValue::Integer(1)) => Ok(Self::Boolean(true)),
            (expected, other) => Err(RepoError::InvalidData(format!(
                "stored value {other:?} does not match declared {expected} column"
            ))),
        }
    }

    /// Reads a column of unknown declared type (explicit query results).
    pub(crate) fn from_sql_untyped(value: SqlValue) -> RepoResult<Self> {
        match value {
            SqlValue::Null => Ok(Self::Null),
            SqlValue::Integer(value) => Ok(Self::Integer(value)),
            SqlValue::Text(value) => Ok(Self::Text(value)),
            other => Err(RepoError::InvalidData(format!(
                "unsupported column value {other:?} in query result"
            ))),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "'{value}'"),
            Self::Boolean(value) => write!(f, "{value}"),
            Self::List(values) => {
                f.write_str("[")?;
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Typed extraction from a [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Boolean(value) => Some(*value),
            Value::Integer(0) => Some(false),
            Value::Integer(1) => Some(true),
            _ => None,
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldType, FromValue, Value};
    use rusqlite::types::Value as SqlValue;

    #[test]
    fn field_type_accepts_null_and_matching_values_only() {
        assert!(FieldType::Integer.accepts(&Value::Null));
        assert!(FieldType::Integer.accepts(&Value::Integer(3)));
        assert!(!FieldType::Integer.accepts(&Value::from("3")));
        assert!(FieldType::Text.accepts(&Value::from("abc")));
        assert!(!FieldType::Boolean.accepts(&Value::Integer(1)));
    }

    #[test]
    fn booleans_are_stored_as_integers() {
        assert_eq!(Value::Boolean(true).to_sql().unwrap(), SqlValue::Integer(1));
        assert_eq!(
            Value::from_sql(SqlValue::Integer(0), FieldType::Boolean).unwrap(),
            Value::Boolean(false)
        );
        assert!(Value::from_sql(SqlValue::Integer(7), FieldType::Boolean).is_err());
    }

    #[test]
    fn list_values_cannot_be_bound_directly() {
        let list = Value::from(vec!["a", "b"]);
        assert!(list.to_sql().is_err());
        assert_eq!(list.to_string(), "['a', 'b']");
    }

    #[test]
    fn optional_extraction_maps_null_to_none() {
        assert_eq!(Option::<i64>::from_value(&Value::Null), Some(None));
        assert_eq!(Option::<i64>::from_value(&Value::Integer(4)), Some(Some(4)));
        assert_eq!(Option::<i64>::from_value(&Value::from("x")), None);
    }
}
