//! value representation
//!
//! Values of the global section of a configuration document:
//! - boolean (true/false)
//! - integer (signed, i64)
//! - decimal (f64)
//! - string (utf-8)
//! - array ("list" of values)
//!
//! Additionally:
//! - there are no nested tables. The deploy tool reads flat `key = value` pairs only.
//! - there is no `null`/`None` value. An absent key is simply not in the map.
//!
/// All possible value types
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

/// A toml value that has no counterpart in the global section
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unsupported value type: {0}")]
pub struct UnsupportedValue(pub &'static str);

impl TryFrom<toml::Value> for Value {
    type Error = UnsupportedValue;

    fn try_from(value: toml::Value) -> Result<Self, Self::Error> {
        match value {
            toml::Value::String(s) => Ok(s.into()),
            toml::Value::Integer(i) => Ok(i.into()),
            toml::Value::Float(f) => Ok(Value::Decimal(f)),
            toml::Value::Boolean(b) => Ok(b.into()),
            toml::Value::Array(array) => Ok(Value::Array(
                array
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<_, _>>()?,
            )),
            toml::Value::Datetime(_) => Err(UnsupportedValue("datetime")),
            toml::Value::Table(_) => Err(UnsupportedValue("table")),
        }
    }
}
