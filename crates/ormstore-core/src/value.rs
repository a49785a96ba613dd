//! Dynamic attribute values.

use serde::{Deserialize, Serialize};

use crate::error::{Error, TypeError};
use crate::types::SqlType;

/// A dynamically-typed attribute value.
///
/// Values are what attributes look like once they leave a domain object:
/// they travel through object images, statement parameters and result rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// SQL name of the variant, used in conversion errors.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Json(_) => "JSON",
        }
    }

    /// Column type a value of this variant would be stored in.
    pub fn sql_type(&self) -> SqlType {
        match self {
            Value::Bool(_) => SqlType::Boolean,
            Value::TinyInt(_) => SqlType::TinyInt,
            Value::SmallInt(_) => SqlType::SmallInt,
            Value::Int(_) => SqlType::Integer,
            Value::BigInt(_) => SqlType::BigInt,
            Value::Float(_) => SqlType::Real,
            Value::Double(_) => SqlType::Double,
            Value::Bytes(_) => SqlType::Blob,
            Value::Json(_) => SqlType::Json,
            Value::Null | Value::Text(_) => SqlType::Text,
        }
    }

    /// Integer content of integral and boolean variants.
    fn integral(&self) -> Option<i64> {
        Some(match *self {
            Value::Bool(v) => i64::from(v),
            Value::TinyInt(v) => i64::from(v),
            Value::SmallInt(v) => i64::from(v),
            Value::Int(v) => i64::from(v),
            Value::BigInt(v) => v,
            _ => return None,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn real(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(f64::from(v)),
            Value::Double(v) => Some(v),
            Value::Bool(_) => None,
            _ => self.integral().map(|v| v as f64),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.integral()
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// `BigInt` holding `v`, saturated at `i64::MAX` with a warning.
    #[must_use]
    pub fn from_u64_clamped(v: u64) -> Self {
        Value::BigInt(i64::try_from(v).unwrap_or_else(|_| {
            tracing::warn!(value = v, "u64 attribute saturated to i64::MAX");
            i64::MAX
        }))
    }
}

fn type_error(expected: &'static str, actual: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.type_name().to_string(),
        column: None,
    })
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

// Unsigned widths widen into the next signed variant.
value_from!(
    bool => Bool,
    i8 => TinyInt,
    i16 => SmallInt,
    i32 => Int,
    i64 => BigInt,
    u8 => SmallInt,
    u16 => Int,
    u32 => BigInt,
    f32 => Float,
    f64 => Double,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
);

impl TryFrom<u64> for Value {
    type Error = Error;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        i64::try_from(v).map(Value::BigInt).map_err(|_| {
            Error::Type(TypeError {
                expected: "BIGINT",
                actual: format!("u64 {v} above i64::MAX"),
                column: None,
            })
        })
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value.integral() {
            Some(v) => Ok(v != 0),
            None => Err(type_error("bool", &value)),
        }
    }
}

// Integral extraction widens to i64 and then narrows with a range check.
macro_rules! integral_try_from {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<Value> for $ty {
                type Error = Error;

                fn try_from(value: Value) -> Result<Self, Self::Error> {
                    let wide = value
                        .integral()
                        .ok_or_else(|| type_error(stringify!($ty), &value))?;
                    <$ty>::try_from(wide).map_err(|_| {
                        Error::Type(TypeError {
                            expected: stringify!($ty),
                            actual: format!("out of range value {wide}"),
                            column: None,
                        })
                    })
                }
            }
        )*
    };
}

integral_try_from!(i8, i16, i32, i64, u8, u16, u32, u64);

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.real().ok_or_else(|| type_error("f64", &value))
    }
}

impl TryFrom<Value> for f32 {
    type Error = Error;

    #[allow(clippy::cast_possible_truncation)]
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Float(v) => Ok(v),
            other => other
                .real()
                .map(|v| v as f32)
                .ok_or_else(|| type_error("f32", &other)),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(v) => Ok(v),
            other => Err(type_error("String", &other)),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bytes(v) => Ok(v),
            Value::Text(v) => Ok(v.into_bytes()),
            other => Err(type_error("Vec<u8>", &other)),
        }
    }
}

impl TryFrom<Value> for serde_json::Value {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Json(v) => Ok(v),
            Value::Text(s) => serde_json::from_str(&s).map_err(|e| {
                Error::Type(TypeError {
                    expected: "JSON",
                    actual: format!("unparsable text: {e}"),
                    column: None,
                })
            }),
            other => Err(type_error("JSON", &other)),
        }
    }
}

impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = Error>,
{
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(None),
            v => T::try_from(v).map(Some),
        }
    }
}
