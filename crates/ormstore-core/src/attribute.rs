//! Field contracts for persistent attributes and primary keys.
//!
//! Domain types hand their fields to visitors as `&mut dyn Attribute` and
//! `&mut dyn PrimaryKey`. The same erased view is used to take object
//! images, restore them, and map fields to and from table columns.

use crate::error::{Error, ObjectErrorKind, Result};
use crate::identifier::Identifier;
use crate::types::{SqlType, TypeInfo};
use crate::value::Value;

/// A persistent scalar field.
pub trait Attribute {
    /// Current value of the field.
    fn to_value(&self) -> Value;

    /// Overwrite the field from a value, converting as needed.
    fn assign(&mut self, value: Value) -> Result<()>;

    /// Column type used for schema generation.
    fn sql_type(&self) -> SqlType;

    fn is_nullable(&self) -> bool {
        false
    }
}

/// A field acting as the object's primary key.
pub trait PrimaryKey: Attribute {
    fn identifier(&self) -> Identifier;

    fn assign_identifier(&mut self, id: &Identifier) -> Result<()>;

    /// Integral keys may be generated from a store-managed sequence.
    fn is_integral(&self) -> bool;
}

macro_rules! scalar_attribute {
    ($($ty:ty),*) => {
        $(
            impl Attribute for $ty {
                fn to_value(&self) -> Value {
                    Value::from(self.clone())
                }

                fn assign(&mut self, value: Value) -> Result<()> {
                    *self = <$ty>::try_from(value)?;
                    Ok(())
                }

                fn sql_type(&self) -> SqlType {
                    <$ty as TypeInfo>::SQL_TYPE
                }
            }
        )*
    };
}

scalar_attribute!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    f32,
    f64,
    String,
    Vec<u8>,
    serde_json::Value
);

impl Attribute for u64 {
    fn to_value(&self) -> Value {
        Value::from_u64_clamped(*self)
    }

    fn assign(&mut self, value: Value) -> Result<()> {
        *self = u64::try_from(value)?;
        Ok(())
    }

    fn sql_type(&self) -> SqlType {
        <u64 as TypeInfo>::SQL_TYPE
    }
}

impl Attribute for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }

    fn assign(&mut self, value: Value) -> Result<()> {
        *self = value;
        Ok(())
    }

    fn sql_type(&self) -> SqlType {
        Value::sql_type(self)
    }

    fn is_nullable(&self) -> bool {
        true
    }
}

impl<T: Attribute + Default> Attribute for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }

    fn assign(&mut self, value: Value) -> Result<()> {
        if value.is_null() {
            *self = None;
        } else {
            let mut inner = T::default();
            inner.assign(value)?;
            *self = Some(inner);
        }
        Ok(())
    }

    fn sql_type(&self) -> SqlType {
        T::default().sql_type()
    }

    fn is_nullable(&self) -> bool {
        true
    }
}

fn key_mismatch(expected: &'static str, id: &Identifier) -> Error {
    Error::object(
        ObjectErrorKind::IdentifierTypeMismatch,
        format!(
            "cannot assign {} identifier {} to a {} key",
            id.type_name(),
            id,
            expected
        ),
    )
}

macro_rules! integral_key {
    ($($ty:ty),*) => {
        $(
            impl PrimaryKey for $ty {
                fn identifier(&self) -> Identifier {
                    Identifier::from(*self)
                }

                fn assign_identifier(&mut self, id: &Identifier) -> Result<()> {
                    if id.is_null() {
                        *self = 0;
                        return Ok(());
                    }
                    let wide = id.as_i128().ok_or_else(|| key_mismatch(stringify!($ty), id))?;
                    *self = <$ty>::try_from(wide).map_err(|_| key_mismatch(stringify!($ty), id))?;
                    Ok(())
                }

                fn is_integral(&self) -> bool {
                    true
                }
            }
        )*
    };
}

integral_key!(i8, i16, i32, i64, u8, u16, u32, u64);

impl PrimaryKey for String {
    fn identifier(&self) -> Identifier {
        Identifier::Text(self.clone())
    }

    fn assign_identifier(&mut self, id: &Identifier) -> Result<()> {
        match id {
            Identifier::Text(s) => {
                self.clone_from(s);
                Ok(())
            }
            Identifier::Null => {
                self.clear();
                Ok(())
            }
            other => Err(key_mismatch("text", other)),
        }
    }

    fn is_integral(&self) -> bool {
        false
    }
}
