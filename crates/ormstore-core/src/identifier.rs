//! Type-erased primary key values.
//!
//! An [`Identifier`] is the store's view of a primary key: an integral value of
//! some width, a string, or the distinguished null identifier. Identifiers are
//! map keys in the store's identity index and the wire value for primary and
//! foreign key columns.
//!
//! Identifiers of different concrete types never compare: `I64(1)` and
//! `U64(1)` are different keys, and [`Identifier::compare`] refuses to order
//! them.

use std::cmp::Ordering;
use std::fmt;
use std::mem;

use serde::Deserialize;

use crate::error::{Error, ObjectErrorKind, Result};
use crate::value::Value;

/// A type-erased primary key value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, Deserialize)]
pub enum Identifier {
    /// No identifier. Equal only to itself.
    #[default]
    Null,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Text(String),
}

impl Identifier {
    /// Name of the concrete held type.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Identifier::Null => "null",
            Identifier::I8(_) => "i8",
            Identifier::I16(_) => "i16",
            Identifier::I32(_) => "i32",
            Identifier::I64(_) => "i64",
            Identifier::U8(_) => "u8",
            Identifier::U16(_) => "u16",
            Identifier::U32(_) => "u32",
            Identifier::U64(_) => "u64",
            Identifier::Text(_) => "text",
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Identifier::Null)
    }

    /// A usable key: not null, not zero and not an empty string.
    pub fn is_valid(&self) -> bool {
        match self {
            Identifier::Null => false,
            Identifier::Text(s) => !s.is_empty(),
            other => other.as_i128() != Some(0),
        }
    }

    pub const fn is_integral(&self) -> bool {
        !matches!(self, Identifier::Null | Identifier::Text(_))
    }

    /// Whether both identifiers hold the same concrete type.
    pub fn same_type(&self, other: &Identifier) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }

    /// Order two identifiers of the same concrete type.
    ///
    /// The null identifier compares equal to itself only.
    pub fn compare(&self, other: &Identifier) -> Result<Ordering> {
        if !self.same_type(other) {
            return Err(mismatch(self, other));
        }
        let ordering = match (self, other) {
            (Identifier::Text(a), Identifier::Text(b)) => a.cmp(b),
            (Identifier::Null, Identifier::Null) => Ordering::Equal,
            (a, b) => a.as_i128().cmp(&b.as_i128()),
        };
        Ok(ordering)
    }

    /// Replace the held value with `other`, which must have the same concrete
    /// type unless this identifier is still null.
    pub fn reset(&mut self, other: &Identifier) -> Result<()> {
        if !self.is_null() && !self.same_type(other) {
            return Err(mismatch(self, other));
        }
        *self = other.clone();
        Ok(())
    }

    /// Dispatch the held value to the serializer callback for its type.
    pub fn serialize(&mut self, serializer: &mut dyn IdentifierSerializer) -> Result<()> {
        match self {
            Identifier::Null => serializer.serialize_null(),
            Identifier::I8(v) => serializer.serialize_i8(v),
            Identifier::I16(v) => serializer.serialize_i16(v),
            Identifier::I32(v) => serializer.serialize_i32(v),
            Identifier::I64(v) => serializer.serialize_i64(v),
            Identifier::U8(v) => serializer.serialize_u8(v),
            Identifier::U16(v) => serializer.serialize_u16(v),
            Identifier::U32(v) => serializer.serialize_u32(v),
            Identifier::U64(v) => serializer.serialize_u64(v),
            Identifier::Text(v) => serializer.serialize_text(v),
        }
    }

    /// The integral value widened to `i128`, if integral.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Identifier::I8(v) => Some(i128::from(*v)),
            Identifier::I16(v) => Some(i128::from(*v)),
            Identifier::I32(v) => Some(i128::from(*v)),
            Identifier::I64(v) => Some(i128::from(*v)),
            Identifier::U8(v) => Some(i128::from(*v)),
            Identifier::U16(v) => Some(i128::from(*v)),
            Identifier::U32(v) => Some(i128::from(*v)),
            Identifier::U64(v) => Some(i128::from(*v)),
            Identifier::Null | Identifier::Text(_) => None,
        }
    }

    /// Column value for binding this identifier as a key parameter.
    pub fn to_value(&self) -> Value {
        let mut serializer = ValueIdentifierSerializer::default();
        let mut copy = self.clone();
        match copy.serialize(&mut serializer) {
            Ok(()) => serializer.into_value(),
            Err(_) => Value::Null,
        }
    }

    /// Build an identifier of the same concrete type as `self` from a column
    /// value. Used when reading foreign key columns back from rows.
    pub fn like(&self, value: &Value) -> Result<Identifier> {
        if value.is_null() {
            return Ok(Identifier::Null);
        }
        if let Identifier::Text(_) = self {
            return value
                .as_str()
                .map(|s| Identifier::Text(s.to_string()))
                .ok_or_else(|| value_mismatch(self, value));
        }
        let wide = value.as_i64().ok_or_else(|| value_mismatch(self, value))?;
        let narrowed = match self {
            Identifier::I8(_) => i8::try_from(wide).ok().map(Identifier::I8),
            Identifier::I16(_) => i16::try_from(wide).ok().map(Identifier::I16),
            Identifier::I32(_) => i32::try_from(wide).ok().map(Identifier::I32),
            Identifier::I64(_) | Identifier::Null => Some(Identifier::I64(wide)),
            Identifier::U8(_) => u8::try_from(wide).ok().map(Identifier::U8),
            Identifier::U16(_) => u16::try_from(wide).ok().map(Identifier::U16),
            Identifier::U32(_) => u32::try_from(wide).ok().map(Identifier::U32),
            Identifier::U64(_) => u64::try_from(wide).ok().map(Identifier::U64),
            Identifier::Text(_) => None,
        };
        narrowed.ok_or_else(|| value_mismatch(self, value))
    }
}

fn mismatch(a: &Identifier, b: &Identifier) -> Error {
    Error::object(
        ObjectErrorKind::IdentifierTypeMismatch,
        format!(
            "cannot combine {} identifier with {} identifier",
            a.type_name(),
            b.type_name()
        ),
    )
}

fn value_mismatch(id: &Identifier, value: &Value) -> Error {
    Error::object(
        ObjectErrorKind::IdentifierTypeMismatch,
        format!(
            "column value {} does not fit a {} identifier",
            value.type_name(),
            id.type_name()
        ),
    )
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Null => write!(f, "null"),
            Identifier::I8(v) => write!(f, "{}", v),
            Identifier::I16(v) => write!(f, "{}", v),
            Identifier::I32(v) => write!(f, "{}", v),
            Identifier::I64(v) => write!(f, "{}", v),
            Identifier::U8(v) => write!(f, "{}", v),
            Identifier::U16(v) => write!(f, "{}", v),
            Identifier::U32(v) => write!(f, "{}", v),
            Identifier::U64(v) => write!(f, "{}", v),
            Identifier::Text(v) => write!(f, "{}", v),
        }
    }
}

macro_rules! identifier_from {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl From<$ty> for Identifier {
                fn from(v: $ty) -> Self {
                    Identifier::$variant(v)
                }
            }
        )*
    };
}

identifier_from!(
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    String => Text
);

impl From<&str> for Identifier {
    fn from(v: &str) -> Self {
        Identifier::Text(v.to_string())
    }
}

/// Visitor over the concrete value held by an [`Identifier`].
///
/// Callbacks receive mutable references so that one serializer shape can both
/// write identifiers out and read them back in.
pub trait IdentifierSerializer {
    fn serialize_i8(&mut self, value: &mut i8) -> Result<()>;
    fn serialize_i16(&mut self, value: &mut i16) -> Result<()>;
    fn serialize_i32(&mut self, value: &mut i32) -> Result<()>;
    fn serialize_i64(&mut self, value: &mut i64) -> Result<()>;
    fn serialize_u8(&mut self, value: &mut u8) -> Result<()>;
    fn serialize_u16(&mut self, value: &mut u16) -> Result<()>;
    fn serialize_u32(&mut self, value: &mut u32) -> Result<()>;
    fn serialize_u64(&mut self, value: &mut u64) -> Result<()>;
    fn serialize_text(&mut self, value: &mut String) -> Result<()>;
    fn serialize_null(&mut self) -> Result<()>;
}

// ============================================================================
// Byte buffer serializer
// ============================================================================

const TAG_NULL: u8 = 0;
const TAG_I8: u8 = 1;
const TAG_I16: u8 = 2;
const TAG_I32: u8 = 3;
const TAG_I64: u8 = 4;
const TAG_U8: u8 = 5;
const TAG_U16: u8 = 6;
const TAG_U32: u8 = 7;
const TAG_U64: u8 = 8;
const TAG_TEXT: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Write,
    Read,
}

/// Writes identifiers into a tagged little-endian byte buffer, or reads them
/// back into identifiers of the same concrete type.
#[derive(Debug)]
pub struct BytesIdentifierSerializer {
    buffer: Vec<u8>,
    position: usize,
    direction: Direction,
}

impl BytesIdentifierSerializer {
    /// A serializer appending to an empty buffer.
    #[must_use]
    pub fn writer() -> Self {
        Self {
            buffer: Vec::new(),
            position: 0,
            direction: Direction::Write,
        }
    }

    /// A serializer reading from `bytes`, starting at the front.
    #[must_use]
    pub fn reader(bytes: Vec<u8>) -> Self {
        Self {
            buffer: bytes,
            position: 0,
            direction: Direction::Read,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Bytes not consumed yet by a reader.
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let end = self.position + len;
        if end > self.buffer.len() {
            return Err(Error::Serde(format!(
                "identifier buffer exhausted: need {} bytes at offset {}, have {}",
                len,
                self.position,
                self.buffer.len()
            )));
        }
        let slice = &self.buffer[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn expect_tag(&mut self, expected: u8, type_name: &'static str) -> Result<()> {
        let found = self.take(1)?[0];
        if found == expected {
            Ok(())
        } else {
            Err(Error::object(
                ObjectErrorKind::IdentifierTypeMismatch,
                format!(
                    "buffer holds identifier tag {} but a {} identifier was requested",
                    found, type_name
                ),
            ))
        }
    }
}

macro_rules! bytes_width {
    ($($method:ident: $ty:ty => $tag:expr),*) => {
        $(
            fn $method(&mut self, value: &mut $ty) -> Result<()> {
                match self.direction {
                    Direction::Write => {
                        self.buffer.push($tag);
                        self.buffer.extend_from_slice(&value.to_le_bytes());
                    }
                    Direction::Read => {
                        self.expect_tag($tag, stringify!($ty))?;
                        let mut raw = [0u8; std::mem::size_of::<$ty>()];
                        raw.copy_from_slice(self.take(std::mem::size_of::<$ty>())?);
                        *value = <$ty>::from_le_bytes(raw);
                    }
                }
                Ok(())
            }
        )*
    };
}

impl IdentifierSerializer for BytesIdentifierSerializer {
    bytes_width!(
        serialize_i8: i8 => TAG_I8,
        serialize_i16: i16 => TAG_I16,
        serialize_i32: i32 => TAG_I32,
        serialize_i64: i64 => TAG_I64,
        serialize_u8: u8 => TAG_U8,
        serialize_u16: u16 => TAG_U16,
        serialize_u32: u32 => TAG_U32,
        serialize_u64: u64 => TAG_U64
    );

    fn serialize_text(&mut self, value: &mut String) -> Result<()> {
        match self.direction {
            Direction::Write => {
                let len = u32::try_from(value.len())
                    .map_err(|_| Error::Serde("identifier text too long".to_string()))?;
                self.buffer.push(TAG_TEXT);
                self.buffer.extend_from_slice(&len.to_le_bytes());
                self.buffer.extend_from_slice(value.as_bytes());
            }
            Direction::Read => {
                self.expect_tag(TAG_TEXT, "text")?;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(self.take(4)?);
                let len = u32::from_le_bytes(raw) as usize;
                let bytes = self.take(len)?.to_vec();
                *value = String::from_utf8(bytes).map_err(|e| Error::Serde(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn serialize_null(&mut self) -> Result<()> {
        match self.direction {
            Direction::Write => self.buffer.push(TAG_NULL),
            Direction::Read => self.expect_tag(TAG_NULL, "null")?,
        }
        Ok(())
    }
}

// ============================================================================
// Value and JSON serializers
// ============================================================================

/// Converts an identifier into a column [`Value`] for parameter binding.
#[derive(Debug, Default)]
pub struct ValueIdentifierSerializer {
    value: Option<Value>,
}

impl ValueIdentifierSerializer {
    pub fn into_value(self) -> Value {
        self.value.unwrap_or(Value::Null)
    }
}

impl IdentifierSerializer for ValueIdentifierSerializer {
    fn serialize_i8(&mut self, value: &mut i8) -> Result<()> {
        self.value = Some(Value::from(*value));
        Ok(())
    }
    fn serialize_i16(&mut self, value: &mut i16) -> Result<()> {
        self.value = Some(Value::from(*value));
        Ok(())
    }
    fn serialize_i32(&mut self, value: &mut i32) -> Result<()> {
        self.value = Some(Value::from(*value));
        Ok(())
    }
    fn serialize_i64(&mut self, value: &mut i64) -> Result<()> {
        self.value = Some(Value::from(*value));
        Ok(())
    }
    fn serialize_u8(&mut self, value: &mut u8) -> Result<()> {
        self.value = Some(Value::from(*value));
        Ok(())
    }
    fn serialize_u16(&mut self, value: &mut u16) -> Result<()> {
        self.value = Some(Value::from(*value));
        Ok(())
    }
    fn serialize_u32(&mut self, value: &mut u32) -> Result<()> {
        self.value = Some(Value::from(*value));
        Ok(())
    }
    fn serialize_u64(&mut self, value: &mut u64) -> Result<()> {
        self.value = Some(Value::try_from(*value)?);
        Ok(())
    }
    fn serialize_text(&mut self, value: &mut String) -> Result<()> {
        self.value = Some(Value::Text(value.clone()));
        Ok(())
    }
    fn serialize_null(&mut self) -> Result<()> {
        self.value = Some(Value::Null);
        Ok(())
    }
}

/// Converts an identifier into a JSON value.
#[derive(Debug, Default)]
pub struct JsonIdentifierSerializer {
    value: serde_json::Value,
}

impl JsonIdentifierSerializer {
    pub fn into_json(self) -> serde_json::Value {
        self.value
    }
}

impl IdentifierSerializer for JsonIdentifierSerializer {
    fn serialize_i8(&mut self, value: &mut i8) -> Result<()> {
        self.value = serde_json::Value::from(*value);
        Ok(())
    }
    fn serialize_i16(&mut self, value: &mut i16) -> Result<()> {
        self.value = serde_json::Value::from(*value);
        Ok(())
    }
    fn serialize_i32(&mut self, value: &mut i32) -> Result<()> {
        self.value = serde_json::Value::from(*value);
        Ok(())
    }
    fn serialize_i64(&mut self, value: &mut i64) -> Result<()> {
        self.value = serde_json::Value::from(*value);
        Ok(())
    }
    fn serialize_u8(&mut self, value: &mut u8) -> Result<()> {
        self.value = serde_json::Value::from(*value);
        Ok(())
    }
    fn serialize_u16(&mut self, value: &mut u16) -> Result<()> {
        self.value = serde_json::Value::from(*value);
        Ok(())
    }
    fn serialize_u32(&mut self, value: &mut u32) -> Result<()> {
        self.value = serde_json::Value::from(*value);
        Ok(())
    }
    fn serialize_u64(&mut self, value: &mut u64) -> Result<()> {
        self.value = serde_json::Value::from(*value);
        Ok(())
    }
    fn serialize_text(&mut self, value: &mut String) -> Result<()> {
        self.value = serde_json::Value::String(value.clone());
        Ok(())
    }
    fn serialize_null(&mut self) -> Result<()> {
        self.value = serde_json::Value::Null;
        Ok(())
    }
}
