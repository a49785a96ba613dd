//! The attribute visitor contract.
//!
//! Every persistent type exposes exactly one traversal, [`Persistent::serialize`],
//! which hands each field to an [`AttributeVisitor`] in declaration order.
//! Attach-time relation discovery, object images, relation binding and row
//! mapping are all visitors over this one traversal.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Default)]
//! struct Student {
//!     id: i64,
//!     name: String,
//!     courses: HasMany<Course>,
//! }
//!
//! impl Persistent for Student {
//!     fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
//!         v.on_primary_key("id", &mut self.id)?;
//!         v.on_attribute("name", &mut self.name)?;
//!         v.on_has_many(
//!             "student_course",
//!             &mut self.courses,
//!             JoinColumns::new("student_id", "course_id"),
//!             Cascade::None,
//!         )
//!     }
//! }
//! ```

use std::any::{Any, TypeId};
use std::fmt;

use ormstore_core::{Attribute, PrimaryKey, Result};

use crate::has_many::HasManyField;
use crate::holder::ObjectHolder;
use crate::proxy::ProxyRef;

/// A domain type that can live in an object store.
pub trait Persistent: Any {
    /// Visit every persistent field in declaration order.
    fn serialize(&mut self, visitor: &mut dyn AttributeVisitor) -> Result<()>;
}

/// Callbacks for each kind of persistent field.
///
/// All callbacks default to doing nothing, so a visitor only implements the
/// field kinds it cares about.
pub trait AttributeVisitor {
    fn on_primary_key(&mut self, name: &str, key: &mut dyn PrimaryKey) -> Result<()> {
        let _ = (name, key);
        Ok(())
    }

    fn on_attribute(&mut self, name: &str, attribute: &mut dyn Attribute) -> Result<()> {
        let _ = (name, attribute);
        Ok(())
    }

    /// A single reference to an object that owns this one.
    fn on_belongs_to(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        cascade: Cascade,
    ) -> Result<()> {
        let _ = (name, holder, cascade);
        Ok(())
    }

    /// A single owned reference.
    fn on_has_one(
        &mut self,
        name: &str,
        holder: &mut dyn ObjectHolder,
        cascade: Cascade,
    ) -> Result<()> {
        let _ = (name, holder, cascade);
        Ok(())
    }

    /// A collection. `table` names the relation table and doubles as the
    /// field name; two types declaring a collection of each other under the
    /// same table form a many-to-many relation.
    fn on_has_many(
        &mut self,
        table: &str,
        field: &mut dyn HasManyField,
        columns: JoinColumns,
        cascade: Cascade,
    ) -> Result<()> {
        let _ = (table, field, columns, cascade);
        Ok(())
    }

    /// Raw proxy links held by relation table rows.
    #[doc(hidden)]
    fn on_link(&mut self, name: &str, link: &mut Option<ProxyRef>) -> Result<()> {
        let _ = (name, link);
        Ok(())
    }
}

/// What happens to related objects when the owning object is inserted or
/// removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Cascade {
    #[default]
    None,
    Insert,
    Remove,
    All,
}

impl Cascade {
    pub const fn inserts(self) -> bool {
        matches!(self, Cascade::Insert | Cascade::All)
    }

    pub const fn removes(self) -> bool {
        matches!(self, Cascade::Remove | Cascade::All)
    }
}

/// Column names of a relation table, seen from the declaring side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinColumns {
    /// Column holding the owner's primary key.
    pub owner: &'static str,
    /// Column holding the item's primary key or value.
    pub item: &'static str,
}

impl JoinColumns {
    pub const fn new(owner: &'static str, item: &'static str) -> Self {
        Self { owner, item }
    }
}

/// Stable identity of a registered Rust type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Object-safe view of a [`Persistent`] value.
pub trait ErasedObject: Any {
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn visit(&mut self, visitor: &mut dyn AttributeVisitor) -> Result<()>;

    fn type_key(&self) -> TypeKey;
}

impl<T: Persistent> ErasedObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn visit(&mut self, visitor: &mut dyn AttributeVisitor) -> Result<()> {
        self.serialize(visitor)
    }

    fn type_key(&self) -> TypeKey {
        TypeKey::of::<T>()
    }
}

/// Reads the primary key identifier of an object, if it declares one.
#[derive(Default)]
pub(crate) struct KeyReader {
    pub(crate) name: Option<String>,
    pub(crate) identifier: Option<ormstore_core::Identifier>,
    pub(crate) sql_type: Option<ormstore_core::SqlType>,
    pub(crate) integral: bool,
}

impl AttributeVisitor for KeyReader {
    fn on_primary_key(&mut self, name: &str, key: &mut dyn PrimaryKey) -> Result<()> {
        self.name = Some(name.to_string());
        self.identifier = Some(key.identifier());
        self.sql_type = Some(key.sql_type());
        self.integral = key.is_integral();
        Ok(())
    }
}

/// Writes an identifier into an object's primary key field.
pub(crate) struct KeyWriter<'a> {
    pub(crate) identifier: &'a ormstore_core::Identifier,
    pub(crate) assigned: Option<ormstore_core::Identifier>,
}

impl AttributeVisitor for KeyWriter<'_> {
    fn on_primary_key(&mut self, _name: &str, key: &mut dyn PrimaryKey) -> Result<()> {
        key.assign_identifier(self.identifier)?;
        self.assigned = Some(key.identifier());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormstore_core::{Identifier, SqlType};

    #[derive(Default)]
    struct Plain {
        id: u32,
        name: String,
    }

    impl Persistent for Plain {
        fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
            v.on_primary_key("id", &mut self.id)?;
            v.on_attribute("name", &mut self.name)
        }
    }

    #[test]
    fn test_key_reader_and_writer() {
        let mut plain = Plain {
            id: 7,
            name: "x".to_string(),
        };
        let mut reader = KeyReader::default();
        plain.serialize(&mut reader).unwrap();
        assert_eq!(reader.name.as_deref(), Some("id"));
        assert_eq!(reader.identifier, Some(Identifier::U32(7)));
        assert_eq!(reader.sql_type, Some(SqlType::BigInt));
        assert!(reader.integral);

        let id = Identifier::U64(42);
        let mut writer = KeyWriter {
            identifier: &id,
            assigned: None,
        };
        plain.serialize(&mut writer).unwrap();
        assert_eq!(plain.id, 42);
        assert_eq!(writer.assigned, Some(Identifier::U32(42)));
        assert_eq!(plain.name, "x");
    }

    #[test]
    fn test_erased_downcast() {
        let mut boxed: Box<dyn ErasedObject> = Box::new(Plain::default());
        assert_eq!(boxed.type_key(), TypeKey::of::<Plain>());
        boxed
            .as_any_mut()
            .downcast_mut::<Plain>()
            .unwrap()
            .name
            .push_str("george");
        assert_eq!(
            boxed.as_any().downcast_ref::<Plain>().unwrap().name,
            "george"
        );
    }

    #[test]
    fn test_cascade_flags() {
        assert!(Cascade::All.inserts() && Cascade::All.removes());
        assert!(Cascade::Insert.inserts() && !Cascade::Insert.removes());
        assert!(!Cascade::None.inserts() && !Cascade::None.removes());
    }
}
