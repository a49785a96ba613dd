//! Object proxies: identity and lifetime wrappers around live objects.
//!
//! A proxy owns at most one domain object. An empty proxy stands for a
//! reference whose object has not been loaded yet. Proxies are shared through
//! [`ProxyRef`] handles; the store, holders, relation rows and transaction
//! actions all keep the same proxy alive, so the object is dropped when the
//! last of them lets go.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};

use ormstore_core::{Error, Identifier, ObjectErrorKind, Result};

use crate::image::ObjectImage;
use crate::prototype::NodeId;
use crate::store::StoreShared;
use crate::visitor::{AttributeVisitor, ErasedObject, KeyReader, Persistent, TypeKey};

/// Shared handle to an [`ObjectProxy`].
pub type ProxyRef = Rc<ObjectProxy>;

/// Identity of one holder registered with a proxy. Unique within that
/// proxy's holder set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HolderId(u64);

/// Per-instance wrapper holding a live object and its bookkeeping.
pub struct ObjectProxy {
    oid: Cell<u64>,
    pk: RefCell<Identifier>,
    type_key: TypeKey,
    object: RefCell<Option<Box<dyn ErasedObject>>>,
    reference_count: Cell<usize>,
    holders: RefCell<BTreeSet<HolderId>>,
    next_holder: Cell<u64>,
    store: RefCell<Weak<StoreShared>>,
    node: Cell<Option<NodeId>>,
    slot: Cell<Option<usize>>,
    deleted: Cell<bool>,
}

impl ObjectProxy {
    /// Wrap a new object. The primary key is read from the object.
    pub fn new<T: Persistent>(object: T) -> ProxyRef {
        Self::from_boxed(Box::new(object))
    }

    /// Construct a proxy owning a freshly created instance.
    pub fn create(factory: &dyn Fn() -> Box<dyn ErasedObject>) -> ProxyRef {
        Self::from_boxed(factory())
    }

    pub(crate) fn from_boxed(object: Box<dyn ErasedObject>) -> ProxyRef {
        let proxy = Rc::new(Self::empty(object.type_key(), Identifier::Null));
        *proxy.object.borrow_mut() = Some(object);
        if let Err(err) = proxy.resolve_identifier() {
            tracing::warn!(error = %err, "Could not read primary key of new object");
        }
        proxy
    }

    /// An empty proxy standing for the object with the given key.
    pub(crate) fn placeholder(type_key: TypeKey, pk: Identifier) -> ProxyRef {
        Rc::new(Self::empty(type_key, pk))
    }

    fn empty(type_key: TypeKey, pk: Identifier) -> Self {
        Self {
            oid: Cell::new(0),
            pk: RefCell::new(pk),
            type_key,
            object: RefCell::new(None),
            reference_count: Cell::new(0),
            holders: RefCell::new(BTreeSet::new()),
            next_holder: Cell::new(1),
            store: RefCell::new(Weak::new()),
            node: Cell::new(None),
            slot: Cell::new(None),
            deleted: Cell::new(false),
        }
    }

    /// Store-local id; zero until the proxy is first inserted.
    pub fn oid(&self) -> u64 {
        self.oid.get()
    }

    pub(crate) fn set_oid(&self, oid: u64) {
        self.oid.set(oid);
    }

    pub fn pk(&self) -> Identifier {
        self.pk.borrow().clone()
    }

    pub(crate) fn set_pk(&self, pk: Identifier) {
        *self.pk.borrow_mut() = pk;
    }

    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    pub fn type_name(&self) -> &'static str {
        self.type_key.name()
    }

    /// Whether an object is present.
    pub fn is_loaded(&self) -> bool {
        self.object
            .try_borrow()
            .map(|o| o.is_some())
            .unwrap_or(true)
    }

    pub fn is_inserted(&self) -> bool {
        self.store.borrow().strong_count() > 0
    }

    pub(crate) fn store(&self) -> Option<Rc<StoreShared>> {
        self.store.borrow().upgrade()
    }

    pub(crate) fn in_store(&self, store: &StoreShared) -> bool {
        std::ptr::eq(self.store.borrow().as_ptr(), store)
    }

    pub(crate) fn set_store(&self, store: Weak<StoreShared>) {
        *self.store.borrow_mut() = store;
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node.get()
    }

    pub(crate) fn set_node(&self, node: Option<NodeId>) {
        self.node.set(node);
    }

    pub(crate) fn slot(&self) -> Option<usize> {
        self.slot.get()
    }

    pub(crate) fn set_slot(&self, slot: Option<usize>) {
        self.slot.set(slot);
    }

    /// Set once a transaction deleting this object has committed.
    pub fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    pub(crate) fn mark_deleted(&self, deleted: bool) {
        self.deleted.set(deleted);
    }

    /// Number of relation holders counting this object.
    pub fn reference_count(&self) -> usize {
        self.reference_count.get()
    }

    pub(crate) fn increment(&self) -> usize {
        let count = self.reference_count.get() + 1;
        self.reference_count.set(count);
        count
    }

    pub(crate) fn decrement(&self) -> usize {
        let count = self.reference_count.get();
        if count == 0 {
            tracing::error!(
                oid = self.oid(),
                type_name = self.type_name(),
                "Reference count underflow"
            );
            return 0;
        }
        self.reference_count.set(count - 1);
        count - 1
    }

    /// Number of registered holders, counting or not.
    pub fn holder_count(&self) -> usize {
        self.holders.borrow().len()
    }

    pub fn has_holders(&self) -> bool {
        !self.holders.borrow().is_empty()
    }

    /// Register a new holder and return its id.
    pub(crate) fn add_holder(&self) -> HolderId {
        let id = HolderId(self.next_holder.get());
        self.next_holder.set(id.0 + 1);
        self.holders.borrow_mut().insert(id);
        id
    }

    /// Deregister a holder. Returns whether the holder set is now empty.
    pub(crate) fn remove_holder(&self, id: HolderId) -> bool {
        let mut holders = self.holders.borrow_mut();
        let removed = holders.remove(&id);
        if !removed {
            tracing::error!(
                oid = self.oid(),
                holder = ?id,
                "Removing a holder that was never registered"
            );
            debug_assert!(removed, "holder {id:?} not registered");
        }
        holders.is_empty()
    }

    /// Replace the owned object.
    ///
    /// With `resolve_identifier` the primary key is re-read from the new
    /// object. Without `keep_ref_count` the reference count starts over at
    /// zero. Returns the previous object.
    pub fn reset(
        &self,
        object: Option<Box<dyn ErasedObject>>,
        resolve_identifier: bool,
        keep_ref_count: bool,
    ) -> Result<Option<Box<dyn ErasedObject>>> {
        let previous = {
            let mut slot = self.object.try_borrow_mut().map_err(|_| self.borrowed())?;
            std::mem::replace(&mut *slot, object)
        };
        if !keep_ref_count {
            self.reference_count.set(0);
        }
        if resolve_identifier {
            self.resolve_identifier()?;
        }
        Ok(previous)
    }

    /// Take the object out, leaving the proxy empty.
    pub(crate) fn take_object(&self) -> Option<Box<dyn ErasedObject>> {
        match self.object.try_borrow_mut() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                tracing::error!(oid = self.oid(), "Object still borrowed while released");
                None
            }
        }
    }

    /// Re-read the primary key from the owned object.
    pub fn resolve_identifier(&self) -> Result<()> {
        if !self.is_loaded() {
            return Ok(());
        }
        let mut reader = KeyReader::default();
        self.visit(&mut reader)?;
        if let Some(identifier) = reader.identifier {
            self.set_pk(identifier);
        }
        Ok(())
    }

    /// Run a visitor over the owned object.
    pub fn visit(&self, visitor: &mut dyn AttributeVisitor) -> Result<()> {
        let mut slot = self.object.try_borrow_mut().map_err(|_| self.borrowed())?;
        match slot.as_mut() {
            Some(object) => object.visit(visitor),
            None => Err(self.not_loaded()),
        }
    }

    /// Capture the full attribute image of the owned object.
    pub fn backup(&self) -> Result<ObjectImage> {
        ObjectImage::capture(self)
    }

    /// Restore a previously captured image into the owned object.
    ///
    /// Relation holders are restored without propagating to the other side.
    pub fn restore(&self, image: &ObjectImage) -> Result<()> {
        image.restore_into(self)?;
        self.resolve_identifier()
    }

    pub(crate) fn object_cell(&self) -> &RefCell<Option<Box<dyn ErasedObject>>> {
        &self.object
    }

    pub(crate) fn borrowed(&self) -> Error {
        Error::object(
            ObjectErrorKind::ObjectBorrowed,
            format!(
                "object {} of type {} is currently borrowed",
                self.oid(),
                self.type_name()
            ),
        )
    }

    pub(crate) fn not_loaded(&self) -> Error {
        Error::object(
            ObjectErrorKind::NotLoaded,
            format!(
                "proxy {} of type {} holds no object",
                self.oid(),
                self.type_name()
            ),
        )
    }
}

impl fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("oid", &self.oid())
            .field("pk", &self.pk())
            .field("type", &self.type_key)
            .field("reference_count", &self.reference_count())
            .field("holders", &self.holder_count())
            .field("inserted", &self.is_inserted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Item {
        id: i64,
        name: String,
    }

    impl Persistent for Item {
        fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
            v.on_primary_key("id", &mut self.id)?;
            v.on_attribute("name", &mut self.name)
        }
    }

    #[test]
    fn test_new_proxy_reads_identifier() {
        let proxy = ObjectProxy::new(Item {
            id: 9,
            name: "x".to_string(),
        });
        assert_eq!(proxy.pk(), Identifier::I64(9));
        assert!(proxy.is_loaded());
        assert!(!proxy.is_inserted());
        assert_eq!(proxy.oid(), 0);
        assert_eq!(proxy.type_key(), TypeKey::of::<Item>());
    }

    #[test]
    fn test_reference_counting() {
        let proxy = ObjectProxy::new(Item::default());
        assert_eq!(proxy.increment(), 1);
        assert_eq!(proxy.increment(), 2);
        assert_eq!(proxy.decrement(), 1);
        assert_eq!(proxy.reference_count(), 1);
    }

    #[test]
    fn test_holder_set() {
        let proxy = ObjectProxy::new(Item::default());
        let a = proxy.add_holder();
        let b = proxy.add_holder();
        assert_ne!(a, b);
        assert_eq!(proxy.holder_count(), 2);
        assert!(!proxy.remove_holder(a));
        assert!(proxy.remove_holder(b));
        assert!(!proxy.has_holders());
    }

    #[test]
    fn test_reset_replaces_object() {
        let proxy = ObjectProxy::new(Item {
            id: 1,
            name: "a".to_string(),
        });
        proxy.increment();
        let previous = proxy
            .reset(
                Some(Box::new(Item {
                    id: 2,
                    name: "b".to_string(),
                })),
                true,
                true,
            )
            .unwrap();
        assert!(previous.is_some());
        assert_eq!(proxy.pk(), Identifier::I64(2));
        assert_eq!(proxy.reference_count(), 1);

        proxy.reset(None, false, false).unwrap();
        assert!(!proxy.is_loaded());
        assert_eq!(proxy.reference_count(), 0);
        assert!(proxy.visit(&mut KeyReader::default()).unwrap_err().is(ObjectErrorKind::NotLoaded));
    }

    #[test]
    fn test_placeholder_is_empty() {
        let proxy = ObjectProxy::placeholder(TypeKey::of::<Item>(), Identifier::I64(4));
        assert!(!proxy.is_loaded());
        assert_eq!(proxy.pk(), Identifier::I64(4));
        proxy.resolve_identifier().unwrap();
        assert_eq!(proxy.pk(), Identifier::I64(4));
    }

    #[test]
    fn test_visit_while_borrowed_fails() {
        let proxy = ObjectProxy::new(Item::default());
        let _guard = proxy.object_cell().borrow();
        let err = proxy.visit(&mut KeyReader::default()).unwrap_err();
        assert!(err.is(ObjectErrorKind::ObjectBorrowed));
    }
}
