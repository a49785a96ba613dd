//! Typed handles to persistent objects.
//!
//! [`ObjectPtr`] is the user-facing handle returned by the store. It is
//! registered with the proxy's holder set but never counts as a reference.
//! [`HasOne`] and [`BelongsTo`] are relation fields inside domain objects;
//! once their owner is inserted they are bound to a relation endpoint, count
//! towards the target's reference count where the relation says so, and
//! propagate changes to the other side.

use std::cell::{Ref, RefMut};
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use ormstore_core::{Error, Identifier, Result, TypeError};

use crate::endpoint::EndpointId;
use crate::proxy::{HolderId, ObjectProxy, ProxyRef};
use crate::store::StoreShared;
use crate::visitor::{Persistent, TypeKey};

/// Binding of a relation field to the store and endpoint it belongs to.
#[doc(hidden)]
#[derive(Clone)]
pub struct Binding {
    pub(crate) store: Weak<StoreShared>,
    pub(crate) owner: Weak<ObjectProxy>,
    pub(crate) endpoint: EndpointId,
    pub(crate) counts: bool,
}

impl Binding {
    pub(crate) fn resolve(&self) -> Option<(Rc<StoreShared>, ProxyRef)> {
        Some((self.store.upgrade()?, self.owner.upgrade()?))
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("endpoint", &self.endpoint)
            .field("counts", &self.counts)
            .finish()
    }
}

/// Holder-set registration plus an optional counted reference.
pub(crate) struct HolderCore {
    id: HolderId,
    proxy: Option<ProxyRef>,
    counted: bool,
}

impl HolderCore {
    pub(crate) fn new() -> Self {
        Self {
            id: HolderId::default(),
            proxy: None,
            counted: false,
        }
    }

    pub(crate) fn with(proxy: ProxyRef) -> Self {
        let mut core = Self::new();
        core.set(Some(proxy));
        core
    }

    pub(crate) fn proxy(&self) -> Option<&ProxyRef> {
        self.proxy.as_ref()
    }

    /// Point at `proxy`, releasing the previous target. The new target is
    /// registered but not counted. Returns the previous target.
    pub(crate) fn set(&mut self, proxy: Option<ProxyRef>) -> Option<ProxyRef> {
        let previous = self.release();
        if let Some(proxy) = &proxy {
            self.id = proxy.add_holder();
        }
        self.proxy = proxy;
        previous
    }

    pub(crate) fn count(&mut self) {
        if let (Some(proxy), false) = (&self.proxy, self.counted) {
            proxy.increment();
            self.counted = true;
        }
    }

    pub(crate) fn uncount(&mut self) {
        if let (Some(proxy), true) = (&self.proxy, self.counted) {
            proxy.decrement();
        }
        self.counted = false;
    }

    fn release(&mut self) -> Option<ProxyRef> {
        self.uncount();
        let previous = self.proxy.take();
        if let Some(proxy) = &previous {
            proxy.remove_holder(self.id);
        }
        previous
    }
}

impl Clone for HolderCore {
    fn clone(&self) -> Self {
        match &self.proxy {
            Some(proxy) => Self::with(Rc::clone(proxy)),
            None => Self::new(),
        }
    }
}

impl Drop for HolderCore {
    fn drop(&mut self) {
        self.release();
    }
}

pub(crate) fn same_target(a: Option<&ProxyRef>, b: Option<&ProxyRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

pub(crate) fn type_mismatch(expected: TypeKey, proxy: &ProxyRef) -> Error {
    Error::Type(TypeError {
        expected: expected.name(),
        actual: proxy.type_name().to_string(),
        column: None,
    })
}

/// Object-safe view of a single-reference relation field.
pub trait ObjectHolder {
    /// Type of the referenced object.
    fn target_type(&self) -> TypeKey;

    fn proxy(&self) -> Option<&ProxyRef>;

    #[doc(hidden)]
    fn binding(&self) -> Option<&Binding>;

    #[doc(hidden)]
    fn bind(&mut self, binding: Binding);

    #[doc(hidden)]
    fn unbind(&mut self);

    /// Point at another proxy without propagating to the other side.
    #[doc(hidden)]
    fn replace(&mut self, proxy: Option<ProxyRef>) -> Result<Option<ProxyRef>>;
}

/// User-facing handle to a persistent object.
pub struct ObjectPtr<T: Persistent> {
    id: HolderId,
    proxy: ProxyRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Persistent> ObjectPtr<T> {
    /// Wrap a new, not yet inserted object.
    pub fn new(object: T) -> Self {
        Self::wrap(ObjectProxy::new(object))
    }

    /// Typed handle to an existing proxy, if it holds a `T`.
    pub fn from_proxy(proxy: &ProxyRef) -> Option<Self> {
        (proxy.type_key() == TypeKey::of::<T>()).then(|| Self::wrap(Rc::clone(proxy)))
    }

    fn wrap(proxy: ProxyRef) -> Self {
        let id = proxy.add_holder();
        Self {
            id,
            proxy,
            _marker: PhantomData,
        }
    }

    pub fn proxy(&self) -> &ProxyRef {
        &self.proxy
    }

    pub fn oid(&self) -> u64 {
        self.proxy.oid()
    }

    pub fn pk(&self) -> Identifier {
        self.proxy.pk()
    }

    pub fn reference_count(&self) -> usize {
        self.proxy.reference_count()
    }

    pub fn is_inserted(&self) -> bool {
        self.proxy.is_inserted()
    }

    pub fn is_loaded(&self) -> bool {
        self.proxy.is_loaded()
    }

    pub fn ptr_eq(&self, other: &ObjectPtr<T>) -> bool {
        Rc::ptr_eq(&self.proxy, &other.proxy)
    }

    /// Borrow the object. `None` if the proxy is empty or the object is
    /// currently borrowed mutably.
    pub fn get(&self) -> Option<Ref<'_, T>> {
        let slot = self.proxy.object_cell().try_borrow().ok()?;
        Ref::filter_map(slot, |o| o.as_ref()?.as_any().downcast_ref::<T>()).ok()
    }

    /// Borrow the object mutably.
    ///
    /// If the object is inserted, it is marked modified first: the current
    /// transaction takes a backup and observers see `on_update`.
    pub fn modify(&self) -> Result<RefMut<'_, T>> {
        if let Some(store) = self.proxy.store() {
            store.mark_modified(&self.proxy)?;
        }
        let slot = self
            .proxy
            .object_cell()
            .try_borrow_mut()
            .map_err(|_| self.proxy.borrowed())?;
        RefMut::filter_map(slot, |o| {
            o.as_mut()
                .and_then(|object| object.as_any_mut().downcast_mut::<T>())
        })
        .map_err(|_| self.proxy.not_loaded())
    }
}

impl<T: Persistent> Clone for ObjectPtr<T> {
    fn clone(&self) -> Self {
        Self::wrap(Rc::clone(&self.proxy))
    }
}

impl<T: Persistent> Drop for ObjectPtr<T> {
    fn drop(&mut self) {
        self.proxy.remove_holder(self.id);
    }
}

impl<T: Persistent> fmt::Debug for ObjectPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPtr")
            .field("oid", &self.oid())
            .field("pk", &self.pk())
            .finish()
    }
}

macro_rules! reference_field {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name<T: Persistent> {
            core: HolderCore,
            binding: Option<Binding>,
            _marker: PhantomData<fn() -> T>,
        }

        impl<T: Persistent> $name<T> {
            pub fn new() -> Self {
                Self {
                    core: HolderCore::new(),
                    binding: None,
                    _marker: PhantomData,
                }
            }

            /// A field pointing at `ptr`, for building objects before insert.
            pub fn to(ptr: &ObjectPtr<T>) -> Self {
                Self {
                    core: HolderCore::with(Rc::clone(ptr.proxy())),
                    binding: None,
                    _marker: PhantomData,
                }
            }

            pub fn is_empty(&self) -> bool {
                self.core.proxy().is_none()
            }

            pub fn get(&self) -> Option<Ref<'_, T>> {
                let proxy = self.core.proxy()?;
                let slot = proxy.object_cell().try_borrow().ok()?;
                Ref::filter_map(slot, |o| o.as_ref()?.as_any().downcast_ref::<T>()).ok()
            }

            /// A user handle to the referenced object.
            pub fn ptr(&self) -> Option<ObjectPtr<T>> {
                self.core.proxy().and_then(ObjectPtr::from_proxy)
            }

            pub fn pk(&self) -> Option<Identifier> {
                self.core.proxy().map(|p| p.pk())
            }

            pub fn points_to(&self, ptr: &ObjectPtr<T>) -> bool {
                same_target(self.core.proxy(), Some(ptr.proxy()))
            }

            /// Point at `ptr`, updating the other side of the relation.
            pub fn set(&mut self, ptr: &ObjectPtr<T>) -> Result<()> {
                self.assign(Some(Rc::clone(ptr.proxy())))
            }

            /// Drop the reference, updating the other side of the relation.
            pub fn clear(&mut self) -> Result<()> {
                self.assign(None)
            }

            fn assign(&mut self, proxy: Option<ProxyRef>) -> Result<()> {
                if same_target(self.core.proxy(), proxy.as_ref()) {
                    return Ok(());
                }
                let Some(binding) = self.binding.clone() else {
                    self.core.set(proxy);
                    return Ok(());
                };
                let Some((store, owner)) = binding.resolve() else {
                    self.core.set(proxy);
                    return Ok(());
                };
                if let Some(target) = &proxy {
                    store.cascade_insert(&owner, binding.endpoint, target)?;
                }
                let previous = self.core.set(proxy.clone());
                if binding.counts {
                    self.core.count();
                }
                store.reference_changed(&owner, binding.endpoint, previous, proxy)
            }
        }

        impl<T: Persistent> Default for $name<T> {
            fn default() -> Self {
                Self::new()
            }
        }

        impl<T: Persistent> Clone for $name<T> {
            /// Clones are unbound: they reference the same object but are
            /// not part of any stored object.
            fn clone(&self) -> Self {
                Self {
                    core: self.core.clone(),
                    binding: None,
                    _marker: PhantomData,
                }
            }
        }

        impl<T: Persistent> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("target", &self.core.proxy().map(|p| p.oid()))
                    .field("bound", &self.binding.is_some())
                    .finish()
            }
        }

        impl<T: Persistent> ObjectHolder for $name<T> {
            fn target_type(&self) -> TypeKey {
                TypeKey::of::<T>()
            }

            fn proxy(&self) -> Option<&ProxyRef> {
                self.core.proxy()
            }

            fn binding(&self) -> Option<&Binding> {
                self.binding.as_ref()
            }

            fn bind(&mut self, binding: Binding) {
                if binding.counts {
                    self.core.count();
                }
                self.binding = Some(binding);
            }

            fn unbind(&mut self) {
                self.core.uncount();
                self.binding = None;
            }

            fn replace(&mut self, proxy: Option<ProxyRef>) -> Result<Option<ProxyRef>> {
                if let Some(target) = &proxy {
                    if target.type_key() != TypeKey::of::<T>() {
                        return Err(type_mismatch(TypeKey::of::<T>(), target));
                    }
                }
                let previous = self.core.set(proxy);
                if self.binding.as_ref().is_some_and(|b| b.counts) {
                    self.core.count();
                }
                Ok(previous)
            }
        }
    };
}

reference_field!(
    /// An owned single reference. The referenced object counts this field
    /// as a reference while the owner is stored.
    HasOne
);

reference_field!(
    /// A reference to the object owning this one, stored as a foreign key.
    BelongsTo
);
