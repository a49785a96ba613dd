//! Snapshot views over the objects of a prototype.

use std::cell::Ref;
use std::fmt;

use crate::holder::ObjectPtr;
use crate::proxy::ProxyRef;
use crate::visitor::Persistent;

/// Typed view over the objects of exactly type `T`, in insertion order.
pub struct ObjectView<T: Persistent> {
    items: Vec<ObjectPtr<T>>,
}

impl<T: Persistent> ObjectView<T> {
    pub(crate) fn new(items: Vec<ObjectPtr<T>>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn front(&self) -> Option<&ObjectPtr<T>> {
        self.items.first()
    }

    pub fn back(&self) -> Option<&ObjectPtr<T>> {
        self.items.last()
    }

    pub fn get(&self, index: usize) -> Option<&ObjectPtr<T>> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ObjectPtr<T>> {
        self.items.iter()
    }

    /// First object matching `predicate`. Objects that are currently
    /// borrowed mutably are skipped.
    pub fn find_if(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<ObjectPtr<T>> {
        self.items
            .iter()
            .find(|ptr| ptr.get().is_some_and(|object| predicate(&object)))
            .cloned()
    }
}

impl<T: Persistent> IntoIterator for ObjectView<T> {
    type Item = ObjectPtr<T>;
    type IntoIter = std::vec::IntoIter<ObjectPtr<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T: Persistent> IntoIterator for &'a ObjectView<T> {
    type Item = &'a ObjectPtr<T>;
    type IntoIter = std::slice::Iter<'a, ObjectPtr<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: Persistent> fmt::Debug for ObjectView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectView").field("len", &self.len()).finish()
    }
}

/// Type-erased view over the proxies of a prototype and, unless siblings
/// were skipped, its descendants in pre-order.
#[derive(Debug, Clone, Default)]
pub struct GenericView {
    proxies: Vec<ProxyRef>,
}

impl GenericView {
    pub(crate) fn new(proxies: Vec<ProxyRef>) -> Self {
        Self { proxies }
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn front(&self) -> Option<&ProxyRef> {
        self.proxies.first()
    }

    pub fn back(&self) -> Option<&ProxyRef> {
        self.proxies.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProxyRef> {
        self.proxies.iter()
    }

    /// Typed handles to the proxies holding a `T`.
    pub fn of_type<T: Persistent>(&self) -> impl Iterator<Item = ObjectPtr<T>> + '_ {
        self.proxies.iter().filter_map(ObjectPtr::from_proxy)
    }

    /// Borrow the object behind each proxy as a `T`, skipping others.
    pub fn objects<T: Persistent>(&self) -> impl Iterator<Item = Ref<'_, T>> + '_ {
        self.proxies.iter().filter_map(|proxy| {
            let slot = proxy.object_cell().try_borrow().ok()?;
            Ref::filter_map(slot, |o| o.as_ref()?.as_any().downcast_ref::<T>()).ok()
        })
    }
}

impl IntoIterator for GenericView {
    type Item = ProxyRef;
    type IntoIter = std::vec::IntoIter<ProxyRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.proxies.into_iter()
    }
}

impl<'a> IntoIterator for &'a GenericView {
    type Item = &'a ProxyRef;
    type IntoIter = std::slice::Iter<'a, ProxyRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.proxies.iter()
    }
}
