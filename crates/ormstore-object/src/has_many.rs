//! Collection relation fields.
//!
//! [`HasMany`] holds references to other persistent objects, [`HasManyValues`]
//! holds builtin values. Both are plain vectors until their owner is inserted
//! into a store; from then on every change is mirrored into the relation
//! table and onto the other side of the relation.

use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use ormstore_core::{Attribute, Result, SqlType, Value};

use crate::holder::{Binding, HolderCore, ObjectPtr, type_mismatch};
use crate::proxy::ProxyRef;
use crate::visitor::{Persistent, TypeKey};

/// One element of a collection as seen by the store.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub enum Entry {
    Object {
        item: ProxyRef,
        link: Option<ProxyRef>,
    },
    Value {
        value: Value,
        link: Option<ProxyRef>,
    },
}

impl Entry {
    pub(crate) fn link(&self) -> Option<&ProxyRef> {
        match self {
            Entry::Object { link, .. } | Entry::Value { link, .. } => link.as_ref(),
        }
    }
}

/// Object-safe view of a collection relation field.
pub trait HasManyField {
    /// Element type for object collections.
    fn item_type(&self) -> Option<TypeKey>;

    /// Column type for value collections.
    fn value_type(&self) -> Option<SqlType>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[doc(hidden)]
    fn binding(&self) -> Option<&Binding>;

    #[doc(hidden)]
    fn bind(&mut self, binding: Binding);

    #[doc(hidden)]
    fn unbind(&mut self);

    #[doc(hidden)]
    fn entries(&self) -> Vec<Entry>;

    #[doc(hidden)]
    fn set_link(&mut self, index: usize, link: Option<ProxyRef>);

    #[doc(hidden)]
    fn contains_item(&self, item: &ProxyRef) -> bool;

    /// Append without touching the store or the other side.
    #[doc(hidden)]
    fn add_item(&mut self, item: ProxyRef, link: Option<ProxyRef>) -> Result<()>;

    /// Remove the first occurrence without touching the store or the other
    /// side. Returns the removed element's link, if one was removed.
    #[doc(hidden)]
    fn remove_item(&mut self, item: &ProxyRef) -> Option<Option<ProxyRef>>;

    #[doc(hidden)]
    fn add_value(&mut self, value: Value, link: Option<ProxyRef>) -> Result<()>;

    /// Replace the whole content.
    #[doc(hidden)]
    fn restore(&mut self, entries: Vec<Entry>) -> Result<()>;
}

struct ManyItem {
    core: HolderCore,
    link: Option<ProxyRef>,
}

/// A collection of references to other persistent objects.
pub struct HasMany<T: Persistent> {
    items: Vec<ManyItem>,
    binding: Option<Binding>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Persistent> HasMany<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            binding: None,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectPtr<T>> + '_ {
        self.items
            .iter()
            .filter_map(|item| item.core.proxy().and_then(ObjectPtr::from_proxy))
    }

    pub fn get(&self, index: usize) -> Option<ObjectPtr<T>> {
        self.items
            .get(index)
            .and_then(|item| item.core.proxy())
            .and_then(ObjectPtr::from_proxy)
    }

    pub fn contains(&self, ptr: &ObjectPtr<T>) -> bool {
        self.position(ptr.proxy()).is_some()
    }

    fn position(&self, proxy: &ProxyRef) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.core.proxy().is_some_and(|p| Rc::ptr_eq(p, proxy)))
    }

    pub fn push_back(&mut self, ptr: &ObjectPtr<T>) -> Result<()> {
        self.insert(self.items.len(), ptr)
    }

    pub fn push_front(&mut self, ptr: &ObjectPtr<T>) -> Result<()> {
        self.insert(0, ptr)
    }

    /// Insert at `index`, clamped to the length.
    ///
    /// When the owner is stored, the item is inserted too if cascading
    /// applies, a relation row is created and the item's side of the
    /// relation is updated.
    pub fn insert(&mut self, index: usize, ptr: &ObjectPtr<T>) -> Result<()> {
        let index = index.min(self.items.len());
        let proxy = Rc::clone(ptr.proxy());
        let Some((binding, store, owner)) = self.resolved() else {
            self.items.insert(
                index,
                ManyItem {
                    core: HolderCore::with(proxy),
                    link: None,
                },
            );
            return Ok(());
        };
        if self.position(&proxy).is_some() && store.is_item_unique(binding.endpoint) {
            return Ok(());
        }
        let link = store.relation_add(&owner, binding.endpoint, &proxy)?;
        let mut core = HolderCore::with(proxy);
        if binding.counts {
            core.count();
        }
        self.items.insert(index, ManyItem { core, link });
        Ok(())
    }

    /// Remove the element at `index`.
    ///
    /// When the owner is stored, the relation row is removed, the item's
    /// side is updated, and the item is removed as well if the relation
    /// cascades removal and nothing else references it.
    pub fn erase(&mut self, index: usize) -> Result<Option<ObjectPtr<T>>> {
        let Some(proxy) = self.items.get(index).map(|item| item.core.proxy().cloned()) else {
            return Ok(None);
        };
        let resolved = self.resolved();
        if let (Some(proxy), Some((binding, store, owner))) = (&proxy, &resolved) {
            store.check_relation_item(owner, binding.endpoint, proxy)?;
        }
        let ManyItem { mut core, link } = self.items.remove(index);
        let Some(proxy) = proxy else {
            return Ok(None);
        };
        let ptr = ObjectPtr::from_proxy(&proxy);
        core.uncount();
        drop(core);
        if let Some((binding, store, owner)) = resolved {
            store.relation_remove(&owner, binding.endpoint, &proxy, link)?;
        }
        Ok(ptr)
    }

    /// Remove the first occurrence of `ptr`. Returns whether it was found.
    pub fn remove(&mut self, ptr: &ObjectPtr<T>) -> Result<bool> {
        match self.position(ptr.proxy()) {
            Some(index) => self.erase(index).map(|_| true),
            None => Ok(false),
        }
    }

    /// Remove every element matching `predicate`. Returns how many were
    /// removed.
    pub fn remove_if(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Result<usize> {
        let mut removed = 0;
        let mut index = 0;
        while index < self.items.len() {
            let matches = self
                .get(index)
                .is_some_and(|ptr| ptr.get().is_some_and(|obj| predicate(&obj)));
            if matches {
                self.erase(index)?;
                removed += 1;
            } else {
                index += 1;
            }
        }
        Ok(removed)
    }

    pub fn clear(&mut self) -> Result<()> {
        while !self.items.is_empty() {
            self.erase(self.items.len() - 1)?;
        }
        Ok(())
    }

    fn resolved(&self) -> Option<(Binding, Rc<crate::store::StoreShared>, ProxyRef)> {
        let binding = self.binding.clone()?;
        let (store, owner) = binding.resolve()?;
        Some((binding, store, owner))
    }
}

impl<T: Persistent> Default for HasMany<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Persistent> Clone for HasMany<T> {
    /// Clones are unbound plain collections of the same objects.
    fn clone(&self) -> Self {
        Self {
            items: self
                .items
                .iter()
                .map(|item| ManyItem {
                    core: item.core.clone(),
                    link: None,
                })
                .collect(),
            binding: None,
            _marker: PhantomData,
        }
    }
}

impl<T: Persistent> fmt::Debug for HasMany<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HasMany")
            .field(
                "items",
                &self
                    .items
                    .iter()
                    .filter_map(|i| i.core.proxy().map(|p| p.oid()))
                    .collect::<Vec<_>>(),
            )
            .field("bound", &self.binding.is_some())
            .finish()
    }
}

impl<T: Persistent> HasManyField for HasMany<T> {
    fn item_type(&self) -> Option<TypeKey> {
        Some(TypeKey::of::<T>())
    }

    fn value_type(&self) -> Option<SqlType> {
        None
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    fn bind(&mut self, binding: Binding) {
        if binding.counts {
            for item in &mut self.items {
                item.core.count();
            }
        }
        self.binding = Some(binding);
    }

    fn unbind(&mut self) {
        for item in &mut self.items {
            item.core.uncount();
        }
        self.binding = None;
    }

    fn entries(&self) -> Vec<Entry> {
        self.items
            .iter()
            .filter_map(|item| {
                item.core.proxy().map(|p| Entry::Object {
                    item: Rc::clone(p),
                    link: item.link.clone(),
                })
            })
            .collect()
    }

    fn set_link(&mut self, index: usize, link: Option<ProxyRef>) {
        if let Some(item) = self.items.get_mut(index) {
            item.link = link;
        }
    }

    fn contains_item(&self, item: &ProxyRef) -> bool {
        self.position(item).is_some()
    }

    fn add_item(&mut self, item: ProxyRef, link: Option<ProxyRef>) -> Result<()> {
        if item.type_key() != TypeKey::of::<T>() {
            return Err(type_mismatch(TypeKey::of::<T>(), &item));
        }
        let mut core = HolderCore::with(item);
        if self.binding.as_ref().is_some_and(|b| b.counts) {
            core.count();
        }
        self.items.push(ManyItem { core, link });
        Ok(())
    }

    fn remove_item(&mut self, item: &ProxyRef) -> Option<Option<ProxyRef>> {
        let index = self.position(item)?;
        let ManyItem { core, link } = self.items.remove(index);
        drop(core);
        Some(link)
    }

    fn add_value(&mut self, value: Value, _link: Option<ProxyRef>) -> Result<()> {
        Err(ormstore_core::Error::Custom(format!(
            "cannot add value {} to a collection of {}",
            value.type_name(),
            std::any::type_name::<T>()
        )))
    }

    fn restore(&mut self, entries: Vec<Entry>) -> Result<()> {
        self.items.clear();
        for entry in entries {
            if let Entry::Object { item, link } = entry {
                self.add_item(item, link)?;
            }
        }
        Ok(())
    }
}

struct ValueItem<V> {
    value: V,
    link: Option<ProxyRef>,
}

/// A collection of builtin values stored in a relation table.
pub struct HasManyValues<V: Attribute + Default + Clone + 'static> {
    items: Vec<ValueItem<V>>,
    binding: Option<Binding>,
}

impl<V: Attribute + Default + Clone + 'static> HasManyValues<V> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            binding: None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> + '_ {
        self.items.iter().map(|item| &item.value)
    }

    pub fn get(&self, index: usize) -> Option<&V> {
        self.items.get(index).map(|item| &item.value)
    }

    pub fn contains(&self, value: &V) -> bool {
        let needle = value.to_value();
        self.items.iter().any(|item| item.value.to_value() == needle)
    }

    pub fn push_back(&mut self, value: V) -> Result<()> {
        self.insert(self.items.len(), value)
    }

    pub fn push_front(&mut self, value: V) -> Result<()> {
        self.insert(0, value)
    }

    /// Insert at `index`, clamped to the length. A stored owner gets a
    /// relation row for the value.
    pub fn insert(&mut self, index: usize, value: V) -> Result<()> {
        let index = index.min(self.items.len());
        let link = match self.resolved() {
            Some((binding, store, owner)) => {
                store.value_add(&owner, binding.endpoint, value.to_value())?
            }
            None => None,
        };
        self.items.insert(index, ValueItem { value, link });
        Ok(())
    }

    pub fn erase(&mut self, index: usize) -> Result<Option<V>> {
        if index >= self.items.len() {
            return Ok(None);
        }
        let ValueItem { value, link } = self.items.remove(index);
        if let Some((_, store, _)) = self.resolved() {
            store.value_remove(link)?;
        }
        Ok(Some(value))
    }

    /// Remove the first element equal to `value`.
    pub fn remove(&mut self, value: &V) -> Result<bool> {
        let needle = value.to_value();
        match self
            .items
            .iter()
            .position(|item| item.value.to_value() == needle)
        {
            Some(index) => self.erase(index).map(|_| true),
            None => Ok(false),
        }
    }

    /// Remove every value matching `predicate`. Returns how many were
    /// removed.
    pub fn remove_if(&mut self, mut predicate: impl FnMut(&V) -> bool) -> Result<usize> {
        let mut removed = 0;
        let mut index = 0;
        while index < self.items.len() {
            if predicate(&self.items[index].value) {
                self.erase(index)?;
                removed += 1;
            } else {
                index += 1;
            }
        }
        Ok(removed)
    }

    pub fn clear(&mut self) -> Result<()> {
        while !self.items.is_empty() {
            self.erase(self.items.len() - 1)?;
        }
        Ok(())
    }

    fn resolved(&self) -> Option<(Binding, Rc<crate::store::StoreShared>, ProxyRef)> {
        let binding = self.binding.clone()?;
        let (store, owner) = binding.resolve()?;
        Some((binding, store, owner))
    }
}

impl<V: Attribute + Default + Clone + 'static> Default for HasManyValues<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Attribute + Default + Clone + 'static> Clone for HasManyValues<V> {
    fn clone(&self) -> Self {
        Self {
            items: self
                .items
                .iter()
                .map(|item| ValueItem {
                    value: item.value.clone(),
                    link: None,
                })
                .collect(),
            binding: None,
        }
    }
}

impl<V: Attribute + Default + Clone + 'static> fmt::Debug for HasManyValues<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HasManyValues")
            .field(
                "values",
                &self
                    .items
                    .iter()
                    .map(|i| i.value.to_value())
                    .collect::<Vec<_>>(),
            )
            .field("bound", &self.binding.is_some())
            .finish()
    }
}

impl<V: Attribute + Default + Clone + 'static> HasManyField for HasManyValues<V> {
    fn item_type(&self) -> Option<TypeKey> {
        None
    }

    fn value_type(&self) -> Option<SqlType> {
        Some(V::default().sql_type())
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    fn bind(&mut self, binding: Binding) {
        self.binding = Some(binding);
    }

    fn unbind(&mut self) {
        self.binding = None;
    }

    fn entries(&self) -> Vec<Entry> {
        self.items
            .iter()
            .map(|item| Entry::Value {
                value: item.value.to_value(),
                link: item.link.clone(),
            })
            .collect()
    }

    fn set_link(&mut self, index: usize, link: Option<ProxyRef>) {
        if let Some(item) = self.items.get_mut(index) {
            item.link = link;
        }
    }

    fn contains_item(&self, _item: &ProxyRef) -> bool {
        false
    }

    fn add_item(&mut self, item: ProxyRef, _link: Option<ProxyRef>) -> Result<()> {
        Err(ormstore_core::Error::Custom(format!(
            "cannot add object of type {} to a value collection",
            item.type_name()
        )))
    }

    fn remove_item(&mut self, _item: &ProxyRef) -> Option<Option<ProxyRef>> {
        None
    }

    fn add_value(&mut self, value: Value, link: Option<ProxyRef>) -> Result<()> {
        let mut item = V::default();
        item.assign(value)?;
        self.items.push(ValueItem { value: item, link });
        Ok(())
    }

    fn restore(&mut self, entries: Vec<Entry>) -> Result<()> {
        self.items.clear();
        for entry in entries {
            if let Entry::Value { value, link } = entry {
                self.add_value(value, link)?;
            }
        }
        Ok(())
    }
}
