//! Bulk loading of persisted objects into a store.

use std::collections::HashMap;
use std::rc::Rc;

use ormstore_core::{Error, Identifier, Result, Value};

use crate::prototype::{JoinTarget, NodeId};
use crate::proxy::{ObjectProxy, ProxyRef};
use crate::relation::{BindMode, RelationItem};
use crate::store::StoreShared;
use crate::visitor::TypeKey;

/// Feeds loaded objects and relation rows into a store.
///
/// While a loader is alive the store raises no observer events and records
/// nothing in transactions. References to objects that have not arrived yet
/// resolve to empty placeholder proxies which are filled in place when the
/// object is loaded. [`Loader::finish`] re-links relation rows and binds
/// every loaded object.
pub struct Loader {
    shared: Rc<StoreShared>,
    placeholders: HashMap<(NodeId, Identifier), ProxyRef>,
    loaded: Vec<ProxyRef>,
    links: Vec<(NodeId, ProxyRef)>,
    was_silent: bool,
    active: bool,
}

impl Loader {
    pub(crate) fn new(shared: Rc<StoreShared>) -> Self {
        let was_silent = shared.silent.replace(true);
        Self {
            shared,
            placeholders: HashMap::new(),
            loaded: Vec::new(),
            links: Vec::new(),
            was_silent,
            active: true,
        }
    }

    /// A fresh instance of the prototype named `table`, to be filled from a
    /// row and passed to [`Loader::load`].
    pub fn create(&self, table: &str) -> Result<ProxyRef> {
        self.shared.create_object(table)
    }

    /// The proxy of the `type_key` object whose primary key is `key`.
    ///
    /// Null keys yield `None`.
    pub fn reference(&mut self, type_key: TypeKey, key: &Value) -> Result<Option<ProxyRef>> {
        if key.is_null() {
            return Ok(None);
        }
        let node = self.shared.entity_node(type_key)?;
        let pk = self.shared.typed_key(node, key)?;
        if let Some(proxy) = self.shared.proxy_by_key(node, &pk) {
            return Ok(Some(proxy));
        }
        let proxy = self
            .placeholders
            .entry((node, pk.clone()))
            .or_insert_with(|| ObjectProxy::placeholder(type_key, pk));
        Ok(Some(Rc::clone(proxy)))
    }

    /// Insert a loaded object. If a placeholder was handed out for its key,
    /// the object moves into the placeholder, which is returned instead.
    pub fn load(&mut self, proxy: ProxyRef) -> Result<ProxyRef> {
        let node = self.shared.entity_node(proxy.type_key())?;
        proxy.resolve_identifier()?;
        let target = match self.placeholders.remove(&(node, proxy.pk())) {
            Some(placeholder) => {
                placeholder.reset(proxy.take_object(), true, true)?;
                placeholder
            }
            None => proxy,
        };
        self.shared.link_proxy(node, &target, None)?;
        tracing::trace!(oid = target.oid(), pk = %target.pk(), "Loaded object");
        self.loaded.push(Rc::clone(&target));
        Ok(target)
    }

    /// Record one row of the relation table `table`.
    pub fn link(&mut self, table: &str, owner: &Value, item: &Value) -> Result<()> {
        let (join, spec) = self.shared.join_spec(table)?;
        let owner = self
            .reference(spec.owner, owner)?
            .ok_or_else(|| Error::Custom(format!("row of '{table}' has no owner key")))?;
        let columns = (spec.owner_column.clone(), spec.item_column.clone());
        let row = match spec.item {
            JoinTarget::Object(item_type) => {
                let item = self
                    .reference(item_type, item)?
                    .ok_or_else(|| Error::Custom(format!("row of '{table}' has no item key")))?;
                RelationItem::objects(&columns, owner, item)
            }
            JoinTarget::Value(_) => RelationItem::value(&columns, owner, item.clone()),
        };
        let link = ObjectProxy::new(row);
        self.shared.link_proxy(join, &link, None)?;
        self.links.push((join, link));
        Ok(())
    }

    /// Number of objects loaded so far.
    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    /// Re-link relation rows, bind relation fields and hand the store back
    /// to observers and transactions. Returns the number of loaded objects.
    pub fn finish(mut self) -> Result<usize> {
        let result = self.complete();
        self.release();
        result
    }

    fn complete(&mut self) -> Result<usize> {
        for (join, link) in std::mem::take(&mut self.links) {
            self.shared.relink(join, &link)?;
        }
        for proxy in &self.loaded {
            self.shared.bind_relations(proxy, BindMode::Load)?;
        }
        if !self.placeholders.is_empty() {
            tracing::warn!(
                unresolved = self.placeholders.len(),
                "Loaded rows reference objects that were never loaded"
            );
        }
        tracing::debug!(
            objects = self.loaded.len(),
            "Finished loading"
        );
        Ok(self.loaded.len())
    }

    fn release(&mut self) {
        if self.active {
            self.shared.silent.set(self.was_silent);
            self.active = false;
        }
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("loaded", &self.loaded.len())
            .field("placeholders", &self.placeholders.len())
            .field("links", &self.links.len())
            .finish()
    }
}
