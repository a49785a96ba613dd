//! The object store: prototype registry, identity map and relation engine.
//!
//! [`ObjectStore`] is the user-facing handle. Its state lives in a shared
//! [`StoreShared`] that holders, transactions and loaders reach through weak
//! references, so a relation field can propagate a change to the other side
//! without the caller passing the store around.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use ormstore_core::{Error, Identifier, ObjectErrorKind, Result, Value};

use crate::discovery;
use crate::endpoint::{EndpointId, EndpointInfo, EndpointRole, EndpointView};
use crate::holder::ObjectPtr;
use crate::image::ObjectImage;
use crate::loader::Loader;
use crate::observer::{PrototypeInfo, StoreObserver};
use crate::prototype::{Factory, JoinSpec, NodeId, NodeKind, PrototypeNode, PrototypeTree};
use crate::proxy::{ObjectProxy, ProxyRef};
use crate::relation::{
    BindMode, BindTasks, BindVisitor, FieldOp, FieldOpVisitor, ForeignTask, LinkReader,
    RawUnbindVisitor, RelationItem, UnbindVisitor,
};
use crate::sequencer::Sequencer;
use crate::transaction::{
    Action, DefaultTransactionObserver, Transaction, TransactionData, TransactionObserver,
};
use crate::view::{GenericView, ObjectView};
use crate::visitor::{ErasedObject, KeyWriter, Persistent, TypeKey};

/// Store behavior switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Assign integral primary keys from a per-type sequence when an inserted
    /// object's key is unset.
    pub generate_primary_keys: bool,
    /// Insert not yet inserted objects reached through relation fields.
    pub cascade_insert: bool,
    /// First store-local id.
    pub sequence_start: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            generate_primary_keys: true,
            cascade_insert: true,
            sequence_start: 1,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn generate_primary_keys(mut self, value: bool) -> Self {
        self.generate_primary_keys = value;
        self
    }

    #[must_use]
    pub fn cascade_insert(mut self, value: bool) -> Self {
        self.cascade_insert = value;
        self
    }

    #[must_use]
    pub fn sequence_start(mut self, value: u64) -> Self {
        self.sequence_start = value.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Insert,
    Update,
    Delete,
}

fn unknown_type(what: &str) -> Error {
    Error::object(
        ObjectErrorKind::UnknownType,
        format!("no prototype attached for '{what}'"),
    )
}

fn unknown_node(id: NodeId) -> Error {
    Error::object(
        ObjectErrorKind::UnknownType,
        format!("prototype node {id:?} is not attached"),
    )
}

fn unknown_endpoint(id: EndpointId) -> Error {
    Error::Custom(format!("relation endpoint {id:?} is not registered"))
}

pub(crate) fn factory_of<T: Persistent + Default>() -> Factory {
    Rc::new(|| Box::new(T::default()) as Box<dyn ErasedObject>)
}

/// State shared by the store handle, holders, transactions and loaders.
pub(crate) struct StoreShared {
    me: Weak<StoreShared>,
    config: StoreConfig,
    pub(crate) tree: RefCell<PrototypeTree>,
    objects: RefCell<HashMap<u64, ProxyRef>>,
    sequencer: Sequencer,
    transactions: RefCell<Vec<Rc<TransactionData>>>,
    observers: RefCell<Vec<Rc<dyn StoreObserver>>>,
    /// Owners whose relation change is in progress; foreign operations
    /// targeting them are skipped.
    busy: RefCell<Vec<*const ObjectProxy>>,
    pub(crate) silent: Cell<bool>,
}

struct BusyGuard<'a> {
    store: &'a StoreShared,
    proxy: *const ObjectProxy,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self.store.busy.borrow_mut();
        if let Some(position) = busy.iter().rposition(|p| *p == self.proxy) {
            busy.remove(position);
        }
    }
}

struct SilentGuard<'a> {
    store: &'a StoreShared,
    previous: bool,
}

impl Drop for SilentGuard<'_> {
    fn drop(&mut self) {
        self.store.silent.set(self.previous);
    }
}

impl StoreShared {
    fn new(config: StoreConfig) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            sequencer: Sequencer::new(config.sequence_start),
            config,
            tree: RefCell::new(PrototypeTree::default()),
            objects: RefCell::new(HashMap::new()),
            transactions: RefCell::new(Vec::new()),
            observers: RefCell::new(Vec::new()),
            busy: RefCell::new(Vec::new()),
            silent: Cell::new(false),
        })
    }

    fn busy(&self, proxy: &ProxyRef) -> BusyGuard<'_> {
        let ptr = Rc::as_ptr(proxy);
        self.busy.borrow_mut().push(ptr);
        BusyGuard {
            store: self,
            proxy: ptr,
        }
    }

    fn is_busy(&self, proxy: &ProxyRef) -> bool {
        self.busy.borrow().contains(&Rc::as_ptr(proxy))
    }

    fn silence(&self) -> SilentGuard<'_> {
        SilentGuard {
            store: self,
            previous: self.silent.replace(true),
        }
    }

    // ---- lookup ----------------------------------------------------------

    pub(crate) fn entity_node(&self, type_key: TypeKey) -> Result<NodeId> {
        self.tree
            .borrow()
            .find_type(type_key.id())
            .ok_or_else(|| unknown_type(type_key.name()))
    }

    fn node_by_name(&self, name: &str) -> Result<NodeId> {
        self.tree
            .borrow()
            .find_name(name)
            .ok_or_else(|| unknown_type(name))
    }

    fn endpoint_view(&self, id: EndpointId) -> Result<EndpointView> {
        self.tree
            .borrow()
            .endpoint_view(id)
            .ok_or_else(|| unknown_endpoint(id))
    }

    /// Endpoint views of the proxy's node; empty for relation rows.
    fn entity_endpoints(&self, proxy: &ProxyRef) -> HashMap<String, EndpointView> {
        let tree = self.tree.borrow();
        match proxy.node().and_then(|id| tree.node(id).map(|n| (id, n))) {
            Some((id, node)) if node.kind == NodeKind::Entity => tree.endpoint_views(id),
            _ => HashMap::new(),
        }
    }

    /// Convert `key` to the concrete identifier type of `node`.
    pub(crate) fn typed_key(&self, node: NodeId, key: &Value) -> Result<Identifier> {
        let tree = self.tree.borrow();
        let entry = tree.node(node).ok_or_else(|| unknown_node(node))?;
        entry.key_template.like(key)
    }

    pub(crate) fn proxy_by_key(&self, node: NodeId, pk: &Identifier) -> Option<ProxyRef> {
        let oid = {
            let tree = self.tree.borrow();
            *tree.node(node)?.pk_index.get(pk)?
        };
        self.objects.borrow().get(&oid).cloned()
    }

    fn lookup(&self, type_key: TypeKey, pk: &Identifier) -> Option<ProxyRef> {
        let node = self.tree.borrow().find_type(type_key.id())?;
        let pk = {
            let tree = self.tree.borrow();
            let template = &tree.node(node)?.key_template;
            if pk.same_type(template) {
                pk.clone()
            } else {
                template.like(&pk.to_value()).ok()?
            }
        };
        self.proxy_by_key(node, &pk)
    }

    pub(crate) fn join_spec(&self, table: &str) -> Result<(NodeId, JoinSpec)> {
        let tree = self.tree.borrow();
        let id = tree.find_name(table).ok_or_else(|| unknown_type(table))?;
        tree.node(id)
            .and_then(|n| n.join.clone())
            .map(|spec| (id, spec))
            .ok_or_else(|| {
                Error::object(
                    ObjectErrorKind::UnknownType,
                    format!("'{table}' is not a relation table"),
                )
            })
    }

    /// A fresh instance of the prototype named `name`.
    pub(crate) fn create_object(&self, name: &str) -> Result<ProxyRef> {
        let factory = {
            let tree = self.tree.borrow();
            let id = tree.find_name(name).ok_or_else(|| unknown_type(name))?;
            let node = tree.node(id).ok_or_else(|| unknown_node(id))?;
            Rc::clone(&node.factory)
        };
        Ok(ObjectProxy::create(&*factory))
    }

    fn collect(&self, node: NodeId, skip_siblings: bool) -> Vec<ProxyRef> {
        let tree = self.tree.borrow();
        let nodes = if skip_siblings {
            vec![node]
        } else {
            tree.subtree(node)
        };
        nodes
            .into_iter()
            .filter_map(|id| tree.node(id))
            .flat_map(|n| n.objects.iter().cloned())
            .collect()
    }

    // ---- notification ----------------------------------------------------

    fn notify(&self, proxy: &ProxyRef, event: Event) {
        if self.silent.get() {
            return;
        }
        let Some(node) = proxy.node() else {
            return;
        };
        let (table, mut observers) = {
            let tree = self.tree.borrow();
            let Some(entry) = tree.node(node) else {
                return;
            };
            (entry.name.clone(), entry.observers.clone())
        };
        observers.extend(self.observers.borrow().iter().cloned());
        for observer in &observers {
            match event {
                Event::Insert => observer.on_insert(&table, proxy),
                Event::Update => observer.on_update(&table, proxy),
                Event::Delete => observer.on_delete(&table, proxy),
            }
        }
    }

    fn announce(
        &self,
        detached: &[PrototypeInfo],
        local: &HashMap<String, Vec<Rc<dyn StoreObserver>>>,
        attached: &[NodeId],
    ) -> Result<()> {
        let global: Vec<Rc<dyn StoreObserver>> = self.observers.borrow().clone();
        for info in detached {
            let own = local.get(&info.name).into_iter().flatten();
            for observer in own.chain(global.iter()) {
                observer.on_detach(info);
            }
        }
        for id in attached {
            let info = PrototypeInfo::build(&self.tree.borrow(), *id)?;
            for observer in &global {
                observer.on_attach(&info);
            }
        }
        Ok(())
    }

    fn record_insert(&self, proxy: &ProxyRef) {
        if self.silent.get() {
            return;
        }
        if let Some(tx) = self.current_transaction_data() {
            tx.push(Action::Insert {
                proxy: Rc::clone(proxy),
            });
        }
        self.notify(proxy, Event::Insert);
    }

    /// Log the first change of an object in the current transaction and tell
    /// observers it is about to change.
    pub(crate) fn mark_modified(&self, proxy: &ProxyRef) -> Result<()> {
        if self.silent.get() || !proxy.in_store(self) {
            return Ok(());
        }
        if let Some(tx) = self.current_transaction_data() {
            if !tx.has_logged(proxy.oid()) {
                let image = proxy.backup()?;
                tx.push(Action::Update {
                    proxy: Rc::clone(proxy),
                    image,
                });
            }
        }
        self.notify(proxy, Event::Update);
        Ok(())
    }

    // ---- structure -------------------------------------------------------

    fn attach(
        &self,
        name: &str,
        type_key: TypeKey,
        parent: Option<NodeId>,
        factory: Factory,
    ) -> Result<NodeId> {
        let outcome =
            discovery::attach(&mut self.tree.borrow_mut(), name, type_key, parent, factory)?;
        tracing::debug!(
            name,
            type_name = type_key.name(),
            nodes = outcome.attached.len(),
            replaced = outcome.detached.len(),
            "Attached prototype"
        );
        self.announce(&outcome.detached, &HashMap::new(), &outcome.attached)?;
        Ok(outcome.node)
    }

    fn detach(&self, id: NodeId) -> Result<()> {
        let local: HashMap<String, Vec<Rc<dyn StoreObserver>>> = {
            let tree = self.tree.borrow();
            tree.subtree(id)
                .into_iter()
                .filter_map(|n| tree.node(n))
                .map(|n| (n.name.clone(), n.observers.clone()))
                .collect()
        };
        let outcome = discovery::detach(&mut self.tree.borrow_mut(), id)?;
        for proxy in &outcome.evicted {
            proxy.set_slot(None);
            proxy.set_node(None);
            proxy.set_store(Weak::new());
            let removed = self.objects.borrow_mut().remove(&proxy.oid());
            drop(removed);
            drop(proxy.take_object());
        }
        tracing::debug!(
            nodes = outcome.detached.len(),
            evicted = outcome.evicted.len(),
            "Detached prototype"
        );
        self.announce(&outcome.detached, &local, &outcome.attached)
    }

    // ---- identity --------------------------------------------------------

    /// Link `proxy` into `node`, resolving its primary key and store-local
    /// id. `oid` restores a previous id.
    pub(crate) fn link_proxy(&self, node: NodeId, proxy: &ProxyRef, oid: Option<u64>) -> Result<()> {
        {
            let mut tree = self.tree.borrow_mut();
            let entry = tree.node_mut(node).ok_or_else(|| unknown_node(node))?;
            let mut pk = Identifier::Null;
            if entry.primary_key.is_some() {
                proxy.resolve_identifier()?;
                pk = proxy.pk();
                if !pk.is_valid()
                    && entry.integral_key
                    && self.config.generate_primary_keys
                    && oid.is_none()
                {
                    pk = generate_key(entry, proxy)?;
                }
                if pk.is_valid() {
                    if let Some(existing) = entry.pk_index.get(&pk) {
                        if oid != Some(*existing) {
                            return Err(Error::object(
                                ObjectErrorKind::DuplicateIdentifier,
                                format!("'{}' already holds an object with key {pk}", entry.name),
                            ));
                        }
                    }
                    entry.observe_key(&pk);
                }
            }
            let oid = match oid {
                Some(oid) => {
                    self.sequencer.update(oid);
                    oid
                }
                None => self.sequencer.next_id(),
            };
            if pk.is_valid() {
                entry.pk_index.insert(pk, oid);
            }
            proxy.set_oid(oid);
            proxy.set_node(Some(node));
            let slot = entry.objects.push_back(Rc::clone(proxy));
            proxy.set_slot(Some(slot));
        }
        proxy.set_store(self.me.clone());
        self.objects
            .borrow_mut()
            .insert(proxy.oid(), Rc::clone(proxy));
        Ok(())
    }

    /// Take `proxy` out of its node and the identity map. The node id stays
    /// so the proxy can be relinked on rollback.
    fn unlink_proxy(&self, proxy: &ProxyRef) {
        let unlinked = proxy.node().and_then(|node| {
            let mut tree = self.tree.borrow_mut();
            let entry = tree.node_mut(node)?;
            let pk = proxy.pk();
            if entry.pk_index.get(&pk) == Some(&proxy.oid()) {
                entry.pk_index.remove(&pk);
            }
            entry.objects.unlink(proxy.slot()?)
        });
        proxy.set_slot(None);
        proxy.set_store(Weak::new());
        let removed = self.objects.borrow_mut().remove(&proxy.oid());
        drop((unlinked, removed));
    }

    pub(crate) fn proxy(&self, oid: u64) -> Option<ProxyRef> {
        self.objects.borrow().get(&oid).cloned()
    }

    // ---- insert ----------------------------------------------------------

    #[tracing::instrument(level = "debug", skip(self, proxy), fields(type_name = proxy.type_name()))]
    pub(crate) fn insert_proxy(&self, proxy: &ProxyRef) -> Result<()> {
        if proxy.is_inserted() {
            return Err(Error::object(
                ObjectErrorKind::AlreadyInserted,
                format!(
                    "object {} of type {} is already inserted",
                    proxy.oid(),
                    proxy.type_name()
                ),
            ));
        }
        if !proxy.is_loaded() {
            return Err(proxy.not_loaded());
        }
        let node = self.entity_node(proxy.type_key())?;
        self.link_proxy(node, proxy, None)?;
        self.record_insert(proxy);
        tracing::debug!(oid = proxy.oid(), pk = %proxy.pk(), "Inserted object");
        self.bind_relations(proxy, BindMode::Insert)
    }

    pub(crate) fn bind_relations(&self, proxy: &ProxyRef, mode: BindMode) -> Result<()> {
        let endpoints = self.entity_endpoints(proxy);
        if endpoints.is_empty() {
            return Ok(());
        }
        let mut visitor = BindVisitor::new(
            self.me.clone(),
            proxy,
            endpoints,
            mode,
            self.config.cascade_insert,
        );
        proxy.visit(&mut visitor)?;
        let tasks = visitor.tasks;
        self.run_bind_tasks(proxy, tasks)
    }

    fn run_bind_tasks(&self, owner: &ProxyRef, tasks: BindTasks) -> Result<()> {
        let _busy = self.busy(owner);
        for target in &tasks.inserts {
            self.cascade_target(target)?;
        }
        for (join, link) in &tasks.joins {
            self.insert_join(*join, link)?;
        }
        for task in tasks.foreign {
            self.run_foreign(task)?;
        }
        Ok(())
    }

    fn cascade_target(&self, target: &ProxyRef) -> Result<()> {
        if target.is_inserted() || !target.is_loaded() {
            return Ok(());
        }
        if self.tree.borrow().find_type(target.type_key().id()).is_none() {
            tracing::warn!(
                type_name = target.type_name(),
                "Related object of an unattached type is not inserted"
            );
            return Ok(());
        }
        self.insert_proxy(target)
    }

    fn insert_join(&self, join: NodeId, link: &ProxyRef) -> Result<()> {
        if link.is_inserted() {
            return Ok(());
        }
        self.link_proxy(join, link, None)?;
        self.record_insert(link);
        Ok(())
    }

    fn run_foreign(&self, task: ForeignTask) -> Result<()> {
        let previous = self.apply_foreign(&task.target, &task.field, &task.op)?;
        if let (Some(field), Some(previous)) = (task.reassign, previous) {
            self.apply_foreign(&previous, &field, &FieldOp::RemoveItem(Rc::clone(&task.target)))?;
        }
        Ok(())
    }

    /// Apply `op` to `field` of `target`, logging the change first. Busy and
    /// empty targets are left alone. Returns the replaced reference.
    fn apply_foreign(
        &self,
        target: &ProxyRef,
        field: &str,
        op: &FieldOp,
    ) -> Result<Option<ProxyRef>> {
        if self.is_busy(target) || !target.is_loaded() {
            return Ok(None);
        }
        let mut probe = FieldOpVisitor::new(field, op, true);
        target.visit(&mut probe)?;
        if !probe.changed {
            return Ok(None);
        }
        self.mark_modified(target)?;
        let mut apply = FieldOpVisitor::new(field, op, false);
        target.visit(&mut apply)?;
        tracing::trace!(oid = target.oid(), field, "Updated other side of relation");
        Ok(apply.previous)
    }

    // ---- relation callbacks from holders --------------------------------

    pub(crate) fn cascade_insert(
        &self,
        owner: &ProxyRef,
        endpoint: EndpointId,
        target: &ProxyRef,
    ) -> Result<()> {
        let view = self.endpoint_view(endpoint)?;
        if !(self.config.cascade_insert || view.cascade.inserts()) {
            return Ok(());
        }
        let _busy = self.busy(owner);
        self.cascade_target(target)
    }

    /// A single reference field of `owner` moved from `previous` to
    /// `current`.
    pub(crate) fn reference_changed(
        &self,
        owner: &ProxyRef,
        endpoint: EndpointId,
        previous: Option<ProxyRef>,
        current: Option<ProxyRef>,
    ) -> Result<()> {
        let view = self.endpoint_view(endpoint)?;
        let Some(foreign_field) = view.foreign_field.as_deref() else {
            return Ok(());
        };
        let _busy = self.busy(owner);
        match view.role {
            EndpointRole::HasOne | EndpointRole::BelongsToOne => {
                if let Some(previous) = &previous {
                    self.apply_foreign(previous, foreign_field, &FieldOp::ClearIf(Rc::clone(owner)))?;
                }
                if let Some(current) = &current {
                    self.apply_foreign(
                        current,
                        foreign_field,
                        &FieldOp::SetReference(Some(Rc::clone(owner))),
                    )?;
                }
            }
            EndpointRole::BelongsToMany => {
                if let Some(previous) = &previous {
                    self.apply_foreign(
                        previous,
                        foreign_field,
                        &FieldOp::RemoveItem(Rc::clone(owner)),
                    )?;
                }
                if let Some(current) = &current {
                    self.apply_foreign(
                        current,
                        foreign_field,
                        &FieldOp::AddItem {
                            item: Rc::clone(owner),
                            link: None,
                        },
                    )?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether a collection bound to `endpoint` holds each item at most once.
    pub(crate) fn is_item_unique(&self, endpoint: EndpointId) -> bool {
        self.tree
            .borrow()
            .endpoint(endpoint)
            .is_some_and(|e| e.role == EndpointRole::ManyToOne)
    }

    /// `item` was added to a collection of `owner`. Returns the relation row
    /// created for it, if the relation keeps one.
    pub(crate) fn relation_add(
        &self,
        owner: &ProxyRef,
        endpoint: EndpointId,
        item: &ProxyRef,
    ) -> Result<Option<ProxyRef>> {
        let view = self.endpoint_view(endpoint)?;
        let _busy = self.busy(owner);
        if self.config.cascade_insert || view.cascade.inserts() {
            self.cascade_target(item)?;
        }
        self.check_other_side(owner, &view, item)?;
        let link = match (view.join, &view.join_columns) {
            (Some(join), Some(columns)) => {
                let row = if view.role == EndpointRole::RightToMany {
                    RelationItem::objects(columns, Rc::clone(item), Rc::clone(owner))
                } else {
                    RelationItem::objects(columns, Rc::clone(owner), Rc::clone(item))
                };
                let link = ObjectProxy::new(row);
                self.insert_join(join, &link)?;
                Some(link)
            }
            _ => None,
        };
        if let Err(err) = self.add_other_side(owner, &view, item, link.as_ref()) {
            if let Some(link) = link.as_ref().filter(|l| l.in_store(self)) {
                self.remove_proxy(link)?;
            }
            return Err(err);
        }
        Ok(link)
    }

    fn add_other_side(
        &self,
        owner: &ProxyRef,
        view: &EndpointView,
        item: &ProxyRef,
        link: Option<&ProxyRef>,
    ) -> Result<()> {
        let Some(foreign_field) = view.foreign_field.as_deref() else {
            return Ok(());
        };
        match view.role {
            EndpointRole::ManyToOne => {
                let previous = self.apply_foreign(
                    item,
                    foreign_field,
                    &FieldOp::SetReference(Some(Rc::clone(owner))),
                )?;
                if let Some(previous) = previous.filter(|p| !Rc::ptr_eq(p, owner)) {
                    self.apply_foreign(&previous, &view.field, &FieldOp::RemoveItem(Rc::clone(item)))?;
                }
            }
            EndpointRole::LeftToMany | EndpointRole::RightToMany => {
                self.apply_foreign(
                    item,
                    foreign_field,
                    &FieldOp::AddItem {
                        item: Rc::clone(owner),
                        link: link.cloned(),
                    },
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Fails with `ObjectBorrowed` when adding or removing `item` would have
    /// to update its side of the relation while its object is borrowed.
    pub(crate) fn check_relation_item(
        &self,
        owner: &ProxyRef,
        endpoint: EndpointId,
        item: &ProxyRef,
    ) -> Result<()> {
        let view = self.endpoint_view(endpoint)?;
        self.check_other_side(owner, &view, item)
    }

    fn check_other_side(&self, owner: &ProxyRef, view: &EndpointView, item: &ProxyRef) -> Result<()> {
        let mirrored = matches!(
            view.role,
            EndpointRole::ManyToOne | EndpointRole::LeftToMany | EndpointRole::RightToMany
        );
        if view.foreign_field.is_none()
            || !mirrored
            || Rc::ptr_eq(owner, item)
            || self.is_busy(item)
            || !item.is_loaded()
        {
            return Ok(());
        }
        match item.object_cell().try_borrow_mut() {
            Ok(_) => Ok(()),
            Err(_) => Err(item.borrowed()),
        }
    }

    /// `item` was removed from a collection of `owner`.
    pub(crate) fn relation_remove(
        &self,
        owner: &ProxyRef,
        endpoint: EndpointId,
        item: &ProxyRef,
        link: Option<ProxyRef>,
    ) -> Result<()> {
        let view = self.endpoint_view(endpoint)?;
        let _busy = self.busy(owner);
        if let Some(link) = link.filter(|l| l.in_store(self)) {
            self.remove_proxy(&link)?;
        }
        if let Some(foreign_field) = view.foreign_field.as_deref() {
            match view.role {
                EndpointRole::ManyToOne => {
                    self.apply_foreign(item, foreign_field, &FieldOp::ClearIf(Rc::clone(owner)))?;
                }
                EndpointRole::LeftToMany | EndpointRole::RightToMany => {
                    self.apply_foreign(item, foreign_field, &FieldOp::RemoveItem(Rc::clone(owner)))?;
                }
                _ => {}
            }
        }
        if view.cascade.removes() && item.in_store(self) && item.reference_count() == 0 {
            self.remove_proxy(item)?;
        }
        Ok(())
    }

    /// A builtin value was added to a collection of `owner`.
    pub(crate) fn value_add(
        &self,
        owner: &ProxyRef,
        endpoint: EndpointId,
        value: Value,
    ) -> Result<Option<ProxyRef>> {
        let view = self.endpoint_view(endpoint)?;
        let (Some(join), Some(columns)) = (view.join, &view.join_columns) else {
            return Ok(None);
        };
        let link = ObjectProxy::new(RelationItem::value(columns, Rc::clone(owner), value));
        self.insert_join(join, &link)?;
        Ok(Some(link))
    }

    pub(crate) fn value_remove(&self, link: Option<ProxyRef>) -> Result<()> {
        match link.filter(|l| l.in_store(self)) {
            Some(link) => self.remove_proxy(&link),
            None => Ok(()),
        }
    }

    /// Re-attach one loaded relation row to the collections using its table.
    pub(crate) fn relink(&self, join: NodeId, link: &ProxyRef) -> Result<()> {
        let mut reader = LinkReader::default();
        link.visit(&mut reader)?;
        let owner = reader.links.first().cloned().flatten();
        let item = reader.links.get(1).cloned().flatten();
        let endpoints: Vec<(String, EndpointRole)> = {
            let tree = self.tree.borrow();
            tree.join_endpoints(join)
                .into_iter()
                .filter_map(|id| tree.endpoint(id))
                .map(|e| (e.field.clone(), e.role))
                .collect()
        };
        for (field, role) in endpoints {
            let (target, op) = match (role, &owner, &item) {
                (EndpointRole::HasManyValues, Some(owner), _) => (
                    owner,
                    FieldOp::AddValue {
                        value: reader.value.clone().unwrap_or(Value::Null),
                        link: Some(Rc::clone(link)),
                    },
                ),
                (EndpointRole::RightToMany, Some(owner), Some(item)) => (
                    item,
                    FieldOp::AddItem {
                        item: Rc::clone(owner),
                        link: Some(Rc::clone(link)),
                    },
                ),
                (_, Some(owner), Some(item)) => (
                    owner,
                    FieldOp::AddItem {
                        item: Rc::clone(item),
                        link: Some(Rc::clone(link)),
                    },
                ),
                _ => continue,
            };
            self.apply_foreign(target, &field, &op)?;
        }
        Ok(())
    }

    // ---- remove ----------------------------------------------------------

    #[tracing::instrument(level = "debug", skip(self, proxy), fields(oid = proxy.oid(), type_name = proxy.type_name()))]
    pub(crate) fn remove_proxy(&self, proxy: &ProxyRef) -> Result<()> {
        if !proxy.in_store(self) {
            return Err(Error::object(
                ObjectErrorKind::ObjectNotInStore,
                format!(
                    "object {} of type {} is not in this store",
                    proxy.oid(),
                    proxy.type_name()
                ),
            ));
        }
        if proxy.reference_count() > 0 {
            return Err(Error::object(
                ObjectErrorKind::HasReferences,
                format!(
                    "object {} of type {} is still referenced {} time(s)",
                    proxy.oid(),
                    proxy.type_name(),
                    proxy.reference_count()
                ),
            ));
        }
        if proxy.object_cell().try_borrow_mut().is_err() {
            return Err(proxy.borrowed());
        }
        if !self.silent.get() {
            if let Some(tx) = self.current_transaction_data() {
                let image = proxy.backup()?;
                tx.push(Action::Delete {
                    proxy: Rc::clone(proxy),
                    image,
                });
            }
        }
        self.notify(proxy, Event::Delete);

        let tasks = {
            let mut visitor = UnbindVisitor::new(proxy, self.entity_endpoints(proxy));
            proxy.visit(&mut visitor)?;
            visitor.tasks
        };
        {
            let _busy = self.busy(proxy);
            for link in &tasks.joins {
                if link.in_store(self) {
                    self.remove_proxy(link)?;
                }
            }
            for task in tasks.foreign {
                self.run_foreign(task)?;
            }
        }
        self.unlink_proxy(proxy);
        drop(proxy.take_object());
        tracing::debug!("Removed object");

        for target in tasks.cascade {
            if target.in_store(self) && target.reference_count() == 0 {
                self.remove_proxy(&target)?;
            }
        }
        Ok(())
    }

    /// Drop a proxy from the store without touching related objects.
    fn evict(&self, proxy: &ProxyRef) -> Result<()> {
        if !proxy.in_store(self) {
            return Ok(());
        }
        if proxy.is_loaded() {
            proxy.visit(&mut RawUnbindVisitor)?;
        }
        self.unlink_proxy(proxy);
        Ok(())
    }

    fn restore_image(&self, proxy: &ProxyRef, image: &ObjectImage) -> Result<()> {
        let before = proxy.pk();
        proxy.restore(image)?;
        let after = proxy.pk();
        if before != after && proxy.in_store(self) {
            if let Some(node) = proxy.node() {
                let mut tree = self.tree.borrow_mut();
                if let Some(entry) = tree.node_mut(node) {
                    entry.pk_index.remove(&before);
                    if after.is_valid() {
                        entry.pk_index.insert(after, proxy.oid());
                    }
                }
            }
        }
        Ok(())
    }

    /// Bring a removed object back under its old store-local id.
    fn resurrect(&self, proxy: &ProxyRef, image: &ObjectImage) -> Result<()> {
        let node = proxy.node().ok_or_else(|| proxy.not_loaded())?;
        let factory = {
            let tree = self.tree.borrow();
            let entry = tree.node(node).ok_or_else(|| unknown_node(node))?;
            Rc::clone(&entry.factory)
        };
        proxy.reset(Some(factory()), false, true)?;
        proxy.restore(image)?;
        self.link_proxy(node, proxy, Some(proxy.oid()))?;
        self.bind_relations(proxy, BindMode::Raw)?;
        proxy.mark_deleted(false);
        Ok(())
    }

    // ---- transactions ----------------------------------------------------

    pub(crate) fn push_transaction(&self, data: Rc<TransactionData>) {
        self.transactions.borrow_mut().push(data);
    }

    pub(crate) fn pop_transaction(&self) {
        self.transactions.borrow_mut().pop();
    }

    pub(crate) fn current_transaction_data(&self) -> Option<Rc<TransactionData>> {
        self.transactions.borrow().last().cloned()
    }

    pub(crate) fn parent_transaction_data(&self) -> Option<Rc<TransactionData>> {
        let transactions = self.transactions.borrow();
        let len = transactions.len();
        (len >= 2).then(|| Rc::clone(&transactions[len - 2]))
    }

    /// Undo actions newest first. Observers are not notified. Every action is
    /// attempted; the first failure is returned.
    pub(crate) fn replay_backwards(&self, actions: Vec<Action>) -> Result<()> {
        let _silent = self.silence();
        let mut first_error = None;
        for action in actions.into_iter().rev() {
            let kind = action.kind();
            let oid = action.proxy().oid();
            let result = match action {
                Action::Insert { proxy } => self.evict(&proxy),
                Action::Update { proxy, image } => self.restore_image(&proxy, &image),
                Action::Delete { proxy, image } => self.resurrect(&proxy, &image),
            };
            if let Err(err) = result {
                tracing::warn!(oid, action = kind, error = %err, "Could not undo action");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Assign the next free generated key to the object in `proxy`.
fn generate_key(node: &mut PrototypeNode, proxy: &ObjectProxy) -> Result<Identifier> {
    loop {
        let candidate = Identifier::U64(node.next_key());
        let mut writer = KeyWriter {
            identifier: &candidate,
            assigned: None,
        };
        proxy.visit(&mut writer)?;
        let assigned = writer.assigned.unwrap_or(Identifier::Null);
        if !node.pk_index.contains_key(&assigned) {
            proxy.set_pk(assigned.clone());
            return Ok(assigned);
        }
    }
}

impl Drop for StoreShared {
    fn drop(&mut self) {
        self.transactions.get_mut().clear();
        let proxies: Vec<ProxyRef> = self.objects.get_mut().drain().map(|(_, p)| p).collect();
        let objects: Vec<_> = proxies
            .iter()
            .map(|proxy| {
                proxy.set_slot(None);
                proxy.take_object()
            })
            .collect();
        drop(objects);
    }
}

/// Handle to an attached prototype.
#[derive(Clone)]
pub struct PrototypeRef {
    shared: Rc<StoreShared>,
    id: NodeId,
}

impl PrototypeRef {
    fn with_node<R>(&self, f: impl FnOnce(&PrototypeNode) -> R) -> Option<R> {
        self.shared.tree.borrow().node(self.id).map(f)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Whether the prototype is still attached.
    pub fn is_attached(&self) -> bool {
        self.with_node(|_| ()).is_some()
    }

    pub fn name(&self) -> String {
        self.with_node(|n| n.name.clone()).unwrap_or_default()
    }

    pub fn type_name(&self) -> &'static str {
        self.with_node(|n| n.type_key.name()).unwrap_or_default()
    }

    pub fn kind(&self) -> Option<NodeKind> {
        self.with_node(|n| n.kind)
    }

    pub fn primary_key(&self) -> Option<String> {
        self.with_node(|n| n.primary_key.as_ref().map(|(name, _)| name.clone()))
            .flatten()
    }

    /// Objects of this prototype and all of its descendants.
    pub fn size(&self) -> usize {
        let tree = self.shared.tree.borrow();
        tree.subtree(self.id)
            .into_iter()
            .filter_map(|id| tree.node(id))
            .map(|n| n.objects.len())
            .sum()
    }

    /// Objects of exactly this prototype.
    pub fn own_size(&self) -> usize {
        self.with_node(|n| n.objects.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn parent(&self) -> Option<PrototypeRef> {
        let parent = self.with_node(|n| n.parent).flatten()?;
        Some(PrototypeRef {
            shared: Rc::clone(&self.shared),
            id: parent,
        })
    }

    pub fn children(&self) -> Vec<PrototypeRef> {
        self.with_node(|n| n.children.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|id| PrototypeRef {
                shared: Rc::clone(&self.shared),
                id,
            })
            .collect()
    }

    /// Whether `other` is a proper ancestor of this prototype.
    pub fn is_child_of(&self, other: &PrototypeRef) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
            && self.shared.tree.borrow().is_ancestor(other.id, self.id)
    }

    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let tree = self.shared.tree.borrow();
        tree.node(self.id)
            .map(|n| {
                n.endpoints
                    .values()
                    .filter_map(|id| tree.endpoint_info(*id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of observers registered on this prototype.
    pub fn observers(&self) -> usize {
        self.with_node(|n| n.observers.len()).unwrap_or_default()
    }

    pub fn info(&self) -> Result<PrototypeInfo> {
        PrototypeInfo::build(&self.shared.tree.borrow(), self.id)
    }

    /// Objects of this prototype followed by those of its descendants.
    pub fn objects(&self) -> GenericView {
        GenericView::new(self.shared.collect(self.id, false))
    }
}

impl PartialEq for PrototypeRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared) && self.id == other.id
    }
}

impl fmt::Debug for PrototypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrototypeRef")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("size", &self.size())
            .finish()
    }
}

/// Pre-order iterator over the prototypes of a store.
pub struct Prototypes {
    inner: std::vec::IntoIter<PrototypeRef>,
}

impl Iterator for Prototypes {
    type Item = PrototypeRef;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for Prototypes {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl ExactSizeIterator for Prototypes {}

/// An in-memory object store.
///
/// # Example
///
/// ```ignore
/// let store = ObjectStore::new();
/// store.attach::<Person>("person")?;
/// let george = store.insert(Person::new("george"))?;
/// assert!(george.is_inserted());
/// store.remove(&george)?;
/// ```
pub struct ObjectStore {
    shared: Rc<StoreShared>,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            shared: StoreShared::new(config),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    fn prototype(&self, id: NodeId) -> PrototypeRef {
        PrototypeRef {
            shared: Rc::clone(&self.shared),
            id,
        }
    }

    /// Register `T` under `name`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn attach<T: Persistent + Default>(&self, name: &str) -> Result<PrototypeRef> {
        let id = self
            .shared
            .attach(name, TypeKey::of::<T>(), None, factory_of::<T>())?;
        Ok(self.prototype(id))
    }

    /// Register `T` under `name` as a child of the prototype of `B`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn attach_child<T: Persistent + Default, B: Persistent>(
        &self,
        name: &str,
    ) -> Result<PrototypeRef> {
        let parent = self.shared.entity_node(TypeKey::of::<B>())?;
        let id = self
            .shared
            .attach(name, TypeKey::of::<T>(), Some(parent), factory_of::<T>())?;
        Ok(self.prototype(id))
    }

    /// Remove the prototype named `name` and its descendants.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detach(&self, name: &str) -> Result<()> {
        let id = self.shared.node_by_name(name)?;
        self.shared.detach(id)
    }

    pub fn detach_type<T: Persistent>(&self) -> Result<()> {
        let id = self.shared.entity_node(TypeKey::of::<T>())?;
        self.shared.detach(id)
    }

    pub fn find<T: Persistent>(&self) -> Option<PrototypeRef> {
        let id = self.shared.tree.borrow().find_type(TypeId::of::<T>())?;
        Some(self.prototype(id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<PrototypeRef> {
        let id = self.shared.tree.borrow().find_name(name)?;
        Some(self.prototype(id))
    }

    /// All prototypes, relation tables included, in pre-order.
    pub fn prototypes(&self) -> Prototypes {
        let ids = self.shared.tree.borrow().preorder();
        Prototypes {
            inner: ids
                .into_iter()
                .map(|id| self.prototype(id))
                .collect::<Vec<_>>()
                .into_iter(),
        }
    }

    /// Observe every prototype.
    pub fn add_observer(&self, observer: Rc<dyn StoreObserver>) {
        self.shared.observers.borrow_mut().push(observer);
    }

    /// Observe the prototype named `name`. The observer is told about the
    /// prototype right away.
    pub fn observe(&self, name: &str, observer: Rc<dyn StoreObserver>) -> Result<()> {
        let id = self.shared.node_by_name(name)?;
        let info = {
            let mut tree = self.shared.tree.borrow_mut();
            let node = tree.node_mut(id).ok_or_else(|| unknown_node(id))?;
            node.observers.push(Rc::clone(&observer));
            PrototypeInfo::build(&tree, id)?
        };
        observer.on_attach(&info);
        Ok(())
    }

    /// Insert a new object.
    pub fn insert<T: Persistent>(&self, object: T) -> Result<ObjectPtr<T>> {
        let ptr = ObjectPtr::new(object);
        self.shared.insert_proxy(ptr.proxy())?;
        Ok(ptr)
    }

    /// Insert the object behind an existing handle.
    pub fn insert_ptr<T: Persistent>(&self, ptr: &ObjectPtr<T>) -> Result<()> {
        self.shared.insert_proxy(ptr.proxy())
    }

    pub fn insert_proxy(&self, proxy: &ProxyRef) -> Result<()> {
        self.shared.insert_proxy(proxy)
    }

    /// Remove an object. Its relation rows go with it and the other side of
    /// each of its relations is updated.
    pub fn remove<T: Persistent>(&self, ptr: &ObjectPtr<T>) -> Result<()> {
        self.shared.remove_proxy(ptr.proxy())
    }

    pub fn remove_proxy(&self, proxy: &ProxyRef) -> Result<()> {
        self.shared.remove_proxy(proxy)
    }

    /// The object of exactly type `T` with the given primary key.
    pub fn get<T: Persistent>(&self, pk: impl Into<Identifier>) -> Option<ObjectPtr<T>> {
        let proxy = self.shared.lookup(TypeKey::of::<T>(), &pk.into())?;
        ObjectPtr::from_proxy(&proxy)
    }

    /// The proxy with the given store-local id.
    pub fn proxy(&self, oid: u64) -> Option<ProxyRef> {
        self.shared.proxy(oid)
    }

    /// A new, not inserted instance built by the registered factory of `T`.
    pub fn create<T: Persistent>(&self) -> Result<ObjectPtr<T>> {
        let name = self
            .find::<T>()
            .map(|p| p.name())
            .ok_or_else(|| unknown_type(std::any::type_name::<T>()))?;
        let proxy = self.shared.create_object(&name)?;
        ObjectPtr::from_proxy(&proxy).ok_or_else(|| unknown_type(&name))
    }

    /// A new, not inserted instance of the prototype named `name`.
    pub fn create_by_name(&self, name: &str) -> Result<ProxyRef> {
        self.shared.create_object(name)
    }

    /// The objects of exactly type `T`.
    pub fn view<T: Persistent>(&self) -> Result<ObjectView<T>> {
        let node = self.shared.entity_node(TypeKey::of::<T>())?;
        Ok(ObjectView::new(
            self.shared
                .collect(node, true)
                .iter()
                .filter_map(ObjectPtr::from_proxy)
                .collect(),
        ))
    }

    /// The objects of the prototype named `name`; with `skip_siblings` unset,
    /// followed by those of its descendants.
    pub fn generic_view(&self, name: &str, skip_siblings: bool) -> Result<GenericView> {
        let node = self.shared.node_by_name(name)?;
        Ok(GenericView::new(self.shared.collect(node, skip_siblings)))
    }

    /// Number of stored domain objects, relation rows excluded.
    pub fn len(&self) -> usize {
        let tree = self.shared.tree.borrow();
        tree.preorder()
            .into_iter()
            .filter_map(|id| tree.node(id))
            .filter(|n| n.kind == NodeKind::Entity)
            .map(|n| n.objects.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every object and relation row without notifying observers.
    pub fn clear(&self) -> Result<()> {
        if self.has_transaction() {
            return Err(Error::Custom(
                "cannot clear a store while a transaction is active".to_string(),
            ));
        }
        let mut proxies: Vec<ProxyRef> = Vec::new();
        {
            let mut tree = self.shared.tree.borrow_mut();
            for id in tree.preorder() {
                if let Some(node) = tree.node_mut(id) {
                    node.pk_index.clear();
                    node.sequence = 0;
                    proxies.extend(node.objects.drain());
                }
            }
        }
        for proxy in &proxies {
            if proxy.is_loaded() {
                if let Err(err) = proxy.visit(&mut RawUnbindVisitor) {
                    tracing::warn!(oid = proxy.oid(), error = %err, "Could not unbind object");
                }
            }
            proxy.set_slot(None);
            proxy.set_node(None);
            proxy.set_store(Weak::new());
        }
        self.shared.objects.borrow_mut().clear();
        tracing::debug!(objects = proxies.len(), "Cleared store");
        Ok(())
    }

    /// A new transaction with the default observer. Call
    /// [`Transaction::begin`] to make it current.
    pub fn transaction(&self) -> Transaction {
        self.transaction_with(Rc::new(DefaultTransactionObserver))
    }

    pub fn transaction_with(&self, observer: Rc<dyn TransactionObserver>) -> Transaction {
        Transaction {
            data: Rc::new(TransactionData::new(
                self.shared.sequencer.next_id(),
                Rc::downgrade(&self.shared),
                observer,
            )),
        }
    }

    /// Create and begin a transaction.
    pub fn begin(&self) -> Result<Transaction> {
        let tx = self.transaction();
        tx.begin()?;
        Ok(tx)
    }

    pub fn current_transaction(&self) -> Option<Transaction> {
        self.shared
            .current_transaction_data()
            .map(|data| Transaction { data })
    }

    pub fn has_transaction(&self) -> bool {
        !self.shared.transactions.borrow().is_empty()
    }

    /// Start loading persisted objects. Observers and transactions are
    /// bypassed until the loader finishes.
    pub fn loader(&self) -> Loader {
        Loader::new(Rc::clone(&self.shared))
    }

    /// A handle that does not keep the store alive.
    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            shared: Rc::downgrade(&self.shared),
        }
    }
}

/// Non-owning handle to an [`ObjectStore`], for observers the store itself
/// keeps alive.
#[derive(Clone)]
pub struct WeakStore {
    shared: Weak<StoreShared>,
}

impl WeakStore {
    pub fn upgrade(&self) -> Option<ObjectStore> {
        self.shared.upgrade().map(|shared| ObjectStore { shared })
    }
}

impl fmt::Debug for WeakStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakStore")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("prototypes", &self.prototypes().len())
            .field("objects", &self.len())
            .field("transactions", &self.shared.transactions.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visitor::AttributeVisitor;

    #[derive(Default)]
    struct Team {
        id: i64,
        name: String,
    }

    impl Persistent for Team {
        fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
            v.on_primary_key("id", &mut self.id)?;
            v.on_attribute("name", &mut self.name)
        }
    }

    #[derive(Default)]
    struct Country {
        code: String,
        name: String,
    }

    impl Persistent for Country {
        fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
            v.on_primary_key("code", &mut self.code)?;
            v.on_attribute("name", &mut self.name)
        }
    }

    fn team(name: &str) -> Team {
        Team {
            id: 0,
            name: name.to_string(),
        }
    }

    #[derive(Default)]
    struct Events(RefCell<Vec<String>>);

    impl StoreObserver for Events {
        fn on_insert(&self, table: &str, _proxy: &ProxyRef) {
            self.0.borrow_mut().push(format!("insert {table}"));
        }
    }

    #[test]
    fn test_key_generation_can_be_disabled() {
        let store = ObjectStore::with_config(StoreConfig::new().generate_primary_keys(false));
        store.attach::<Team>("team").unwrap();
        let red = store.insert(team("red")).unwrap();
        let blue = store.insert(team("blue")).unwrap();
        assert_eq!(red.pk(), Identifier::I64(0));
        assert_eq!(blue.pk(), Identifier::I64(0));
        assert!(store.get::<Team>(0).is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_sequence_start_offsets_oids() {
        let store = ObjectStore::with_config(StoreConfig::new().sequence_start(100));
        store.attach::<Team>("team").unwrap();
        let red = store.insert(team("red")).unwrap();
        assert!(red.oid() >= 100);
        assert_eq!(red.pk(), Identifier::I64(1));
        assert_eq!(store.proxy(red.oid()).map(|p| p.oid()), Some(red.oid()));
    }

    #[test]
    fn test_text_keys_are_never_generated() {
        let store = ObjectStore::new();
        store.attach::<Country>("country").unwrap();
        let nowhere = store.insert(Country::default()).unwrap();
        assert_eq!(nowhere.pk(), Identifier::Text(String::new()));

        let france = store
            .insert(Country {
                code: "fr".to_string(),
                name: "France".to_string(),
            })
            .unwrap();
        assert!(store.get::<Country>("fr").unwrap().ptr_eq(&france));

        let err = store
            .insert(Country {
                code: "fr".to_string(),
                name: "Francia".to_string(),
            })
            .unwrap_err();
        assert!(err.is(ObjectErrorKind::DuplicateIdentifier));
    }

    #[test]
    fn test_loader_bypasses_observers() {
        let store = ObjectStore::new();
        store.attach::<Team>("team").unwrap();
        let events = Rc::new(Events::default());
        store.add_observer(events.clone());

        let mut loader = store.loader();
        let loaded = ObjectPtr::new(Team {
            id: 7,
            name: "green".to_string(),
        });
        loader.load(Rc::clone(loaded.proxy())).unwrap();
        assert_eq!(loader.finish().unwrap(), 1);
        assert!(events.0.borrow().is_empty());
        assert!(store.get::<Team>(7).unwrap().ptr_eq(&loaded));

        let next = store.insert(team("red")).unwrap();
        assert_eq!(next.pk(), Identifier::I64(8));
        assert_eq!(*events.0.borrow(), vec!["insert team".to_string()]);
    }

    #[test]
    fn test_dropped_loader_restores_notifications() {
        let store = ObjectStore::new();
        store.attach::<Team>("team").unwrap();
        let events = Rc::new(Events::default());
        store.add_observer(events.clone());

        drop(store.loader());
        store.insert(team("red")).unwrap();
        assert_eq!(events.0.borrow().len(), 1);
    }

    #[test]
    fn test_loaded_keys_must_be_unique() {
        let store = ObjectStore::new();
        store.attach::<Team>("team").unwrap();
        store
            .insert(Team {
                id: 3,
                name: "red".to_string(),
            })
            .unwrap();

        let mut loader = store.loader();
        let twin = ObjectPtr::new(Team {
            id: 3,
            name: "blue".to_string(),
        });
        let err = loader.load(Rc::clone(twin.proxy())).unwrap_err();
        assert!(err.is(ObjectErrorKind::DuplicateIdentifier));
    }

    #[test]
    fn test_weak_store_follows_the_store() {
        let store = ObjectStore::new();
        let weak = store.downgrade();
        assert!(weak.upgrade().is_some());
        drop(store);
        assert!(weak.upgrade().is_none());
    }
}
