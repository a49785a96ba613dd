//! Prototype nodes and the prototype tree.
//!
//! Each registered type gets a [`PrototypeNode`] holding the proxies of its
//! objects in an arena-backed list with two sentinel slots. Nodes form a tree
//! through explicit parent/child ids; a node's own list holds objects of
//! exactly its type, and walking its children in pre-order yields the objects
//! of derived types.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use ormstore_core::{Identifier, SqlType};

use crate::endpoint::{EndpointId, EndpointInfo, EndpointView, RelationEndpoint};
use crate::observer::StoreObserver;
use crate::proxy::ProxyRef;
use crate::visitor::{ErasedObject, TypeKey};

/// Index of a node in the prototype tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

/// What a prototype node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A registered domain type.
    Entity,
    /// Relation table for a `has_many` without a reciprocal side.
    OneToManyJoin,
    /// Relation table shared by both sides of a many-to-many relation.
    ManyToManyJoin,
    /// Relation table for a `has_many` of builtin values.
    ValueJoin,
}

impl NodeKind {
    pub const fn is_join(self) -> bool {
        !matches!(self, NodeKind::Entity)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            NodeKind::Entity => "entity",
            NodeKind::OneToManyJoin => "one-to-many",
            NodeKind::ManyToManyJoin => "many-to-many",
            NodeKind::ValueJoin => "values",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JoinTarget {
    Object(TypeKey),
    Value(SqlType),
}

/// Layout of a relation table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JoinSpec {
    pub(crate) owner: TypeKey,
    pub(crate) owner_column: String,
    pub(crate) item: JoinTarget,
    pub(crate) item_column: String,
}

pub(crate) type Factory = Rc<dyn Fn() -> Box<dyn ErasedObject>>;

const FIRST: usize = 0;
const LAST: usize = 1;

struct Slot {
    proxy: Option<ProxyRef>,
    prev: usize,
    next: usize,
}

/// Doubly linked proxy list over a slot arena.
///
/// Slots 0 and 1 are the first and last sentinels. Unlinked slots are
/// recycled through a free list, so linking and unlinking are O(1) and slot
/// indices stay stable while linked.
pub(crate) struct ProxyList {
    slots: Vec<Slot>,
    free: Vec<usize>,
    len: usize,
}

impl ProxyList {
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![
                Slot {
                    proxy: None,
                    prev: FIRST,
                    next: LAST,
                },
                Slot {
                    proxy: None,
                    prev: FIRST,
                    next: LAST,
                },
            ],
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Link `proxy` in front of the slot `successor`. Returns its slot.
    pub(crate) fn link_before(&mut self, successor: usize, proxy: ProxyRef) -> usize {
        let successor = if self.is_linked(successor) || successor == LAST {
            successor
        } else {
            LAST
        };
        let prev = self.slots[successor].prev;
        let slot = Slot {
            proxy: Some(proxy),
            prev,
            next: successor,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = slot;
                index
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        self.slots[prev].next = index;
        self.slots[successor].prev = index;
        self.len += 1;
        index
    }

    pub(crate) fn push_back(&mut self, proxy: ProxyRef) -> usize {
        self.link_before(LAST, proxy)
    }

    /// Unlink the proxy in `index`, patching its neighbours.
    pub(crate) fn unlink(&mut self, index: usize) -> Option<ProxyRef> {
        if !self.is_linked(index) {
            return None;
        }
        let (prev, next) = (self.slots[index].prev, self.slots[index].next);
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
        let proxy = self.slots[index].proxy.take();
        self.free.push(index);
        self.len -= 1;
        proxy
    }

    fn is_linked(&self, index: usize) -> bool {
        index > LAST && self.slots.get(index).is_some_and(|s| s.proxy.is_some())
    }

    pub(crate) fn iter(&self) -> ProxyIter<'_> {
        ProxyIter {
            list: self,
            cursor: self.slots[FIRST].next,
        }
    }

    /// Unlink everything, returning the proxies in list order.
    pub(crate) fn drain(&mut self) -> Vec<ProxyRef> {
        let proxies: Vec<ProxyRef> = self.iter().cloned().collect();
        *self = Self::new();
        proxies
    }
}

pub(crate) struct ProxyIter<'a> {
    list: &'a ProxyList,
    cursor: usize,
}

impl<'a> Iterator for ProxyIter<'a> {
    type Item = &'a ProxyRef;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == LAST {
            return None;
        }
        let slot = &self.list.slots[self.cursor];
        self.cursor = slot.next;
        slot.proxy.as_ref()
    }
}

/// One registered type or relation table.
pub(crate) struct PrototypeNode {
    pub(crate) name: String,
    pub(crate) type_key: TypeKey,
    pub(crate) kind: NodeKind,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) objects: ProxyList,
    pub(crate) endpoints: BTreeMap<String, EndpointId>,
    pub(crate) observers: Vec<Rc<dyn StoreObserver>>,
    pub(crate) factory: Factory,
    pub(crate) join: Option<JoinSpec>,
    pub(crate) primary_key: Option<(String, SqlType)>,
    /// Identifier of a default instance; gives the key's concrete type.
    pub(crate) key_template: Identifier,
    pub(crate) integral_key: bool,
    pub(crate) sequence: u64,
    /// Primary key to oid.
    pub(crate) pk_index: HashMap<Identifier, u64>,
}

impl PrototypeNode {
    pub(crate) fn new(name: String, type_key: TypeKey, kind: NodeKind, factory: Factory) -> Self {
        Self {
            name,
            type_key,
            kind,
            parent: None,
            children: Vec::new(),
            objects: ProxyList::new(),
            endpoints: BTreeMap::new(),
            observers: Vec::new(),
            factory,
            join: None,
            primary_key: None,
            key_template: Identifier::Null,
            integral_key: false,
            sequence: 0,
            pk_index: HashMap::new(),
        }
    }

    /// Next generated key value.
    pub(crate) fn next_key(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Keep the key sequence ahead of an explicitly assigned key.
    pub(crate) fn observe_key(&mut self, pk: &Identifier) {
        if let Some(value) = pk.as_i128().and_then(|v| u64::try_from(v).ok()) {
            self.sequence = self.sequence.max(value);
        }
    }
}

/// Registry of prototype nodes and relation endpoints.
#[derive(Default)]
pub(crate) struct PrototypeTree {
    nodes: Vec<Option<PrototypeNode>>,
    roots: Vec<NodeId>,
    by_name: HashMap<String, NodeId>,
    by_type: HashMap<TypeId, NodeId>,
    endpoints: Vec<Option<RelationEndpoint>>,
}

impl PrototypeTree {
    pub(crate) fn node(&self, id: NodeId) -> Option<&PrototypeNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut PrototypeNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    pub(crate) fn find_name(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn find_type(&self, id: TypeId) -> Option<NodeId> {
        self.by_type.get(&id).copied()
    }

    /// Register a node. Entity nodes are also indexed by type.
    pub(crate) fn insert_node(&mut self, node: PrototypeNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.by_name.insert(node.name.clone(), id);
        if node.kind == NodeKind::Entity {
            self.by_type.insert(node.type_key.id(), id);
        }
        match node.parent.and_then(|p| self.node_mut(p)) {
            Some(parent) => parent.children.push(id),
            None => self.roots.push(id),
        }
        self.nodes.push(Some(node));
        id
    }

    /// Unregister a node. Its id is never reused.
    pub(crate) fn remove_node(&mut self, id: NodeId) -> Option<PrototypeNode> {
        let node = self.nodes.get_mut(id.0)?.take()?;
        if self.by_name.get(&node.name) == Some(&id) {
            self.by_name.remove(&node.name);
        }
        if self.by_type.get(&node.type_key.id()) == Some(&id) {
            self.by_type.remove(&node.type_key.id());
        }
        match node.parent.and_then(|p| self.node_mut(p)) {
            Some(parent) => parent.children.retain(|c| *c != id),
            None => self.roots.retain(|r| *r != id),
        }
        Some(node)
    }

    /// All nodes in pre-order: each root followed by its descendants.
    pub(crate) fn preorder(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        for root in &self.roots {
            self.collect_subtree(*root, &mut out);
        }
        out
    }

    /// `id` and its descendants in pre-order.
    pub(crate) fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_subtree(id, &mut out);
        out
    }

    fn collect_subtree(&self, id: NodeId, out: &mut Vec<NodeId>) {
        if let Some(node) = self.node(id) {
            out.push(id);
            for child in &node.children {
                self.collect_subtree(*child, out);
            }
        }
    }

    /// Whether `ancestor` is a proper ancestor of `id`.
    pub(crate) fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = self.node(id).and_then(|n| n.parent);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.node(parent).and_then(|n| n.parent);
        }
        false
    }

    pub(crate) fn add_endpoint(&mut self, endpoint: RelationEndpoint) -> EndpointId {
        let id = EndpointId(self.endpoints.len());
        if let Some(node) = self.node_mut(endpoint.node) {
            node.endpoints.insert(endpoint.field.clone(), id);
        }
        self.endpoints.push(Some(endpoint));
        id
    }

    pub(crate) fn remove_endpoint(&mut self, id: EndpointId) -> Option<RelationEndpoint> {
        let endpoint = self.endpoints.get_mut(id.0)?.take()?;
        if let Some(node) = self.node_mut(endpoint.node) {
            node.endpoints.remove(&endpoint.field);
        }
        Some(endpoint)
    }

    pub(crate) fn endpoint(&self, id: EndpointId) -> Option<&RelationEndpoint> {
        self.endpoints.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn endpoint_mut(&mut self, id: EndpointId) -> Option<&mut RelationEndpoint> {
        self.endpoints.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Endpoints of `node` whose relation targets the type `target`.
    pub(crate) fn endpoints_toward(&self, node: NodeId, target: TypeId) -> Vec<EndpointId> {
        self.node(node)
            .map(|n| {
                n.endpoints
                    .values()
                    .copied()
                    .filter(|id| {
                        self.endpoint(*id)
                            .is_some_and(|e| e.foreign_type.id() == target)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Endpoints using `join` as their relation table.
    pub(crate) fn join_endpoints(&self, join: NodeId) -> Vec<EndpointId> {
        self.endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.as_ref().is_some_and(|e| e.join == Some(join)))
            .map(|(i, _)| EndpointId(i))
            .collect()
    }

    pub(crate) fn endpoint_view(&self, id: EndpointId) -> Option<EndpointView> {
        let endpoint = self.endpoint(id)?;
        let foreign_field = endpoint
            .foreign
            .and_then(|f| self.endpoint(f))
            .map(|f| f.field.clone());
        let join_columns = endpoint
            .join
            .and_then(|j| self.node(j))
            .and_then(|n| n.join.as_ref())
            .map(|spec| (spec.owner_column.clone(), spec.item_column.clone()));
        Some(EndpointView {
            id,
            field: endpoint.field.clone(),
            role: endpoint.role,
            counts: endpoint.counts(),
            cascade: endpoint.cascade,
            foreign_field,
            join: endpoint.join,
            join_columns,
        })
    }

    /// Views of all endpoints of `node`, keyed by field name.
    pub(crate) fn endpoint_views(&self, node: NodeId) -> HashMap<String, EndpointView> {
        self.node(node)
            .map(|n| {
                n.endpoints
                    .values()
                    .filter_map(|id| self.endpoint_view(*id))
                    .map(|view| (view.field.clone(), view))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn endpoint_info(&self, id: EndpointId) -> Option<EndpointInfo> {
        let endpoint = self.endpoint(id)?;
        Some(EndpointInfo {
            field: endpoint.field.clone(),
            role: endpoint.role,
            kind: endpoint.role.kind(),
            foreign_type: endpoint.foreign_type.name(),
            foreign_field: endpoint
                .foreign
                .and_then(|f| self.endpoint(f))
                .map(|f| f.field.clone()),
            join_table: endpoint
                .join
                .and_then(|j| self.node(j))
                .map(|n| n.name.clone()),
            cascade: endpoint.cascade,
        })
    }

    /// Name of the entity node registered for a type.
    pub(crate) fn table_of(&self, type_key: TypeKey) -> Option<String> {
        self.find_type(type_key.id())
            .and_then(|id| self.node(id))
            .map(|n| n.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ObjectProxy;
    use crate::visitor::{AttributeVisitor, Persistent};
    use ormstore_core::Result;
    use std::rc::Rc;

    #[derive(Default)]
    struct Thing;

    impl Persistent for Thing {
        fn serialize(&mut self, _v: &mut dyn AttributeVisitor) -> Result<()> {
            Ok(())
        }
    }

    fn proxies(n: usize) -> Vec<ProxyRef> {
        (0..n).map(|_| ObjectProxy::new(Thing)).collect()
    }

    fn node(name: &str) -> PrototypeNode {
        PrototypeNode::new(
            name.to_string(),
            TypeKey::of::<Thing>(),
            NodeKind::Entity,
            Rc::new(|| Box::new(Thing) as Box<dyn ErasedObject>),
        )
    }

    #[test]
    fn test_list_push_and_iterate() {
        let ps = proxies(3);
        let mut list = ProxyList::new();
        for p in &ps {
            list.push_back(Rc::clone(p));
        }
        assert_eq!(list.len(), 3);
        let order: Vec<_> = list.iter().collect();
        assert!(Rc::ptr_eq(order[0], &ps[0]));
        assert!(Rc::ptr_eq(order[2], &ps[2]));
        assert!(Rc::ptr_eq(list.iter().next().unwrap(), &ps[0]));
        assert!(Rc::ptr_eq(list.iter().last().unwrap(), &ps[2]));
    }

    #[test]
    fn test_list_unlink_boundaries() {
        let ps = proxies(3);
        let mut list = ProxyList::new();
        let slots: Vec<usize> = ps.iter().map(|p| list.push_back(Rc::clone(p))).collect();

        assert!(Rc::ptr_eq(&list.unlink(slots[0]).unwrap(), &ps[0]));
        assert!(Rc::ptr_eq(list.iter().next().unwrap(), &ps[1]));
        assert!(Rc::ptr_eq(&list.unlink(slots[2]).unwrap(), &ps[2]));
        assert!(Rc::ptr_eq(list.iter().last().unwrap(), &ps[1]));
        assert!(list.unlink(slots[2]).is_none());
        assert!(list.unlink(0).is_none());
        assert_eq!(list.len(), 1);

        list.unlink(slots[1]);
        assert!(list.is_empty());
        assert!(list.iter().next().is_none());
    }

    #[test]
    fn test_list_reuses_slots_and_links_before() {
        let ps = proxies(3);
        let mut list = ProxyList::new();
        let a = list.push_back(Rc::clone(&ps[0]));
        list.unlink(a);
        let b = list.push_back(Rc::clone(&ps[1]));
        assert_eq!(a, b);
        list.link_before(b, Rc::clone(&ps[2]));
        let order: Vec<_> = list.iter().collect();
        assert!(Rc::ptr_eq(order[0], &ps[2]));
        assert!(Rc::ptr_eq(order[1], &ps[1]));
        assert_eq!(list.drain().len(), 2);
        assert!(list.is_empty());
    }

    #[test]
    fn test_tree_preorder_and_ancestry() {
        let mut tree = PrototypeTree::default();
        let root = tree.insert_node(node("item"));
        let mut child = node("book");
        child.parent = Some(root);
        let book = tree.insert_node(child);
        let mut grandchild = node("ebook");
        grandchild.parent = Some(book);
        let ebook = tree.insert_node(grandchild);
        let other = tree.insert_node(node("author"));

        assert_eq!(tree.preorder(), vec![root, book, ebook, other]);
        assert_eq!(tree.subtree(book), vec![book, ebook]);
        assert!(tree.is_ancestor(root, ebook));
        assert!(!tree.is_ancestor(ebook, root));
        assert_eq!(tree.find_name("book"), Some(book));

        tree.remove_node(ebook);
        assert_eq!(tree.subtree(root), vec![root, book]);
        assert!(tree.find_name("ebook").is_none());
    }

    #[test]
    fn test_key_sequence() {
        let mut n = node("item");
        assert_eq!(n.next_key(), 1);
        n.observe_key(&Identifier::I64(10));
        assert_eq!(n.next_key(), 11);
        n.observe_key(&Identifier::from("x"));
        assert_eq!(n.next_key(), 12);
    }
}
