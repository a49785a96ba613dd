//! Change tracking between the object store and the database.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use ormstore_core::{Result, Value};
use ormstore_object::{PrototypeInfo, ProxyRef, StoreObserver};

use crate::flush::PendingOp;
use crate::rows::RowWriter;

/// What has to happen to an object's row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One object whose row is out of date.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub table: String,
    pub proxy: ProxyRef,
    pub kind: ChangeKind,
    /// Row key captured when the object was removed.
    pub keys: Vec<(String, Value)>,
}

impl PendingChange {
    /// The operation writing this change. Inserts and updates read the
    /// object's current state.
    pub fn to_op(&self) -> Result<PendingOp> {
        let oid = self.proxy.oid();
        let table = self.table.clone();
        Ok(match self.kind {
            ChangeKind::Insert => {
                let row = RowWriter::write(&self.proxy)?;
                let (columns, values) = row.into_columns();
                PendingOp::Insert {
                    oid,
                    table,
                    columns,
                    values,
                }
            }
            ChangeKind::Update => {
                let row = RowWriter::write(&self.proxy)?;
                let (key_columns, key_values) = row.key();
                let (set_columns, set_values) = row.non_key();
                PendingOp::Update {
                    oid,
                    table,
                    key_columns,
                    key_values,
                    set_columns,
                    set_values,
                }
            }
            ChangeKind::Delete => {
                let (key_columns, key_values) = self.keys.iter().cloned().unzip();
                PendingOp::Delete {
                    oid,
                    table,
                    key_columns,
                    key_values,
                }
            }
        })
    }
}

#[derive(Debug, Clone, Default)]
struct PendingSet {
    /// Changes by arrival order.
    changes: BTreeMap<u64, PendingChange>,
    by_oid: HashMap<u64, u64>,
    next: u64,
}

impl PendingSet {
    fn get(&self, oid: u64) -> Option<&PendingChange> {
        let seq = self.by_oid.get(&oid)?;
        self.changes.get(seq)
    }

    fn get_mut(&mut self, oid: u64) -> Option<&mut PendingChange> {
        let seq = self.by_oid.get(&oid)?;
        self.changes.get_mut(seq)
    }

    fn push(&mut self, change: PendingChange) {
        let seq = self.next;
        self.next += 1;
        self.by_oid.insert(change.proxy.oid(), seq);
        self.changes.insert(seq, change);
    }

    fn remove(&mut self, oid: u64) -> Option<PendingChange> {
        let seq = self.by_oid.remove(&oid)?;
        self.changes.remove(&seq)
    }

    fn retain(&mut self, mut keep: impl FnMut(&PendingChange) -> bool) {
        let by_oid = &mut self.by_oid;
        self.changes.retain(|_, change| {
            let kept = keep(change);
            if !kept {
                by_oid.remove(&change.proxy.oid());
            }
            kept
        });
    }
}

/// Store observer recording which rows a flush has to write.
///
/// Changes to one object collapse: an insert absorbs later updates, and a
/// removal cancels a pending insert outright. Transaction checkpoints let a
/// rolled back transaction discard what it recorded.
#[derive(Debug, Default)]
pub struct PersistenceObserver {
    pending: RefCell<PendingSet>,
    checkpoints: RefCell<Vec<(u64, PendingSet)>>,
}

impl PersistenceObserver {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Number of pending changes.
    pub fn len(&self) -> usize {
        self.pending.borrow().changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending changes in arrival order.
    pub fn changes(&self) -> Vec<PendingChange> {
        self.pending.borrow().changes.values().cloned().collect()
    }

    pub fn kind_of(&self, proxy: &ProxyRef) -> Option<ChangeKind> {
        self.pending.borrow().get(proxy.oid()).map(|c| c.kind)
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        *self.pending.borrow_mut() = PendingSet::default();
    }

    pub(crate) fn checkpoint(&self, tx: u64) {
        let snapshot = self.pending.borrow().clone();
        self.checkpoints.borrow_mut().push((tx, snapshot));
    }

    /// Restore the state recorded when `tx` began.
    pub(crate) fn restore(&self, tx: u64) {
        let mut checkpoints = self.checkpoints.borrow_mut();
        let Some(position) = checkpoints.iter().rposition(|(id, _)| *id == tx) else {
            return;
        };
        if let Some((_, snapshot)) = checkpoints.drain(position..).next() {
            *self.pending.borrow_mut() = snapshot;
        }
    }

    pub(crate) fn release_checkpoints(&self) {
        self.checkpoints.borrow_mut().clear();
    }
}

impl StoreObserver for PersistenceObserver {
    fn on_attach(&self, prototype: &PrototypeInfo) {
        tracing::trace!(table = %prototype.name, kind = prototype.kind.as_str(), "Tracking table");
    }

    fn on_detach(&self, prototype: &PrototypeInfo) {
        self.pending
            .borrow_mut()
            .retain(|change| change.table != prototype.name);
    }

    fn on_insert(&self, table: &str, proxy: &ProxyRef) {
        let mut pending = self.pending.borrow_mut();
        if let Some(change) = pending.get_mut(proxy.oid()) {
            // the row is still there, only its content changed
            if change.kind == ChangeKind::Delete {
                change.kind = ChangeKind::Update;
                change.keys.clear();
            }
            return;
        }
        tracing::trace!(table, oid = proxy.oid(), "Pending insert");
        pending.push(PendingChange {
            table: table.to_string(),
            proxy: Rc::clone(proxy),
            kind: ChangeKind::Insert,
            keys: Vec::new(),
        });
    }

    fn on_update(&self, table: &str, proxy: &ProxyRef) {
        let mut pending = self.pending.borrow_mut();
        if pending.get(proxy.oid()).is_some() {
            return;
        }
        tracing::trace!(table, oid = proxy.oid(), "Pending update");
        pending.push(PendingChange {
            table: table.to_string(),
            proxy: Rc::clone(proxy),
            kind: ChangeKind::Update,
            keys: Vec::new(),
        });
    }

    fn on_delete(&self, table: &str, proxy: &ProxyRef) {
        let mut pending = self.pending.borrow_mut();
        match pending.get(proxy.oid()).map(|c| c.kind) {
            Some(ChangeKind::Insert) => {
                pending.remove(proxy.oid());
                return;
            }
            Some(ChangeKind::Delete) => return,
            Some(ChangeKind::Update) | None => {}
        }
        let keys = match RowWriter::write(proxy) {
            Ok(row) => {
                let (columns, values) = row.key();
                columns.into_iter().zip(values).collect()
            }
            Err(err) => {
                tracing::warn!(table, oid = proxy.oid(), error = %err, "Could not read row key");
                Vec::new()
            }
        };
        tracing::trace!(table, oid = proxy.oid(), "Pending delete");
        pending.remove(proxy.oid());
        pending.push(PendingChange {
            table: table.to_string(),
            proxy: Rc::clone(proxy),
            kind: ChangeKind::Delete,
            keys,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormstore_object::{AttributeVisitor, ObjectStore, Persistent};

    #[derive(Default)]
    struct Tag {
        id: i64,
        label: String,
    }

    impl Persistent for Tag {
        fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
            v.on_primary_key("id", &mut self.id)?;
            v.on_attribute("label", &mut self.label)
        }
    }

    fn store() -> ObjectStore {
        let store = ObjectStore::new();
        store.attach::<Tag>("tag").unwrap();
        store
    }

    fn tag(store: &ObjectStore, id: i64) -> ProxyRef {
        let ptr = store
            .insert(Tag {
                id,
                label: format!("tag{id}"),
            })
            .unwrap();
        Rc::clone(ptr.proxy())
    }

    #[test]
    fn test_insert_absorbs_update() {
        let store = store();
        let observer = PersistenceObserver::default();
        let p = tag(&store, 1);
        observer.on_insert("tag", &p);
        observer.on_update("tag", &p);
        assert_eq!(observer.len(), 1);
        assert_eq!(observer.kind_of(&p), Some(ChangeKind::Insert));
    }

    #[test]
    fn test_delete_cancels_insert() {
        let store = store();
        let observer = PersistenceObserver::default();
        let p = tag(&store, 1);
        observer.on_insert("tag", &p);
        observer.on_delete("tag", &p);
        assert!(observer.is_empty());
    }

    #[test]
    fn test_delete_after_update_captures_key() {
        let store = store();
        let observer = PersistenceObserver::default();
        let p = tag(&store, 4);
        observer.on_update("tag", &p);
        observer.on_delete("tag", &p);
        let changes = observer.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Delete);
        assert_eq!(
            changes[0].keys,
            vec![("id".to_string(), Value::BigInt(4))]
        );
        match changes[0].to_op().unwrap() {
            PendingOp::Delete { key_values, .. } => {
                assert_eq!(key_values, vec![Value::BigInt(4)]);
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_restore_discards_changes_after_checkpoint() {
        let store = store();
        let observer = PersistenceObserver::default();
        let a = tag(&store, 1);
        let b = tag(&store, 2);
        observer.on_update("tag", &a);
        observer.checkpoint(10);
        observer.on_insert("tag", &b);
        observer.on_delete("tag", &a);
        observer.restore(10);
        assert_eq!(observer.len(), 1);
        assert_eq!(observer.kind_of(&a), Some(ChangeKind::Update));
        assert_eq!(observer.kind_of(&b), None);
    }

    #[test]
    fn test_update_op_splits_key_and_values() {
        let store = store();
        let observer = PersistenceObserver::default();
        let p = tag(&store, 3);
        observer.on_update("tag", &p);
        let op = observer.changes()[0].to_op().unwrap();
        assert_eq!(
            op,
            PendingOp::Update {
                oid: p.oid(),
                table: "tag".to_string(),
                key_columns: vec!["id".to_string()],
                key_values: vec![Value::BigInt(3)],
                set_columns: vec!["label".to_string()],
                set_values: vec![Value::Text("tag3".to_string())],
            }
        );
    }
}
