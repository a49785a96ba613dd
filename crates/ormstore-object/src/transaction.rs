//! Transactions: an undo log over the object store.
//!
//! While a transaction is current, every insert, first modification and
//! removal of an object is recorded as an [`Action`]. Commit hands the log to
//! a [`TransactionObserver`] (which typically writes it to a database);
//! rollback replays it backwards to restore the in-memory graph.

use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use ormstore_core::{Error, ObjectErrorKind, Result};

use crate::image::ObjectImage;
use crate::proxy::ProxyRef;
use crate::store::StoreShared;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Created,
    Begun,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

/// One recorded change.
#[derive(Debug, Clone)]
pub enum Action {
    Insert { proxy: ProxyRef },
    /// First modification of an object; the image is its prior state.
    Update { proxy: ProxyRef, image: ObjectImage },
    /// Removal; the image is the state before the first change in this
    /// transaction.
    Delete { proxy: ProxyRef, image: ObjectImage },
}

impl Action {
    pub fn proxy(&self) -> &ProxyRef {
        match self {
            Action::Insert { proxy }
            | Action::Update { proxy, .. }
            | Action::Delete { proxy, .. } => proxy,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Insert { .. } => "insert",
            Action::Update { .. } => "update",
            Action::Delete { .. } => "delete",
        }
    }
}

/// Receives the outcome of transactions.
pub trait TransactionObserver {
    fn on_begin(&self, id: u64) {
        let _ = id;
    }

    /// Called for the outermost commit with the collapsed action log. An
    /// error aborts the commit and leaves the transaction begun.
    fn on_commit(&self, actions: &[Action]) -> Result<()>;

    fn on_rollback(&self, id: u64) {
        let _ = id;
    }
}

/// Flag objects deleted by a committed action log.
pub fn mark_deleted(actions: &[Action]) {
    for action in actions {
        if let Action::Delete { proxy, .. } = action {
            proxy.mark_deleted(true);
        }
    }
}

/// Accepts every commit and marks deleted objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransactionObserver;

impl TransactionObserver for DefaultTransactionObserver {
    fn on_commit(&self, actions: &[Action]) -> Result<()> {
        mark_deleted(actions);
        Ok(())
    }
}

pub(crate) struct TransactionData {
    pub(crate) id: u64,
    store: Weak<StoreShared>,
    state: Cell<TransactionState>,
    actions: RefCell<Vec<Action>>,
    index: RefCell<HashMap<u64, usize>>,
    observer: Rc<dyn TransactionObserver>,
}

impl TransactionData {
    pub(crate) fn new(
        id: u64,
        store: Weak<StoreShared>,
        observer: Rc<dyn TransactionObserver>,
    ) -> Self {
        Self {
            id,
            store,
            state: Cell::new(TransactionState::Created),
            actions: RefCell::new(Vec::new()),
            index: RefCell::new(HashMap::new()),
            observer,
        }
    }

    pub(crate) fn has_logged(&self, oid: u64) -> bool {
        self.index.borrow().contains_key(&oid)
    }

    /// Record an action, collapsing it with an earlier action on the same
    /// object.
    pub(crate) fn push(&self, action: Action) {
        let oid = action.proxy().oid();
        let existing = self.index.borrow().get(&oid).copied();
        let mut actions = self.actions.borrow_mut();
        match (existing, action) {
            (None, action) => {
                self.index.borrow_mut().insert(oid, actions.len());
                actions.push(action);
            }
            (Some(_), Action::Insert { proxy }) => {
                tracing::warn!(oid = proxy.oid(), "Object logged twice for insert");
            }
            (Some(_), Action::Update { .. }) => {}
            (Some(position), Action::Delete { proxy, image: _ }) => {
                let replacement = match &actions[position] {
                    Action::Insert { .. } => None,
                    Action::Update { image: earlier, .. } => Some(Action::Delete {
                        proxy,
                        image: earlier.clone(),
                    }),
                    Action::Delete { .. } => return,
                };
                match replacement {
                    Some(action) => actions[position] = action,
                    None => {
                        actions.remove(position);
                        drop(actions);
                        self.reindex();
                    }
                }
            }
        }
    }

    fn reindex(&self) {
        let actions = self.actions.borrow();
        let mut index = self.index.borrow_mut();
        index.clear();
        for (position, action) in actions.iter().enumerate() {
            index.insert(action.proxy().oid(), position);
        }
    }

    fn take_actions(&self) -> Vec<Action> {
        self.index.borrow_mut().clear();
        std::mem::take(&mut *self.actions.borrow_mut())
    }
}

/// Handle to a transaction of an object store.
///
/// # Example
///
/// ```ignore
/// let tx = store.begin()?;
/// let ptr = store.insert(Person::new("george"))?;
/// ptr.modify()?.name = "jane".into();
/// tx.rollback()?;
/// assert!(!ptr.is_inserted());
/// ```
#[derive(Clone)]
pub struct Transaction {
    pub(crate) data: Rc<TransactionData>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.data.id
    }

    pub fn state(&self) -> TransactionState {
        self.data.state.get()
    }

    /// Number of recorded actions.
    pub fn len(&self) -> usize {
        self.data.actions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn actions(&self) -> Ref<'_, [Action]> {
        Ref::map(self.data.actions.borrow(), Vec::as_slice)
    }

    fn store(&self) -> Result<Rc<StoreShared>> {
        self.data
            .store
            .upgrade()
            .ok_or_else(|| Error::Custom("object store dropped".to_string()))
    }

    /// Push the transaction onto the store's transaction stack.
    pub fn begin(&self) -> Result<()> {
        if self.state() != TransactionState::Created {
            return Err(Error::Custom(format!(
                "transaction {} cannot begin in state {:?}",
                self.id(),
                self.state()
            )));
        }
        let store = self.store()?;
        store.push_transaction(Rc::clone(&self.data));
        self.data.state.set(TransactionState::Begun);
        self.data.observer.on_begin(self.id());
        tracing::debug!(tx = self.id(), "Transaction begun");
        Ok(())
    }

    fn ensure_current(&self, store: &StoreShared) -> Result<()> {
        let current = store.current_transaction_data();
        if current.is_some_and(|c| Rc::ptr_eq(&c, &self.data)) {
            return Ok(());
        }
        Err(Error::object(
            ObjectErrorKind::TransactionNotCurrent,
            format!("transaction {} is not the current transaction", self.id()),
        ))
    }

    /// Commit. A nested transaction merges its log into its parent; the
    /// outermost one hands it to its observer.
    pub fn commit(&self) -> Result<()> {
        let store = self.store()?;
        self.ensure_current(&store)?;
        let parent = store.parent_transaction_data();
        if parent.is_none() {
            self.data.state.set(TransactionState::Committing);
            let actions = self.data.actions.borrow().clone();
            let result = self.data.observer.on_commit(&actions);
            if let Err(err) = result {
                self.data.state.set(TransactionState::Begun);
                tracing::warn!(tx = self.id(), error = %err, "Commit failed");
                return Err(err);
            }
        }
        store.pop_transaction();
        let actions = self.data.take_actions();
        let count = actions.len();
        if let Some(parent) = parent {
            for action in actions {
                parent.push(action);
            }
        }
        self.data.state.set(TransactionState::Committed);
        tracing::debug!(tx = self.id(), actions = count, "Transaction committed");
        Ok(())
    }

    /// Undo every recorded action in reverse order.
    pub fn rollback(&self) -> Result<()> {
        let store = self.store()?;
        self.ensure_current(&store)?;
        self.data.state.set(TransactionState::RollingBack);
        store.pop_transaction();
        let actions = self.data.take_actions();
        let count = actions.len();
        let result = store.replay_backwards(actions);
        self.data.state.set(TransactionState::RolledBack);
        self.data.observer.on_rollback(self.id());
        tracing::debug!(tx = self.id(), actions = count, "Transaction rolled back");
        result
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("actions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ObjectProxy;
    use crate::visitor::{AttributeVisitor, Persistent};

    #[derive(Default)]
    struct Note {
        text: String,
    }

    impl Persistent for Note {
        fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
            v.on_attribute("text", &mut self.text)
        }
    }

    fn proxy(oid: u64) -> ProxyRef {
        let proxy = ObjectProxy::new(Note::default());
        proxy.set_oid(oid);
        proxy
    }

    fn data() -> TransactionData {
        TransactionData::new(1, Weak::new(), Rc::new(DefaultTransactionObserver))
    }

    #[test]
    fn test_update_after_insert_is_dropped() {
        let tx = data();
        let p = proxy(1);
        tx.push(Action::Insert { proxy: Rc::clone(&p) });
        let image = p.backup().unwrap();
        tx.push(Action::Update { proxy: Rc::clone(&p), image });
        assert_eq!(tx.actions.borrow().len(), 1);
        assert!(tx.has_logged(1));
    }

    #[test]
    fn test_delete_after_insert_cancels() {
        let tx = data();
        let a = proxy(1);
        let b = proxy(2);
        tx.push(Action::Insert { proxy: Rc::clone(&a) });
        tx.push(Action::Insert { proxy: Rc::clone(&b) });
        let image = a.backup().unwrap();
        tx.push(Action::Delete { proxy: Rc::clone(&a), image });
        let actions = tx.actions.borrow();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].proxy().oid(), 2);
        drop(actions);
        assert!(!tx.has_logged(1));
        assert!(tx.has_logged(2));
    }

    #[test]
    fn test_delete_after_update_keeps_first_image() {
        let tx = data();
        let p = proxy(1);
        p.object_cell()
            .borrow_mut()
            .as_mut()
            .unwrap()
            .as_any_mut()
            .downcast_mut::<Note>()
            .unwrap()
            .text = "a".to_string();
        let first = p.backup().unwrap();
        tx.push(Action::Update { proxy: Rc::clone(&p), image: first });
        let second = p.backup().unwrap();
        tx.push(Action::Delete { proxy: Rc::clone(&p), image: second });
        let actions = tx.actions.borrow();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Delete { image, .. } => {
                assert_eq!(
                    image.attribute("text"),
                    Some(ormstore_core::Value::Text("a".to_string()))
                );
            }
            other => panic!("unexpected action {}", other.kind()),
        }
    }

    #[test]
    fn test_default_observer_marks_deleted() {
        let p = proxy(3);
        let image = p.backup().unwrap();
        DefaultTransactionObserver
            .on_commit(&[Action::Delete { proxy: Rc::clone(&p), image }])
            .unwrap();
        assert!(p.is_deleted());
    }
}
