//! Persistence layer for ormstore.
//!
//! `ormstore-session` is the **database mirror** of an object store. It
//! watches a store, turns what changed into SQL statements and reads stored
//! rows back into objects.
//!
//! # Role In The Architecture
//!
//! - **Change tracking**: a [`PersistenceObserver`] registered on the store
//!   records inserted, updated and removed objects, relation rows included.
//! - **Flush ordering**: a [`FlushOrderer`] sorts the pending operations by
//!   foreign key depth so parents are inserted first and deleted last.
//! - **Transactional safety**: store transactions begun through a
//!   [`Session`] flush on commit, inside a backend transaction on the
//!   [`Connection`].
//! - **Loading**: [`Session::load`] reads every table and rebuilds the
//!   object graph through a [`Loader`](ormstore_object::Loader).
//!
//! SQL text comes from a [`Dialect`]; the session never formats statements
//! itself.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(connection);
//! session.attach::<Team>("team")?;
//! session.attach::<Hero>("hero")?;
//! session.create_schema()?;
//!
//! // each call runs in its own transaction and flushes on commit
//! let team = session.insert(Team::new("avengers"))?;
//! let hero = session.insert(Hero::new("thor"))?;
//! session.modify(&hero, |h| h.team.set(&team))??;
//!
//! // or group several changes
//! let tx = session.begin()?;
//! session.remove(&hero)?;
//! tx.commit()?;
//! ```

pub mod flush;
pub mod rows;
pub mod tracker;

pub use flush::{FlushOrderer, FlushPlan, FlushResult, PendingOp};
pub use rows::{RowReader, RowWriter};
pub use tracker::{ChangeKind, PendingChange, PersistenceObserver};

use std::cell::{RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use ormstore_core::{AnsiDialect, Connection, Dialect, Error, Result, Statement, Value};
use ormstore_object::{
    Action, ObjectPtr, ObjectStore, Persistent, PrototypeInfo, PrototypeRef, StoreConfig,
    Transaction, TransactionObserver, TransactionState, WeakStore, mark_deleted,
};

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Whether committing a session transaction flushes pending changes.
    pub flush_on_commit: bool,
    /// Whether consecutive inserts into one table share a statement.
    pub batch_inserts: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_on_commit: true,
            batch_inserts: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `flush_on_commit` option (builder pattern).
    #[must_use]
    pub fn flush_on_commit(mut self, value: bool) -> Self {
        self.flush_on_commit = value;
        self
    }

    /// Set the `batch_inserts` option (builder pattern).
    #[must_use]
    pub fn batch_inserts(mut self, value: bool) -> Self {
        self.batch_inserts = value;
        self
    }
}

// ============================================================================
// Backend
// ============================================================================

/// State shared between a session and the observers of its transactions.
struct Backend<C, D> {
    store: WeakStore,
    connection: RefCell<C>,
    dialect: D,
    config: SessionConfig,
    tracker: Rc<PersistenceObserver>,
}

impl<C: Connection, D: Dialect> Backend<C, D> {
    fn connection(&self) -> Result<RefMut<'_, C>> {
        self.connection
            .try_borrow_mut()
            .map_err(|_| Error::Custom("session connection is already in use".to_string()))
    }

    fn orderer(store: &ObjectStore) -> Result<FlushOrderer> {
        let mut orderer = FlushOrderer::new();
        for prototype in store.prototypes() {
            let info = prototype.info()?;
            orderer.register_table(info.name, info.references);
        }
        Ok(orderer)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn flush(&self) -> Result<FlushResult> {
        if self.tracker.is_empty() {
            return Ok(FlushResult::default());
        }
        let store = self
            .store
            .upgrade()
            .ok_or_else(|| Error::Custom("object store dropped".to_string()))?;

        let mut ops = Vec::with_capacity(self.tracker.len());
        for change in self.tracker.changes() {
            if change.kind != ChangeKind::Delete && !change.proxy.is_inserted() {
                tracing::warn!(
                    table = %change.table,
                    oid = change.proxy.oid(),
                    "Skipping change of an object that left the store"
                );
                continue;
            }
            ops.push(change.to_op()?);
        }
        let plan = Self::orderer(&store)?.order(ops);

        let mut conn = self.connection()?;
        conn.begin()?;
        match plan.execute(&mut *conn, &self.dialect, self.config.batch_inserts) {
            Ok(result) => {
                conn.commit()?;
                self.tracker.clear();
                Ok(result)
            }
            Err(err) => {
                if let Err(rollback) = conn.rollback() {
                    tracing::warn!(error = %rollback, "Backend rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// Transaction observer of session transactions.
struct FlushOnCommit<C, D> {
    backend: Rc<Backend<C, D>>,
}

impl<C: Connection, D: Dialect> TransactionObserver for FlushOnCommit<C, D> {
    fn on_begin(&self, id: u64) {
        self.backend.tracker.checkpoint(id);
    }

    fn on_commit(&self, actions: &[Action]) -> Result<()> {
        if self.backend.config.flush_on_commit {
            self.backend.flush()?;
        }
        self.backend.tracker.release_checkpoints();
        mark_deleted(actions);
        Ok(())
    }

    fn on_rollback(&self, id: u64) {
        self.backend.tracker.restore(id);
    }
}

// ============================================================================
// Session
// ============================================================================

/// An object store bound to a database connection.
///
/// The session owns its store and connection. Every mutation made through
/// the session runs in a store transaction whose commit writes the pending
/// changes; mutations made directly on [`Session::store`] are recorded too
/// and written by the next flush.
pub struct Session<C: Connection + 'static, D: Dialect + 'static = AnsiDialect> {
    store: ObjectStore,
    backend: Rc<Backend<C, D>>,
}

impl<C: Connection + 'static> Session<C, AnsiDialect> {
    /// Create a session compiling statements with [`AnsiDialect`].
    pub fn new(connection: C) -> Self {
        Self::with_dialect(connection, AnsiDialect)
    }
}

impl<C: Connection + 'static, D: Dialect + 'static> Session<C, D> {
    pub fn with_dialect(connection: C, dialect: D) -> Self {
        Self::with_config(
            connection,
            dialect,
            SessionConfig::default(),
            StoreConfig::default(),
        )
    }

    /// Create a session with custom configuration.
    pub fn with_config(
        connection: C,
        dialect: D,
        config: SessionConfig,
        store_config: StoreConfig,
    ) -> Self {
        let store = ObjectStore::with_config(store_config);
        let tracker = PersistenceObserver::new();
        store.add_observer(Rc::clone(&tracker) as Rc<dyn ormstore_object::StoreObserver>);
        let backend = Rc::new(Backend {
            store: store.downgrade(),
            connection: RefCell::new(connection),
            dialect,
            config,
            tracker,
        });
        Self { store, backend }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.backend.config
    }

    pub fn dialect(&self) -> &D {
        &self.backend.dialect
    }

    /// Borrow the underlying connection.
    pub fn connection(&self) -> Result<RefMut<'_, C>> {
        self.backend.connection()
    }

    pub fn tracker(&self) -> &PersistenceObserver {
        &self.backend.tracker
    }

    /// Number of changes waiting for a flush.
    pub fn pending(&self) -> usize {
        self.backend.tracker.len()
    }

    // ========================================================================
    // Schema
    // ========================================================================

    pub fn attach<T: Persistent + Default>(&self, name: &str) -> Result<PrototypeRef> {
        self.store.attach::<T>(name)
    }

    pub fn attach_child<T: Persistent + Default, B: Persistent>(
        &self,
        name: &str,
    ) -> Result<PrototypeRef> {
        self.store.attach_child::<T, B>(name)
    }

    fn tables(&self) -> Result<Vec<PrototypeInfo>> {
        self.store.prototypes().map(|p| p.info()).collect()
    }

    /// Create a table for every prototype, relation tables included.
    /// Returns the number of statements executed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn create_schema(&self) -> Result<usize> {
        let tables = self.tables()?;
        let mut conn = self.connection()?;
        for info in &tables {
            let sql = self.backend.dialect.compile(&Statement::CreateTable {
                table: info.name.clone(),
                columns: info.columns.clone(),
            });
            tracing::trace!(sql = %sql, "Creating table");
            conn.execute(&sql, &[])?;
        }
        tracing::debug!(tables = tables.len(), "Created schema");
        Ok(tables.len())
    }

    /// Drop every table, in reverse creation order.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn drop_schema(&self) -> Result<usize> {
        let tables = self.tables()?;
        let mut conn = self.connection()?;
        for info in tables.iter().rev() {
            let sql = self.backend.dialect.compile(&Statement::DropTable {
                table: info.name.clone(),
            });
            conn.execute(&sql, &[])?;
        }
        tracing::debug!(tables = tables.len(), "Dropped schema");
        Ok(tables.len())
    }

    // ========================================================================
    // Transactions and mutation
    // ========================================================================

    /// Begin a store transaction that flushes when the outermost one
    /// commits and discards recorded changes when rolled back.
    pub fn begin(&self) -> Result<Transaction> {
        let observer = FlushOnCommit {
            backend: Rc::clone(&self.backend),
        };
        let tx = self.store.transaction_with(Rc::new(observer));
        tx.begin()?;
        Ok(tx)
    }

    fn in_transaction<R>(&self, op: impl FnOnce() -> Result<R>) -> Result<R> {
        let tx = self.begin()?;
        let outcome = op().and_then(|value| tx.commit().map(|()| value));
        if outcome.is_err() && tx.state() == TransactionState::Begun {
            if let Err(err) = tx.rollback() {
                tracing::warn!(tx = tx.id(), error = %err, "Rollback after failed operation failed");
            }
        }
        outcome
    }

    /// Insert an object and write it.
    pub fn insert<T: Persistent>(&self, object: T) -> Result<ObjectPtr<T>> {
        self.in_transaction(|| self.store.insert(object))
    }

    /// Change an object in place and write the change.
    pub fn modify<T: Persistent, R>(
        &self,
        ptr: &ObjectPtr<T>,
        change: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        self.in_transaction(|| {
            let mut object = ptr.modify()?;
            Ok(change(&mut object))
        })
    }

    /// Remove an object and delete its row.
    pub fn remove<T: Persistent>(&self, ptr: &ObjectPtr<T>) -> Result<()> {
        self.in_transaction(|| self.store.remove(ptr))
    }

    /// Write every pending change now.
    pub fn flush(&self) -> Result<FlushResult> {
        self.backend.flush()
    }

    // ========================================================================
    // Loading
    // ========================================================================

    fn select(&self, info: &PrototypeInfo) -> String {
        self.backend.dialect.compile(&Statement::Select {
            table: info.name.clone(),
            columns: info.columns.iter().map(|c| c.name.clone()).collect(),
        })
    }

    /// Read every table into the store. Returns the number of objects
    /// loaded; relation rows are linked but not counted.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn load(&self) -> Result<usize> {
        let tables = self.tables()?;
        let mut conn = self.connection()?;
        let mut loader = self.store.loader();

        for info in tables.iter().filter(|info| !info.is_join()) {
            let rows = conn.query(&self.select(info), &[])?;
            tracing::debug!(table = %info.name, rows = rows.len(), "Loading objects");
            for row in &rows {
                let proxy = loader.create(&info.name)?;
                proxy.visit(&mut RowReader::new(row, &mut loader))?;
                loader.load(proxy)?;
            }
        }

        for info in &tables {
            let Some(join) = &info.join else {
                continue;
            };
            let rows = conn.query(&self.select(info), &[])?;
            tracing::debug!(table = %info.name, rows = rows.len(), "Loading relation rows");
            for row in &rows {
                let owner = row.get_by_name(&join.owner_column).unwrap_or(&Value::Null);
                let item = row.get_by_name(&join.item_column).unwrap_or(&Value::Null);
                loader.link(&info.name, owner, item)?;
            }
        }

        loader.finish()
    }
}

impl<C: Connection + 'static, D: Dialect + 'static> fmt::Debug for Session<C, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store)
            .field("config", &self.backend.config)
            .field("pending", &self.pending())
            .finish()
    }
}
