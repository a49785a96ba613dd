//! ormstore - an in-process object store with relation tracking and
//! transactional rollback, mirrored into relational storage.
//!
//! ormstore keeps a graph of live domain objects in memory, provides:
//!
//! - A prototype tree of registered types, arranged by inheritance
//! - Automatic bookkeeping of both sides of one-to-one, one-to-many and
//!   many-to-many relations
//! - Nested transactions that undo inserts, updates and removals
//! - A persistence session that writes changes through any [`Connection`]
//!
//! # Quick Start
//!
//! ```ignore
//! use ormstore::prelude::*;
//!
//! #[derive(Default)]
//! struct Author {
//!     id: i64,
//!     name: String,
//!     books: HasMany<Book>,
//! }
//!
//! impl Persistent for Author {
//!     fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
//!         v.on_primary_key("id", &mut self.id)?;
//!         v.on_attribute("name", &mut self.name)?;
//!         v.on_has_many("books", &mut self.books, JoinColumns::new("author_id", "book_id"), Cascade::None)
//!     }
//! }
//!
//! #[derive(Default)]
//! struct Book {
//!     id: i64,
//!     title: String,
//!     author: BelongsTo<Author>,
//! }
//!
//! impl Persistent for Book {
//!     fn serialize(&mut self, v: &mut dyn AttributeVisitor) -> Result<()> {
//!         v.on_primary_key("id", &mut self.id)?;
//!         v.on_attribute("title", &mut self.title)?;
//!         v.on_belongs_to("author", &mut self.author, Cascade::None)
//!     }
//! }
//!
//! let store = ObjectStore::new();
//! store.attach::<Author>("author")?;
//! store.attach::<Book>("book")?;
//!
//! let tx = store.begin()?;
//! let author = store.insert(Author { name: "Le Guin".into(), ..Default::default() })?;
//! let book = store.insert(Book { title: "The Dispossessed".into(), ..Default::default() })?;
//! author.modify()?.books.push_back(&book)?;
//! assert!(book.get().unwrap().author.points_to(&author));
//! tx.rollback()?;
//! assert!(store.is_empty());
//! ```
//!
//! # Crates
//!
//! - `ormstore-core`: identifiers, values, field contracts and the
//!   connection/dialect collaborator traits
//! - `ormstore-object`: the object store itself
//! - `ormstore-session`: change tracking, flush ordering and loading

pub mod session;

pub use session::SessionBuilder;

// Re-export all public types from sub-crates
pub use ormstore_core::{
    AnsiDialect, Attribute, BytesIdentifierSerializer, ColumnDef, Connection,
    ConnectionError, ConnectionErrorKind, Dialect, Error, Identifier, IdentifierSerializer,
    JsonIdentifierSerializer, ObjectError, ObjectErrorKind, PrimaryKey, QueryError,
    QueryErrorKind, Result, Row, SqlType, Statement, TypeError, TypeInfo, Value,
    ValueIdentifierSerializer,
};
pub use ormstore_object::{
    Action, AttributeVisitor, BelongsTo, Cascade, DefaultTransactionObserver, EndpointInfo,
    EndpointKind, EndpointRole, GenericView, HasMany, HasManyField, HasManyValues, HasOne,
    JoinColumns, JoinInfo, Loader, NodeId, NodeKind, ObjectHolder, ObjectImage, ObjectProxy,
    ObjectPtr, ObjectStore, ObjectView, Persistent, PrototypeInfo, PrototypeRef, Prototypes,
    ProxyRef, Sequencer, StoreConfig, StoreObserver, Transaction, TransactionObserver,
    TransactionState, TypeKey, WeakStore, mark_deleted,
};
pub use ormstore_session::{
    ChangeKind, FlushOrderer, FlushPlan, FlushResult, PendingChange, PendingOp,
    PersistenceObserver, RowReader, RowWriter, Session, SessionConfig,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        // Field contracts
        AttributeVisitor,
        // Relations
        BelongsTo,
        Cascade,
        // Collaborators
        Connection,
        Dialect,
        Error,
        HasMany,
        HasManyValues,
        HasOne,
        Identifier,
        JoinColumns,
        ObjectErrorKind,
        ObjectPtr,
        // Store
        ObjectStore,
        Persistent,
        Result,
        Row,
        // Session
        Session,
        SessionBuilder,
        SessionConfig,
        StoreConfig,
        StoreObserver,
        Transaction,
        TransactionObserver,
        Value,
    };
}
