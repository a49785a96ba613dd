//! Object store for ormstore.
//!
//! `ormstore-object` is the **in-memory object layer**. It keeps live domain
//! objects, tracks the relations between them and can undo changes through
//! nested transactions.
//!
//! # Role In The Architecture
//!
//! - **Prototype tree**: one node per registered type, arranged by
//!   inheritance, plus synthesized nodes for relation tables.
//! - **Relation endpoints**: discovered when a type is attached; they keep
//!   both sides of a relation in step and count references.
//! - **Proxies and holders**: every stored object sits in an
//!   [`ObjectProxy`]; [`ObjectPtr`], [`HasOne`], [`BelongsTo`], [`HasMany`]
//!   and [`HasManyValues`] refer to proxies.
//! - **Transactions**: an undo log of inserts, updates and deletes with
//!   before-images.
//!
//! Stores are single-threaded (`!Send`).
//!
//! # Example
//!
//! ```ignore
//! let store = ObjectStore::new();
//! store.attach::<Course>("course")?;
//! store.attach::<Student>("student")?;
//!
//! let tx = store.begin()?;
//! let algebra = store.insert(Course::new("algebra"))?;
//! let jane = store.insert(Student::new("jane"))?;
//! jane.modify()?.courses.push_back(&algebra)?;
//! assert_eq!(algebra.get().unwrap().students.len(), 1);
//! tx.rollback()?;
//! assert!(store.is_empty());
//! ```

mod discovery;
pub mod endpoint;
pub mod has_many;
pub mod holder;
pub mod image;
pub mod loader;
pub mod observer;
pub mod prototype;
pub mod proxy;
mod relation;
pub mod sequencer;
pub mod store;
pub mod transaction;
pub mod view;
pub mod visitor;

pub use endpoint::{EndpointId, EndpointInfo, EndpointKind, EndpointRole};
pub use has_many::{HasMany, HasManyField, HasManyValues};
pub use holder::{BelongsTo, HasOne, ObjectHolder, ObjectPtr};
pub use image::ObjectImage;
pub use loader::Loader;
pub use observer::{JoinInfo, PrototypeInfo, StoreObserver};
pub use prototype::{NodeId, NodeKind};
pub use proxy::{HolderId, ObjectProxy, ProxyRef};
pub use sequencer::Sequencer;
pub use store::{ObjectStore, PrototypeRef, Prototypes, StoreConfig, WeakStore};
pub use transaction::{
    Action, DefaultTransactionObserver, Transaction, TransactionObserver, TransactionState,
    mark_deleted,
};
pub use view::{GenericView, ObjectView};
pub use visitor::{AttributeVisitor, Cascade, ErasedObject, JoinColumns, Persistent, TypeKey};
