//! Core types and collaborator contracts for ormstore.
//!
//! This crate provides the leaf abstractions the object store is built on:
//!
//! - [`Identifier`] and the [`IdentifierSerializer`] family for primary keys
//! - [`Value`] for dynamically typed attribute values
//! - [`Attribute`] and [`PrimaryKey`], the erased views of persistent fields
//! - [`Row`], [`Statement`], [`Dialect`] and [`Connection`], the narrow
//!   contracts through which SQL generation and drivers are consumed
//! - [`Error`] and [`Result`], shared by every ormstore crate

pub mod attribute;
pub mod connection;
pub mod error;
pub mod identifier;
pub mod identifiers;
pub mod row;
pub mod types;
pub mod value;

pub use attribute::{Attribute, PrimaryKey};
pub use connection::{AnsiDialect, ColumnDef, Connection, Dialect, Statement};
pub use error::{
    ConnectionError, ConnectionErrorKind, Error, ObjectError, ObjectErrorKind, QueryError,
    QueryErrorKind, Result, TypeError,
};
pub use identifier::{
    BytesIdentifierSerializer, Identifier, IdentifierSerializer, JsonIdentifierSerializer,
    ValueIdentifierSerializer,
};
pub use identifiers::{is_valid_identifier, quote_ident};
pub use row::Row;
pub use types::{SqlType, TypeInfo};
pub use value::Value;
