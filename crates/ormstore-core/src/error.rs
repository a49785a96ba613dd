//! Error types for ormstore operations.

use std::fmt;

/// The primary error type for all ormstore operations.
#[derive(Debug)]
pub enum Error {
    /// Structural misuse of the object store (types, proxies, relations, transactions)
    Object(ObjectError),
    /// Type conversion errors
    Type(TypeError),
    /// Statement execution errors reported by a backend
    Query(QueryError),
    /// Connection-related errors reported by a backend
    Connection(ConnectionError),
    /// Serialization/deserialization errors (object images, JSON)
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// An object store error, classified by [`ObjectErrorKind`].
#[derive(Debug, Clone)]
pub struct ObjectError {
    pub kind: ObjectErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectErrorKind {
    /// A prototype with this name or type is already attached
    DuplicateType,
    /// The type or prototype name is not attached
    UnknownType,
    /// Detach while objects of the node are still referenced
    NodeHasObjects,
    /// The object does not belong to this store
    ObjectNotInStore,
    /// Remove while the object is still referenced by relations
    HasReferences,
    /// Relation discovery found an incompatible endpoint on the foreign node
    InvalidEndpointType,
    /// A relation table with this name is already registered
    PrototypeAlreadyInserted,
    /// Commit or rollback of a transaction that is not on top of the stack
    TransactionNotCurrent,
    /// Identifiers of different concrete types were compared or assigned
    IdentifierTypeMismatch,
    /// The object is already inserted into a store
    AlreadyInserted,
    /// Another object of the same type already uses this primary key
    DuplicateIdentifier,
    /// The live object is borrowed and cannot be visited right now
    ObjectBorrowed,
    /// The proxy holds no object
    NotLoaded,
}

impl ObjectErrorKind {
    /// Short stable label for logs and messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            ObjectErrorKind::DuplicateType => "duplicate type",
            ObjectErrorKind::UnknownType => "unknown type",
            ObjectErrorKind::NodeHasObjects => "node has objects",
            ObjectErrorKind::ObjectNotInStore => "object not in store",
            ObjectErrorKind::HasReferences => "object has references",
            ObjectErrorKind::InvalidEndpointType => "invalid endpoint type",
            ObjectErrorKind::PrototypeAlreadyInserted => "prototype already inserted",
            ObjectErrorKind::TransactionNotCurrent => "transaction not current",
            ObjectErrorKind::IdentifierTypeMismatch => "identifier type mismatch",
            ObjectErrorKind::AlreadyInserted => "object already inserted",
            ObjectErrorKind::DuplicateIdentifier => "duplicate identifier",
            ObjectErrorKind::ObjectBorrowed => "object borrowed",
            ObjectErrorKind::NotLoaded => "object not loaded",
        }
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Backend transaction could not be started or finished
    Transaction,
}

impl Error {
    /// Build an object store error of the given kind.
    pub fn object(kind: ObjectErrorKind, message: impl Into<String>) -> Self {
        Error::Object(ObjectError {
            kind,
            message: message.into(),
        })
    }

    /// The object store error kind, if this is an object store error.
    pub fn object_kind(&self) -> Option<ObjectErrorKind> {
        match self {
            Error::Object(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Is this the given object store error kind?
    pub fn is(&self, kind: ObjectErrorKind) -> bool {
        self.object_kind() == Some(kind)
    }

    /// Get the SQL that caused the error, if available.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Object(e) => write!(f, "Object store error ({}): {}", e.kind.as_str(), e.message),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ObjectError> for Error {
    fn from(err: ObjectError) -> Self {
        Error::Object(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for ormstore operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_kind_helpers() {
        let err = Error::object(ObjectErrorKind::HasReferences, "item 3 is referenced");
        assert_eq!(err.object_kind(), Some(ObjectErrorKind::HasReferences));
        assert!(err.is(ObjectErrorKind::HasReferences));
        assert!(!err.is(ObjectErrorKind::UnknownType));
        assert_eq!(
            err.to_string(),
            "Object store error (object has references): item 3 is referenced"
        );
    }

    #[test]
    fn test_non_object_errors_have_no_kind() {
        let err = Error::Custom("boom".to_string());
        assert_eq!(err.object_kind(), None);
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_query_error_exposes_sql() {
        let err = Error::Query(QueryError {
            kind: QueryErrorKind::Syntax,
            sql: Some("SELEC 1".to_string()),
            message: "syntax error".to_string(),
            source: None,
        });
        assert_eq!(err.sql(), Some("SELEC 1"));
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse = serde_json::from_str::<i32>("not json").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Serde(_)));
    }
}
