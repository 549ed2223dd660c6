//! Error types for Flushline operations.

use std::fmt;

/// The primary error type for all Flushline operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect), raised by
    /// [`crate::Connection`] implementations
    Connection(ConnectionError),
    /// Statement execution errors reported by the database client
    Query(QueryError),
    /// Transaction demarcation errors reported by a driver's `begin`,
    /// `commit` or `rollback`
    Transaction(TransactionError),
    /// Configuration errors
    Config(ConfigError),
    /// Mapping metadata is inconsistent (unknown entity, missing property)
    Mapping(String),
    /// A second live instance was associated with an identity already tracked
    NonUniqueObject(EntityIdentity),
    /// A statement that must touch exactly one row touched several
    TooManyRowsAffected(RowCountError),
    /// An identifier generator produced no usable value
    IdentifierGeneration(String),
    /// A flushed entity references an unsaved transient instance
    TransientObject(TransientReference),
    /// Optimistic lock failure: the row was updated or deleted concurrently
    StaleState(EntityIdentity),
    /// No row exists for the given identifier
    ObjectNotFound(EntityIdentity),
    /// I/O errors
    Io(std::io::Error),
    /// Operation was cancelled via asupersync; for drivers that report
    /// cancellation as an error instead of `Outcome::Cancelled`
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
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
    /// Connection already closed
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already active
    AlreadyActive,
    /// No transaction is active
    NotActive,
    /// The transaction was marked rollback-only
    MarkedForRollback,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// An entity name plus rendered identifier, carried by identity-related errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityIdentity {
    pub entity: String,
    pub id: String,
}

/// Row count mismatch for a statement that must touch exactly `expected` rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCountError {
    pub message: String,
    pub expected: u64,
    pub actual: u64,
}

/// A reference from a flushed entity to a transient one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientReference {
    pub entity: String,
    pub property: String,
    pub target: String,
}

impl Error {
    /// Build an identity error payload from an entity name and identifier.
    pub fn identity(entity: impl Into<String>, id: &crate::Value) -> EntityIdentity {
        EntityIdentity {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Shorthand for a [`Error::Config`] without a source.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Is this a retryable error (deadlock, serialization failure)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            _ => false,
        }
    }

    /// Is this an optimistic-locking or identity conflict?
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::NonUniqueObject(_) | Error::StaleState(_) | Error::TooManyRowsAffected(_)
        )
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Mapping(msg) => write!(f, "Mapping error: {}", msg),
            Error::NonUniqueObject(e) => write!(
                f,
                "A different object with the same identifier value was already associated with the session: [{}#{}]",
                e.entity, e.id
            ),
            Error::TooManyRowsAffected(e) => write!(
                f,
                "{}: expected {} row(s), actual {}",
                e.message, e.expected, e.actual
            ),
            Error::IdentifierGeneration(msg) => write!(f, "{}", msg),
            Error::TransientObject(e) => write!(
                f,
                "object references an unsaved transient instance: {}.{} -> {}",
                e.entity, e.property, e.target
            ),
            Error::StaleState(e) => write!(
                f,
                "Row was updated or deleted by another transaction: [{}#{}]",
                e.entity, e.id
            ),
            Error::ObjectNotFound(e) => {
                write!(f, "No row with the given identifier exists: [{}#{}]", e.entity, e.id)
            }
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for Flushline operations.
pub type Result<T> = std::result::Result<T, Error>;
