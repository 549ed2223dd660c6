//! Core types and traits for Flushline.
//!
//! This crate provides the foundational abstractions shared by the identifier
//! allocator and the session engine:
//!
//! - `Value` and `Row` for dynamically typed parameters and results
//! - `Connection` trait for the asynchronous database client
//! - `Dialect` for placeholder and lock syntax
//! - Mapping metadata (`EntityPersister`, `Metamodel`)
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome};

pub mod connection;
pub mod dialect;
pub mod error;
pub mod mapping;
pub mod row;
pub mod value;

pub use connection::Connection;
pub use dialect::Dialect;
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, EntityIdentity, Error, QueryError,
    QueryErrorKind, Result, RowCountError, TransactionError, TransactionErrorKind,
    TransientReference,
};
pub use mapping::{
    CascadeStyle, CollectionMapping, EntityPersister, IdGeneration, IdType, Metamodel,
    PropertyMapping, TableGeneratorConfig, ToOneMapping,
};
pub use row::Row;
pub use value::Value;
