//! Flushline - a non-blocking unit of work for async SQL persistence.
//!
//! Flushline tracks entity instances in a session, records what changed, and
//! writes the changes in one dependency-safe batch when the session is
//! flushed:
//!
//! - Identity-mapped persistence context with lifecycle statuses
//! - Cascading persist, remove, refresh and lock along mapped associations
//! - An action queue ordering inserts parent-first and deletes child-first
//! - Optimistic locking through version columns
//! - Block identifier allocation from a shared counter table
//! - A stateless session for bulk work without tracking
//!
//! # Quick Start
//!
//! ```ignore
//! use flushline::prelude::*;
//!
//! let metamodel = Metamodel::new()
//!     .entity(EntityPersister::new("Team", "teams").basic("name", "name"))
//!     .entity(
//!         EntityPersister::new("Hero", "heroes")
//!             .id("id", IdGeneration::Table(TableGeneratorConfig::new("hibernate_sequences").segment("heroes")))
//!             .basic("name", "name")
//!             .versioned("version")
//!             .to_one(ToOneMapping::new("team", "team_id", "Team").cascade(CascadeStyle::PERSIST)),
//!     );
//! let factory = SessionFactory::new(metamodel, Dialect::Postgres)?;
//!
//! async fn save(cx: &Cx, factory: &SessionFactory, conn: impl Connection) -> Outcome<(), Error> {
//!     let mut session = factory.open_session(conn);
//!     let team = EntityRef::new("Team").with_id(1_i64).with("name", "Avengers");
//!     let hero = EntityRef::new("Hero").with("name", "Thor").with_entity("team", Some(&team));
//!     try_outcome!(session.persist(cx, &hero).await);
//!     try_outcome!(session.commit(cx).await);
//!     Outcome::Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - **Structured concurrency**: Built on asupersync for cancel-correct operations
//! - **Driver agnostic**: Anything implementing [`Connection`] can back a session
//! - **Observable**: `tracing` spans and events around every phase and statement

// Re-export all public types from sub-crates
pub use flushline_core::{
    // asupersync re-exports
    Budget,
    // Mapping metadata
    CascadeStyle,
    CollectionMapping,
    // Core types
    ConfigError,
    Connection,
    ConnectionError,
    ConnectionErrorKind,
    Cx,
    Dialect,
    EntityIdentity,
    EntityPersister,
    Error,
    IdGeneration,
    IdType,
    Metamodel,
    Outcome,
    PropertyMapping,
    QueryError,
    QueryErrorKind,
    Result,
    Row,
    RowCountError,
    TableGeneratorConfig,
    ToOneMapping,
    TransactionError,
    TransactionErrorKind,
    TransientReference,
   
    Value,
    try_outcome,
};

// Identifier generation
pub use flushline_id::{BlockAllocator, BlockIdentifierGenerator, TableGenerator};

// Session
pub use flushline_session::{
    Action, ActionCounts, ActionKind, ActionQueue, Bag, CascadePoint, CascadingAction,
    CollectionEntry, CollectionRef, EntityEntry, EntityKey, EntityRef, EntityStatus, FlushPhase,
    FlushStats, Interceptor, LockMode, PersistenceContext, QueueError, QueuedOperation, Session,
    SessionConfig, SessionEvent, SessionEventCallbacks, SessionFactory, SharedGenerator,
    StatelessSession, UnitOfWork,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use flushline::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // asupersync
        Budget,
        // Mapping
        CascadeStyle,
        CollectionMapping,
        // Core traits and types
        Connection,
        Cx,
        Dialect,
        // Session
        EntityRef,
        EntityPersister,
        EntityStatus,
        Error,
        FlushStats,
        IdGeneration,
        LockMode,
        Metamodel,
        Outcome,
        Result,
        Row,
        Session,
        SessionConfig,
        SessionFactory,
        StatelessSession,
        TableGeneratorConfig,
        ToOneMapping,
        Value,
        try_outcome,
    };
}
