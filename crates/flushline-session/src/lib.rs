//! Session and unit of work for Flushline.
//!
//! `flushline-session` is the **unit-of-work layer**. A [`Session`] tracks the
//! entities it loaded or was handed, queues the statements their changes
//! imply, and writes them in a dependency-safe order when flushed.
//!
//! # Role In The Architecture
//!
//! - **Persistence context**: one instance per identity, with its loaded
//!   state and lifecycle status.
//! - **Action queue**: inserts, updates, collection actions and deletes,
//!   ordered so foreign keys never point at rows that do not exist yet.
//! - **Flush**: a phased walk (cascade, dirty check, collection processing,
//!   execution) over the whole context.
//! - **Stateless session**: direct single-statement operations with no
//!   tracking, for bulk work.
//!
//! # Design Notes
//!
//! - **Explicit flush**: nothing is written until `flush` or `commit`, except
//!   identity inserts inside a transaction, which run early so the generated
//!   id is visible.
//! - **Shared handles**: entities are [`EntityRef`] handles; the context keys
//!   its bookkeeping on handle identity, not on equality.
//! - **Cancel-correct**: every database call takes a `Cx` and reports through
//!   `Outcome`; a flush interrupted by an error or cancellation leaves the
//!   context consistent and the queue free of half-executed work.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::new(metamodel, Dialect::Postgres)?;
//! let mut session = factory.open_session(conn);
//!
//! let team = EntityRef::new("Team").with("name", "Avengers");
//! let hero = EntityRef::new("Hero").with("name", "Thor").with_entity("team", Some(&team));
//! session.persist(&cx, &hero).await;   // cascades to `team`
//! session.commit(&cx).await;           // insert team, insert hero, commit
//! ```

pub mod action;
pub mod action_queue;
pub mod cascade;
pub mod config;
pub mod context;
pub mod entity;
pub mod factory;
pub mod flush;
mod listeners;
mod loader;
pub mod stateless;
pub mod unit_of_work;

#[cfg(test)]
pub(crate) mod testing;

pub use action::{Action, ActionKind};
pub use action_queue::{ActionCounts, ActionQueue, QueueError};
pub use cascade::{CascadePoint, CascadingAction};
pub use config::SessionConfig;
pub use context::{
    CollectionEntry, CollectionRef, EntityEntry, EntityKey, EntityStatus, LockMode,
    PersistenceContext,
};
pub use entity::{Bag, EntityRef, QueuedOperation};
pub use factory::{SessionFactory, SharedGenerator};
pub use flush::{FlushPhase, FlushStats, Interceptor};
pub use stateless::StatelessSession;
pub use unit_of_work::UnitOfWork;

use flushline_core::{Connection, Cx, Error, Outcome, Value, try_outcome};
use std::sync::Arc;

/// Points in a session's life where registered callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Before a flush starts; an error aborts the flush.
    BeforeFlush,
    AfterFlush,
    /// After the flush of a commit and before the database commit; an error
    /// aborts the commit.
    BeforeCommit,
    AfterCommit,
    AfterRollback,
}

type SessionEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Callbacks registered on a [`Session`], run in registration order.
#[derive(Default)]
pub struct SessionEventCallbacks {
    listeners: Vec<(SessionEvent, SessionEventFn)>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.listeners.iter().map(|(event, _)| event))
            .finish()
    }
}

impl SessionEventCallbacks {
    fn register(&mut self, event: SessionEvent, callback: SessionEventFn) {
        self.listeners.push((event, callback));
    }

    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<(), Error> {
        self.listeners
            .iter_mut()
            .filter(|(registered, _)| *registered == event)
            .try_for_each(|(_, callback)| callback())
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work bound to one connection.
///
/// Created by [`SessionFactory::open_session`].
pub struct Session<C: Connection> {
    connection: C,
    uow: UnitOfWork,
    event_callbacks: SessionEventCallbacks,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uow", &self.uow)
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    pub fn new(factory: SessionFactory, connection: C) -> Self {
        let dialect = connection.dialect();
        Self {
            uow: UnitOfWork::new(factory, dialect),
            connection,
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.uow
    }

    pub fn config(&self) -> &SessionConfig {
        self.uow.config()
    }

    /// Install the hooks called around each flush.
    pub fn set_interceptor(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.uow.set_interceptor(interceptor);
    }

    /// Run `callback` whenever `event` happens in this session.
    ///
    /// An error from a `Before*` callback aborts the operation it precedes.
    pub fn on(
        &mut self,
        event: SessionEvent,
        callback: impl FnMut() -> Result<(), Error> + Send + 'static,
    ) {
        self.event_callbacks.register(event, Box::new(callback));
    }

    // ========================================================================
    // Entity Operations
    // ========================================================================

    /// Make a transient entity persistent.
    ///
    /// The insert is queued until the next flush, except for identity ids
    /// inside a transaction, which are inserted right away. Cascades to
    /// associations mapped with `persist`.
    pub async fn persist(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        self.uow
            .persist_entity(cx, &self.connection, entity, CascadingAction::Persist)
            .await
    }

    /// Schedule the removal of a managed entity.
    pub async fn remove(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        self.uow.delete_entity(cx, &self.connection, entity).await
    }

    /// Reattach a detached entity; its full state is written at the next
    /// flush.
    pub async fn update(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        self.uow.update_entity(cx, &self.connection, entity).await
    }

    /// Re-read a managed entity from the database.
    pub async fn refresh(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        self.uow.refresh_entity(cx, &self.connection, entity).await
    }

    /// Obtain `mode` on a managed entity.
    pub async fn lock(&mut self, cx: &Cx, entity: &EntityRef, mode: LockMode) -> Outcome<(), Error> {
        self.uow.lock_entity(cx, &self.connection, entity, mode).await
    }

    /// Find an entity by id, from the context when it is already tracked.
    ///
    /// Entities removed in this session are reported as absent.
    pub async fn find(
        &mut self,
        cx: &Cx,
        entity_name: &str,
        id: impl Into<Value>,
    ) -> Outcome<Option<EntityRef>, Error> {
        self.uow
            .find(cx, &self.connection, entity_name, id.into())
            .await
    }

    /// Load a lazy collection of a managed entity.
    pub async fn initialize(
        &mut self,
        cx: &Cx,
        owner: &EntityRef,
        property: &str,
    ) -> Outcome<(), Error> {
        self.uow
            .initialize_collection(cx, &self.connection, owner, property)
            .await
    }

    /// Whether `entity` is managed and not scheduled for removal.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.uow.contains(entity)
    }

    pub fn status_of(&self, entity: &EntityRef) -> Option<EntityStatus> {
        self.uow.status_of(entity)
    }

    pub fn entry(&self, entity: &EntityRef) -> Option<&EntityEntry> {
        self.uow.entry(entity)
    }

    /// Toggle read-only mode; read-only entities are never dirty-checked.
    pub fn set_read_only(&mut self, entity: &EntityRef, read_only: bool) -> Result<(), Error> {
        self.uow.set_read_only(entity, read_only)
    }

    /// Stop tracking `entity`; pending work for it is dropped.
    pub fn evict(&mut self, entity: &EntityRef) {
        self.uow.evict(entity);
    }

    /// Stop tracking everything; pending work is dropped.
    pub fn clear(&mut self) {
        self.uow.clear();
    }

    // ========================================================================
    // Flush and Transactions
    // ========================================================================

    /// Write every pending change to the database.
    ///
    /// This executes INSERT, UPDATE and DELETE statements but does NOT commit.
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushStats, Error> {
        try_outcome!(result self.event_callbacks.fire(SessionEvent::BeforeFlush));

        if self.uow.config().auto_begin && !self.uow.in_transaction() {
            try_outcome!(self.begin(cx).await);
        }

        let stats = try_outcome!(self.uow.flush(cx, &self.connection).await);

        try_outcome!(result self.event_callbacks.fire(SessionEvent::AfterFlush));
        Outcome::Ok(stats)
    }

    /// Begin a transaction.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.uow.in_transaction() {
            return Outcome::Ok(());
        }
        try_outcome!(self.connection.begin(cx).await);
        self.uow.set_in_transaction(true);
        tracing::debug!("Transaction started");
        Outcome::Ok(())
    }

    /// Flush, then commit the current transaction.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<FlushStats, Error> {
        let stats = try_outcome!(self.flush(cx).await);

        try_outcome!(result self.event_callbacks.fire(SessionEvent::BeforeCommit));

        if self.uow.in_transaction() {
            try_outcome!(self.connection.commit(cx).await);
            self.uow.set_in_transaction(false);
            tracing::debug!("Transaction committed");
        }

        try_outcome!(result self.event_callbacks.fire(SessionEvent::AfterCommit));
        Outcome::Ok(stats)
    }

    /// Roll back the current transaction and forget every tracked entity.
    ///
    /// In-memory instances keep whatever state they had; they are detached.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.uow.in_transaction() {
            try_outcome!(self.connection.rollback(cx).await);
            self.uow.set_in_transaction(false);
            tracing::debug!("Transaction rolled back");
        }
        self.uow.clear();

        try_outcome!(result self.event_callbacks.fire(SessionEvent::AfterRollback));
        Outcome::Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.uow.in_transaction()
    }
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)]
mod tests {
    use super::*;
    use crate::testing::{MockConnection, unwrap_outcome};
    use asupersync::runtime::RuntimeBuilder;
    use flushline_core::{
        CascadeStyle, CollectionMapping, Dialect, EntityPersister, IdGeneration, Metamodel,
        ToOneMapping,
    };
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn metamodel() -> Metamodel {
        Metamodel::new()
            .entity(
                EntityPersister::new("Team", "teams")
                    .id("id", IdGeneration::Assigned)
                    .basic("name", "name")
                    .collection(
                        CollectionMapping::one_to_many("heroes", "Hero")
                            .mapped_by("team")
                            .cascade(CascadeStyle::ALL),
                    ),
            )
            .entity(
                EntityPersister::new("Hero", "heroes")
                    .id("id", IdGeneration::Assigned)
                    .basic("name", "name")
                    .versioned("version")
                    .to_one(ToOneMapping::new("team", "team_id", "Team").cascade(CascadeStyle::PERSIST)),
            )
            .entity(
                EntityPersister::new("Villain", "villains")
                    .id("id", IdGeneration::Identity)
                    .basic("name", "name"),
            )
            .entity(
                EntityPersister::new("Sidekick", "sidekicks")
                    .id("id", IdGeneration::Assigned)
                    .to_one(ToOneMapping::new("hero", "hero_id", "Hero")),
            )
    }

    fn session(conn: &MockConnection) -> Session<MockConnection> {
        SessionFactory::new(metamodel(), Dialect::Postgres)
            .expect("valid metamodel")
            .open_session(conn.clone())
    }

    fn hero_row(conn: &MockConnection, id: i64, name: &str, team: Option<i64>, version: i64) {
        conn.add_row(
            "heroes",
            &["id", "name", "team_id", "version"],
            vec![
                Value::BigInt(id),
                Value::Text(name.into()),
                team.map_or(Value::Null, Value::BigInt),
                Value::BigInt(version),
            ],
        );
    }

    #[test]
    fn test_persist_cascades_parent_first() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session(&conn);
        let team = EntityRef::new("Team").with_id(1_i64).with("name", "Avengers");
        let hero = EntityRef::new("Hero")
            .with_id(10_i64)
            .with("name", "Thor")
            .with_entity("team", Some(&team));

        rt.block_on(async {
            unwrap_outcome(session.persist(&cx, &hero).await);
            assert!(session.contains(&team));
            assert!(conn.executed().is_empty());

            let stats = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(stats.actions.get(ActionKind::Insert), 2);
        });

        let sql = conn.executed_sql();
        assert!(sql[0].starts_with("insert into teams"), "{sql:?}");
        assert!(sql[1].starts_with("insert into heroes"), "{sql:?}");
        assert_eq!(hero.version(), Some(0));
        assert_eq!(conn.transactions(), (1, 0, 0));
    }

    #[test]
    fn test_second_flush_is_empty() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session(&conn);
        let team = EntityRef::new("Team").with_id(1_i64).with("name", "Avengers");

        rt.block_on(async {
            unwrap_outcome(session.persist(&cx, &team).await);
            unwrap_outcome(session.flush(&cx).await);
            let stats = unwrap_outcome(session.flush(&cx).await);
            assert!(stats.is_empty());
        });
        assert_eq!(conn.executed().len(), 1);
    }

    #[test]
    fn test_dirty_entity_updates_with_version_check() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        hero_row(&conn, 10, "Thor", None, 4);
        let mut session = session(&conn);

        rt.block_on(async {
            let hero = unwrap_outcome(session.find(&cx, "Hero", 10_i64).await).expect("loaded");
            hero.set("name", "Loki");
            let stats = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(stats.actions.get(ActionKind::Update), 1);
            assert_eq!(hero.version(), Some(5));

            let stats = unwrap_outcome(session.flush(&cx).await);
            assert!(stats.is_empty());
        });

        let (sql, params) = &conn.executed()[0];
        assert_eq!(sql, "update heroes set name=$1, version=$2 where id=$3 and version=$4");
        assert_eq!(
            params,
            &vec![
                Value::Text("Loki".into()),
                Value::BigInt(5),
                Value::BigInt(10),
                Value::BigInt(4),
            ]
        );
    }

    #[test]
    fn test_stale_update_fails_flush() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        hero_row(&conn, 10, "Thor", None, 4);
        conn.set_update_count("update heroes", 0);
        let mut session = session(&conn);

        rt.block_on(async {
            let hero = unwrap_outcome(session.find(&cx, "Hero", 10_i64).await).expect("loaded");
            hero.set("name", "Loki");
            let outcome = session.flush(&cx).await;
            assert!(matches!(outcome, Outcome::Err(Error::StaleState(_))));
            assert_eq!(session.unit_of_work().phase(), FlushPhase::Idle);
            assert!(session.unit_of_work().queue().is_empty());
        });
    }

    #[test]
    fn test_find_after_remove_is_absent() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        hero_row(&conn, 10, "Thor", None, 0);
        let mut session = session(&conn);

        rt.block_on(async {
            let hero = unwrap_outcome(session.find(&cx, "Hero", 10_i64).await).expect("loaded");
            unwrap_outcome(session.remove(&cx, &hero).await);
            assert_eq!(session.status_of(&hero), Some(EntityStatus::Deleted));
            assert!(!session.contains(&hero));
            assert!(unwrap_outcome(session.find(&cx, "Hero", 10_i64).await).is_none());

            let stats = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(stats.actions.get(ActionKind::Delete), 1);
            assert_eq!(session.status_of(&hero), None);
        });
        assert_eq!(
            conn.executed_sql(),
            vec!["delete from heroes where id=$1 and version=$2".to_string()]
        );
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        hero_row(&conn, 10, "Thor", Some(1), 0);
        conn.add_row(
            "teams",
            &["id", "name"],
            vec![Value::BigInt(1), Value::Text("Avengers".into())],
        );
        conn.fail_on("select id, name from teams");
        let mut session = session(&conn);

        rt.block_on(async {
            let outcome = session.find(&cx, "Hero", 10_i64).await;
            assert!(matches!(outcome, Outcome::Err(Error::Query(_))), "{outcome:?}");
            assert_eq!(session.unit_of_work().context().entity_count(), 0);
            assert_eq!(session.unit_of_work().context().collection_count(), 0);

            conn.clear_failure();
            let hero = unwrap_outcome(session.find(&cx, "Hero", 10_i64).await).expect("loaded");
            assert_eq!(session.status_of(&hero), Some(EntityStatus::Managed));
            let team = hero.entity("team").expect("team resolved");
            assert_eq!(team.id(), Value::BigInt(1));
            assert_eq!(session.status_of(&team), Some(EntityStatus::Managed));
        });
        assert_eq!(conn.queries().len(), 4);
    }

    #[test]
    fn test_remove_of_pending_insert_issues_nothing() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session(&conn);
        let team = EntityRef::new("Team").with_id(1_i64).with("name", "Avengers");

        rt.block_on(async {
            unwrap_outcome(session.persist(&cx, &team).await);
            unwrap_outcome(session.remove(&cx, &team).await);
            let stats = unwrap_outcome(session.flush(&cx).await);
            assert!(stats.is_empty());
        });
        assert!(conn.executed().is_empty());
    }

    #[test]
    fn test_identity_insert_is_delayed_outside_transaction() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session(&conn);
        let villain = EntityRef::new("Villain").with("name", "Loki");

        rt.block_on(async {
            unwrap_outcome(session.persist(&cx, &villain).await);
            assert!(villain.id().is_null());
            assert!(session.unit_of_work().queue().is_unresolved_insert(&villain));

            unwrap_outcome(session.flush(&cx).await);
            assert_eq!(villain.id(), Value::BigInt(1));
        });
    }

    #[test]
    fn test_identity_insert_runs_early_in_transaction() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session(&conn);
        let villain = EntityRef::new("Villain").with("name", "Loki");

        rt.block_on(async {
            unwrap_outcome(session.begin(&cx).await);
            unwrap_outcome(session.persist(&cx, &villain).await);
            assert_eq!(villain.id(), Value::BigInt(1));
            assert_eq!(conn.executed().len(), 1);

            let stats = unwrap_outcome(session.commit(&cx).await);
            assert!(stats.is_empty());
        });
        assert_eq!(conn.transactions(), (1, 1, 0));
    }

    #[test]
    fn test_persist_rejects_duplicate_identity() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session(&conn);
        let first = EntityRef::new("Team").with_id(1_i64);
        let second = EntityRef::new("Team").with_id(1_i64);

        rt.block_on(async {
            unwrap_outcome(session.persist(&cx, &first).await);
            let outcome = session.persist(&cx, &second).await;
            assert!(matches!(outcome, Outcome::Err(Error::NonUniqueObject(_))));
        });
    }

    #[test]
    fn test_transient_reference_fails_flush() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session(&conn);
        let hero = EntityRef::new("Hero").with("name", "Thor");
        let sidekick = EntityRef::new("Sidekick")
            .with_id(1_i64)
            .with_entity("hero", Some(&hero));

        rt.block_on(async {
            unwrap_outcome(session.persist(&cx, &sidekick).await);
            let outcome = session.flush(&cx).await;
            let Outcome::Err(Error::TransientObject(reference)) = outcome else {
                panic!("expected transient object error, got {outcome:?}");
            };
            assert_eq!(reference.entity, "Sidekick");
            assert_eq!(reference.property, "hero");
            assert_eq!(reference.target, "Hero");
        });
        assert!(conn.executed().is_empty());
    }

    #[test]
    fn test_events_and_rollback() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session(&conn);
        let fired = Arc::new(Mutex::new(Vec::new()));
        for (event, label) in [
            (SessionEvent::AfterRollback, "after_rollback"),
            (SessionEvent::BeforeFlush, "before_flush"),
            (SessionEvent::AfterFlush, "after_flush"),
        ] {
            let fired = Arc::clone(&fired);
            session.on(event, move || {
                fired.lock().expect("lock poisoned").push(label);
                Ok(())
            });
        }
        let team = EntityRef::new("Team").with_id(1_i64);

        rt.block_on(async {
            unwrap_outcome(session.persist(&cx, &team).await);
            unwrap_outcome(session.flush(&cx).await);
            unwrap_outcome(session.rollback(&cx).await);
        });

        assert_eq!(
            *fired.lock().expect("lock poisoned"),
            vec!["before_flush", "after_flush", "after_rollback"]
        );
        assert!(!session.contains(&team));
        assert!(!session.in_transaction());
        assert_eq!(conn.transactions(), (1, 0, 1));
    }

    #[test]
    fn test_before_flush_error_aborts() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session(&conn);
        session.on(SessionEvent::BeforeFlush, || Err(Error::Custom("no".into())));
        let team = EntityRef::new("Team").with_id(1_i64);

        rt.block_on(async {
            unwrap_outcome(session.persist(&cx, &team).await);
            assert!(matches!(session.flush(&cx).await, Outcome::Err(Error::Custom(_))));
        });
        assert!(conn.executed().is_empty());
    }

    #[test]
    fn test_interceptor_sees_flushable_entities() {
        struct Counting(AtomicUsize, AtomicUsize);
        impl Interceptor for Counting {
            fn pre_flush(&self, entities: &[EntityRef]) -> Result<(), Error> {
                self.0.fetch_add(entities.len(), Ordering::SeqCst);
                Ok(())
            }
            fn post_flush(&self, entities: &[EntityRef]) {
                self.1.fetch_add(entities.len(), Ordering::SeqCst);
            }
        }

        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = session(&conn);
        let counting = Arc::new(Counting(AtomicUsize::new(0), AtomicUsize::new(0)));
        session.set_interceptor(counting.clone());
        let team = EntityRef::new("Team").with_id(1_i64);
        let hero = EntityRef::new("Hero")
            .with_id(10_i64)
            .with_entity("team", Some(&team));

        rt.block_on(async {
            unwrap_outcome(session.persist(&cx, &hero).await);
            unwrap_outcome(session.flush(&cx).await);
        });
        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
        assert_eq!(counting.1.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_force_increment_lock_bumps_version() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        hero_row(&conn, 10, "Thor", None, 2);
        let mut session = session(&conn);

        rt.block_on(async {
            let hero = unwrap_outcome(session.find(&cx, "Hero", 10_i64).await).expect("loaded");
            unwrap_outcome(session.lock(&cx, &hero, LockMode::ForceIncrement).await);
            unwrap_outcome(session.flush(&cx).await);
            assert_eq!(hero.version(), Some(3));
            assert_eq!(
                session.entry(&hero).map(|e| e.lock_mode),
                Some(LockMode::Read)
            );
        });
        assert_eq!(
            conn.executed_sql(),
            vec!["update heroes set version=$1 where id=$2 and version=$3".to_string()]
        );
    }

    #[test]
    fn test_read_only_entity_is_not_updated() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        hero_row(&conn, 10, "Thor", None, 0);
        let mut session = session(&conn);

        rt.block_on(async {
            let hero = unwrap_outcome(session.find(&cx, "Hero", 10_i64).await).expect("loaded");
            session.set_read_only(&hero, true).expect("managed");
            hero.set("name", "Loki");
            let stats = unwrap_outcome(session.flush(&cx).await);
            assert!(stats.is_empty());
        });
    }
}
