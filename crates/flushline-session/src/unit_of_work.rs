//! The unit of work: persistence context, action queue and the state the
//! event listeners share.
//!
//! The listeners themselves live in [`crate::listeners`] (persist, remove,
//! reattach), [`crate::loader`] (find, refresh, lock, initialize) and
//! [`crate::flush`]; the cascade walker in [`crate::cascade`]. They are all
//! methods on [`UnitOfWork`] because they recurse into one another while
//! walking the entity graph.

use crate::action_queue::ActionQueue;
use crate::cascade::{CascadePoint, CascadingAction};
use crate::config::SessionConfig;
use crate::context::{EntityEntry, EntityStatus, PersistenceContext};
use crate::entity::EntityRef;
use crate::factory::SessionFactory;
use crate::flush::{FlushPhase, Interceptor};
use flushline_core::{Dialect, EntityPersister, Error, Outcome, Result};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future used where the listeners recurse.
pub(crate) type BoxOutcome<'a, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + Send + 'a>>;

/// Per-session persistence state.
pub struct UnitOfWork {
    pub(crate) context: PersistenceContext,
    pub(crate) queue: ActionQueue,
    pub(crate) factory: SessionFactory,
    pub(crate) config: SessionConfig,
    pub(crate) in_transaction: bool,
    /// Entities already walked by the current cascade, per action and point.
    pub(crate) visited: HashSet<(CascadingAction, CascadePoint, EntityRef)>,
    pub(crate) interceptor: Option<Arc<dyn Interceptor>>,
    pub(crate) phase: FlushPhase,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("entities", &self.context.entity_count())
            .field("collections", &self.context.collection_count())
            .field("pending_actions", &self.queue.len())
            .field("in_transaction", &self.in_transaction)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl UnitOfWork {
    /// An empty unit of work issuing statements in `dialect`.
    pub fn new(factory: SessionFactory, dialect: Dialect) -> Self {
        let config = factory.config().clone();
        Self {
            context: PersistenceContext::new(),
            queue: ActionQueue::new(dialect, config.batch_size),
            factory,
            config,
            in_transaction: false,
            visited: HashSet::new(),
            interceptor: None,
            phase: FlushPhase::Idle,
        }
    }

    pub fn context(&self) -> &PersistenceContext {
        &self.context
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current flush phase; `Idle` outside a flush.
    pub fn phase(&self) -> FlushPhase {
        self.phase
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, value: bool) {
        self.in_transaction = value;
    }

    pub fn set_interceptor(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptor = Some(interceptor);
    }

    /// Mapping of `entity`'s type.
    pub(crate) fn persister_for(&self, entity: &EntityRef) -> Result<Arc<EntityPersister>> {
        self.factory.metamodel().persister(&entity.entity_name())
    }

    /// Whether `entity` is managed and not scheduled for removal.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.context
            .get_entry(entity)
            .is_some_and(|e| !e.status.is_deleted_or_gone())
    }

    pub fn status_of(&self, entity: &EntityRef) -> Option<EntityStatus> {
        self.context.get_entry(entity).map(|e| e.status)
    }

    pub fn entry(&self, entity: &EntityRef) -> Option<&EntityEntry> {
        self.context.get_entry(entity)
    }

    /// Toggle the read-only status of a managed entity.
    ///
    /// A read-only entity is never dirty-checked. Making it modifiable again
    /// takes its current state as the loaded state.
    pub fn set_read_only(&mut self, entity: &EntityRef, read_only: bool) -> Result<()> {
        let Some(entry) = self.context.get_entry_mut(entity) else {
            return Err(Error::Custom(format!(
                "cannot change read-only status of an unmanaged entity: {entity:?}"
            )));
        };
        match (entry.status, read_only) {
            (EntityStatus::Managed, true) => entry.status = EntityStatus::ReadOnly,
            (EntityStatus::ReadOnly, false) => {
                entry.loaded_state = Some(crate::action::current_state(entity, &entry.persister));
                entry.status = EntityStatus::Managed;
            }
            (EntityStatus::Managed, false) | (EntityStatus::ReadOnly, true) => {}
            (status, _) => {
                return Err(Error::Custom(format!(
                    "cannot change read-only status of {entity:?} while {status:?}"
                )));
            }
        }
        Ok(())
    }

    /// Stop tracking `entity`, its collections and its pending actions.
    pub fn evict(&mut self, entity: &EntityRef) {
        if self.context.remove_entry(entity).is_some() {
            self.queue.unschedule_all(entity);
            tracing::debug!(entity = ?entity, "Evicted");
        }
    }

    /// Forget every tracked entity and pending action.
    pub fn clear(&mut self) {
        self.context.clear();
        self.queue.clear();
        self.visited.clear();
        tracing::debug!("Unit of work cleared");
    }
}
