//! Flush coordination.
//!
//! A flush walks a fixed sequence of phases:
//!
//! 1. **PreFlush**: interceptor hook, flush-time persist cascade over every
//!    flushable entity, transient-reference check, collection flag reset.
//! 2. **EntityCascade**: reach the collections of every tracked entity and
//!    decide whether each must be recreated, removed or updated.
//! 3. **DirtyCheckAndSchedule**: compare each managed entity with its loaded
//!    state and schedule updates (and forced version increments), then sort
//!    the entity actions.
//! 4. **CollectionProcess**: dereferenced collections are removed; flagged
//!    and queued-operation collections get their actions; those are sorted.
//! 5. **Executing**: the action queue runs every action, fail-fast.
//! 6. **PostFlush**: context bookkeeping and the interceptor hook.
//!
//! Any failure aborts the remaining phases. The flushing flag is cleared on
//! every exit path and the updates and collection actions the failed flush
//! scheduled are dropped.

use crate::action::{Action, ActionKind, CollectionAction, EntityUpdateAction, current_state};
use crate::action_queue::ActionCounts;
use crate::cascade::{CascadePoint, CascadingAction};
use crate::context::{CollectionEntry, CollectionRef, EntityStatus, LockMode};
use crate::entity::{Bag, EntityRef};
use crate::unit_of_work::UnitOfWork;
use flushline_core::{Connection, Cx, Error, Outcome, PropertyMapping, Result, try_outcome};
use std::sync::Arc;

/// Hooks called around each flush.
pub trait Interceptor: Send + Sync {
    /// Called with the flushable entities before anything is cascaded.
    /// Returning `Err` aborts the flush.
    fn pre_flush(&self, entities: &[EntityRef]) -> Result<()> {
        let _ = entities;
        Ok(())
    }

    /// Called with the entities still tracked after a successful flush.
    fn post_flush(&self, entities: &[EntityRef]) {
        let _ = entities;
    }
}

/// Phase of the flush state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushPhase {
    #[default]
    Idle,
    PreFlush,
    EntityCascade,
    DirtyCheckAndSchedule,
    CollectionProcess,
    Executing,
    PostFlush,
}

/// Summary of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Entities tracked when execution started.
    pub entities: usize,
    /// Collections tracked when execution started.
    pub collections: usize,
    /// Actions executed, per kind.
    pub actions: ActionCounts,
}

impl FlushStats {
    /// Whether the flush issued no statements.
    pub fn is_empty(&self) -> bool {
        self.actions.total() == 0
    }
}

/// Whether `bag` holds different elements than `snapshot`, ignoring order.
fn differs(snapshot: &[EntityRef], bag: &Bag) -> bool {
    snapshot.len() != bag.len() || snapshot.iter().any(|e| !bag.contains(e))
}

impl UnitOfWork {
    fn enter(&mut self, phase: FlushPhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "Flush phase");
        self.phase = phase;
    }

    /// Synchronize every tracked change with the database.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn flush<C: Connection>(&mut self, cx: &Cx, conn: &C) -> Outcome<FlushStats, Error> {
        if self.context.is_flushing() {
            return Outcome::Err(Error::Custom(
                "flush requested while a flush is in progress".to_string(),
            ));
        }

        let outcome = self.run_flush(cx, conn).await;
        if !matches!(outcome, Outcome::Ok(_)) {
            tracing::warn!(phase = ?self.phase, "Flush failed, discarding scheduled updates");
            self.queue.discard_flush_actions();
            self.visited.clear();
        }
        self.enter(FlushPhase::Idle);
        outcome
    }

    async fn run_flush<C: Connection>(&mut self, cx: &Cx, conn: &C) -> Outcome<FlushStats, Error> {
        let _flushing = self.context.flushing_guard();

        self.enter(FlushPhase::PreFlush);
        try_outcome!(self.pre_flush(cx, conn).await);

        self.enter(FlushPhase::EntityCascade);
        self.reach_collections();

        self.enter(FlushPhase::DirtyCheckAndSchedule);
        try_outcome!(result self.schedule_updates());
        try_outcome!(result self.queue.sort_actions(self.config.order_updates));

        self.enter(FlushPhase::CollectionProcess);
        try_outcome!(result self.schedule_collection_actions());
        self.queue.sort_collection_actions();

        self.enter(FlushPhase::Executing);
        self.queue.prepare_actions();
        let entities = self.context.entity_count();
        let collections = self.context.collection_count();
        let actions = try_outcome!(
            self.queue
                .execute_actions(cx, conn, &mut self.context)
                .await
        );

        self.enter(FlushPhase::PostFlush);
        self.context.post_flush();
        if let Some(interceptor) = &self.interceptor {
            let tracked: Vec<EntityRef> = self
                .context
                .reentrant_safe_entity_entries()
                .into_iter()
                .map(|(entity, _)| entity)
                .collect();
            interceptor.post_flush(&tracked);
        }

        let stats = FlushStats {
            entities,
            collections,
            actions,
        };
        tracing::info!(
            entities,
            collections,
            inserts = actions.get(ActionKind::Insert),
            updates = actions.get(ActionKind::Update),
            deletes = actions.get(ActionKind::Delete),
            collection_recreates = actions.get(ActionKind::CollectionRecreate),
            collection_updates = actions.get(ActionKind::CollectionUpdate),
            collection_removes = actions.get(ActionKind::CollectionRemove),
            queued_operations = actions.get(ActionKind::QueuedOperation),
            "Flushed"
        );
        Outcome::Ok(stats)
    }

    fn flushable_entities(&self) -> Vec<EntityRef> {
        self.context
            .reentrant_safe_entity_entries()
            .into_iter()
            .filter(|(_, entry)| entry.status.is_flushable())
            .map(|(entity, _)| entity)
            .collect()
    }

    async fn pre_flush<C: Connection>(&mut self, cx: &Cx, conn: &C) -> Outcome<(), Error> {
        if let Some(interceptor) = &self.interceptor {
            try_outcome!(result interceptor.pre_flush(&self.flushable_entities()));
        }

        {
            // One level for the whole pass: walks from different roots share
            // the visited set.
            let _level = self.context.cascade_level_guard();
            for action in [CascadingAction::PersistOnFlush, CascadingAction::CheckOnFlush] {
                self.visited.clear();
                for entity in self.flushable_entities() {
                    try_outcome!(
                        self.cascade(cx, conn, action, CascadePoint::BeforeFlush, &entity)
                            .await
                    );
                }
            }
            self.visited.clear();
        }

        try_outcome!(result self.context.for_each_collection_entry(false, |ctx, collection, _| {
            if let Some(entry) = ctx.get_collection_entry_mut(collection) {
                entry.pre_flush();
            }
            Ok(())
        }));
        Outcome::Ok(())
    }

    /// Mark every collection still referenced by its owner as reached and
    /// compute its recreate/remove/update flags.
    fn reach_collections(&mut self) {
        for (owner, entry) in self.context.reentrant_safe_entity_entries() {
            if matches!(
                entry.status,
                EntityStatus::Loading | EntityStatus::Deleted | EntityStatus::Gone
            ) {
                continue;
            }
            let owner_key = entry.key();
            for mapping in entry.persister.collections() {
                let Some(bag) = owner.collection(&mapping.name) else {
                    continue;
                };
                let collection = CollectionRef::new(owner.clone(), mapping.name.clone());
                if self.context.get_collection_entry(&collection).is_none() {
                    self.context.add_collection_entry(
                        collection.clone(),
                        CollectionEntry::new(entry.persister.role(&mapping.name)),
                    );
                }
                let Some(ce) = self.context.get_collection_entry_mut(&collection) else {
                    continue;
                };
                ce.reached = true;
                if entry.status == EntityStatus::ReadOnly {
                    ce.ignore = true;
                    ce.current_persister = ce.loaded_persister.clone();
                    continue;
                }
                ce.current_persister = Some(Arc::clone(&entry.persister));

                match &ce.loaded_persister {
                    None => ce.do_recreate = !bag.is_empty(),
                    Some(loaded) if loaded.name != entry.persister.name || ce.loaded_key != owner_key => {
                        ce.do_remove = true;
                        ce.do_recreate = !bag.is_empty();
                    }
                    Some(_) if bag.is_initialized() => match &ce.loaded_snapshot {
                        None => {
                            ce.do_remove = true;
                            ce.do_recreate = !bag.is_empty();
                        }
                        Some(snapshot) if bag.is_empty() && !snapshot.is_empty() => {
                            ce.do_remove = true;
                        }
                        Some(snapshot) if differs(snapshot, &bag) => ce.do_update = true,
                        Some(_) => {}
                    },
                    Some(_) => {}
                }
                if ce.needs_action() {
                    tracing::trace!(
                        role = %ce.role,
                        recreate = ce.do_recreate,
                        remove = ce.do_remove,
                        update = ce.do_update,
                        "Collection changed"
                    );
                }
            }
        }
    }

    /// Dirty-check every managed entity and schedule its update.
    fn schedule_updates(&mut self) -> Result<()> {
        for (entity, entry) in self.context.reentrant_safe_entity_entries() {
            if entry.status != EntityStatus::Managed || self.queue.has_insert_for(&entity) {
                continue;
            }
            if !entry.id.is_null() && !entity.id().id_eq(&entry.id) {
                return Err(Error::Custom(format!(
                    "identifier of an instance of {} was altered from {} to {}",
                    entry.entity_name(),
                    entry.id,
                    entity.id()
                )));
            }

            let persister = &entry.persister;
            let state = current_state(&entity, persister);
            let dirty: Vec<usize> = match &entry.loaded_state {
                None => (0..state.len()).collect(),
                Some(loaded) => (0..state.len())
                    .filter(|&i| loaded.get(i) != Some(&state[i]))
                    .collect(),
            };
            let force = entry.lock_mode == LockMode::ForceIncrement;
            if dirty.is_empty() && !force {
                continue;
            }

            let previous = entry.version;
            let bump = force || (!dirty.is_empty() && !entry.disable_version_increment);
            let next = if persister.is_versioned() && bump {
                Some(previous.unwrap_or(0) + 1)
            } else {
                previous
            };
            tracing::debug!(entity = ?entity, dirty = dirty.len(), forced = force, "Scheduling update");
            self.queue.enqueue(Action::Update(EntityUpdateAction {
                entity: entity.clone(),
                persister: Arc::clone(persister),
                id: entry.id.clone(),
                dirty,
                previous_version: previous,
                next_version: next,
            }));
        }
        Ok(())
    }

    /// Turn collection flags and queued operations into actions.
    fn schedule_collection_actions(&mut self) -> Result<()> {
        let factory = self.factory.clone();
        let mut scheduled = Vec::new();
        self.context.for_each_collection_entry(false, |ctx, collection, entry| {
            let mut entry = entry.clone();
            if !entry.reached && !entry.ignore && entry.loaded_persister.is_some() {
                tracing::trace!(role = %entry.role, "Collection dereferenced");
                entry.do_remove = true;
                entry.current_persister = None;
            }

            let owner = factory.metamodel().persister(&collection.owner.entity_name())?;
            let Some(PropertyMapping::Collection(mapping)) = owner.property(&collection.property)
            else {
                return Err(Error::Mapping(format!(
                    "{} has no collection {}",
                    owner.name, collection.property
                )));
            };
            let action = CollectionAction {
                collection: collection.clone(),
                role: entry.role.clone(),
                mapping: mapping.clone(),
                loaded_key: entry.loaded_key.clone(),
                snapshot: entry.loaded_snapshot.clone().unwrap_or_default(),
            };
            if entry.do_remove {
                scheduled.push(Action::CollectionRemove(action.clone()));
            }
            if entry.do_recreate {
                scheduled.push(Action::CollectionRecreate(action.clone()));
            }
            if entry.do_update {
                scheduled.push(Action::CollectionUpdate(action.clone()));
            }
            let queued = collection
                .owner
                .collection(&collection.property)
                .is_some_and(|bag| !bag.is_initialized() && bag.has_queued_operations());
            if !entry.needs_action() && entry.reached && queued {
                scheduled.push(Action::QueuedOperation(action));
            }

            entry.processed = true;
            if let Some(tracked) = ctx.get_collection_entry_mut(collection) {
                *tracked = entry;
            }
            Ok(())
        })?;

        for action in scheduled {
            self.queue.enqueue(action);
        }
        Ok(())
    }
}
