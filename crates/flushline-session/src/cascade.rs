//! Cascade walker.
//!
//! [`UnitOfWork::cascade`] applies a [`CascadingAction`] to the entities
//! reachable from one entity through associations whose [`CascadeStyle`]
//! includes the action. The walk is depth-first and sequential: each cascaded
//! step is awaited before the next sibling starts. Every walk holds one level
//! of the context's cascade counter, and entities already walked for the same
//! action and point are skipped until the outermost walk returns.

use crate::context::{CollectionRef, EntityKey, LockMode};
use crate::entity::{EntityRef, QueuedOperation};
use crate::unit_of_work::{BoxOutcome, UnitOfWork};
use flushline_core::{
    CascadeStyle, CollectionMapping, Connection, Cx, EntityPersister, Error, Outcome,
    ToOneMapping, TransientReference, try_outcome,
};

/// Operation propagated across associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadingAction {
    /// Persist reached during flush; also removes orphans.
    PersistOnFlush,
    /// Verify no flushed entity references a transient one through an
    /// association that does not cascade persist.
    CheckOnFlush,
    Persist,
    /// Reattach.
    Update,
    Remove,
    Refresh,
    Lock(LockMode),
}

impl CascadingAction {
    /// Whether an association with `style` propagates this action.
    pub const fn applies(self, style: CascadeStyle) -> bool {
        match self {
            CascadingAction::PersistOnFlush
            | CascadingAction::Persist
            | CascadingAction::Update => style.persist,
            CascadingAction::CheckOnFlush => false,
            CascadingAction::Remove => style.remove,
            CascadingAction::Refresh => style.refresh,
            CascadingAction::Lock(_) => style.lock,
        }
    }

    /// Whether the action removes orphans of associations configured for it.
    pub const fn deletes_orphans(self) -> bool {
        matches!(self, CascadingAction::PersistOnFlush)
    }
}

/// Where in an operation the cascade runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadePoint {
    /// Before the parent is inserted, after it is deleted: to-one
    /// associations, whose targets must exist first.
    BeforeInsertAfterDelete,
    /// After the parent is inserted, before it is deleted: collections.
    AfterInsertBeforeDelete,
    AfterUpdate,
    BeforeFlush,
    BeforeRefresh,
    AfterLock,
}

impl CascadePoint {
    const fn includes_to_one(self) -> bool {
        !matches!(self, CascadePoint::AfterInsertBeforeDelete)
    }

    const fn includes_collections(self) -> bool {
        !matches!(self, CascadePoint::BeforeInsertAfterDelete)
    }
}

/// Index of `property` among the persister's state properties.
fn state_index(persister: &EntityPersister, property: &str) -> Option<usize> {
    persister.state_properties().position(|p| p.name() == property)
}

impl UnitOfWork {
    /// Cascade `action` from `entity` at `point`.
    pub(crate) fn cascade<'a, C: Connection>(
        &'a mut self,
        cx: &'a Cx,
        conn: &'a C,
        action: CascadingAction,
        point: CascadePoint,
        entity: &'a EntityRef,
    ) -> BoxOutcome<'a, ()> {
        Box::pin(async move {
            let persister = try_outcome!(result self.persister_for(entity));
            if action == CascadingAction::CheckOnFlush {
                try_outcome!(result self.check_transient_references(entity, &persister));
                return Outcome::Ok(());
            }

            let level = self.context.cascade_level_guard();
            if self.context.cascade_level() == 1 {
                self.visited.clear();
            }
            if !self.visited.insert((action, point, entity.clone())) {
                return Outcome::Ok(());
            }
            tracing::trace!(
                entity = ?entity,
                action = ?action,
                point = ?point,
                level = self.context.cascade_level(),
                "Cascading"
            );

            if point.includes_to_one() {
                for mapping in persister.to_one_associations() {
                    try_outcome!(self.cascade_to_one(cx, conn, action, entity, &persister, mapping).await);
                }
            }
            if point.includes_collections() {
                for mapping in persister.collections() {
                    try_outcome!(self.cascade_collection(cx, conn, action, entity, &persister, mapping).await);
                }
            }

            drop(level);
            if self.context.cascade_level() == 0 {
                self.visited.clear();
            }
            Outcome::Ok(())
        })
    }

    async fn cascade_to_one<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        action: CascadingAction,
        entity: &EntityRef,
        persister: &EntityPersister,
        mapping: &ToOneMapping,
    ) -> Outcome<(), Error> {
        let target = entity.entity(&mapping.name);

        if action.deletes_orphans() && mapping.orphan_removal {
            let loaded_id = state_index(persister, &mapping.name).and_then(|i| {
                self.context
                    .get_entry(entity)
                    .and_then(|e| e.loaded_state.as_ref())
                    .and_then(|state| state.get(i).cloned())
            });
            if let Some(loaded_id) = loaded_id.filter(|id| !id.is_null()) {
                let severed = target.as_ref().is_none_or(|t| !t.id().id_eq(&loaded_id));
                if severed {
                    let key = EntityKey::new(mapping.target.clone(), loaded_id);
                    if let Some(orphan) = self.context.get_entity(&key).cloned() {
                        tracing::debug!(entity = ?entity, orphan = ?orphan, property = %mapping.name, "Removing orphan");
                        try_outcome!(self.delete_entity(cx, conn, &orphan).await);
                    }
                }
            }
        }

        match target {
            Some(target) if action.applies(mapping.cascade) => {
                self.cascade_to(cx, conn, action, &target).await
            }
            _ => Outcome::Ok(()),
        }
    }

    async fn cascade_collection<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        action: CascadingAction,
        entity: &EntityRef,
        persister: &EntityPersister,
        mapping: &CollectionMapping,
    ) -> Outcome<(), Error> {
        if action.applies(mapping.cascade) {
            let uninitialized = entity
                .collection(&mapping.name)
                .is_some_and(|bag| !bag.is_initialized());
            if action == CascadingAction::Remove && uninitialized && self.context.contains(entity) {
                try_outcome!(self.initialize_collection(cx, conn, entity, &mapping.name).await);
            }

            let targets: Vec<EntityRef> = match entity.collection(&mapping.name) {
                Some(bag) if bag.is_initialized() => bag.elements().to_vec(),
                // Persisting through a lazy bag reaches the queued additions.
                Some(bag) if matches!(action, CascadingAction::Persist | CascadingAction::PersistOnFlush) => {
                    bag.queued_additions().cloned().collect()
                }
                _ => Vec::new(),
            };
            for target in &targets {
                try_outcome!(self.cascade_to(cx, conn, action, target).await);
            }
        }

        if action.deletes_orphans() && mapping.orphan_removal {
            for orphan in self.collection_orphans(entity, persister, mapping) {
                if self.contains(&orphan) {
                    tracing::debug!(entity = ?entity, orphan = ?orphan, property = %mapping.name, "Removing orphan");
                    try_outcome!(self.delete_entity(cx, conn, &orphan).await);
                }
            }
        }
        Outcome::Ok(())
    }

    /// Elements of the loaded snapshot that left the collection.
    fn collection_orphans(
        &self,
        entity: &EntityRef,
        persister: &EntityPersister,
        mapping: &CollectionMapping,
    ) -> Vec<EntityRef> {
        let collection = CollectionRef::new(entity.clone(), mapping.name.clone());
        let snapshot = self
            .context
            .get_collection_entry(&collection)
            .filter(|e| e.role == persister.role(&mapping.name))
            .and_then(|e| e.loaded_snapshot.clone())
            .unwrap_or_default();

        match entity.collection(&mapping.name) {
            None => snapshot,
            Some(bag) if bag.is_initialized() => snapshot
                .into_iter()
                .filter(|e| !bag.contains(e))
                .collect(),
            Some(bag) => bag
                .queued()
                .iter()
                .filter_map(|op| match op {
                    QueuedOperation::Remove(e) => Some(e.clone()),
                    QueuedOperation::Add(_) => None,
                })
                .collect(),
        }
    }

    /// Apply `action` to one reached entity.
    async fn cascade_to<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        action: CascadingAction,
        target: &EntityRef,
    ) -> Outcome<(), Error> {
        match action {
            CascadingAction::Persist | CascadingAction::PersistOnFlush => {
                self.persist_entity(cx, conn, target, action).await
            }
            CascadingAction::Update => {
                if self.context.contains(target) {
                    self.cascade(cx, conn, action, CascadePoint::AfterUpdate, target)
                        .await
                } else if target.id().is_null() {
                    self.persist_entity(cx, conn, target, CascadingAction::Persist)
                        .await
                } else {
                    self.update_entity(cx, conn, target).await
                }
            }
            CascadingAction::Remove => self.delete_entity(cx, conn, target).await,
            CascadingAction::Refresh if self.contains(target) => {
                self.refresh_entity(cx, conn, target).await
            }
            CascadingAction::Lock(mode) if self.contains(target) => {
                self.lock_entity(cx, conn, target, mode).await
            }
            CascadingAction::Refresh | CascadingAction::Lock(_) | CascadingAction::CheckOnFlush => {
                Outcome::Ok(())
            }
        }
    }

    /// Fail when `entity` references an unsaved transient instance through an
    /// association that does not cascade persist.
    fn check_transient_references(
        &self,
        entity: &EntityRef,
        persister: &EntityPersister,
    ) -> Result<(), Error> {
        let transient = |property: &str, target: &EntityRef| {
            if self.is_transient(target) {
                Err(Error::TransientObject(TransientReference {
                    entity: persister.name.clone(),
                    property: property.to_string(),
                    target: target.entity_name(),
                }))
            } else {
                Ok(())
            }
        };

        for mapping in persister.to_one_associations() {
            if mapping.cascade.persist {
                continue;
            }
            if let Some(target) = entity.entity(&mapping.name) {
                transient(&mapping.name, &target)?;
            }
        }
        for mapping in persister.collections() {
            if mapping.cascade.persist || mapping.inverse {
                continue;
            }
            if let Some(bag) = entity.collection(&mapping.name) {
                for target in bag.elements().iter().chain(bag.queued_additions()) {
                    transient(&mapping.name, target)?;
                }
            }
        }
        Ok(())
    }

    /// Not tracked and never assigned an id.
    fn is_transient(&self, entity: &EntityRef) -> bool {
        !self.context.contains(entity) && entity.id().is_null()
    }
}
