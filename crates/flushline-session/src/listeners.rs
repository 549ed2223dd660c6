//! Persist, remove and reattach listeners.
//!
//! These decide what a session operation means for one entity given its
//! tracked status, schedule the matching action and cascade to the
//! associated entities at the right points around it.

use crate::action::{Action, EntityDeleteAction, EntityInsertAction};
use crate::cascade::{CascadePoint, CascadingAction};
use crate::context::{CollectionEntry, CollectionRef, EntityKey, EntityStatus, LockMode};
use crate::entity::EntityRef;
use crate::unit_of_work::UnitOfWork;
use flushline_core::{
    Connection, Cx, EntityPersister, Error, IdGeneration, Outcome, Value, try_outcome,
};
use std::sync::Arc;

impl UnitOfWork {
    /// Make `entity` persistent, or cascade from it when it already is.
    ///
    /// `action` is [`CascadingAction::Persist`] for application calls and
    /// [`CascadingAction::PersistOnFlush`] when reached during a flush.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = ?entity))]
    pub(crate) async fn persist_entity<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        entity: &EntityRef,
        action: CascadingAction,
    ) -> Outcome<(), Error> {
        let persister = try_outcome!(result self.persister_for(entity));

        match self.context.get_entry(entity).map(|e| e.status) {
            Some(EntityStatus::Saving) => Outcome::Ok(()),
            Some(EntityStatus::Deleted) => {
                tracing::debug!("Un-scheduling removal of persisted entity");
                self.queue.unschedule_delete(entity);
                self.context.set_status(entity, EntityStatus::Managed);
                self.just_cascade(cx, conn, entity, action).await
            }
            Some(EntityStatus::Gone) => Outcome::Err(Error::Custom(format!(
                "deleted entity passed to persist: {}",
                persister.name
            ))),
            Some(EntityStatus::Managed | EntityStatus::ReadOnly | EntityStatus::Loading) => {
                self.just_cascade(cx, conn, entity, action).await
            }
            None => {
                if !entity.id().is_null() && persister.id_generation != IdGeneration::Assigned {
                    return Outcome::Err(Error::Custom(format!(
                        "detached entity passed to persist: {}",
                        persister.name
                    )));
                }
                self.save_with_generated_id(cx, conn, entity, persister, action)
                    .await
            }
        }
    }

    async fn just_cascade<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        entity: &EntityRef,
        action: CascadingAction,
    ) -> Outcome<(), Error> {
        try_outcome!(
            self.cascade(cx, conn, action, CascadePoint::BeforeInsertAfterDelete, entity)
                .await
        );
        self.cascade(cx, conn, action, CascadePoint::AfterInsertBeforeDelete, entity)
            .await
    }

    async fn save_with_generated_id<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        entity: &EntityRef,
        persister: Arc<EntityPersister>,
        action: CascadingAction,
    ) -> Outcome<(), Error> {
        let (id, identity) = match &persister.id_generation {
            IdGeneration::Assigned => {
                let id = entity.id();
                if id.is_null() {
                    return Outcome::Err(Error::IdentifierGeneration(format!(
                        "Identifier of entity '{}' must be manually assigned before calling 'persist()'",
                        persister.name
                    )));
                }
                (id, false)
            }
            IdGeneration::Table(_) => {
                let Some(generator) = self.factory.generator(&persister.name).cloned() else {
                    return Outcome::Err(Error::Mapping(format!(
                        "no identifier generator registered for {}",
                        persister.name
                    )));
                };
                let raw = try_outcome!(generator.generate(cx, conn).await);
                let id = try_outcome!(result persister.id_type.coerce(raw));
                if id.is_null() {
                    return Outcome::Err(Error::IdentifierGeneration(format!(
                        "null id generated for: {}",
                        persister.name
                    )));
                }
                tracing::debug!(id = %id, "Generated identifier");
                entity.set_id(id.clone());
                (id, false)
            }
            IdGeneration::Identity => (Value::Null, true),
        };
        self.perform_save(cx, conn, entity, persister, id, identity, action)
            .await
    }

    async fn perform_save<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        entity: &EntityRef,
        persister: Arc<EntityPersister>,
        id: Value,
        identity: bool,
        action: CascadingAction,
    ) -> Outcome<(), Error> {
        if !id.is_null() {
            let key = EntityKey::new(persister.name.clone(), id.clone());
            if let Some(old) = self.context.get_entry_by_key(&key) {
                if old.status == EntityStatus::Deleted {
                    tracing::debug!(key = %key, "Flushing pending removal before re-insert");
                    try_outcome!(self.force_flush(cx, conn).await);
                } else if !old.status.is_deleted_or_gone() {
                    return Outcome::Err(Error::NonUniqueObject(Error::identity(
                        persister.name.clone(),
                        &id,
                    )));
                }
            }
        }

        try_outcome!(result self.context.add_entry(
            entity,
            EntityStatus::Saving,
            None,
            id.clone(),
            entity.version(),
            LockMode::None,
            false,
            Arc::clone(&persister),
            false,
        ));

        try_outcome!(
            self.cascade(cx, conn, action, CascadePoint::BeforeInsertAfterDelete, entity)
                .await
        );

        if persister.is_versioned() && entity.version().is_none() {
            entity.set_version(Some(0));
            if let Some(entry) = self.context.get_entry_mut(entity) {
                entry.version = Some(0);
            }
        }

        let delayed = identity && !self.in_transaction && !self.config.immediate_identity_access;
        let insert = EntityInsertAction {
            entity: entity.clone(),
            persister,
            id,
            identity,
            delayed,
        };
        try_outcome!(
            self.queue
                .add_action(cx, conn, &mut self.context, Action::Insert(insert))
                .await
        );
        if self.context.get_entry(entity).map(|e| e.status) == Some(EntityStatus::Saving) {
            self.context.set_status(entity, EntityStatus::Managed);
        }

        self.cascade(cx, conn, action, CascadePoint::AfterInsertBeforeDelete, entity)
            .await
    }

    /// Flush in the middle of another operation.
    pub(crate) async fn force_flush<C: Connection>(&mut self, cx: &Cx, conn: &C) -> Outcome<(), Error> {
        if self.context.cascade_level() > 0 {
            return Outcome::Err(Error::Custom(
                "deleted object would be re-saved by cascade (remove deleted object from associations)"
                    .to_string(),
            ));
        }
        try_outcome!(self.flush(cx, conn).await);
        Outcome::Ok(())
    }

    /// Schedule the removal of `entity`.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = ?entity))]
    pub(crate) async fn delete_entity<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        entity: &EntityRef,
    ) -> Outcome<(), Error> {
        let persister = try_outcome!(result self.persister_for(entity));
        let Some(entry) = self.context.get_entry(entity).cloned() else {
            if entity.id().is_null() {
                // Transient: nothing to delete, but its associations may be.
                return self.just_cascade(cx, conn, entity, CascadingAction::Remove).await;
            }
            return Outcome::Err(Error::Custom(format!(
                "removing a detached instance {}#{}",
                persister.name,
                entity.id()
            )));
        };

        if entry.status.is_deleted_or_gone() {
            return Outcome::Ok(());
        }

        if self.queue.has_insert_for(entity) || entry.status == EntityStatus::Saving {
            tracing::debug!("Removing entity whose insert is still pending");
            self.queue.unschedule_insert(entity);
            self.context.set_status(entity, EntityStatus::Deleted);
            try_outcome!(self.just_cascade(cx, conn, entity, CascadingAction::Remove).await);
            self.context.remove_entry(entity);
            self.queue.unschedule_all(entity);
            return Outcome::Ok(());
        }

        self.context.set_status(entity, EntityStatus::Deleted);
        try_outcome!(
            self.cascade(
                cx,
                conn,
                CascadingAction::Remove,
                CascadePoint::AfterInsertBeforeDelete,
                entity
            )
            .await
        );

        self.queue.enqueue(Action::Delete(EntityDeleteAction {
            entity: entity.clone(),
            persister,
            id: entry.id.clone(),
            version: entry.version,
        }));

        self.cascade(
            cx,
            conn,
            CascadingAction::Remove,
            CascadePoint::BeforeInsertAfterDelete,
            entity,
        )
        .await
    }

    /// Reattach a detached instance as managed.
    ///
    /// The database state is unknown, so the next flush writes every column
    /// and recreates every initialized collection.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = ?entity))]
    pub(crate) async fn update_entity<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        entity: &EntityRef,
    ) -> Outcome<(), Error> {
        let persister = try_outcome!(result self.persister_for(entity));
        match self.context.get_entry(entity).map(|e| e.status) {
            Some(status) if status.is_deleted_or_gone() => {
                return Outcome::Err(Error::Custom(format!(
                    "deleted instance passed to update: {entity:?}"
                )));
            }
            Some(_) => {}
            None => {
                let id = entity.id();
                if id.is_null() {
                    return Outcome::Err(Error::Custom(format!(
                        "the given object has a null identifier: {}",
                        persister.name
                    )));
                }
                try_outcome!(result self.context.add_entry(
                    entity,
                    EntityStatus::Managed,
                    None,
                    id.clone(),
                    entity.version(),
                    LockMode::None,
                    true,
                    Arc::clone(&persister),
                    false,
                ));
                let key = EntityKey::new(persister.name.clone(), id);
                for mapping in persister.collections() {
                    if entity.collection(&mapping.name).is_some() {
                        self.context.add_collection_entry(
                            CollectionRef::new(entity.clone(), mapping.name.clone()),
                            CollectionEntry::loaded(
                                persister.role(&mapping.name),
                                Arc::clone(&persister),
                                key.clone(),
                                None,
                            ),
                        );
                    }
                }
                tracing::debug!("Reattached");
            }
        }
        self.cascade(cx, conn, CascadingAction::Update, CascadePoint::AfterUpdate, entity)
            .await
    }
}
