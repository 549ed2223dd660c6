//! Loading by id, refresh, lock and lazy collection initialization.
//!
//! Only primary-key selects are issued. A loaded entity's to-one targets are
//! resolved through the persistence context first and loaded by id otherwise;
//! its collections start as lazy bags.

use crate::action::current_state;
use crate::cascade::{CascadePoint, CascadingAction};
use crate::context::{CollectionEntry, CollectionRef, EntityKey, EntityStatus, LockMode};
use crate::entity::{Bag, EntityRef};
use crate::unit_of_work::{BoxOutcome, UnitOfWork};
use flushline_core::{
    Connection, Cx, EntityPersister, Error, Outcome, PropertyMapping, Row, Value, try_outcome,
};
use std::sync::Arc;

/// `select <id>, <state columns>[, <version>] from <table> where <column>=<p1>`.
pub(crate) fn select_by_column(
    persister: &EntityPersister,
    column: &str,
    placeholder: &str,
) -> String {
    let mut columns = vec![persister.id_column.as_str()];
    columns.extend(persister.state_columns());
    if let Some(version) = &persister.version_column {
        columns.push(version);
    }
    format!(
        "select {} from {} where {}={}",
        columns.join(", "),
        persister.table,
        column,
        placeholder
    )
}

/// Version held by a selected row.
pub(crate) fn row_version(persister: &EntityPersister, row: &Row) -> Option<i64> {
    persister
        .version_column
        .as_ref()
        .and_then(|column| row.get_by_name(column))
        .and_then(Value::as_i64)
}

impl UnitOfWork {
    /// Return the managed instance for `(entity_name, id)`, loading it when
    /// it is not tracked yet.
    ///
    /// An instance removed in this unit of work is reported as absent.
    #[tracing::instrument(level = "debug", skip(self, cx, conn))]
    pub(crate) async fn find<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        entity_name: &str,
        id: Value,
    ) -> Outcome<Option<EntityRef>, Error> {
        let persister = try_outcome!(result self.factory.metamodel().persister(entity_name));
        let key = EntityKey::new(persister.name.clone(), id.clone());
        if let Some(entity) = self.context.get_entity(&key).cloned() {
            let removed = self
                .context
                .get_entry(&entity)
                .is_some_and(|e| e.status.is_deleted_or_gone());
            return Outcome::Ok(if removed { None } else { Some(entity) });
        }
        self.load_entity(cx, conn, persister, id).await
    }

    async fn load_entity<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        persister: Arc<EntityPersister>,
        id: Value,
    ) -> Outcome<Option<EntityRef>, Error> {
        let placeholder = self.queue.dialect().placeholder(1);
        let sql = select_by_column(&persister, &persister.id_column, &placeholder);
        tracing::trace!(sql = %sql, id = %id, "Loading entity");
        let Some(row) = try_outcome!(conn.select_one(cx, &sql, &[id]).await) else {
            return Outcome::Ok(None);
        };
        let entity = try_outcome!(self.materialize(cx, conn, persister, &row).await);
        Outcome::Ok(Some(entity))
    }

    /// The managed instance for a selected row; an instance already tracked
    /// under the row's key wins over the row.
    async fn materialize<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        persister: Arc<EntityPersister>,
        row: &Row,
    ) -> Outcome<EntityRef, Error> {
        let id = row.value_or_null(&persister.id_column);
        let key = EntityKey::new(persister.name.clone(), id.clone());
        if let Some(existing) = self.context.get_entity(&key) {
            return Outcome::Ok(existing.clone());
        }

        let entity = EntityRef::new(persister.name.clone()).with_id(id.clone());
        let version = row_version(&persister, row);
        entity.set_version(version);
        // Tracked before hydration so references back to it resolve.
        try_outcome!(result self.context.add_entry(
            &entity,
            EntityStatus::Loading,
            None,
            id,
            version,
            LockMode::None,
            true,
            Arc::clone(&persister),
            false,
        ));
        let hydrated = self.hydrate(cx, conn, &entity, persister, row).await;
        if !matches!(hydrated, Outcome::Ok(())) {
            // A half-hydrated instance must not satisfy later lookups.
            self.context.remove_entry(&entity);
            tracing::debug!(entity = ?entity, "Discarded partially loaded entity");
        }
        try_outcome!(hydrated);
        self.context.set_status(&entity, EntityStatus::Managed);
        Outcome::Ok(entity)
    }

    /// Copy a selected row into `entity` and take it as the loaded state.
    fn hydrate<'a, C: Connection>(
        &'a mut self,
        cx: &'a Cx,
        conn: &'a C,
        entity: &'a EntityRef,
        persister: Arc<EntityPersister>,
        row: &'a Row,
    ) -> BoxOutcome<'a, ()> {
        Box::pin(async move {
            let key = EntityKey::new(persister.name.clone(), entity.id());
            for property in &persister.properties {
                match property {
                    PropertyMapping::Basic { name, column } => {
                        let value = row.value_or_null(column);
                        entity.set(name, value);
                    }
                    PropertyMapping::ToOne(mapping) => {
                        let fk = row.value_or_null(&mapping.column);
                        if fk.is_null() {
                            entity.set_entity(&mapping.name, None);
                            continue;
                        }
                        let target_key = EntityKey::new(mapping.target.clone(), fk.clone());
                        let target = match self.context.get_entity(&target_key).cloned() {
                            Some(target) => Some(target),
                            None => {
                                let target_persister = try_outcome!(result self
                                    .factory
                                    .metamodel()
                                    .persister(&mapping.target));
                                try_outcome!(self.load_entity(cx, conn, target_persister, fk.clone()).await)
                            }
                        };
                        if target.is_none() {
                            tracing::warn!(
                                entity = ?entity,
                                property = %mapping.name,
                                target = %target_key,
                                "Referenced row not found"
                            );
                        }
                        entity.set_entity(&mapping.name, target);
                    }
                    PropertyMapping::Collection(mapping) => {
                        let collection = CollectionRef::new(entity.clone(), mapping.name.clone());
                        entity.set_collection(&mapping.name, Some(Bag::lazy()));
                        self.context.add_collection_entry(
                            collection.clone(),
                            CollectionEntry::loaded(
                                persister.role(&mapping.name),
                                Arc::clone(&persister),
                                key.clone(),
                                None,
                            ),
                        );
                        self.context.add_batch_loadable_collection(collection);
                    }
                }
            }

            let version = row_version(&persister, row);
            entity.set_version(version);
            let state = current_state(entity, &persister);
            if let Some(entry) = self.context.get_entry_mut(entity) {
                entry.loaded_state = Some(state);
                entry.version = version;
            }
            Outcome::Ok(())
        })
    }

    /// Re-read the state of a managed entity, cascading first.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = ?entity))]
    pub(crate) async fn refresh_entity<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        entity: &EntityRef,
    ) -> Outcome<(), Error> {
        let Some(entry) = self.context.get_entry(entity).cloned() else {
            return Outcome::Err(Error::Custom(format!(
                "entity not managed by this session: {entity:?}"
            )));
        };
        if entry.status.is_deleted_or_gone() {
            return Outcome::Err(Error::Custom(format!(
                "cannot refresh a removed entity: {entity:?}"
            )));
        }

        try_outcome!(
            self.cascade(cx, conn, CascadingAction::Refresh, CascadePoint::BeforeRefresh, entity)
                .await
        );

        let persister = entry.persister;
        let placeholder = self.queue.dialect().placeholder(1);
        let sql = select_by_column(&persister, &persister.id_column, &placeholder);
        tracing::trace!(sql = %sql, "Refreshing entity");
        let row = try_outcome!(conn.select_one(cx, &sql, &[entry.id.clone()]).await);
        let Some(row) = row else {
            self.evict(entity);
            return Outcome::Err(Error::ObjectNotFound(Error::identity(
                persister.name.clone(),
                &entry.id,
            )));
        };
        self.hydrate(cx, conn, entity, persister, &row).await
    }

    /// Obtain `mode` on a managed entity. Locks are only ever upgraded.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = ?entity, mode = ?mode))]
    pub(crate) async fn lock_entity<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        entity: &EntityRef,
        mode: LockMode,
    ) -> Outcome<(), Error> {
        let Some(entry) = self.context.get_entry(entity).cloned() else {
            return Outcome::Err(Error::Custom(format!(
                "entity not managed by this session: {entity:?}"
            )));
        };
        if entry.status.is_deleted_or_gone() {
            return Outcome::Err(Error::Custom(format!(
                "cannot lock a removed entity: {entity:?}"
            )));
        }

        if mode > entry.lock_mode {
            let persister = &entry.persister;
            let dialect = self.queue.dialect();
            match mode {
                LockMode::None => {}
                LockMode::Read | LockMode::PessimisticWrite => {
                    let column = persister
                        .version_column
                        .as_deref()
                        .unwrap_or(persister.id_column.as_str());
                    let sql = if mode == LockMode::Read {
                        format!(
                            "select {} from {} where {}={}",
                            column,
                            persister.table,
                            persister.id_column,
                            dialect.placeholder(1)
                        )
                    } else {
                        format!(
                            "select tbl.{} from {} tbl{} where tbl.{}={}{}",
                            column,
                            persister.table,
                            dialect.write_lock_table_hint(),
                            persister.id_column,
                            dialect.placeholder(1),
                            dialect.write_lock_suffix("tbl", column)
                        )
                    };
                    tracing::trace!(sql = %sql, "Locking entity");
                    let row = try_outcome!(conn.select_one(cx, &sql, &[entry.id.clone()]).await);
                    let Some(row) = row else {
                        return Outcome::Err(Error::ObjectNotFound(Error::identity(
                            persister.name.clone(),
                            &entry.id,
                        )));
                    };
                    if persister.is_versioned() {
                        let current = row_version(persister, &row);
                        if current != entry.version {
                            return Outcome::Err(Error::StaleState(Error::identity(
                                persister.name.clone(),
                                &entry.id,
                            )));
                        }
                    }
                }
                LockMode::ForceIncrement => {
                    if !persister.is_versioned() {
                        return Outcome::Err(Error::Custom(format!(
                            "force increment lock requires a versioned entity: {}",
                            persister.name
                        )));
                    }
                }
            }
            if let Some(entry) = self.context.get_entry_mut(entity) {
                entry.lock_mode = mode;
            }
        }

        self.cascade(cx, conn, CascadingAction::Lock(mode), CascadePoint::AfterLock, entity)
            .await
    }

    /// Load the elements of a lazy collection.
    ///
    /// Owning collections are read from their join table; inverse ones by the
    /// element's foreign key to the owner. Operations queued on the lazy bag
    /// are replayed on top of the loaded elements, so they show up as changes
    /// at the next flush.
    #[tracing::instrument(level = "debug", skip_all, fields(owner = ?owner, property))]
    pub(crate) async fn initialize_collection<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        owner: &EntityRef,
        property: &str,
    ) -> Outcome<(), Error> {
        let owner_persister = try_outcome!(result self.persister_for(owner));
        let Some(PropertyMapping::Collection(mapping)) = owner_persister.property(property).cloned()
        else {
            return Outcome::Err(Error::Mapping(format!(
                "{} has no collection {}",
                owner_persister.name, property
            )));
        };
        if owner.collection(property).is_none_or(|bag| bag.is_initialized()) {
            return Outcome::Ok(());
        }

        let owner_id = owner.id();
        let element_persister = try_outcome!(result self.factory.metamodel().persister(&mapping.element));
        let placeholder = self.queue.dialect().placeholder(1);
        let mut loaded = Vec::new();
        if mapping.inverse {
            let Some(owning) = element_persister.inverse_owner(&owner_persister.name, &mapping) else {
                return Outcome::Err(Error::Mapping(format!(
                    "{} has no owning to-one for {}",
                    element_persister.name,
                    owner_persister.role(property)
                )));
            };
            let sql = select_by_column(&element_persister, &owning.column, &placeholder);
            tracing::trace!(sql = %sql, "Initializing inverse collection");
            let rows = try_outcome!(conn.select(cx, &sql, &[owner_id]).await);
            for row in &rows {
                let element = try_outcome!(
                    self.materialize(cx, conn, Arc::clone(&element_persister), row)
                        .await
                );
                if self.contains(&element) {
                    loaded.push(element);
                }
            }
        } else {
            let sql = format!(
                "select {} from {} where {}={}",
                mapping.element_column, mapping.table, mapping.key_column, placeholder
            );
            tracing::trace!(sql = %sql, "Initializing collection");
            let rows = try_outcome!(conn.select(cx, &sql, &[owner_id]).await);
            for row in &rows {
                let Some(element_id) = row.get_by_name(&mapping.element_column).cloned() else {
                    continue;
                };
                if let Some(element) = try_outcome!(
                    self.find(cx, conn, &element_persister.name, element_id)
                        .await
                ) {
                    loaded.push(element);
                }
            }
        }

        owner.update_collection(property, |bag| bag.initialize(loaded.clone()));
        let collection = CollectionRef::new(owner.clone(), property);
        match self.context.get_collection_entry_mut(&collection) {
            Some(entry) => entry.loaded_snapshot = Some(loaded),
            None => {
                if let Some(key) = self.context.get_entry(owner).and_then(|e| e.key()) {
                    self.context.add_collection_entry(
                        collection.clone(),
                        CollectionEntry::loaded(
                            owner_persister.role(property),
                            Arc::clone(&owner_persister),
                            key,
                            Some(loaded),
                        ),
                    );
                }
            }
        }
        self.context.remove_batch_loadable_collection(&collection);
        tracing::debug!(role = %owner_persister.role(property), "Collection initialized");
        Outcome::Ok(())
    }
}
