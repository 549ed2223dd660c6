//! Stateless session.
//!
//! A `StatelessSession` has no persistence context, no action queue and no
//! cascades. Every operation issues its statements immediately. To-one
//! associations of loaded entities are id-only stubs and collections are
//! never loaded; owning collections that are present on an entity are
//! written with it.

use crate::action::{
    check_single_row, current_state, delete_statement, execute_rows, insert_statement,
    join_row_insert, join_rows_delete_all, update_statement,
};
use crate::entity::EntityRef;
use crate::factory::SessionFactory;
use crate::loader::{row_version, select_by_column};
use flushline_core::{
    Connection, Cx, Dialect, EntityPersister, Error, IdGeneration, Outcome, PropertyMapping,
    Result, Row, TransientReference, Value, try_outcome,
};
use std::sync::Arc;

/// One rendered statement and the entity row it must touch.
struct Pending {
    persister: Arc<EntityPersister>,
    id: Value,
    sql: String,
    params: Vec<Value>,
}

/// Session issuing one statement per operation.
pub struct StatelessSession<C: Connection> {
    connection: C,
    factory: SessionFactory,
    dialect: Dialect,
    batch_size: usize,
    in_transaction: bool,
    rollback_only: bool,
}

impl<C: Connection> std::fmt::Debug for StatelessSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatelessSession")
            .field("dialect", &self.dialect)
            .field("batch_size", &self.batch_size)
            .field("in_transaction", &self.in_transaction)
            .field("rollback_only", &self.rollback_only)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> StatelessSession<C> {
    pub fn new(factory: SessionFactory, connection: C) -> Self {
        let dialect = connection.dialect();
        let batch_size = factory.config().batch_size;
        Self {
            connection,
            factory,
            dialect,
            batch_size,
            in_transaction: false,
            rollback_only: false,
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn persister(&self, entity_name: &str) -> Result<Arc<EntityPersister>> {
        self.factory.metamodel().persister(entity_name)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read one entity by id.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn get(
        &self,
        cx: &Cx,
        entity_name: &str,
        id: Value,
    ) -> Outcome<Option<EntityRef>, Error> {
        let persister = try_outcome!(result self.persister(entity_name));
        let Some(row) = try_outcome!(self.select_row(cx, &persister, id).await) else {
            return Outcome::Ok(None);
        };
        let entity = EntityRef::new(persister.name.clone());
        populate(&entity, &persister, &row);
        Outcome::Ok(Some(entity))
    }

    /// Read several entities by id; missing rows are skipped.
    pub async fn get_all(
        &self,
        cx: &Cx,
        entity_name: &str,
        ids: &[Value],
    ) -> Outcome<Vec<EntityRef>, Error> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = try_outcome!(self.get(cx, entity_name, id.clone()).await) {
                found.push(entity);
            }
        }
        Outcome::Ok(found)
    }

    /// Overwrite `entity`'s state with its row.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = ?entity))]
    pub async fn refresh(&self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        let persister = try_outcome!(result self.persister(&entity.entity_name()));
        let id = entity.id();
        let Some(row) = try_outcome!(self.select_row(cx, &persister, id.clone()).await) else {
            return Outcome::Err(Error::ObjectNotFound(Error::identity(
                persister.name.clone(),
                &id,
            )));
        };
        populate(entity, &persister, &row);
        Outcome::Ok(())
    }

    /// Refresh each entity in turn.
    pub async fn refresh_all(&self, cx: &Cx, entities: &[EntityRef]) -> Outcome<(), Error> {
        for entity in entities {
            try_outcome!(self.refresh(cx, entity).await);
        }
        Outcome::Ok(())
    }

    async fn select_row(
        &self,
        cx: &Cx,
        persister: &EntityPersister,
        id: Value,
    ) -> Outcome<Option<Row>, Error> {
        let sql = select_by_column(persister, &persister.id_column, &self.dialect.placeholder(1));
        tracing::trace!(sql = %sql, id = %id, "Selecting row");
        self.connection.select_one(cx, &sql, &[id]).await
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert one entity, generating its id first.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = ?entity))]
    pub async fn insert(&self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        let persister = try_outcome!(result self.persister(&entity.entity_name()));
        if let Some(pending) = try_outcome!(self.prepare_insert(cx, entity, &persister).await) {
            tracing::trace!(sql = %pending.sql, "Inserting");
            let count = try_outcome!(self.connection.update(cx, &pending.sql, &pending.params).await);
            try_outcome!(result check_single_row(&pending.persister, &pending.id, count));
        }
        self.write_collections(cx, entity, &persister, false).await
    }

    /// Insert several entities with the configured batch size.
    pub async fn insert_all(&self, cx: &Cx, entities: &[EntityRef]) -> Outcome<(), Error> {
        self.insert_batch(cx, self.batch_size, entities).await
    }

    /// Insert several entities, `batch_size` statements per round trip.
    ///
    /// Identity inserts cannot be batched and run one at a time.
    pub async fn insert_batch(
        &self,
        cx: &Cx,
        batch_size: usize,
        entities: &[EntityRef],
    ) -> Outcome<(), Error> {
        let mut pending = Vec::with_capacity(entities.len());
        for entity in entities {
            let persister = try_outcome!(result self.persister(&entity.entity_name()));
            if let Some(statement) = try_outcome!(self.prepare_insert(cx, entity, &persister).await) {
                pending.push(statement);
            }
        }
        try_outcome!(self.run_batched(cx, batch_size, pending).await);
        for entity in entities {
            let persister = try_outcome!(result self.persister(&entity.entity_name()));
            try_outcome!(self.write_collections(cx, entity, &persister, false).await);
        }
        Outcome::Ok(())
    }

    /// Assign `entity`'s id and render its insert.
    ///
    /// Identity inserts are executed right here, since the id only exists
    /// once the row does; `None` is returned for them.
    async fn prepare_insert(
        &self,
        cx: &Cx,
        entity: &EntityRef,
        persister: &Arc<EntityPersister>,
    ) -> Outcome<Option<Pending>, Error> {
        match &persister.id_generation {
            IdGeneration::Assigned => {
                if entity.id().is_null() {
                    return Outcome::Err(Error::IdentifierGeneration(format!(
                        "Identifier of entity '{}' must be manually assigned before calling 'insert()'",
                        persister.name
                    )));
                }
            }
            IdGeneration::Table(_) => {
                let Some(generator) = self.factory.generator(&persister.name) else {
                    return Outcome::Err(Error::Mapping(format!(
                        "no identifier generator registered for {}",
                        persister.name
                    )));
                };
                let raw = try_outcome!(generator.generate(cx, &self.connection).await);
                let id = try_outcome!(result persister.id_type.coerce(raw));
                entity.set_id(id);
            }
            IdGeneration::Identity => {
                let statement = insert_statement(self.dialect, persister, entity, true);
                tracing::trace!(sql = %statement.sql, "Inserting with identity column");
                let raw = try_outcome!(
                    self.connection
                        .insert(cx, &statement.sql, &statement.params)
                        .await
                );
                let id = try_outcome!(result persister.id_type.coerce(raw));
                entity.set_id(id);
                entity.set_version(statement.version);
                return Outcome::Ok(None);
            }
        }

        let statement = insert_statement(self.dialect, persister, entity, false);
        entity.set_version(statement.version);
        Outcome::Ok(Some(Pending {
            persister: Arc::clone(persister),
            id: entity.id(),
            sql: statement.sql,
            params: statement.params,
        }))
    }

    /// Write every column of one entity, bumping its version.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = ?entity))]
    pub async fn update(&self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        self.update_batch(cx, 1, std::slice::from_ref(entity)).await
    }

    pub async fn update_all(&self, cx: &Cx, entities: &[EntityRef]) -> Outcome<(), Error> {
        self.update_batch(cx, self.batch_size, entities).await
    }

    /// Update several entities, `batch_size` statements per round trip.
    pub async fn update_batch(
        &self,
        cx: &Cx,
        batch_size: usize,
        entities: &[EntityRef],
    ) -> Outcome<(), Error> {
        let mut pending = Vec::with_capacity(entities.len());
        let mut versions = Vec::with_capacity(entities.len());
        for entity in entities {
            let persister = try_outcome!(result self.persister(&entity.entity_name()));
            let id = entity.id();
            let state = current_state(entity, &persister);
            let dirty: Vec<usize> = (0..state.len()).collect();
            let previous = entity.version();
            let next = persister
                .is_versioned()
                .then(|| previous.unwrap_or(0) + 1);
            if let Some((sql, params)) =
                update_statement(self.dialect, &persister, &id, &state, &dirty, previous, next)
            {
                pending.push(Pending {
                    persister,
                    id,
                    sql,
                    params,
                });
                versions.push((entity, next));
            }
        }
        try_outcome!(self.run_batched(cx, batch_size, pending).await);
        for (entity, next) in versions {
            entity.set_version(next);
        }
        for entity in entities {
            let persister = try_outcome!(result self.persister(&entity.entity_name()));
            try_outcome!(self.write_collections(cx, entity, &persister, true).await);
        }
        Outcome::Ok(())
    }

    /// Delete one entity, its join-table rows first.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = ?entity))]
    pub async fn delete(&self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        self.delete_batch(cx, 1, std::slice::from_ref(entity)).await
    }

    pub async fn delete_all(&self, cx: &Cx, entities: &[EntityRef]) -> Outcome<(), Error> {
        self.delete_batch(cx, self.batch_size, entities).await
    }

    /// Delete several entities, `batch_size` statements per round trip.
    pub async fn delete_batch(
        &self,
        cx: &Cx,
        batch_size: usize,
        entities: &[EntityRef],
    ) -> Outcome<(), Error> {
        let mut join_rows = Vec::new();
        let mut pending = Vec::with_capacity(entities.len());
        for entity in entities {
            let persister = try_outcome!(result self.persister(&entity.entity_name()));
            let id = entity.id();
            for mapping in persister.collections().filter(|m| !m.inverse) {
                join_rows.push(join_rows_delete_all(self.dialect, mapping, &id));
            }
            let (sql, params) = delete_statement(self.dialect, &persister, &id, entity.version());
            pending.push(Pending {
                persister,
                id,
                sql,
                params,
            });
        }
        try_outcome!(execute_rows(cx, &self.connection, join_rows, batch_size, false).await);
        self.run_batched(cx, batch_size, pending).await
    }

    /// Execute statements in chunks; each must touch exactly one row.
    async fn run_batched(
        &self,
        cx: &Cx,
        batch_size: usize,
        pending: Vec<Pending>,
    ) -> Outcome<(), Error> {
        for chunk in pending.chunks(batch_size.max(1)) {
            let statements: Vec<(String, Vec<Value>)> = chunk
                .iter()
                .map(|p| (p.sql.clone(), p.params.clone()))
                .collect();
            tracing::trace!(statements = statements.len(), sql = %statements[0].0, "Executing batch");
            let counts = try_outcome!(self.connection.batch(cx, &statements).await);
            for (statement, count) in chunk.iter().zip(counts) {
                try_outcome!(result check_single_row(&statement.persister, &statement.id, count));
            }
        }
        Outcome::Ok(())
    }

    /// Write the join-table rows of `entity`'s owning collections, clearing
    /// the old rows first when `replace` is set.
    async fn write_collections(
        &self,
        cx: &Cx,
        entity: &EntityRef,
        persister: &EntityPersister,
        replace: bool,
    ) -> Outcome<(), Error> {
        let owner_id = entity.id();
        let mut rows = Vec::new();
        for mapping in persister.collections().filter(|m| !m.inverse) {
            let Some(bag) = entity.collection(&mapping.name) else {
                continue;
            };
            if !bag.is_initialized() {
                continue;
            }
            if replace {
                rows.push(join_rows_delete_all(self.dialect, mapping, &owner_id));
            }
            for element in bag.elements() {
                let element_id = element.id();
                if element_id.is_null() {
                    return Outcome::Err(Error::TransientObject(TransientReference {
                        entity: persister.name.clone(),
                        property: mapping.name.clone(),
                        target: element.entity_name(),
                    }));
                }
                rows.push(join_row_insert(self.dialect, mapping, &owner_id, &element_id));
            }
        }
        if rows.is_empty() {
            return Outcome::Ok(());
        }
        execute_rows(cx, &self.connection, rows, self.batch_size, false).await
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            return Outcome::Ok(());
        }
        try_outcome!(self.connection.begin(cx).await);
        self.in_transaction = true;
        self.rollback_only = false;
        Outcome::Ok(())
    }

    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.in_transaction {
            return Outcome::Ok(());
        }
        self.in_transaction = false;
        self.connection.commit(cx).await
    }

    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.in_transaction {
            return Outcome::Ok(());
        }
        self.in_transaction = false;
        self.rollback_only = false;
        self.connection.rollback(cx).await
    }

    /// Make the enclosing [`with_transaction`](Self::with_transaction) roll
    /// back instead of committing.
    pub fn mark_for_rollback(&mut self) {
        self.rollback_only = true;
    }

    pub fn is_marked_for_rollback(&self) -> bool {
        self.rollback_only
    }

    /// Run `work` in a transaction.
    ///
    /// The transaction commits when `work` succeeds and rolls back when it
    /// fails, is cancelled or panics, or when it called
    /// [`mark_for_rollback`](Self::mark_for_rollback). Inside an existing
    /// transaction `work` just runs in it.
    pub async fn with_transaction<T, F>(&mut self, cx: &Cx, work: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Self) -> Outcome<T, Error>,
    {
        if self.in_transaction {
            return work(&mut *self).await;
        }

        try_outcome!(self.begin(cx).await);
        let outcome = work(&mut *self).await;
        match outcome {
            Outcome::Ok(value) => {
                if self.rollback_only {
                    tracing::debug!("Transaction marked for rollback");
                    try_outcome!(self.rollback(cx).await);
                } else {
                    try_outcome!(self.commit(cx).await);
                }
                Outcome::Ok(value)
            }
            other => {
                tracing::warn!("Rolling back failed transaction");
                if let Outcome::Err(e) = self.rollback(cx).await {
                    tracing::warn!(error = %e, "Rollback failed");
                }
                other
            }
        }
    }
}

/// Copy a selected row into `entity`.
///
/// To-one associations become id-only stubs; collections are left alone.
fn populate(entity: &EntityRef, persister: &EntityPersister, row: &Row) {
    let id = row.value_or_null(&persister.id_column);
    entity.set_id(id);
    for property in &persister.properties {
        match property {
            PropertyMapping::Basic { name, column } => {
                entity.set(name, row.value_or_null(column));
            }
            PropertyMapping::ToOne(mapping) => {
                let target = row
                    .get_by_name(&mapping.column)
                    .filter(|fk| !fk.is_null())
                    .map(|fk| EntityRef::new(mapping.target.clone()).with_id(fk.clone()));
                entity.set_entity(&mapping.name, target);
            }
            PropertyMapping::Collection(_) => {}
        }
    }
    entity.set_version(row_version(persister, row));
}
