//! Scheduled database work.
//!
//! An [`Action`] is one unit of work decided during persist/remove or flush
//! preparation. Dispatch is a `match` on the variant. Entity state is read
//! from the live instance when the action executes, not when it is
//! scheduled, so foreign keys to rows inserted earlier in the same flush
//! carry their generated ids.

use crate::context::{CollectionRef, EntityKey, EntityStatus, LockMode, PersistenceContext};
use crate::entity::{EntityRef, QueuedOperation};
use flushline_core::{
    CollectionMapping, Connection, Cx, Dialect, EntityPersister, Error, Outcome, PropertyMapping,
    RowCountError, Value, try_outcome,
};
use std::sync::Arc;

/// Action kinds, in pipeline execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionKind {
    Insert,
    Update,
    QueuedOperation,
    CollectionRemove,
    CollectionUpdate,
    CollectionRecreate,
    Delete,
}

impl ActionKind {
    /// Execution order of the action kinds within a flush.
    pub const PIPELINE: [ActionKind; 7] = [
        ActionKind::Insert,
        ActionKind::Update,
        ActionKind::QueuedOperation,
        ActionKind::CollectionRemove,
        ActionKind::CollectionUpdate,
        ActionKind::CollectionRecreate,
        ActionKind::Delete,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ActionKind::Insert => "insert",
            ActionKind::Update => "update",
            ActionKind::QueuedOperation => "queued_operation",
            ActionKind::CollectionRemove => "collection_remove",
            ActionKind::CollectionUpdate => "collection_update",
            ActionKind::CollectionRecreate => "collection_recreate",
            ActionKind::Delete => "delete",
        }
    }
}

/// Current column state of `entity`, in state-property order.
///
/// To-one associations contribute the target's id.
pub fn current_state(entity: &EntityRef, persister: &EntityPersister) -> Vec<Value> {
    persister
        .state_properties()
        .map(|property| match property {
            PropertyMapping::Basic { name, .. } => entity.get(name).unwrap_or(Value::Null),
            PropertyMapping::ToOne(m) => entity
                .entity(&m.name)
                .map_or(Value::Null, |target| target.id()),
            PropertyMapping::Collection(_) => Value::Null,
        })
        .collect()
}

/// Insert the entity's row.
#[derive(Debug, Clone)]
pub struct EntityInsertAction {
    pub entity: EntityRef,
    pub persister: Arc<EntityPersister>,
    /// Null until the database assigns it for identity inserts.
    pub id: Value,
    pub identity: bool,
    /// Identity insert held back until the next flush.
    pub delayed: bool,
}

/// Update the entity's dirty columns.
#[derive(Debug, Clone)]
pub struct EntityUpdateAction {
    pub entity: EntityRef,
    pub persister: Arc<EntityPersister>,
    pub id: Value,
    /// Indexes of dirty state properties.
    pub dirty: Vec<usize>,
    pub previous_version: Option<i64>,
    pub next_version: Option<i64>,
}

/// Delete the entity's row.
#[derive(Debug, Clone)]
pub struct EntityDeleteAction {
    pub entity: EntityRef,
    pub persister: Arc<EntityPersister>,
    pub id: Value,
    pub version: Option<i64>,
}

/// Recreate, remove or update the rows of one collection.
#[derive(Debug, Clone)]
pub struct CollectionAction {
    pub collection: CollectionRef,
    pub role: String,
    pub mapping: CollectionMapping,
    /// Owner key the rows are currently stored under.
    pub loaded_key: Option<EntityKey>,
    /// Elements as of the last synchronization.
    pub snapshot: Vec<EntityRef>,
}

impl CollectionAction {
    pub fn owner(&self) -> &EntityRef {
        &self.collection.owner
    }

    fn owner_id(&self) -> Value {
        match &self.loaded_key {
            Some(key) => key.id.clone(),
            None => self.collection.owner.id(),
        }
    }

    fn current_elements(&self) -> Vec<EntityRef> {
        self.collection
            .owner
            .collection(&self.collection.property)
            .map(|bag| bag.elements().to_vec())
            .unwrap_or_default()
    }

    fn insert_row(&self, dialect: Dialect, owner_id: &Value, element: &EntityRef) -> (String, Vec<Value>) {
        join_row_insert(dialect, &self.mapping, owner_id, &element.id())
    }

    fn delete_row(&self, dialect: Dialect, owner_id: &Value, element: &EntityRef) -> (String, Vec<Value>) {
        let sql = format!(
            "delete from {} where {}={} and {}={}",
            self.mapping.table,
            self.mapping.key_column,
            dialect.placeholder(1),
            self.mapping.element_column,
            dialect.placeholder(2)
        );
        (sql, vec![owner_id.clone(), element.id()])
    }
}

/// A unit of scheduled database work.
#[derive(Debug, Clone)]
pub enum Action {
    Insert(EntityInsertAction),
    Update(EntityUpdateAction),
    Delete(EntityDeleteAction),
    CollectionRecreate(CollectionAction),
    CollectionRemove(CollectionAction),
    CollectionUpdate(CollectionAction),
    QueuedOperation(CollectionAction),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Insert(_) => ActionKind::Insert,
            Action::Update(_) => ActionKind::Update,
            Action::Delete(_) => ActionKind::Delete,
            Action::CollectionRecreate(_) => ActionKind::CollectionRecreate,
            Action::CollectionRemove(_) => ActionKind::CollectionRemove,
            Action::CollectionUpdate(_) => ActionKind::CollectionUpdate,
            Action::QueuedOperation(_) => ActionKind::QueuedOperation,
        }
    }

    /// Target entity, or the owner for collection actions.
    pub fn entity(&self) -> &EntityRef {
        match self {
            Action::Insert(a) => &a.entity,
            Action::Update(a) => &a.entity,
            Action::Delete(a) => &a.entity,
            Action::CollectionRecreate(a)
            | Action::CollectionRemove(a)
            | Action::CollectionUpdate(a)
            | Action::QueuedOperation(a) => a.owner(),
        }
    }

    /// The collection action payload, if this is one.
    pub fn collection(&self) -> Option<&CollectionAction> {
        match self {
            Action::CollectionRecreate(a)
            | Action::CollectionRemove(a)
            | Action::CollectionUpdate(a)
            | Action::QueuedOperation(a) => Some(a),
            _ => None,
        }
    }

    /// Run the action's statements and update the tracked state.
    #[tracing::instrument(level = "debug", skip_all, fields(kind = self.kind().as_str(), entity = ?self.entity()))]
    pub async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        ctx: &mut PersistenceContext,
        dialect: Dialect,
        batch_size: usize,
    ) -> Outcome<(), Error> {
        match self {
            Action::Insert(a) => execute_insert(cx, conn, ctx, dialect, a).await,
            Action::Update(a) => execute_update(cx, conn, ctx, dialect, a).await,
            Action::Delete(a) => execute_delete(cx, conn, ctx, dialect, a).await,
            Action::CollectionRecreate(a) => {
                let owner_id = a.collection.owner.id();
                let rows: Vec<_> = a
                    .current_elements()
                    .iter()
                    .map(|e| a.insert_row(dialect, &owner_id, e))
                    .collect();
                execute_rows(cx, conn, rows, batch_size, true).await
            }
            Action::CollectionRemove(a) => {
                let row = join_rows_delete_all(dialect, &a.mapping, &a.owner_id());
                execute_rows(cx, conn, vec![row], batch_size, false).await
            }
            Action::CollectionUpdate(a) => {
                let owner_id = a.owner_id();
                let current = a.current_elements();
                let mut rows: Vec<_> = a
                    .snapshot
                    .iter()
                    .filter(|e| !current.contains(e))
                    .map(|e| a.delete_row(dialect, &owner_id, e))
                    .collect();
                rows.extend(
                    current
                        .iter()
                        .filter(|e| !a.snapshot.contains(e))
                        .map(|e| a.insert_row(dialect, &owner_id, e)),
                );
                execute_rows(cx, conn, rows, batch_size, true).await
            }
            Action::QueuedOperation(a) => {
                let owner_id = a.owner_id();
                let ops = a
                    .collection
                    .owner
                    .update_collection(&a.collection.property, |bag| bag.drain_queued());
                let rows: Vec<_> = ops
                    .iter()
                    .map(|op| match op {
                        QueuedOperation::Add(e) => a.insert_row(dialect, &owner_id, e),
                        QueuedOperation::Remove(e) => a.delete_row(dialect, &owner_id, e),
                    })
                    .collect();
                execute_rows(cx, conn, rows, batch_size, false).await
            }
        }
    }
}

pub(crate) async fn execute_rows<C: Connection>(
    cx: &Cx,
    conn: &C,
    rows: Vec<(String, Vec<Value>)>,
    batch_size: usize,
    expect_single: bool,
) -> Outcome<(), Error> {
    for chunk in rows.chunks(batch_size.max(1)) {
        tracing::trace!(statements = chunk.len(), sql = %chunk[0].0, "Executing collection rows");
        let counts = try_outcome!(conn.batch(cx, chunk).await);
        if expect_single {
            if let Some(&actual) = counts.iter().find(|&&n| n != 1) {
                return Outcome::Err(Error::TooManyRowsAffected(RowCountError {
                    message: "unexpected row count for collection row".to_string(),
                    expected: 1,
                    actual,
                }));
            }
        }
    }
    Outcome::Ok(())
}

pub(crate) fn check_single_row(persister: &EntityPersister, id: &Value, count: u64) -> Result<(), Error> {
    match count {
        1 => Ok(()),
        0 => Err(Error::StaleState(Error::identity(persister.name.clone(), id))),
        n => Err(Error::TooManyRowsAffected(RowCountError {
            message: format!("unexpected row count for {}", persister.name),
            expected: 1,
            actual: n,
        })),
    }
}

/// Row insert into an owning collection's join table.
pub(crate) fn join_row_insert(
    dialect: Dialect,
    mapping: &CollectionMapping,
    owner_id: &Value,
    element_id: &Value,
) -> (String, Vec<Value>) {
    let sql = dialect.insert(
        &mapping.table,
        &[mapping.key_column.as_str(), mapping.element_column.as_str()],
        false,
    );
    (sql, vec![owner_id.clone(), element_id.clone()])
}

/// Delete of every join-table row of one owner.
pub(crate) fn join_rows_delete_all(
    dialect: Dialect,
    mapping: &CollectionMapping,
    owner_id: &Value,
) -> (String, Vec<Value>) {
    let sql = format!(
        "delete from {} where {}={}",
        mapping.table,
        mapping.key_column,
        dialect.placeholder(1)
    );
    (sql, vec![owner_id.clone()])
}

/// A rendered entity insert.
#[derive(Debug, Clone)]
pub(crate) struct InsertStatement {
    pub sql: String,
    pub params: Vec<Value>,
    /// State written, in state-property order.
    pub state: Vec<Value>,
    pub version: Option<i64>,
}

/// Render the insert of `entity`'s current state.
///
/// The id column is left out for identity inserts; a versioned entity
/// without a version starts at 0.
pub(crate) fn insert_statement(
    dialect: Dialect,
    persister: &EntityPersister,
    entity: &EntityRef,
    identity: bool,
) -> InsertStatement {
    let state = current_state(entity, persister);
    let version = persister
        .version_column
        .as_ref()
        .map(|_| entity.version().unwrap_or(0));

    let mut columns: Vec<&str> = Vec::new();
    let mut params: Vec<Value> = Vec::new();
    if !identity {
        columns.push(&persister.id_column);
        params.push(entity.id());
    }
    columns.extend(persister.state_columns());
    params.extend(state.iter().cloned());
    if let (Some(column), Some(v)) = (&persister.version_column, version) {
        columns.push(column);
        params.push(Value::BigInt(v));
    }
    InsertStatement {
        sql: dialect.insert(&persister.table, &columns, false),
        params,
        state,
        version,
    }
}

/// Render an update of the `dirty` state properties, guarded by the
/// previous version. `None` when there is nothing to set.
pub(crate) fn update_statement(
    dialect: Dialect,
    persister: &EntityPersister,
    id: &Value,
    state: &[Value],
    dirty: &[usize],
    previous_version: Option<i64>,
    next_version: Option<i64>,
) -> Option<(String, Vec<Value>)> {
    let columns = persister.state_columns();
    let mut sets: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();
    for &i in dirty {
        params.push(state[i].clone());
        sets.push(format!("{}={}", columns[i], dialect.placeholder(params.len())));
    }
    if let (Some(column), Some(next), true) = (
        &persister.version_column,
        next_version,
        next_version != previous_version,
    ) {
        params.push(Value::BigInt(next));
        sets.push(format!("{}={}", column, dialect.placeholder(params.len())));
    }
    if sets.is_empty() {
        return None;
    }

    params.push(id.clone());
    let mut sql = format!(
        "update {} set {} where {}={}",
        persister.table,
        sets.join(", "),
        persister.id_column,
        dialect.placeholder(params.len())
    );
    if let (Some(column), Some(previous)) = (&persister.version_column, previous_version) {
        params.push(Value::BigInt(previous));
        sql.push_str(&format!(" and {}={}", column, dialect.placeholder(params.len())));
    }
    Some((sql, params))
}

/// Render a delete by id, guarded by the version when there is one.
pub(crate) fn delete_statement(
    dialect: Dialect,
    persister: &EntityPersister,
    id: &Value,
    version: Option<i64>,
) -> (String, Vec<Value>) {
    let mut params = vec![id.clone()];
    let mut sql = format!(
        "delete from {} where {}={}",
        persister.table,
        persister.id_column,
        dialect.placeholder(1)
    );
    if let (Some(column), Some(version)) = (&persister.version_column, version) {
        params.push(Value::BigInt(version));
        sql.push_str(&format!(" and {}={}", column, dialect.placeholder(2)));
    }
    (sql, params)
}

async fn execute_insert<C: Connection>(
    cx: &Cx,
    conn: &C,
    ctx: &mut PersistenceContext,
    dialect: Dialect,
    action: &EntityInsertAction,
) -> Outcome<(), Error> {
    let persister = &action.persister;
    let statement = insert_statement(dialect, persister, &action.entity, action.identity);
    tracing::trace!(sql = %statement.sql, "Inserting entity");

    if action.identity {
        let raw = try_outcome!(conn.insert(cx, &statement.sql, &statement.params).await);
        let id = try_outcome!(result persister.id_type.coerce(raw));
        action.entity.set_id(id.clone());
        try_outcome!(result ctx.set_id(&action.entity, id));
    } else {
        let count = try_outcome!(conn.update(cx, &statement.sql, &statement.params).await);
        if count != 1 {
            return Outcome::Err(Error::TooManyRowsAffected(RowCountError {
                message: format!("unexpected row count for {} insert", persister.name),
                expected: 1,
                actual: count,
            }));
        }
    }

    action.entity.set_version(statement.version);
    if let Some(entry) = ctx.get_entry_mut(&action.entity) {
        entry.status = EntityStatus::Managed;
        entry.loaded_state = Some(statement.state);
        entry.exists_in_database = true;
        entry.version = statement.version;
    }
    Outcome::Ok(())
}

async fn execute_update<C: Connection>(
    cx: &Cx,
    conn: &C,
    ctx: &mut PersistenceContext,
    dialect: Dialect,
    action: &EntityUpdateAction,
) -> Outcome<(), Error> {
    let persister = &action.persister;
    let state = current_state(&action.entity, persister);
    let Some((sql, params)) = update_statement(
        dialect,
        persister,
        &action.id,
        &state,
        &action.dirty,
        action.previous_version,
        action.next_version,
    ) else {
        return Outcome::Ok(());
    };
    tracing::trace!(sql = %sql, dirty = action.dirty.len(), "Updating entity");

    let count = try_outcome!(conn.update(cx, &sql, &params).await);
    try_outcome!(result check_single_row(persister, &action.id, count));

    action.entity.set_version(action.next_version);
    if let Some(entry) = ctx.get_entry_mut(&action.entity) {
        entry.loaded_state = Some(state);
        entry.version = action.next_version;
        if entry.lock_mode == LockMode::ForceIncrement {
            entry.lock_mode = LockMode::Read;
        }
    }
    Outcome::Ok(())
}

async fn execute_delete<C: Connection>(
    cx: &Cx,
    conn: &C,
    ctx: &mut PersistenceContext,
    dialect: Dialect,
    action: &EntityDeleteAction,
) -> Outcome<(), Error> {
    let persister = &action.persister;
    let (sql, params) = delete_statement(dialect, persister, &action.id, action.version);
    tracing::trace!(sql = %sql, "Deleting entity");

    let count = try_outcome!(conn.update(cx, &sql, &params).await);
    try_outcome!(result check_single_row(persister, &action.id, count));

    if let Some(entry) = ctx.get_entry_mut(&action.entity) {
        entry.status = EntityStatus::Gone;
        entry.exists_in_database = false;
    }
    Outcome::Ok(())
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)]
mod tests {
    use super::*;
    use crate::context::EntityEntry;
    use crate::testing::{MockConnection, unwrap_outcome};
    use asupersync::runtime::RuntimeBuilder;
    use flushline_core::{IdGeneration, ToOneMapping};

    fn hero_persister() -> Arc<EntityPersister> {
        Arc::new(
            EntityPersister::new("Hero", "heroes")
                .versioned("version")
                .basic("name", "name")
                .to_one(ToOneMapping::new("team", "team_id", "Team")),
        )
    }

    fn track(ctx: &mut PersistenceContext, entity: &EntityRef, persister: &Arc<EntityPersister>) -> EntityEntry {
        ctx.add_entry(
            entity,
            EntityStatus::Managed,
            None,
            entity.id(),
            entity.version(),
            LockMode::None,
            false,
            Arc::clone(persister),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_pipeline_order() {
        let mut kinds = ActionKind::PIPELINE.to_vec();
        kinds.sort();
        assert_eq!(kinds, ActionKind::PIPELINE.to_vec());
        assert_eq!(ActionKind::PIPELINE[0], ActionKind::Insert);
        assert_eq!(ActionKind::PIPELINE[6], ActionKind::Delete);
    }

    #[test]
    fn test_current_state_reads_target_ids() {
        let team = EntityRef::new("Team").with_id(3_i64);
        let hero = EntityRef::new("Hero")
            .with("name", "Thor")
            .with_entity("team", Some(&team));
        let state = current_state(&hero, &hero_persister());
        assert_eq!(state, vec![Value::Text("Thor".into()), Value::BigInt(3)]);
    }

    #[test]
    fn test_insert_writes_id_state_and_version() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let persister = hero_persister();
        let mut ctx = PersistenceContext::new();
        let hero = EntityRef::new("Hero").with_id(7_i64).with("name", "Thor");
        track(&mut ctx, &hero, &persister);

        let action = Action::Insert(EntityInsertAction {
            entity: hero.clone(),
            persister: Arc::clone(&persister),
            id: hero.id(),
            identity: false,
            delayed: false,
        });
        rt.block_on(async {
            unwrap_outcome(action.execute(&cx, &conn, &mut ctx, Dialect::Postgres, 10).await);
        });

        let executed = conn.executed();
        assert_eq!(
            executed[0].0,
            "insert into heroes (id, name, team_id, version) values ($1, $2, $3, $4)"
        );
        assert_eq!(
            executed[0].1,
            vec![
                Value::BigInt(7),
                Value::Text("Thor".into()),
                Value::Null,
                Value::BigInt(0)
            ]
        );
        let entry = ctx.get_entry(&hero).unwrap();
        assert!(entry.exists_in_database);
        assert_eq!(entry.version, Some(0));
        assert_eq!(hero.version(), Some(0));
    }

    #[test]
    fn test_identity_insert_assigns_coerced_id() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let persister = Arc::new(
            EntityPersister::new("Team", "teams")
                .id("id", IdGeneration::Identity)
                .id_type(flushline_core::IdType::Int)
                .basic("name", "name"),
        );
        let mut ctx = PersistenceContext::new();
        let team = EntityRef::new("Team").with("name", "Avengers");
        track(&mut ctx, &team, &persister);

        let action = Action::Insert(EntityInsertAction {
            entity: team.clone(),
            persister,
            id: Value::Null,
            identity: true,
            delayed: false,
        });
        rt.block_on(async {
            unwrap_outcome(action.execute(&cx, &conn, &mut ctx, Dialect::Postgres, 10).await);
        });

        assert_eq!(team.id(), Value::Int(1));
        assert_eq!(conn.executed()[0].0, "insert into teams (name) values ($1)");
        let key = EntityKey::new("Team", Value::BigInt(1));
        assert_eq!(ctx.get_entity(&key), Some(&team));
    }

    #[test]
    fn test_versioned_update_sets_dirty_columns_and_guards_version() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let persister = hero_persister();
        let mut ctx = PersistenceContext::new();
        let hero = EntityRef::new("Hero").with_id(7_i64).with("name", "Loki");
        hero.set_version(Some(3));
        track(&mut ctx, &hero, &persister);

        let action = Action::Update(EntityUpdateAction {
            entity: hero.clone(),
            persister,
            id: hero.id(),
            dirty: vec![0],
            previous_version: Some(3),
            next_version: Some(4),
        });
        rt.block_on(async {
            unwrap_outcome(action.execute(&cx, &conn, &mut ctx, Dialect::Postgres, 10).await);
        });

        let executed = conn.executed();
        assert_eq!(
            executed[0].0,
            "update heroes set name=$1, version=$2 where id=$3 and version=$4"
        );
        assert_eq!(hero.version(), Some(4));
        assert_eq!(ctx.get_entry(&hero).unwrap().version, Some(4));
    }

    #[test]
    fn test_zero_row_update_is_stale() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.set_update_count("update heroes", 0);
        let persister = hero_persister();
        let mut ctx = PersistenceContext::new();
        let hero = EntityRef::new("Hero").with_id(7_i64);
        track(&mut ctx, &hero, &persister);

        let action = Action::Update(EntityUpdateAction {
            entity: hero.clone(),
            persister,
            id: hero.id(),
            dirty: vec![0],
            previous_version: Some(0),
            next_version: Some(1),
        });
        let outcome =
            rt.block_on(async { action.execute(&cx, &conn, &mut ctx, Dialect::Postgres, 10).await });
        assert!(matches!(outcome, Outcome::Err(Error::StaleState(_))));
        assert_eq!(hero.version(), None);
    }

    #[test]
    fn test_delete_marks_entry_gone() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let persister = hero_persister();
        let mut ctx = PersistenceContext::new();
        let hero = EntityRef::new("Hero").with_id(7_i64);
        track(&mut ctx, &hero, &persister);

        let action = Action::Delete(EntityDeleteAction {
            entity: hero.clone(),
            persister,
            id: hero.id(),
            version: Some(2),
        });
        rt.block_on(async {
            unwrap_outcome(action.execute(&cx, &conn, &mut ctx, Dialect::Mysql, 10).await);
        });

        assert_eq!(conn.executed()[0].0, "delete from heroes where id=? and version=?");
        assert_eq!(ctx.get_entry(&hero).unwrap().status, EntityStatus::Gone);
    }

    #[test]
    fn test_collection_update_diffs_against_snapshot() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut ctx = PersistenceContext::new();

        let kept = EntityRef::new("Power").with_id(1_i64);
        let dropped = EntityRef::new("Power").with_id(2_i64);
        let added = EntityRef::new("Power").with_id(3_i64);
        let hero = EntityRef::new("Hero")
            .with_id(7_i64)
            .with_collection("powers", vec![kept.clone(), added]);

        let action = Action::CollectionUpdate(CollectionAction {
            collection: CollectionRef::new(hero.clone(), "powers"),
            role: "Hero.powers".to_string(),
            mapping: CollectionMapping::join_table(
                "powers",
                "Power",
                "hero_powers",
                "hero_id",
                "power_id",
            ),
            loaded_key: Some(EntityKey::new("Hero", Value::BigInt(7))),
            snapshot: vec![kept, dropped],
        });
        rt.block_on(async {
            unwrap_outcome(action.execute(&cx, &conn, &mut ctx, Dialect::Postgres, 10).await);
        });

        let executed = conn.executed();
        assert_eq!(executed.len(), 2);
        assert_eq!(
            executed[0],
            (
                "delete from hero_powers where hero_id=$1 and power_id=$2".to_string(),
                vec![Value::BigInt(7), Value::BigInt(2)]
            )
        );
        assert_eq!(
            executed[1],
            (
                "insert into hero_powers (hero_id, power_id) values ($1, $2)".to_string(),
                vec![Value::BigInt(7), Value::BigInt(3)]
            )
        );
    }

    #[test]
    fn test_queued_operations_applied_and_drained() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut ctx = PersistenceContext::new();

        let power = EntityRef::new("Power").with_id(5_i64);
        let hero = EntityRef::new("Hero").with_id(7_i64);
        hero.set_collection("powers", Some(crate::entity::Bag::lazy()));
        hero.add_to("powers", &power);

        let action = Action::QueuedOperation(CollectionAction {
            collection: CollectionRef::new(hero.clone(), "powers"),
            role: "Hero.powers".to_string(),
            mapping: CollectionMapping::join_table(
                "powers",
                "Power",
                "hero_powers",
                "hero_id",
                "power_id",
            ),
            loaded_key: None,
            snapshot: Vec::new(),
        });
        rt.block_on(async {
            unwrap_outcome(action.execute(&cx, &conn, &mut ctx, Dialect::Postgres, 10).await);
        });

        assert_eq!(conn.executed().len(), 1);
        let bag = hero.collection("powers").unwrap();
        assert!(!bag.is_initialized());
        assert!(!bag.has_queued_operations());
    }
}
