//! Identity map guarantees of the persistence context.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{MemoryDb, unwrap_outcome};
use flushline::{
    CascadeStyle, Cx, Dialect, EntityPersister, EntityRef, EntityStatus, Error, IdGeneration,
    LockMode, Metamodel, Outcome, PersistenceContext, Session, SessionFactory, ToOneMapping, Value,
};

fn metamodel() -> Metamodel {
    Metamodel::new()
        .entity(
            EntityPersister::new("Team", "teams")
                .id("id", IdGeneration::Assigned)
                .basic("name", "name"),
        )
        .entity(
            EntityPersister::new("Hero", "heroes")
                .id("id", IdGeneration::Assigned)
                .basic("name", "name")
                .versioned("version")
                .to_one(ToOneMapping::new("team", "team_id", "Team").cascade(CascadeStyle::PERSIST)),
        )
}

fn open(db: &MemoryDb) -> Session<MemoryDb> {
    SessionFactory::new(metamodel(), Dialect::Postgres)
        .expect("valid metamodel")
        .open_session(db.clone())
}

fn seeded() -> MemoryDb {
    let db = MemoryDb::new();
    db.insert_row(
        "heroes",
        &[
            ("id", Value::BigInt(10)),
            ("name", Value::Text("Thor".into())),
            ("team_id", Value::Null),
            ("version", Value::BigInt(3)),
        ],
    );
    db
}

#[test]
fn one_instance_per_identity() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let db = seeded();
    let mut session = open(&db);

    rt.block_on(async {
        let first = unwrap_outcome(session.find(&cx, "Hero", 10_i64).await).expect("hero row");
        let second = unwrap_outcome(session.find(&cx, "Hero", 10_i32).await).expect("hero row");
        assert!(first.ptr_eq(&second));
        assert_eq!(first.version(), Some(3));

        let copy = EntityRef::new("Hero").with_id(10_i64).with("name", "Thor");
        let outcome = session.persist(&cx, &copy).await;
        let Outcome::Err(Error::NonUniqueObject(identity)) = outcome else {
            panic!("expected non-unique object error, got {outcome:?}");
        };
        assert_eq!(identity.entity, "Hero");
        assert!(!session.contains(&copy));
    });

    // only the first lookup reached the database
    assert_eq!(db.state.lock().expect("lock poisoned").selects.len(), 1);
}

#[test]
fn snapshot_ignores_entries_added_while_iterating() {
    let persister = metamodel().persister("Team").expect("team mapping");
    let mut context = PersistenceContext::new();
    let add = |context: &mut PersistenceContext, id: i64| {
        let team = EntityRef::new("Team").with_id(id);
        context
            .add_entry(
                &team,
                EntityStatus::Managed,
                Some(vec![Value::Null]),
                Value::BigInt(id),
                None,
                LockMode::None,
                true,
                persister.clone(),
                false,
            )
            .expect("unique team");
        team
    };
    add(&mut context, 1);
    add(&mut context, 2);

    let snapshot = context.reentrant_safe_entity_entries();
    let mut visited = Vec::new();
    for (entity, entry) in &snapshot {
        visited.push(entry.id.clone());
        add(&mut context, entity.id().as_i64().unwrap_or_default() + 100);
    }

    assert_eq!(visited, vec![Value::BigInt(1), Value::BigInt(2)]);
    assert_eq!(context.entity_count(), 4);
    let ids: Vec<Value> = context
        .reentrant_safe_entity_entries()
        .into_iter()
        .map(|(_, entry)| entry.id)
        .collect();
    assert_eq!(
        ids,
        vec![Value::BigInt(1), Value::BigInt(2), Value::BigInt(101), Value::BigInt(102)]
    );
}

#[test]
fn flush_persists_entities_reached_during_the_flush() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let db = seeded();
    let mut session = open(&db);
    let team = EntityRef::new("Team").with_id(2_i64).with("name", "Asgard");

    rt.block_on(async {
        let thor = unwrap_outcome(session.find(&cx, "Hero", 10_i64).await).expect("hero row");
        thor.set_entity("team", Some(team.clone()));
        assert!(!session.contains(&team));

        unwrap_outcome(session.commit(&cx).await);
        assert!(session.contains(&team));
        assert_eq!(session.status_of(&team), Some(EntityStatus::Managed));
        assert_eq!(thor.version(), Some(4));
    });

    let writes = db.writes();
    assert_eq!(writes.len(), 2, "{writes:?}");
    assert!(writes[0].starts_with("insert into teams"), "{writes:?}");
    assert!(writes[1].starts_with("update heroes set team_id=$1"), "{writes:?}");
    assert_eq!(
        db.rows("heroes")[0].get("team_id"),
        Some(&Value::BigInt(2))
    );
}
