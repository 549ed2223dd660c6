//! Sessions and generators configured from JSON.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{MemoryDb, unwrap_outcome};
use flushline::{
    Cx, Dialect, EntityPersister, EntityRef, Error, IdGeneration, Metamodel, SessionConfig,
    SessionFactory, TableGeneratorConfig, Value,
};
use serde_json::json;

fn metamodel(counter: TableGeneratorConfig) -> Metamodel {
    Metamodel::new()
        .entity(
            EntityPersister::new("Villain", "villains")
                .id("id", IdGeneration::Identity)
                .basic("name", "name"),
        )
        .entity(
            EntityPersister::new("Minion", "minions")
                .id("id", IdGeneration::Table(counter))
                .basic("name", "name"),
        )
}

#[test]
fn immediate_identity_access_from_json() {
    let config = SessionConfig::from_json(&json!({ "immediate_identity_access": true }).to_string())
        .expect("valid session config");
    assert!(config.auto_begin);
    assert_eq!(config.batch_size, 50);

    let factory = SessionFactory::new(
        metamodel(TableGeneratorConfig::default()),
        Dialect::Postgres,
    )
    .expect("valid metamodel")
    .with_config(config);
    let db = MemoryDb::new();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let mut session = factory.open_session(db.clone());
    let villain = EntityRef::new("Villain").with("name", "Ultron");

    rt.block_on(async {
        unwrap_outcome(session.persist(&cx, &villain).await);
    });

    assert!(!session.in_transaction());
    assert_eq!(villain.id(), Value::BigInt(1));
    assert_eq!(db.writes(), vec!["insert into villains (name) values ($1)"]);
}

#[test]
fn single_counter_table_from_json() {
    let counter = TableGeneratorConfig::from_json(
        &json!({
            "table": "id_counter",
            "segment_column": null,
            "increment_size": 3,
        })
        .to_string(),
    )
    .expect("valid generator config");
    assert_eq!(counter.value_column, "next_val");

    let factory =
        SessionFactory::new(metamodel(counter), Dialect::Postgres).expect("valid metamodel");
    let db = MemoryDb::new();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let mut session = factory.open_session(db.clone());

    let minions: Vec<EntityRef> = (0..4)
        .map(|i| EntityRef::new("Minion").with("name", format!("minion-{i}")))
        .collect();
    rt.block_on(async {
        for minion in &minions {
            unwrap_outcome(session.persist(&cx, minion).await);
        }
        unwrap_outcome(session.commit(&cx).await);
    });

    let ids: Vec<i64> = minions.iter().filter_map(|m| m.id().as_i64()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(db.rows("minions").len(), 4);
    let counter = db.rows("id_counter");
    assert_eq!(counter.len(), 1);
    assert_eq!(counter[0].get("next_val"), Some(&Value::BigInt(7)));
}

#[test]
fn invalid_generator_config_is_rejected() {
    let outcome = TableGeneratorConfig::from_json(&json!({ "increment_size": 0 }).to_string());
    assert!(matches!(outcome, Err(Error::Config(_))));
}
