//! Session factory: validated mapping metadata plus shared identifier
//! generators.
//!
//! A factory is built once and cloned freely; every session it opens shares
//! the same [`Metamodel`] and the same block generators, so ids handed out by
//! different sessions never collide within one process.

use crate::config::SessionConfig;
use crate::stateless::StatelessSession;
use crate::Session;
use flushline_core::{Connection, Dialect, Error, IdGeneration, Metamodel, Result};
use flushline_id::{BlockIdentifierGenerator, TableGenerator};
use std::collections::HashMap;
use std::sync::Arc;

/// Block generator shared by every entity mapped to the same counter row.
pub type SharedGenerator = Arc<BlockIdentifierGenerator<TableGenerator>>;

/// Entry point for opening sessions.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    metamodel: Arc<Metamodel>,
    dialect: Dialect,
    config: SessionConfig,
    /// Entity name -> generator, for table-generated entities.
    generators: Arc<HashMap<String, SharedGenerator>>,
}

impl SessionFactory {
    /// Validate `metamodel` and build one generator per counter row.
    ///
    /// Entities whose generator configs name the same table and segment share
    /// a generator; their configs must agree.
    pub fn new(metamodel: Metamodel, dialect: Dialect) -> Result<Self> {
        metamodel.validate()?;

        let mut by_row: HashMap<(String, String), SharedGenerator> = HashMap::new();
        let mut generators = HashMap::new();
        for persister in metamodel.persisters() {
            let IdGeneration::Table(config) = &persister.id_generation else {
                continue;
            };
            let row = (config.table.clone(), config.segment_value.clone());
            let generator = match by_row.get(&row) {
                Some(existing) => {
                    if existing.allocator().config() != config {
                        return Err(Error::config(format!(
                            "generator {}/{} is configured twice with different settings",
                            row.0, row.1
                        )));
                    }
                    Arc::clone(existing)
                }
                None => {
                    let generator = Arc::new(BlockIdentifierGenerator::new(TableGenerator::new(
                        config.clone(),
                        dialect,
                    )?));
                    by_row.insert(row, Arc::clone(&generator));
                    generator
                }
            };
            generators.insert(persister.name.clone(), generator);
        }

        tracing::debug!(
            entities = metamodel.persisters().count(),
            generators = by_row.len(),
            dialect = ?dialect,
            "Session factory built"
        );
        Ok(Self {
            metamodel: Arc::new(metamodel),
            dialect,
            config: SessionConfig::default(),
            generators: Arc::new(generators),
        })
    }

    /// Replace the configuration handed to new sessions.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Open a stateful session over `connection`.
    pub fn open_session<C: Connection>(&self, connection: C) -> Session<C> {
        Session::new(self.clone(), connection)
    }

    /// Open a stateless session over `connection`.
    pub fn open_stateless_session<C: Connection>(&self, connection: C) -> StatelessSession<C> {
        StatelessSession::new(self.clone(), connection)
    }

    /// The block generator of a table-generated entity.
    pub fn generator(&self, entity: &str) -> Option<&SharedGenerator> {
        self.generators.get(entity)
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.metamodel
    }

    /// Dialect the generators render their statements for.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}
