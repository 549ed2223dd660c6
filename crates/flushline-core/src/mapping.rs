//! Static object/relational mapping metadata.
//!
//! The flush engine consults, but never computes, mapping information: which
//! columns an entity's state is written to, how its identifier is produced,
//! which associations cascade which operations, and whether orphans are
//! deleted. A [`Metamodel`] is assembled once at configuration time and shared
//! read-only by every session.
//!
//! # Example
//!
//! ```rust,ignore
//! let metamodel = Metamodel::new()
//!     .entity(
//!         EntityPersister::new("Team", "teams")
//!             .id("id", IdGeneration::Identity)
//!             .basic("name", "name")
//!             .collection(
//!                 CollectionMapping::one_to_many("heroes", "Hero")
//!                     .cascade(CascadeStyle::ALL)
//!                     .orphan_removal(),
//!             ),
//!     )
//!     .entity(
//!         EntityPersister::new("Hero", "heroes")
//!             .id("id", IdGeneration::Table(TableGeneratorConfig::default()))
//!             .basic("name", "name")
//!             .to_one(ToOneMapping::new("team", "team_id", "Team")),
//!     );
//! ```

use crate::error::{Error, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Which session operations propagate across an association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeStyle {
    /// Persist, flush-time persist and reattach.
    pub persist: bool,
    pub remove: bool,
    pub refresh: bool,
    pub lock: bool,
}

impl CascadeStyle {
    /// No cascading.
    pub const NONE: Self = Self {
        persist: false,
        remove: false,
        refresh: false,
        lock: false,
    };

    /// Cascade persist (and flush-time persist, reattach).
    pub const PERSIST: Self = Self {
        persist: true,
        ..Self::NONE
    };

    /// Cascade remove.
    pub const REMOVE: Self = Self {
        remove: true,
        ..Self::NONE
    };

    /// Cascade everything.
    pub const ALL: Self = Self {
        persist: true,
        remove: true,
        refresh: true,
        lock: true,
    };

    /// Whether any operation cascades.
    pub const fn is_none(&self) -> bool {
        !self.persist && !self.remove && !self.refresh && !self.lock
    }
}

/// Identifier generation strategy for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IdGeneration {
    /// The application sets the id before calling persist.
    Assigned,
    /// The database assigns the id on insert (identity/auto-increment column).
    Identity,
    /// Ids come from blocks reserved in a counter table.
    Table(TableGeneratorConfig),
}

/// SQL type of the identifier column, used to coerce generated keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdType {
    SmallInt,
    Int,
    #[default]
    BigInt,
    Text,
}

impl IdType {
    /// Coerce a generated integral key into this id type.
    pub fn coerce(self, raw: i64) -> Result<Value> {
        let out_of_range = || {
            Error::IdentifierGeneration(format!(
                "generated identifier {raw} does not fit the {self:?} id column"
            ))
        };
        match self {
            IdType::SmallInt => i16::try_from(raw)
                .map(Value::SmallInt)
                .map_err(|_| out_of_range()),
            IdType::Int => i32::try_from(raw).map(Value::Int).map_err(|_| out_of_range()),
            IdType::BigInt => Ok(Value::BigInt(raw)),
            IdType::Text => Ok(Value::Text(raw.to_string())),
        }
    }
}

/// Configuration of a table-backed block identifier generator.
///
/// Defaults follow the conventional `hibernate_sequences` layout: one row per
/// segment, the counter in `next_val`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableGeneratorConfig {
    /// Counter table name.
    pub table: String,
    /// Segment column; `None` for a single-counter table.
    pub segment_column: Option<String>,
    /// Segment value identifying this generator's row.
    pub segment_value: String,
    /// Counter column.
    pub value_column: String,
    /// First identifier handed out when the row does not exist yet.
    pub initial_value: i64,
    /// Block size: identifiers reserved per round trip.
    pub increment_size: i64,
    /// When set the counter row records the upper bound of the most recently
    /// reserved block; otherwise it records the first value of that block.
    pub store_last_used: bool,
    /// Seed a missing counter row with a conflict-ignoring insert so
    /// concurrent first use converges instead of duplicating the row.
    pub seed_with_upsert: bool,
}

impl Default for TableGeneratorConfig {
    fn default() -> Self {
        Self {
            table: "hibernate_sequences".to_string(),
            segment_column: Some("sequence_name".to_string()),
            segment_value: "default".to_string(),
            value_column: "next_val".to_string(),
            initial_value: 1,
            increment_size: 50,
            store_last_used: true,
            seed_with_upsert: true,
        }
    }
}

impl TableGeneratorConfig {
    /// Create a config for the given counter table with default columns.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Load a config from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the segment value.
    pub fn segment(mut self, value: impl Into<String>) -> Self {
        self.segment_value = value.into();
        self
    }

    /// Use a single-counter table without a segment column.
    pub fn without_segment(mut self) -> Self {
        self.segment_column = None;
        self
    }

    /// Set the counter column.
    pub fn value_column(mut self, column: impl Into<String>) -> Self {
        self.value_column = column.into();
        self
    }

    /// Set the initial value.
    pub fn initial_value(mut self, value: i64) -> Self {
        self.initial_value = value;
        self
    }

    /// Set the block size.
    pub fn increment_size(mut self, size: i64) -> Self {
        self.increment_size = size;
        self
    }

    /// Choose what the counter row records.
    pub fn store_last_used(mut self, value: bool) -> Self {
        self.store_last_used = value;
        self
    }

    /// Enable or disable conflict-ignoring seed inserts.
    pub fn seed_with_upsert(mut self, value: bool) -> Self {
        self.seed_with_upsert = value;
        self
    }

    /// Check the config for values the allocator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() || self.value_column.is_empty() {
            return Err(Error::config(
                "table generator needs a table and a value column",
            ));
        }
        if self.increment_size < 1 {
            return Err(Error::config(format!(
                "table generator increment_size must be positive, got {}",
                self.increment_size
            )));
        }
        Ok(())
    }
}

/// A single-valued association (many-to-one / one-to-one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToOneMapping {
    /// Property name on the owning entity.
    pub name: String,
    /// Foreign key column on the owning entity's table.
    pub column: String,
    /// Target entity name.
    pub target: String,
    pub cascade: CascadeStyle,
    /// Remove the previous target when the reference is severed.
    pub orphan_removal: bool,
}

impl ToOneMapping {
    /// Create a non-cascading to-one association.
    pub fn new(name: impl Into<String>, column: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            target: target.into(),
            cascade: CascadeStyle::NONE,
            orphan_removal: false,
        }
    }

    /// Set the cascade style.
    pub fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    /// Enable orphan removal.
    pub fn orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self
    }
}

/// A collection-valued association.
///
/// Owning collections persist membership in a join table
/// (`table.key_column` references the owner, `table.element_column` the
/// element). Inverse collections mirror a to-one association on the element
/// side and issue no statements of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMapping {
    /// Property name on the owning entity.
    pub name: String,
    /// Element entity name.
    pub element: String,
    /// Join table.
    pub table: String,
    pub key_column: String,
    pub element_column: String,
    /// Membership is owned by the other side of a bidirectional association.
    pub inverse: bool,
    /// To-one property on the element that owns an inverse collection.
    pub mapped_by: Option<String>,
    pub cascade: CascadeStyle,
    /// Remove elements that leave the collection.
    pub orphan_removal: bool,
}

impl CollectionMapping {
    /// An owning collection stored in a join table.
    pub fn join_table(
        name: impl Into<String>,
        element: impl Into<String>,
        table: impl Into<String>,
        key_column: impl Into<String>,
        element_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            element: element.into(),
            table: table.into(),
            key_column: key_column.into(),
            element_column: element_column.into(),
            inverse: false,
            mapped_by: None,
            cascade: CascadeStyle::NONE,
            orphan_removal: false,
        }
    }

    /// An inverse one-to-many collection, mapped by a to-one on the element.
    pub fn one_to_many(name: impl Into<String>, element: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            element: element.into(),
            table: String::new(),
            key_column: String::new(),
            element_column: String::new(),
            inverse: true,
            mapped_by: None,
            cascade: CascadeStyle::NONE,
            orphan_removal: false,
        }
    }

    /// Name the element's to-one property that owns this inverse collection.
    pub fn mapped_by(mut self, property: impl Into<String>) -> Self {
        self.mapped_by = Some(property.into());
        self
    }

    /// Set the cascade style.
    pub fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    /// Enable orphan removal.
    pub fn orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self
    }
}

/// A mapped property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyMapping {
    /// A plain column.
    Basic { name: String, column: String },
    ToOne(ToOneMapping),
    Collection(CollectionMapping),
}

impl PropertyMapping {
    /// Property name.
    pub fn name(&self) -> &str {
        match self {
            PropertyMapping::Basic { name, .. } => name,
            PropertyMapping::ToOne(m) => &m.name,
            PropertyMapping::Collection(m) => &m.name,
        }
    }

    /// Column holding the property's state, if it has one in the entity table.
    pub fn column(&self) -> Option<&str> {
        match self {
            PropertyMapping::Basic { column, .. } => Some(column),
            PropertyMapping::ToOne(m) => Some(&m.column),
            PropertyMapping::Collection(_) => None,
        }
    }
}

/// Mapping of one entity type to its table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPersister {
    pub name: String,
    pub table: String,
    pub id_column: String,
    pub id_type: IdType,
    pub id_generation: IdGeneration,
    pub version_column: Option<String>,
    pub properties: Vec<PropertyMapping>,
}

impl EntityPersister {
    /// Create a mapping with an assigned `id` column and no properties.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            id_column: "id".to_string(),
            id_type: IdType::BigInt,
            id_generation: IdGeneration::Assigned,
            version_column: None,
            properties: Vec::new(),
        }
    }

    /// Set the id column and generation strategy.
    pub fn id(mut self, column: impl Into<String>, generation: IdGeneration) -> Self {
        self.id_column = column.into();
        self.id_generation = generation;
        self
    }

    /// Set the id column type.
    pub fn id_type(mut self, id_type: IdType) -> Self {
        self.id_type = id_type;
        self
    }

    /// Enable optimistic locking through an integer version column.
    pub fn versioned(mut self, column: impl Into<String>) -> Self {
        self.version_column = Some(column.into());
        self
    }

    /// Add a basic property.
    pub fn basic(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.properties.push(PropertyMapping::Basic {
            name: name.into(),
            column: column.into(),
        });
        self
    }

    /// Add a to-one association.
    pub fn to_one(mut self, mapping: ToOneMapping) -> Self {
        self.properties.push(PropertyMapping::ToOne(mapping));
        self
    }

    /// Add a collection association.
    pub fn collection(mut self, mapping: CollectionMapping) -> Self {
        self.properties.push(PropertyMapping::Collection(mapping));
        self
    }

    /// Whether the entity carries a version column.
    pub fn is_versioned(&self) -> bool {
        self.version_column.is_some()
    }

    /// Whether the database assigns the id on insert.
    pub fn is_identity(&self) -> bool {
        matches!(self.id_generation, IdGeneration::Identity)
    }

    /// Look up a property by name.
    pub fn property(&self, name: &str) -> Option<&PropertyMapping> {
        self.properties.iter().find(|p| p.name() == name)
    }

    /// Properties whose state lives in the entity table, in state order.
    pub fn state_properties(&self) -> impl Iterator<Item = &PropertyMapping> {
        self.properties.iter().filter(|p| p.column().is_some())
    }

    /// Columns of the state properties, in state order.
    pub fn state_columns(&self) -> Vec<&str> {
        self.state_properties().filter_map(|p| p.column()).collect()
    }

    /// To-one associations.
    pub fn to_one_associations(&self) -> impl Iterator<Item = &ToOneMapping> {
        self.properties.iter().filter_map(|p| match p {
            PropertyMapping::ToOne(m) => Some(m),
            _ => None,
        })
    }

    /// Collection associations.
    pub fn collections(&self) -> impl Iterator<Item = &CollectionMapping> {
        self.properties.iter().filter_map(|p| match p {
            PropertyMapping::Collection(m) => Some(m),
            _ => None,
        })
    }

    /// The to-one association on this (element) entity that owns the inverse
    /// collection `mapping` of `owner`.
    pub fn inverse_owner(&self, owner: &str, mapping: &CollectionMapping) -> Option<&ToOneMapping> {
        match &mapping.mapped_by {
            Some(name) => self.to_one_associations().find(|m| &m.name == name),
            None => self.to_one_associations().find(|m| m.target == owner),
        }
    }

    /// Collection role name, `Entity.property`.
    pub fn role(&self, property: &str) -> String {
        format!("{}.{}", self.name, property)
    }
}

/// All entity mappings known to a session factory.
#[derive(Debug, Clone, Default)]
pub struct Metamodel {
    entities: HashMap<String, Arc<EntityPersister>>,
}

impl Metamodel {
    /// Create an empty metamodel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity mapping.
    pub fn entity(mut self, persister: EntityPersister) -> Self {
        self.entities
            .insert(persister.name.clone(), Arc::new(persister));
        self
    }

    /// Look up an entity mapping.
    pub fn persister(&self, entity: &str) -> Result<Arc<EntityPersister>> {
        self.entities
            .get(entity)
            .cloned()
            .ok_or_else(|| Error::Mapping(format!("Unknown entity: {entity}")))
    }

    /// Iterate over all registered mappings.
    pub fn persisters(&self) -> impl Iterator<Item = &Arc<EntityPersister>> {
        self.entities.values()
    }

    /// Check that every association targets a registered entity and that
    /// generator configs are usable.
    pub fn validate(&self) -> Result<()> {
        for persister in self.entities.values() {
            for assoc in persister.to_one_associations() {
                if !self.entities.contains_key(&assoc.target) {
                    return Err(Error::Mapping(format!(
                        "{}.{} targets unknown entity {}",
                        persister.name, assoc.name, assoc.target
                    )));
                }
            }
            for coll in persister.collections() {
                if !self.entities.contains_key(&coll.element) {
                    return Err(Error::Mapping(format!(
                        "{}.{} targets unknown entity {}",
                        persister.name, coll.name, coll.element
                    )));
                }
                if coll.inverse {
                    let element = &self.entities[&coll.element];
                    if element.inverse_owner(&persister.name, coll).is_none() {
                        return Err(Error::Mapping(format!(
                            "{}.{} is inverse but {} has no owning to-one",
                            persister.name, coll.name, coll.element
                        )));
                    }
                } else if coll.table.is_empty() {
                    return Err(Error::Mapping(format!(
                        "{}.{} is owning but has no join table",
                        persister.name, coll.name
                    )));
                }
            }
            if let IdGeneration::Table(config) = &persister.id_generation {
                config.validate()?;
            }
        }
        tracing::debug!(entities = self.entities.len(), "Metamodel validated");
        Ok(())
    }
}
