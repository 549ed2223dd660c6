//! Dynamically-typed entity instances.
//!
//! Application objects are shared handles ([`EntityRef`]) so the live object
//! graph can be walked and mutated while the session tracks it. Two handles are
//! the same entity exactly when they point at the same allocation.

use flushline_core::Value;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A deferred membership change recorded on a collection that was never loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedOperation {
    Add(EntityRef),
    Remove(EntityRef),
}

/// The value of a collection-valued property.
///
/// A lazy bag has not been loaded from the database; membership changes made
/// to it are queued and applied when it is initialized or flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bag {
    elements: Vec<EntityRef>,
    initialized: bool,
    queued: Vec<QueuedOperation>,
}

impl Bag {
    /// An initialized bag holding `elements`.
    pub fn new(elements: Vec<EntityRef>) -> Self {
        Self {
            elements,
            initialized: true,
            queued: Vec::new(),
        }
    }

    /// A bag whose contents have not been loaded yet.
    pub fn lazy() -> Self {
        Self {
            elements: Vec::new(),
            initialized: false,
            queued: Vec::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Loaded elements. Empty for a lazy bag.
    pub fn elements(&self) -> &[EntityRef] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.elements.contains(entity)
    }

    /// Operations queued while lazy.
    pub fn queued(&self) -> &[QueuedOperation] {
        &self.queued
    }

    pub fn has_queued_operations(&self) -> bool {
        !self.queued.is_empty()
    }

    /// Add an element, queueing the addition on a lazy bag.
    pub fn add(&mut self, entity: EntityRef) {
        if self.initialized {
            if !self.elements.contains(&entity) {
                self.elements.push(entity);
            }
        } else {
            self.queued.push(QueuedOperation::Add(entity));
        }
    }

    /// Remove an element, queueing the removal on a lazy bag.
    pub fn remove(&mut self, entity: &EntityRef) {
        if self.initialized {
            self.elements.retain(|e| e != entity);
        } else {
            self.queued.push(QueuedOperation::Remove(entity.clone()));
        }
    }

    /// Install loaded elements and replay queued operations on top of them.
    pub fn initialize(&mut self, loaded: Vec<EntityRef>) {
        self.elements = loaded;
        self.initialized = true;
        for op in std::mem::take(&mut self.queued) {
            match op {
                QueuedOperation::Add(e) => {
                    if !self.elements.contains(&e) {
                        self.elements.push(e);
                    }
                }
                QueuedOperation::Remove(e) => self.elements.retain(|x| *x != e),
            }
        }
    }

    /// Take the queued operations, leaving the bag lazy and clean.
    pub fn drain_queued(&mut self) -> Vec<QueuedOperation> {
        std::mem::take(&mut self.queued)
    }

    /// Entities added through queued operations.
    pub fn queued_additions(&self) -> impl Iterator<Item = &EntityRef> {
        self.queued.iter().filter_map(|op| match op {
            QueuedOperation::Add(e) => Some(e),
            QueuedOperation::Remove(_) => None,
        })
    }
}

/// A property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    /// A basic column value.
    Value(Value),
    /// A to-one association.
    Entity(Option<EntityRef>),
    /// A collection; `None` when the collection itself is null.
    Collection(Option<Bag>),
}

/// State of one entity instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityData {
    entity_name: String,
    id: Value,
    version: Option<i64>,
    properties: BTreeMap<String, Property>,
}

/// Shared handle to an entity instance.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<EntityData>>);

impl EntityRef {
    /// A new transient instance of `entity_name` with a null id.
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(EntityData {
            entity_name: entity_name.into(),
            id: Value::Null,
            version: None,
            properties: BTreeMap::new(),
        })))
    }

    fn read(&self) -> RwLockReadGuard<'_, EntityData> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityData> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the id.
    pub fn with_id(self, id: impl Into<Value>) -> Self {
        self.set_id(id.into());
        self
    }

    /// Set a basic property.
    pub fn with(self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a to-one association.
    pub fn with_entity(self, name: &str, target: Option<&EntityRef>) -> Self {
        self.set_entity(name, target.cloned());
        self
    }

    /// Set an initialized collection.
    pub fn with_collection(self, name: &str, elements: Vec<EntityRef>) -> Self {
        self.set_collection(name, Some(Bag::new(elements)));
        self
    }

    pub fn entity_name(&self) -> String {
        self.read().entity_name.clone()
    }

    pub fn id(&self) -> Value {
        self.read().id.clone()
    }

    pub fn set_id(&self, id: Value) {
        self.write().id = id;
    }

    pub fn version(&self) -> Option<i64> {
        self.read().version
    }

    pub fn set_version(&self, version: Option<i64>) {
        self.write().version = version;
    }

    /// Basic property value; `None` when unset or not a basic property.
    pub fn get(&self, name: &str) -> Option<Value> {
        match self.read().properties.get(name) {
            Some(Property::Value(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) {
        self.write()
            .properties
            .insert(name.to_string(), Property::Value(value.into()));
    }

    /// To-one association target.
    pub fn entity(&self, name: &str) -> Option<EntityRef> {
        match self.read().properties.get(name) {
            Some(Property::Entity(target)) => target.clone(),
            _ => None,
        }
    }

    pub fn set_entity(&self, name: &str, target: Option<EntityRef>) {
        self.write()
            .properties
            .insert(name.to_string(), Property::Entity(target));
    }

    /// Collection value; `None` when null or unset.
    pub fn collection(&self, name: &str) -> Option<Bag> {
        match self.read().properties.get(name) {
            Some(Property::Collection(bag)) => bag.clone(),
            _ => None,
        }
    }

    pub fn set_collection(&self, name: &str, bag: Option<Bag>) {
        self.write()
            .properties
            .insert(name.to_string(), Property::Collection(bag));
    }

    /// Mutate a collection in place, creating an empty initialized bag when
    /// the property is null.
    pub fn update_collection<R>(&self, name: &str, f: impl FnOnce(&mut Bag) -> R) -> R {
        let mut data = self.write();
        let mut bag = match data.properties.remove(name) {
            Some(Property::Collection(Some(bag))) => bag,
            _ => Bag::new(Vec::new()),
        };
        let result = f(&mut bag);
        data.properties
            .insert(name.to_string(), Property::Collection(Some(bag)));
        result
    }

    pub fn add_to(&self, name: &str, element: &EntityRef) {
        self.update_collection(name, |bag| bag.add(element.clone()));
    }

    pub fn remove_from(&self, name: &str, element: &EntityRef) {
        self.update_collection(name, |bag| bag.remove(element));
    }

    /// Whether two handles refer to the same instance.
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Snapshot of the instance state.
    pub fn data(&self) -> EntityData {
        self.read().clone()
    }
}

impl EntityData {
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn properties(&self) -> &BTreeMap<String, Property> {
        &self.properties
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl std::fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // try_read: a Debug print must not deadlock against a held write guard
        match self.0.try_read() {
            Ok(data) => write!(f, "{}#{}", data.entity_name, data.id),
            Err(_) => write!(f, "EntityRef({:p})", Arc::as_ptr(&self.0)),
        }
    }
}
