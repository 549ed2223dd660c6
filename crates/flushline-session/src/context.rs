//! Persistence context: the per-unit-of-work entity state tracker.
//!
//! Every managed entity has exactly one [`EntityEntry`] here and every
//! managed collection one [`CollectionEntry`]. Iteration during a flush always
//! goes through snapshots ([`PersistenceContext::reentrant_safe_entity_entries`],
//! [`PersistenceContext::for_each_collection_entry`]) because the cascades run
//! while iterating add new entries.

use crate::entity::EntityRef;
use flushline_core::{EntityPersister, Error, Result, Value};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Lifecycle status of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityStatus {
    /// Being hydrated from a row.
    Loading,
    Managed,
    ReadOnly,
    /// Placeholder while an insert is being scheduled.
    Saving,
    /// Removed; the delete has not been flushed yet.
    Deleted,
    /// Deleted in the database. Terminal.
    Gone,
}

impl EntityStatus {
    /// Whether the flush processes entries in this status.
    pub const fn is_flushable(self) -> bool {
        matches!(
            self,
            EntityStatus::Managed | EntityStatus::Saving | EntityStatus::ReadOnly
        )
    }

    pub const fn is_deleted_or_gone(self) -> bool {
        matches!(self, EntityStatus::Deleted | EntityStatus::Gone)
    }
}

/// Lock held on an entity's row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    #[default]
    None,
    /// Version verified against the database.
    Read,
    /// Row locked with a pessimistic write lock.
    PessimisticWrite,
    /// Version incremented at the next flush even when clean.
    ForceIncrement,
}

/// Tracked state of one managed entity.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub status: EntityStatus,
    /// Column values as of the last synchronization, in state-property order.
    pub loaded_state: Option<Vec<Value>>,
    pub id: Value,
    pub version: Option<i64>,
    pub lock_mode: LockMode,
    pub exists_in_database: bool,
    pub persister: Arc<EntityPersister>,
    pub disable_version_increment: bool,
}

impl EntityEntry {
    pub fn entity_name(&self) -> &str {
        &self.persister.name
    }

    /// Identity key, once the id is known.
    pub fn key(&self) -> Option<EntityKey> {
        if self.id.is_null() {
            None
        } else {
            Some(EntityKey::new(self.persister.name.clone(), self.id.clone()))
        }
    }
}

/// Identity of a persistent entity: entity name plus id.
#[derive(Debug, Clone)]
pub struct EntityKey {
    pub entity: String,
    pub id: Value,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, id: Value) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.id.id_eq(&other.id)
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.id.hash_id(state);
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// A collection instance: the owner plus the collection property.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    pub owner: EntityRef,
    pub property: String,
}

impl CollectionRef {
    pub fn new(owner: EntityRef, property: impl Into<String>) -> Self {
        Self {
            owner,
            property: property.into(),
        }
    }
}

/// Tracked state of one collection.
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    /// `Owner.property`.
    pub role: String,
    /// Elements as of the last synchronization; `None` when never loaded.
    pub loaded_snapshot: Option<Vec<EntityRef>>,
    /// Owner key the collection was loaded or last flushed under.
    pub loaded_key: Option<EntityKey>,
    /// Owner mapping the collection was loaded or last flushed with.
    pub loaded_persister: Option<Arc<EntityPersister>>,
    /// Owner mapping found during this flush; `None` when dereferenced.
    pub current_persister: Option<Arc<EntityPersister>>,
    pub reached: bool,
    pub processed: bool,
    /// Owner is read-only; leave the collection alone.
    pub ignore: bool,
    pub do_recreate: bool,
    pub do_remove: bool,
    pub do_update: bool,
}

impl CollectionEntry {
    /// Entry for a collection created in memory.
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            loaded_snapshot: None,
            loaded_key: None,
            loaded_persister: None,
            current_persister: None,
            reached: false,
            processed: false,
            ignore: false,
            do_recreate: false,
            do_remove: false,
            do_update: false,
        }
    }

    /// Entry for a collection loaded from the database.
    pub fn loaded(
        role: impl Into<String>,
        persister: Arc<EntityPersister>,
        key: EntityKey,
        snapshot: Option<Vec<EntityRef>>,
    ) -> Self {
        Self {
            loaded_snapshot: snapshot,
            loaded_key: Some(key),
            loaded_persister: Some(persister),
            ..Self::new(role)
        }
    }

    /// Reset per-flush flags.
    pub fn pre_flush(&mut self) {
        self.reached = false;
        self.processed = false;
        self.ignore = false;
        self.do_recreate = false;
        self.do_remove = false;
        self.do_update = false;
        self.current_persister = None;
    }

    pub fn needs_action(&self) -> bool {
        self.do_remove || self.do_update || self.do_recreate
    }
}

/// Sets the flushing flag for its lifetime.
#[derive(Debug)]
pub struct FlushingGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for FlushingGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Holds one level of cascade depth for its lifetime.
#[derive(Debug)]
pub struct CascadeLevelGuard {
    level: Arc<AtomicUsize>,
}

impl Drop for CascadeLevelGuard {
    fn drop(&mut self) {
        self.level.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The entity state tracker of one unit of work.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entries: HashMap<EntityRef, EntityEntry>,
    /// Entry insertion order.
    order: Vec<EntityRef>,
    by_key: HashMap<EntityKey, EntityRef>,
    collections: HashMap<CollectionRef, CollectionEntry>,
    collection_order: Vec<CollectionRef>,
    collections_by_key: HashMap<(String, EntityKey), CollectionRef>,
    /// Lazy collections awaiting initialization, batch-fetch lookahead.
    batch_fetch_queue: Vec<CollectionRef>,
    flushing: Arc<AtomicBool>,
    cascade_level: Arc<AtomicUsize>,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Create or replace the entry for `entity`.
    ///
    /// Fails with [`Error::NonUniqueObject`] when a different instance is
    /// already tracked under the same key and its entry is neither deleted
    /// nor gone.
    pub fn add_entry(
        &mut self,
        entity: &EntityRef,
        status: EntityStatus,
        loaded_state: Option<Vec<Value>>,
        id: Value,
        version: Option<i64>,
        lock_mode: LockMode,
        exists_in_database: bool,
        persister: Arc<EntityPersister>,
        disable_version_increment: bool,
    ) -> Result<EntityEntry> {
        let entry = EntityEntry {
            status,
            loaded_state,
            id,
            version,
            lock_mode,
            exists_in_database,
            persister,
            disable_version_increment,
        };

        if let Some(key) = entry.key() {
            if let Some(existing) = self.by_key.get(&key) {
                if existing != entity {
                    let blocking = self
                        .entries
                        .get(existing)
                        .is_some_and(|e| !e.status.is_deleted_or_gone());
                    if blocking {
                        return Err(Error::NonUniqueObject(Error::identity(
                            key.entity.clone(),
                            &key.id,
                        )));
                    }
                }
            }
            self.by_key.insert(key, entity.clone());
        }

        if self.entries.insert(entity.clone(), entry.clone()).is_none() {
            self.order.push(entity.clone());
        }
        tracing::trace!(entity = ?entity, status = ?entry.status, "Entry added");
        Ok(entry)
    }

    pub fn get_entry(&self, entity: &EntityRef) -> Option<&EntityEntry> {
        self.entries.get(entity)
    }

    pub fn get_entry_mut(&mut self, entity: &EntityRef) -> Option<&mut EntityEntry> {
        self.entries.get_mut(entity)
    }

    /// The instance tracked under `key`.
    pub fn get_entity(&self, key: &EntityKey) -> Option<&EntityRef> {
        self.by_key.get(key)
    }

    pub fn get_entry_by_key(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.by_key.get(key).and_then(|e| self.entries.get(e))
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.entries.contains_key(entity)
    }

    /// Change the status of a tracked entity.
    pub fn set_status(&mut self, entity: &EntityRef, status: EntityStatus) {
        if let Some(entry) = self.entries.get_mut(entity) {
            tracing::trace!(entity = ?entity, from = ?entry.status, to = ?status, "Status change");
            entry.status = status;
        }
    }

    /// Record the id assigned to an entity after its identity insert.
    pub fn set_id(&mut self, entity: &EntityRef, id: Value) -> Result<()> {
        let Some(entry) = self.entries.get_mut(entity) else {
            return Ok(());
        };
        if let Some(old) = entry.key() {
            if self.by_key.get(&old) == Some(entity) {
                self.by_key.remove(&old);
            }
        }
        entry.id = id;
        if let Some(key) = entry.key() {
            if let Some(existing) = self.by_key.get(&key) {
                if existing != entity {
                    return Err(Error::NonUniqueObject(Error::identity(
                        key.entity.clone(),
                        &key.id,
                    )));
                }
            }
            self.by_key.insert(key, entity.clone());
        }
        Ok(())
    }

    /// Stop tracking `entity` and its collections.
    pub fn remove_entry(&mut self, entity: &EntityRef) -> Option<EntityEntry> {
        let entry = self.entries.remove(entity)?;
        self.order.retain(|e| e != entity);
        if let Some(key) = entry.key() {
            if self.by_key.get(&key) == Some(entity) {
                self.by_key.remove(&key);
            }
        }
        let owned: Vec<CollectionRef> = self
            .collection_order
            .iter()
            .filter(|c| &c.owner == entity)
            .cloned()
            .collect();
        for collection in owned {
            self.remove_collection_entry(&collection);
        }
        Some(entry)
    }

    /// Stable snapshot of all entries in insertion order.
    ///
    /// Entries added after the snapshot is taken do not appear in it, and
    /// the context may be mutated freely while the snapshot is iterated.
    pub fn reentrant_safe_entity_entries(&self) -> Vec<(EntityRef, EntityEntry)> {
        self.order
            .iter()
            .filter_map(|e| self.entries.get(e).map(|entry| (e.clone(), entry.clone())))
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entries.len()
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    /// Track a collection.
    pub fn add_collection_entry(&mut self, collection: CollectionRef, entry: CollectionEntry) {
        if let Some(key) = &entry.loaded_key {
            self.collections_by_key
                .insert((entry.role.clone(), key.clone()), collection.clone());
        }
        if self.collections.insert(collection.clone(), entry).is_none() {
            self.collection_order.push(collection);
        }
    }

    pub fn get_collection_entry(&self, collection: &CollectionRef) -> Option<&CollectionEntry> {
        self.collections.get(collection)
    }

    pub fn get_collection_entry_mut(
        &mut self,
        collection: &CollectionRef,
    ) -> Option<&mut CollectionEntry> {
        self.collections.get_mut(collection)
    }

    /// Collection tracked under `role` for the owner `key`.
    pub fn get_collection_by_key(&self, role: &str, key: &EntityKey) -> Option<&CollectionRef> {
        self.collections_by_key.get(&(role.to_string(), key.clone()))
    }

    pub fn remove_collection_entry(&mut self, collection: &CollectionRef) -> Option<CollectionEntry> {
        let entry = self.collections.remove(collection)?;
        self.collection_order.retain(|c| c != collection);
        self.batch_fetch_queue.retain(|c| c != collection);
        if let Some(key) = &entry.loaded_key {
            let index_key = (entry.role.clone(), key.clone());
            if self.collections_by_key.get(&index_key) == Some(collection) {
                self.collections_by_key.remove(&index_key);
            }
        }
        Some(entry)
    }

    /// Visit a snapshot of the collection entries.
    ///
    /// With `only_persistent`, collections never synchronized with the
    /// database are skipped. The visitor may mutate the context, including
    /// adding collections; additions are not visited.
    pub fn for_each_collection_entry<F>(&mut self, only_persistent: bool, mut visitor: F) -> Result<()>
    where
        F: FnMut(&mut Self, &CollectionRef, &CollectionEntry) -> Result<()>,
    {
        let snapshot: Vec<(CollectionRef, CollectionEntry)> = self
            .collection_order
            .iter()
            .filter_map(|c| self.collections.get(c).map(|e| (c.clone(), e.clone())))
            .filter(|(_, e)| !only_persistent || e.loaded_persister.is_some())
            .collect();
        for (collection, entry) in &snapshot {
            visitor(self, collection, entry)?;
        }
        Ok(())
    }

    /// Snapshot of collection handles in insertion order.
    pub fn collection_refs(&self) -> Vec<CollectionRef> {
        self.collection_order.clone()
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    /// Queue a lazy collection for batch initialization.
    pub fn add_batch_loadable_collection(&mut self, collection: CollectionRef) {
        if !self.batch_fetch_queue.contains(&collection) {
            self.batch_fetch_queue.push(collection);
        }
    }

    pub fn remove_batch_loadable_collection(&mut self, collection: &CollectionRef) {
        self.batch_fetch_queue.retain(|c| c != collection);
    }

    pub fn batch_loadable_collections(&self) -> &[CollectionRef] {
        &self.batch_fetch_queue
    }

    // ------------------------------------------------------------------
    // Scoped flags
    // ------------------------------------------------------------------

    /// Set the flushing flag until the guard is dropped.
    pub fn flushing_guard(&self) -> FlushingGuard {
        self.flushing.store(true, Ordering::Release);
        FlushingGuard {
            flag: Arc::clone(&self.flushing),
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Enter one cascade level until the guard is dropped.
    pub fn cascade_level_guard(&self) -> CascadeLevelGuard {
        self.cascade_level.fetch_add(1, Ordering::AcqRel);
        CascadeLevelGuard {
            level: Arc::clone(&self.cascade_level),
        }
    }

    pub fn cascade_level(&self) -> usize {
        self.cascade_level.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Post flush
    // ------------------------------------------------------------------

    /// Bookkeeping after a successful flush.
    ///
    /// Gone entries are dropped. The collection key index and batch-fetch
    /// queue are cleared and the index rebuilt from surviving collections.
    /// Collections dereferenced during the flush are detached; the others
    /// take their current state as the new loaded state.
    pub fn post_flush(&mut self) {
        let gone: Vec<EntityRef> = self
            .order
            .iter()
            .filter(|e| {
                self.entries
                    .get(*e)
                    .is_some_and(|entry| entry.status == EntityStatus::Gone)
            })
            .cloned()
            .collect();
        for entity in &gone {
            self.remove_entry(entity);
        }

        self.collections_by_key.clear();
        self.batch_fetch_queue.clear();

        let mut detached = Vec::new();
        for collection in &self.collection_order {
            let Some(entry) = self.collections.get_mut(collection) else {
                continue;
            };
            match entry.current_persister.take() {
                None => detached.push(collection.clone()),
                Some(persister) => {
                    let owner_key = self
                        .entries
                        .get(&collection.owner)
                        .and_then(EntityEntry::key);
                    let bag = collection.owner.collection(&collection.property);
                    if let Some(bag) = bag.filter(|b| b.is_initialized()) {
                        entry.loaded_snapshot = Some(bag.elements().to_vec());
                    }
                    entry.loaded_persister = Some(persister);
                    entry.loaded_key = owner_key.clone();
                    entry.reached = false;
                    entry.processed = false;
                    entry.do_recreate = false;
                    entry.do_remove = false;
                    entry.do_update = false;
                    if let Some(key) = owner_key {
                        self.collections_by_key
                            .insert((entry.role.clone(), key), collection.clone());
                    }
                }
            }
        }
        for collection in &detached {
            self.collections.remove(collection);
        }
        self.collection_order.retain(|c| !detached.contains(c));

        tracing::debug!(
            gone = gone.len(),
            detached_collections = detached.len(),
            entities = self.entries.len(),
            collections = self.collections.len(),
            "Post-flush bookkeeping complete"
        );
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.by_key.clear();
        self.collections.clear();
        self.collection_order.clear();
        self.collections_by_key.clear();
        self.batch_fetch_queue.clear();
    }
}
