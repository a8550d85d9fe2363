//! Change tracking over a [`DataStore`]
//!
//! The unit of work keeps one tracked instance per `(type, key)`, remembers
//! the version each row was loaded at and collects field-level change marks.
//! `save_changes` turns the tracked set into one atomic write batch.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::entity::{Entity, EntityDescriptor, EntityKey};
use crate::errors::{RepoError, RepoResult};
use crate::store::{DataStore, RecordWrite, StoreReader, StoreTransaction, StoredRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Added,
    Unchanged,
    Modified,
    Deleted,
}

/// Where the item of a masked update comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemSource {
    /// A separate, incoming copy of the entity
    Detached,
    /// The tracked instance itself, edited in place
    InPlace,
}

#[derive(Clone)]
struct Entry<E> {
    current: E,
    /// Last persisted value, `None` while added
    original: Option<E>,
    version: Option<i64>,
    deleted: bool,
    marked: BTreeSet<&'static str>,
    nested: bool,
}

struct EntitySet<E: Entity> {
    descriptor: Arc<EntityDescriptor<E>>,
    entries: BTreeMap<E::Key, Entry<E>>,
}

impl<E: Entity> Clone for EntitySet<E> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl<E: Entity> EntitySet<E> {
    fn state_of(&self, entry: &Entry<E>) -> EntryState {
        match &entry.original {
            None => EntryState::Added,
            Some(_) if entry.deleted => EntryState::Deleted,
            Some(original) => {
                if entry.marked.is_empty() && self.descriptor.changed_fields(original, &entry.current).is_empty() {
                    EntryState::Unchanged
                } else {
                    EntryState::Modified
                }
            }
        }
    }

    fn to_record(&self, key: &E::Key, entity: &E) -> RepoResult<StoredRecord> {
        let persisted = self.descriptor.persisted_form(entity);
        Ok(StoredRecord {
            type_name: E::TYPE_NAME.to_string(),
            key: key.to_storage_key(),
            tenant_id: self
                .descriptor
                .tenant_accessor()
                .and_then(|tenant| tenant.get(entity)),
            is_deleted: self.descriptor.is_deleted(entity),
            version: 0,
            data: serde_json::to_value(&persisted)?,
        })
    }
}

trait ErasedSet: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn boxed_clone(&self) -> Box<dyn ErasedSet>;

    fn pending_writes(&self) -> RepoResult<Vec<RecordWrite>>;

    fn accept_changes(&mut self);

    fn reject_changes(&mut self);

    fn has_changes(&self) -> bool;
}

impl<E: Entity> ErasedSet for EntitySet<E> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn boxed_clone(&self) -> Box<dyn ErasedSet> {
        Box::new(self.clone())
    }

    fn pending_writes(&self) -> RepoResult<Vec<RecordWrite>> {
        let mut writes = Vec::new();
        for (key, entry) in &self.entries {
            let version = entry.version.unwrap_or(0);
            match self.state_of(entry) {
                EntryState::Added => writes.push(RecordWrite::Insert(self.to_record(key, &entry.current)?)),
                EntryState::Modified => writes.push(RecordWrite::Update {
                    record: self.to_record(key, &entry.current)?,
                    expected_version: version,
                }),
                EntryState::Deleted => writes.push(RecordWrite::Delete {
                    type_name: E::TYPE_NAME.to_string(),
                    key: key.to_storage_key(),
                    expected_version: version,
                }),
                EntryState::Unchanged => {}
            }
        }
        Ok(writes)
    }

    fn accept_changes(&mut self) {
        let states: Vec<(E::Key, EntryState)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), self.state_of(entry)))
            .collect();

        for (key, state) in states {
            match state {
                EntryState::Deleted => {
                    self.entries.remove(&key);
                }
                EntryState::Unchanged => {}
                EntryState::Added | EntryState::Modified => {
                    if let Some(entry) = self.entries.get_mut(&key) {
                        entry.version = Some(entry.version.map_or(1, |version| version + 1));
                        entry.original = Some(entry.current.clone());
                        entry.marked.clear();
                        entry.nested = false;
                    }
                }
            }
        }
    }

    fn reject_changes(&mut self) {
        self.entries.retain(|_, entry| entry.original.is_some());
        for entry in self.entries.values_mut() {
            if let Some(original) = &entry.original {
                entry.current = original.clone();
            }
            entry.deleted = false;
            entry.marked.clear();
            entry.nested = false;
        }
    }

    fn has_changes(&self) -> bool {
        self.entries
            .values()
            .any(|entry| self.state_of(entry) != EntryState::Unchanged)
    }
}

/// Copy of the tracked state taken by [`UnitOfWork::checkpoint`]
pub struct Checkpoint {
    sets: HashMap<TypeId, Box<dyn ErasedSet>>,
}

/// Tracked entities plus the optional open transaction
pub struct UnitOfWork {
    store: Arc<dyn DataStore>,
    txn: Option<Box<dyn StoreTransaction>>,
    sets: HashMap<TypeId, Box<dyn ErasedSet>>,
}

impl UnitOfWork {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            txn: None,
            sets: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    /// Reads go through the open transaction when there is one
    pub fn reader(&self) -> &dyn StoreReader {
        match &self.txn {
            Some(txn) => txn.as_reader(),
            None => self.store.as_reader(),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    pub async fn begin(&mut self) -> RepoResult<()> {
        if self.txn.is_some() {
            return Err(RepoError::configuration("a transaction is already open"));
        }
        self.txn = Some(self.store.begin().await?);
        Ok(())
    }

    pub async fn commit(&mut self) -> RepoResult<()> {
        match self.txn.take() {
            Some(txn) => txn.commit().await,
            None => Err(RepoError::configuration("no open transaction to commit")),
        }
    }

    /// Roll back the open transaction, if any
    pub async fn rollback(&mut self) -> RepoResult<()> {
        match self.txn.take() {
            Some(txn) => txn.rollback().await,
            None => Ok(()),
        }
    }

    fn set<E: Entity>(&self) -> Option<&EntitySet<E>> {
        self.sets
            .get(&TypeId::of::<E>())
            .and_then(|set| set.as_any().downcast_ref::<EntitySet<E>>())
    }

    fn set_mut<E: Entity>(&mut self) -> Option<&mut EntitySet<E>> {
        self.sets
            .get_mut(&TypeId::of::<E>())
            .and_then(|set| set.as_any_mut().downcast_mut::<EntitySet<E>>())
    }

    fn set_or_create<E: Entity>(&mut self, descriptor: &Arc<EntityDescriptor<E>>) -> RepoResult<&mut EntitySet<E>> {
        let descriptor = descriptor.clone();
        self.sets
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                Box::new(EntitySet::<E> {
                    descriptor,
                    entries: BTreeMap::new(),
                })
            })
            .as_any_mut()
            .downcast_mut::<EntitySet<E>>()
            .ok_or_else(|| RepoError::configuration(format!("tracked set for {} has the wrong type", E::TYPE_NAME)))
    }

    fn entry<E: Entity>(&self, key: &E::Key) -> Option<&Entry<E>> {
        self.set::<E>().and_then(|set| set.entries.get(key))
    }

    fn entry_mut<E: Entity>(&mut self, key: &E::Key) -> RepoResult<&mut Entry<E>> {
        self.set_mut::<E>()
            .and_then(|set| set.entries.get_mut(key))
            .filter(|entry| !entry.deleted)
            .ok_or_else(|| RepoError::not_found(E::TYPE_NAME, key.to_storage_key()))
    }

    /// Tracked instance for a key, `None` when untracked or removed
    pub fn tracked<E: Entity>(&self, key: &E::Key) -> Option<&E> {
        self.entry::<E>(key)
            .filter(|entry| !entry.deleted)
            .map(|entry| &entry.current)
    }

    pub fn tracked_mut<E: Entity>(&mut self, key: &E::Key) -> Option<&mut E> {
        self.entry_mut::<E>(key).ok().map(|entry| &mut entry.current)
    }

    pub fn is_tracked<E: Entity>(&self, key: &E::Key) -> bool {
        self.entry::<E>(key).is_some()
    }

    /// True when the row was removed in this unit of work
    pub fn is_removed<E: Entity>(&self, key: &E::Key) -> bool {
        self.entry::<E>(key).map_or(false, |entry| entry.deleted)
    }

    pub fn entry_state<E: Entity>(&self, key: &E::Key) -> Option<EntryState> {
        let set = self.set::<E>()?;
        set.entries.get(key).map(|entry| set.state_of(entry))
    }

    /// Fields marked modified plus fields whose value differs from the
    /// last persisted value
    pub fn modified_fields<E: Entity>(&self, key: &E::Key) -> Vec<&'static str> {
        let Some(set) = self.set::<E>() else {
            return Vec::new();
        };
        let Some(entry) = set.entries.get(key) else {
            return Vec::new();
        };
        let mut fields = entry.marked.clone();
        if let Some(original) = &entry.original {
            fields.extend(set.descriptor.changed_fields(original, &entry.current));
        }
        fields.into_iter().collect()
    }

    /// True when the entity was created as part of its parent's update
    pub fn is_nested<E: Entity>(&self, key: &E::Key) -> bool {
        self.entry::<E>(key).map_or(false, |entry| entry.nested)
    }

    /// All tracked, not removed instances of a type
    pub fn local<E: Entity>(&self) -> Vec<&E> {
        self.set::<E>()
            .map(|set| {
                set.entries
                    .values()
                    .filter(|entry| !entry.deleted)
                    .map(|entry| &entry.current)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Start tracking a row loaded from the store
    ///
    /// An already tracked instance wins over the loaded value.
    pub fn attach<E: Entity>(
        &mut self,
        descriptor: &Arc<EntityDescriptor<E>>,
        entity: E,
        version: i64,
    ) -> RepoResult<&E> {
        let key = descriptor.key_of(&entity);
        let set = self.set_or_create(descriptor)?;
        let entry = set.entries.entry(key).or_insert_with(|| Entry {
            original: Some(entity.clone()),
            current: entity,
            version: Some(version),
            deleted: false,
            marked: BTreeSet::new(),
            nested: false,
        });
        Ok(&entry.current)
    }

    /// Start tracking a new entity
    pub fn add<E: Entity>(&mut self, descriptor: &Arc<EntityDescriptor<E>>, entity: E) -> RepoResult<()> {
        let key = descriptor.key_of(&entity);
        let set = self.set_or_create(descriptor)?;
        if set.entries.contains_key(&key) {
            return Err(RepoError::invalid_data(format!(
                "{} '{}' is already tracked",
                E::TYPE_NAME,
                key.to_storage_key()
            )));
        }
        debug!(entity = E::TYPE_NAME, key = %key.to_storage_key(), "Tracking added entity");
        set.entries.insert(
            key,
            Entry {
                current: entity,
                original: None,
                version: None,
                deleted: false,
                marked: BTreeSet::new(),
                nested: false,
            },
        );
        Ok(())
    }

    /// Replace the tracked value
    pub fn replace<E: Entity>(&mut self, key: &E::Key, entity: E) -> RepoResult<()> {
        self.entry_mut::<E>(key)?.current = entity;
        Ok(())
    }

    pub fn mark_modified<E: Entity>(&mut self, key: &E::Key, field: &'static str) -> RepoResult<()> {
        self.entry_mut::<E>(key)?.marked.insert(field);
        Ok(())
    }

    pub fn mark_all_modified<E: Entity>(&mut self, key: &E::Key) -> RepoResult<()> {
        let set = self
            .set_mut::<E>()
            .ok_or_else(|| RepoError::not_found(E::TYPE_NAME, key.to_storage_key()))?;
        let names: Vec<&'static str> = set.descriptor.fields().iter().map(|field| field.name()).collect();
        let entry = set
            .entries
            .get_mut(key)
            .ok_or_else(|| RepoError::not_found(E::TYPE_NAME, key.to_storage_key()))?;
        entry.marked.extend(names);
        Ok(())
    }

    pub fn set_nested<E: Entity>(&mut self, key: &E::Key) -> RepoResult<()> {
        self.entry_mut::<E>(key)?.nested = true;
        Ok(())
    }

    /// Schedule a physical delete; an added entity is simply forgotten
    pub fn remove<E: Entity>(&mut self, key: &E::Key) -> RepoResult<()> {
        let Some(set) = self.set_mut::<E>() else {
            return Ok(());
        };
        let added = match set.entries.get_mut(key) {
            Some(entry) if entry.original.is_none() => true,
            Some(entry) => {
                entry.deleted = true;
                false
            }
            None => false,
        };
        if added {
            set.entries.remove(key);
        }
        Ok(())
    }

    pub fn has_changes(&self) -> bool {
        self.sets.values().any(|set| set.has_changes())
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            sets: self
                .sets
                .iter()
                .map(|(type_id, set)| (*type_id, set.boxed_clone()))
                .collect(),
        }
    }

    /// Put the tracked state back to `checkpoint`; the open transaction is kept
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.sets = checkpoint.sets;
    }

    /// Persist every tracked change as one batch
    ///
    /// Returns the number of rows written. A concurrency conflict on a row
    /// that no longer exists is reported as not found.
    pub async fn save_changes(&mut self) -> RepoResult<usize> {
        let mut writes = Vec::new();
        for set in self.sets.values() {
            writes.extend(set.pending_writes()?);
        }
        if writes.is_empty() {
            debug!("No changes to save");
            return Ok(0);
        }

        let result = match self.txn.as_mut() {
            Some(txn) => txn.write(&writes).await,
            None => self.store.apply(&writes).await,
        };
        if let Err(e) = result {
            return Err(self.recheck_conflict(e).await);
        }

        for set in self.sets.values_mut() {
            set.accept_changes();
        }
        info!(rows = writes.len(), "Saved changes");
        Ok(writes.len())
    }

    async fn recheck_conflict(&self, error: RepoError) -> RepoError {
        match error {
            RepoError::ConcurrencyConflict { entity, key } => match self.reader().exists(&entity, &key).await {
                Ok(false) => {
                    warn!(entity = %entity, key = %key, "Conflicting row no longer exists");
                    RepoError::not_found(entity, key)
                }
                Ok(true) => RepoError::ConcurrencyConflict { entity, key },
                Err(e) => e,
            },
            other => other,
        }
    }

    /// Drop added entities and restore everything else to its persisted value
    pub fn reject_changes(&mut self) {
        for set in self.sets.values_mut() {
            set.reject_changes();
        }
    }
}

/// Shareable handle to a unit of work
#[derive(Clone)]
pub struct DbContext {
    inner: Arc<Mutex<UnitOfWork>>,
}

impl DbContext {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(UnitOfWork::new(store))),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, UnitOfWork> {
        self.inner.lock().await
    }

    pub fn same_as(&self, other: &DbContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn save_changes(&self) -> RepoResult<usize> {
        self.lock().await.save_changes().await
    }

    /// Run `work` inside a store transaction
    ///
    /// Changes are saved and committed when `work` succeeds. On any error the
    /// transaction is rolled back, tracked changes are rejected and the error
    /// is returned. `work` must not hold the lock across its own return.
    pub async fn transaction<F, Fut, T>(&self, work: F) -> RepoResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RepoResult<T>>,
    {
        self.lock().await.begin().await?;
        info!("Transaction started");

        let outcome = match work().await {
            Ok(value) => {
                let mut uow = self.lock().await;
                match uow.save_changes().await {
                    Ok(_) => uow.commit().await.map(|_| value),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(value) => {
                info!("Transaction committed");
                Ok(value)
            }
            Err(e) => {
                let mut uow = self.lock().await;
                if let Err(rollback_error) = uow.rollback().await {
                    warn!("Rollback failed: {}", rollback_error);
                }
                uow.reject_changes();
                warn!("Transaction rolled back: {}", e);
                Err(e)
            }
        }
    }
}
