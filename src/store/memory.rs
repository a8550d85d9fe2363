//! In-process record store
//!
//! Transactions buffer their writes and apply them under the store lock at
//! commit, after checking that every touched row still has the version the
//! transaction first saw.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{DataStore, RecordWrite, ScanFilter, StoreReader, StoreTransaction, StoredRecord};
use crate::errors::{RepoError, RepoResult};

type RowKey = (String, String);

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<RowKey, StoredRecord>,
    sequences: HashMap<String, i64>,
}

impl MemoryState {
    fn next_sequence_value(&mut self, name: &str) -> i64 {
        let value = self.sequences.entry(name.to_string()).or_insert(0);
        *value += 1;
        *value
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed rows of all types
    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn row_key(type_name: &str, key: &str) -> RowKey {
    (type_name.to_string(), key.to_string())
}

#[async_trait]
impl StoreReader for MemoryStore {
    async fn load(&self, type_name: &str, key: &str) -> RepoResult<Option<StoredRecord>> {
        let state = self.state.read().await;
        Ok(state.records.get(&row_key(type_name, key)).cloned())
    }

    async fn scan(&self, filter: &ScanFilter) -> RepoResult<Vec<StoredRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    async fn next_sequence_value(&self, name: &str) -> RepoResult<i64> {
        Ok(self.state.write().await.next_sequence_value(name))
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    fn as_reader(&self) -> &dyn StoreReader {
        self
    }

    async fn begin(&self) -> RepoResult<Box<dyn StoreTransaction>> {
        debug!("Beginning in-memory transaction");
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            pending: BTreeMap::new(),
        }))
    }
}

#[derive(Clone, Debug)]
struct PendingRow {
    /// Committed version when the transaction first touched the row
    base_version: Option<i64>,
    value: Option<StoredRecord>,
}

pub struct MemoryTransaction {
    state: Arc<RwLock<MemoryState>>,
    pending: BTreeMap<RowKey, PendingRow>,
}

impl MemoryTransaction {
    fn current<'a>(
        pending: &'a BTreeMap<RowKey, PendingRow>,
        committed: &'a BTreeMap<RowKey, StoredRecord>,
        key: &RowKey,
    ) -> Option<&'a StoredRecord> {
        match pending.get(key) {
            Some(row) => row.value.as_ref(),
            None => committed.get(key),
        }
    }
}

#[async_trait]
impl StoreReader for MemoryTransaction {
    async fn load(&self, type_name: &str, key: &str) -> RepoResult<Option<StoredRecord>> {
        let state = self.state.read().await;
        let key = row_key(type_name, key);
        Ok(Self::current(&self.pending, &state.records, &key).cloned())
    }

    async fn scan(&self, filter: &ScanFilter) -> RepoResult<Vec<StoredRecord>> {
        let state = self.state.read().await;
        let mut rows: BTreeMap<&RowKey, &StoredRecord> = state
            .records
            .iter()
            .filter(|(key, _)| !self.pending.contains_key(*key))
            .collect();
        for (key, row) in &self.pending {
            if let Some(value) = &row.value {
                rows.insert(key, value);
            }
        }
        Ok(rows
            .into_values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    async fn next_sequence_value(&self, name: &str) -> RepoResult<i64> {
        // sequences are not transactional
        Ok(self.state.write().await.next_sequence_value(name))
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn as_reader(&self) -> &dyn StoreReader {
        self
    }

    async fn write(&mut self, writes: &[RecordWrite]) -> RepoResult<()> {
        let state = self.state.read().await;
        let mut pending = self.pending.clone();

        for write in writes {
            let key = row_key(write.type_name(), write.key());
            let current_version =
                Self::current(&pending, &state.records, &key).map(|record| record.version);

            let value = match write {
                RecordWrite::Insert(record) => {
                    if current_version.is_some() {
                        warn!(entity = %key.0, key = %key.1, "Insert of an existing row");
                        return Err(RepoError::conflict(&key.0, &key.1));
                    }
                    Some(StoredRecord {
                        version: 1,
                        ..record.clone()
                    })
                }
                RecordWrite::Update {
                    record,
                    expected_version,
                } => {
                    if current_version != Some(*expected_version) {
                        warn!(entity = %key.0, key = %key.1, "Stale update rejected");
                        return Err(RepoError::conflict(&key.0, &key.1));
                    }
                    Some(StoredRecord {
                        version: expected_version + 1,
                        ..record.clone()
                    })
                }
                RecordWrite::Delete {
                    expected_version, ..
                } => {
                    if current_version != Some(*expected_version) {
                        warn!(entity = %key.0, key = %key.1, "Stale delete rejected");
                        return Err(RepoError::conflict(&key.0, &key.1));
                    }
                    None
                }
            };

            let base_version = match pending.get(&key) {
                Some(row) => row.base_version,
                None => state.records.get(&key).map(|record| record.version),
            };
            pending.insert(key, PendingRow { base_version, value });
        }

        drop(state);
        self.pending = pending;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> RepoResult<()> {
        let MemoryTransaction { state, pending } = *self;
        let mut state = state.write().await;

        for (key, row) in &pending {
            let committed = state.records.get(key).map(|record| record.version);
            if committed != row.base_version {
                warn!(entity = %key.0, key = %key.1, "Row changed by another transaction");
                return Err(RepoError::conflict(&key.0, &key.1));
            }
        }

        let count = pending.len();
        for (key, row) in pending {
            match row.value {
                Some(record) => {
                    state.records.insert(key, record);
                }
                None => {
                    state.records.remove(&key);
                }
            }
        }
        debug!(rows = count, "Committed in-memory transaction");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> RepoResult<()> {
        debug!(rows = self.pending.len(), "Rolled back in-memory transaction");
        Ok(())
    }
}
