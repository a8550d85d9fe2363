//! Transactional record store contract
//!
//! The repository persists entities as JSON documents keyed by
//! `(type_name, key)`. A store offers keyed lookup, filtered scans, a sequence
//! generator and atomic batched writes guarded by row versions. Inserted rows
//! start at version 1 and every update or delete names the version it expects
//! to replace; a mismatch is a [`RepoError::ConcurrencyConflict`].

pub mod memory;
pub mod sea;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::{StoreBackend, StoreConfig};
use crate::errors::RepoResult;

pub use memory::MemoryStore;
pub use sea::SeaOrmStore;

/// One persisted entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub type_name: String,
    pub key: String,
    pub tenant_id: Option<Uuid>,
    pub is_deleted: bool,
    pub version: i64,
    pub data: serde_json::Value,
}

/// Row selection pushed down to the store
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub type_name: String,
    /// Restrict to one tenant; `None` scans all tenants
    pub tenant_id: Option<Uuid>,
    pub include_deleted: bool,
}

impl ScanFilter {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    pub fn tenant(mut self, tenant_id: Option<Uuid>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn include_deleted(mut self, include_deleted: bool) -> Self {
        self.include_deleted = include_deleted;
        self
    }

    pub fn matches(&self, record: &StoredRecord) -> bool {
        record.type_name == self.type_name
            && (self.include_deleted || !record.is_deleted)
            && self.tenant_id.map_or(true, |tenant| record.tenant_id == Some(tenant))
    }
}

/// A single change in a write batch
#[derive(Clone, Debug, PartialEq)]
pub enum RecordWrite {
    Insert(StoredRecord),
    Update {
        record: StoredRecord,
        expected_version: i64,
    },
    Delete {
        type_name: String,
        key: String,
        expected_version: i64,
    },
}

impl RecordWrite {
    pub fn type_name(&self) -> &str {
        match self {
            RecordWrite::Insert(record) | RecordWrite::Update { record, .. } => &record.type_name,
            RecordWrite::Delete { type_name, .. } => type_name,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            RecordWrite::Insert(record) | RecordWrite::Update { record, .. } => &record.key,
            RecordWrite::Delete { key, .. } => key,
        }
    }

    /// Version stored after the write, `None` for deletes
    pub fn resulting_version(&self) -> Option<i64> {
        match self {
            RecordWrite::Insert(_) => Some(1),
            RecordWrite::Update { expected_version, .. } => Some(expected_version + 1),
            RecordWrite::Delete { .. } => None,
        }
    }
}

#[async_trait]
pub trait StoreReader: Send + Sync {
    async fn load(&self, type_name: &str, key: &str) -> RepoResult<Option<StoredRecord>>;

    async fn scan(&self, filter: &ScanFilter) -> RepoResult<Vec<StoredRecord>>;

    async fn exists(&self, type_name: &str, key: &str) -> RepoResult<bool> {
        Ok(self.load(type_name, key).await?.is_some())
    }

    /// Next value of a named sequence, starting at 1
    async fn next_sequence_value(&self, name: &str) -> RepoResult<i64>;
}

/// An open store transaction
///
/// Reads see the transaction's own writes. Dropping a transaction without
/// committing discards its writes.
#[async_trait]
pub trait StoreTransaction: StoreReader {
    fn as_reader(&self) -> &dyn StoreReader;

    /// Apply a batch atomically; nothing is applied if any write conflicts
    async fn write(&mut self, writes: &[RecordWrite]) -> RepoResult<()>;

    async fn commit(self: Box<Self>) -> RepoResult<()>;

    async fn rollback(self: Box<Self>) -> RepoResult<()>;
}

#[async_trait]
pub trait DataStore: StoreReader {
    fn as_reader(&self) -> &dyn StoreReader;

    /// Begin a read-committed transaction where the backend supports it
    async fn begin(&self) -> RepoResult<Box<dyn StoreTransaction>>;

    /// Apply a batch in its own transaction
    async fn apply(&self, writes: &[RecordWrite]) -> RepoResult<()> {
        let mut txn = self.begin().await?;
        if let Err(e) = txn.write(writes).await {
            txn.rollback().await?;
            return Err(e);
        }
        txn.commit().await
    }
}

/// Build the store selected by the configuration
pub async fn from_config(config: &StoreConfig) -> RepoResult<Arc<dyn DataStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory record store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Sqlite => {
            let store = SeaOrmStore::connect(config).await?;
            info!("Using SQLite record store at {}", config.database_url);
            Ok(Arc::new(store))
        }
    }
}
