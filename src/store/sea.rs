//! sea-orm backed record store
//!
//! Each entity is one row of the `records` table holding its JSON document.
//! Tenant and deleted filters run in SQL. Version checks are part of the
//! `UPDATE`/`DELETE` condition, so a stale write affects no rows.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection,
    DatabaseTransaction, EntityTrait, IsolationLevel, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DataStore, RecordWrite, ScanFilter, StoreReader, StoreTransaction, StoredRecord};
use crate::config::StoreConfig;
use crate::database::connection::establish_connection;
use crate::database::entities::{records, sequences};
use crate::errors::{RepoError, RepoResult};

#[derive(Clone, Debug)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Connect and bring the schema up to date
    pub async fn connect(config: &StoreConfig) -> RepoResult<Self> {
        let db = establish_connection(config).await?;
        crate::database::migrate_database(&db, crate::database::MigrateDirection::Up).await?;
        Ok(Self::new(db))
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn to_record(model: records::Model) -> RepoResult<StoredRecord> {
    let tenant_id = match model.tenant_id {
        Some(raw) => Some(Uuid::parse_str(&raw).map_err(|e| {
            RepoError::invalid_data(format!(
                "{} '{}' has a malformed tenant id: {}",
                model.type_name, model.record_key, e
            ))
        })?),
        None => None,
    };
    Ok(StoredRecord {
        tenant_id,
        is_deleted: model.is_deleted,
        version: model.version,
        data: serde_json::from_str(&model.data)?,
        type_name: model.type_name,
        key: model.record_key,
    })
}

async fn load_record<C: ConnectionTrait>(
    conn: &C,
    type_name: &str,
    key: &str,
) -> RepoResult<Option<StoredRecord>> {
    records::Entity::find_by_id((type_name.to_string(), key.to_string()))
        .one(conn)
        .await?
        .map(to_record)
        .transpose()
}

async fn scan_records<C: ConnectionTrait>(conn: &C, filter: &ScanFilter) -> RepoResult<Vec<StoredRecord>> {
    let mut query = records::Entity::find().filter(records::Column::TypeName.eq(filter.type_name.as_str()));
    if let Some(tenant) = filter.tenant_id {
        query = query.filter(records::Column::TenantId.eq(tenant.hyphenated().to_string()));
    }
    if !filter.include_deleted {
        query = query.filter(records::Column::IsDeleted.eq(false));
    }

    query
        .order_by_asc(records::Column::RecordKey)
        .all(conn)
        .await?
        .into_iter()
        .map(to_record)
        .collect()
}

async fn next_sequence<C: ConnectionTrait>(conn: &C, name: &str) -> RepoResult<i64> {
    let value = match sequences::Entity::find_by_id(name.to_string()).one(conn).await? {
        Some(row) => {
            let next = row.value + 1;
            let mut active: sequences::ActiveModel = row.into();
            active.value = Set(next);
            active.update(conn).await?;
            next
        }
        None => {
            sequences::ActiveModel {
                name: Set(name.to_string()),
                value: Set(1),
            }
            .insert(conn)
            .await?;
            1
        }
    };
    debug!(sequence = name, value, "Advanced sequence");
    Ok(value)
}

fn tenant_column(record: &StoredRecord) -> Option<String> {
    record.tenant_id.map(|tenant| tenant.hyphenated().to_string())
}

async fn write_records<C: ConnectionTrait>(conn: &C, writes: &[RecordWrite]) -> RepoResult<()> {
    let now = Utc::now();
    for write in writes {
        match write {
            RecordWrite::Insert(record) => {
                if load_record(conn, &record.type_name, &record.key).await?.is_some() {
                    warn!(entity = %record.type_name, key = %record.key, "Insert of an existing row");
                    return Err(RepoError::conflict(&record.type_name, &record.key));
                }
                records::ActiveModel {
                    type_name: Set(record.type_name.clone()),
                    record_key: Set(record.key.clone()),
                    tenant_id: Set(tenant_column(record)),
                    is_deleted: Set(record.is_deleted),
                    version: Set(1),
                    data: Set(serde_json::to_string(&record.data)?),
                    updated_at: Set(now),
                }
                .insert(conn)
                .await?;
            }
            RecordWrite::Update {
                record,
                expected_version,
            } => {
                let result = records::Entity::update_many()
                    .col_expr(records::Column::TenantId, Expr::value(tenant_column(record)))
                    .col_expr(records::Column::IsDeleted, Expr::value(record.is_deleted))
                    .col_expr(records::Column::Version, Expr::value(expected_version + 1))
                    .col_expr(
                        records::Column::Data,
                        Expr::value(serde_json::to_string(&record.data)?),
                    )
                    .col_expr(records::Column::UpdatedAt, Expr::value(now))
                    .filter(records::Column::TypeName.eq(record.type_name.as_str()))
                    .filter(records::Column::RecordKey.eq(record.key.as_str()))
                    .filter(records::Column::Version.eq(*expected_version))
                    .exec(conn)
                    .await?;
                if result.rows_affected == 0 {
                    warn!(entity = %record.type_name, key = %record.key, "Stale update rejected");
                    return Err(RepoError::conflict(&record.type_name, &record.key));
                }
            }
            RecordWrite::Delete {
                type_name,
                key,
                expected_version,
            } => {
                let result = records::Entity::delete_many()
                    .filter(records::Column::TypeName.eq(type_name.as_str()))
                    .filter(records::Column::RecordKey.eq(key.as_str()))
                    .filter(records::Column::Version.eq(*expected_version))
                    .exec(conn)
                    .await?;
                if result.rows_affected == 0 {
                    warn!(entity = %type_name, key = %key, "Stale delete rejected");
                    return Err(RepoError::conflict(type_name, key));
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl StoreReader for SeaOrmStore {
    async fn load(&self, type_name: &str, key: &str) -> RepoResult<Option<StoredRecord>> {
        load_record(&self.db, type_name, key).await
    }

    async fn scan(&self, filter: &ScanFilter) -> RepoResult<Vec<StoredRecord>> {
        scan_records(&self.db, filter).await
    }

    async fn next_sequence_value(&self, name: &str) -> RepoResult<i64> {
        let txn = self.db.begin().await?;
        let value = next_sequence(&txn, name).await?;
        txn.commit().await?;
        Ok(value)
    }
}

#[async_trait]
impl DataStore for SeaOrmStore {
    fn as_reader(&self) -> &dyn StoreReader {
        self
    }

    async fn begin(&self) -> RepoResult<Box<dyn StoreTransaction>> {
        // SQLite transactions are serializable and reject an isolation level
        let txn = match self.db.get_database_backend() {
            DatabaseBackend::Sqlite => self.db.begin().await?,
            _ => {
                self.db
                    .begin_with_config(Some(IsolationLevel::ReadCommitted), None)
                    .await?
            }
        };
        debug!("Beginning database transaction");
        Ok(Box::new(SeaOrmTransaction { txn }))
    }
}

pub struct SeaOrmTransaction {
    txn: DatabaseTransaction,
}

#[async_trait]
impl StoreReader for SeaOrmTransaction {
    async fn load(&self, type_name: &str, key: &str) -> RepoResult<Option<StoredRecord>> {
        load_record(&self.txn, type_name, key).await
    }

    async fn scan(&self, filter: &ScanFilter) -> RepoResult<Vec<StoredRecord>> {
        scan_records(&self.txn, filter).await
    }

    async fn next_sequence_value(&self, name: &str) -> RepoResult<i64> {
        next_sequence(&self.txn, name).await
    }
}

#[async_trait]
impl StoreTransaction for SeaOrmTransaction {
    fn as_reader(&self) -> &dyn StoreReader {
        self
    }

    async fn write(&mut self, writes: &[RecordWrite]) -> RepoResult<()> {
        // a savepoint keeps a failed batch from leaving partial writes behind
        let savepoint = self.txn.begin().await?;
        match write_records(&savepoint, writes).await {
            Ok(()) => {
                savepoint.commit().await?;
                Ok(())
            }
            Err(e) => {
                savepoint.rollback().await?;
                Err(e)
            }
        }
    }

    async fn commit(self: Box<Self>) -> RepoResult<()> {
        self.txn.commit().await?;
        debug!("Committed database transaction");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> RepoResult<()> {
        self.txn.rollback().await?;
        debug!("Rolled back database transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_utils::setup_test_db;
    use serde_json::json;

    fn note(key: &str, tenant: Option<Uuid>, deleted: bool) -> StoredRecord {
        StoredRecord {
            type_name: "note".to_string(),
            key: key.to_string(),
            tenant_id: tenant,
            is_deleted: deleted,
            version: 0,
            data: json!({ "text": key }),
        }
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let store = SeaOrmStore::new(setup_test_db().await);
        let tenant = Uuid::new_v4();
        store
            .apply(&[RecordWrite::Insert(note("a", Some(tenant), false))])
            .await
            .unwrap();

        let loaded = store.load("note", "a").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.tenant_id, Some(tenant));
        assert_eq!(loaded.data["text"], "a");
        assert!(store.load("note", "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_pushes_down_filters() {
        let store = SeaOrmStore::new(setup_test_db().await);
        let tenant = Uuid::new_v4();
        store
            .apply(&[
                RecordWrite::Insert(note("a", Some(tenant), false)),
                RecordWrite::Insert(note("b", Some(tenant), true)),
                RecordWrite::Insert(note("c", Some(Uuid::new_v4()), false)),
            ])
            .await
            .unwrap();

        let visible = store
            .scan(&ScanFilter::new("note").tenant(Some(tenant)))
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].key, "a");

        let all = store
            .scan(&ScanFilter::new("note").tenant(Some(tenant)).include_deleted(true))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_version_checked_update() {
        let store = SeaOrmStore::new(setup_test_db().await);
        store
            .apply(&[RecordWrite::Insert(note("a", None, false))])
            .await
            .unwrap();

        let mut changed = note("a", None, false);
        changed.data = json!({ "text": "changed" });
        store
            .apply(&[RecordWrite::Update {
                record: changed.clone(),
                expected_version: 1,
            }])
            .await
            .unwrap();

        let err = store
            .apply(&[RecordWrite::Update {
                record: changed,
                expected_version: 1,
            }])
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let loaded = store.load("note", "a").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.data["text"], "changed");
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = SeaOrmStore::new(setup_test_db().await);
        let mut txn = store.begin().await.unwrap();
        txn.write(&[RecordWrite::Insert(note("a", None, false))])
            .await
            .unwrap();
        assert!(txn.exists("note", "a").await.unwrap());
        txn.rollback().await.unwrap();

        assert!(!store.exists("note", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_batch_is_undone() {
        let store = SeaOrmStore::new(setup_test_db().await);
        let mut txn = store.begin().await.unwrap();
        let result = txn
            .write(&[
                RecordWrite::Insert(note("a", None, false)),
                RecordWrite::Delete {
                    type_name: "note".to_string(),
                    key: "missing".to_string(),
                    expected_version: 1,
                },
            ])
            .await;
        assert!(result.unwrap_err().is_conflict());
        assert!(!txn.exists("note", "a").await.unwrap());
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequences() {
        let store = SeaOrmStore::new(setup_test_db().await);
        assert_eq!(store.next_sequence_value("note").await.unwrap(), 1);
        assert_eq!(store.next_sequence_value("note").await.unwrap(), 2);
        assert_eq!(store.next_sequence_value("order").await.unwrap(), 1);
    }
}
