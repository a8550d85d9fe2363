//! Type-erased repository access and nested collection sync
//!
//! [`DbRepository`] lets callers drive a repository without naming its entity
//! type. [`update_nested_collection`] uses it to bring an owned child
//! collection to an exact desired state.

use async_trait::async_trait;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

use super::{Repository, ScopedRepository};
use crate::behavior::EntityBehavior;
use crate::context::OperationContext;
use crate::entity::{Entity, EntityKey, RecordKey};
use crate::errors::{RepoError, RepoResult};

pub type AnyEntity = Box<dyn Any + Send + Sync>;

/// Predicate over an erased entity
pub type AnyPredicate = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync>;

#[async_trait]
pub trait DbRepository: Send {
    /// Stored type name of the entities this repository manages
    fn entity_type(&self) -> &'static str;

    async fn find_entity(&mut self, key: &RecordKey) -> RepoResult<Option<AnyEntity>>;

    /// Tracked and persisted entities matching `predicate`, soft-deleted
    /// rows excluded
    async fn query_entities(&mut self, predicate: AnyPredicate) -> RepoResult<Vec<AnyEntity>>;

    async fn add_entity(&mut self, entity: AnyEntity, parent: Option<&OperationContext<()>>) -> RepoResult<AnyEntity>;

    async fn update_entity(
        &mut self,
        entity: AnyEntity,
        parent: Option<&OperationContext<()>>,
    ) -> RepoResult<AnyEntity>;

    async fn delete_entity(&mut self, entity: AnyEntity, parent: Option<&OperationContext<()>>) -> RepoResult<()>;

    async fn delete_entity_by_key(&mut self, key: &RecordKey, parent: Option<&OperationContext<()>>) -> RepoResult<()>;
}

fn downcast<E: Entity>(entity: AnyEntity) -> RepoResult<E> {
    entity
        .downcast::<E>()
        .map(|entity| *entity)
        .map_err(|_| RepoError::invalid_data(format!("value is not a {}", E::TYPE_NAME)))
}

fn parse_key<E: Entity>(key: &RecordKey) -> RepoResult<E::Key> {
    key.parse::<E::Key>()
        .ok_or_else(|| RepoError::invalid_data(format!("'{}' is not a valid {} key", key, E::TYPE_NAME)))
}

#[async_trait]
impl<'a, E: EntityBehavior> DbRepository for ScopedRepository<'a, E> {
    fn entity_type(&self) -> &'static str {
        E::TYPE_NAME
    }

    async fn find_entity(&mut self, key: &RecordKey) -> RepoResult<Option<AnyEntity>> {
        let key = parse_key::<E>(key)?;
        Ok(self.find(&key, false).await?.map(|entity| Box::new(entity) as AnyEntity))
    }

    async fn query_entities(&mut self, predicate: AnyPredicate) -> RepoResult<Vec<AnyEntity>> {
        let rows = self
            .local_and_query(move |entity: &E| predicate(entity as &(dyn Any + Send + Sync)), false)
            .await?;
        Ok(rows.into_iter().map(|entity| Box::new(entity) as AnyEntity).collect())
    }

    async fn add_entity(&mut self, entity: AnyEntity, parent: Option<&OperationContext<()>>) -> RepoResult<AnyEntity> {
        let added = self.add_in(downcast::<E>(entity)?, parent).await?;
        Ok(Box::new(added))
    }

    async fn update_entity(
        &mut self,
        entity: AnyEntity,
        parent: Option<&OperationContext<()>>,
    ) -> RepoResult<AnyEntity> {
        let updated = self.update_in(downcast::<E>(entity)?, None, parent).await?;
        Ok(Box::new(updated))
    }

    async fn delete_entity(&mut self, entity: AnyEntity, parent: Option<&OperationContext<()>>) -> RepoResult<()> {
        self.delete_entity_in(downcast::<E>(entity)?, parent).await
    }

    async fn delete_entity_by_key(&mut self, key: &RecordKey, parent: Option<&OperationContext<()>>) -> RepoResult<()> {
        let key = parse_key::<E>(key)?;
        self.delete_in(&key, parent).await
    }
}

#[async_trait]
impl<E: EntityBehavior> DbRepository for Repository<E> {
    fn entity_type(&self) -> &'static str {
        E::TYPE_NAME
    }

    async fn find_entity(&mut self, key: &RecordKey) -> RepoResult<Option<AnyEntity>> {
        let context = self.context()?;
        let mut uow = context.lock().await;
        DbRepository::find_entity(&mut self.core.scoped::<E>(&mut uow), key).await
    }

    async fn query_entities(&mut self, predicate: AnyPredicate) -> RepoResult<Vec<AnyEntity>> {
        let context = self.context()?;
        let mut uow = context.lock().await;
        DbRepository::query_entities(&mut self.core.scoped::<E>(&mut uow), predicate).await
    }

    async fn add_entity(&mut self, entity: AnyEntity, parent: Option<&OperationContext<()>>) -> RepoResult<AnyEntity> {
        let context = self.context()?;
        let mut uow = context.lock().await;
        DbRepository::add_entity(&mut self.core.scoped::<E>(&mut uow), entity, parent).await
    }

    async fn update_entity(
        &mut self,
        entity: AnyEntity,
        parent: Option<&OperationContext<()>>,
    ) -> RepoResult<AnyEntity> {
        let context = self.context()?;
        let mut uow = context.lock().await;
        DbRepository::update_entity(&mut self.core.scoped::<E>(&mut uow), entity, parent).await
    }

    async fn delete_entity(&mut self, entity: AnyEntity, parent: Option<&OperationContext<()>>) -> RepoResult<()> {
        let context = self.context()?;
        let mut uow = context.lock().await;
        DbRepository::delete_entity(&mut self.core.scoped::<E>(&mut uow), entity, parent).await
    }

    async fn delete_entity_by_key(&mut self, key: &RecordKey, parent: Option<&OperationContext<()>>) -> RepoResult<()> {
        let context = self.context()?;
        let mut uow = context.lock().await;
        DbRepository::delete_entity_by_key(&mut self.core.scoped::<E>(&mut uow), key, parent).await
    }
}

/// Outcome of [`update_nested_collection`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Make the rows matching `predicate` equal to `items`
///
/// Persisted rows whose key appears in `items` are updated, rows whose key
/// does not appear are physically deleted and items with a new or default
/// key are added. `items` must be the complete desired collection.
pub async fn update_nested_collection<E, K, T>(
    items: Vec<E>,
    predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    key_selector: impl Fn(&E) -> K,
    repo: &mut dyn DbRepository,
    ctx: &OperationContext<T>,
) -> RepoResult<ReconcileSummary>
where
    E: Entity,
    K: EntityKey,
{
    if repo.entity_type() != E::TYPE_NAME {
        return Err(RepoError::configuration(format!(
            "repository for {} cannot reconcile {} rows",
            repo.entity_type(),
            E::TYPE_NAME
        )));
    }

    let parent = ctx.detached();
    let erased: AnyPredicate = Arc::new(move |entity: &(dyn Any + Send + Sync)| {
        entity.downcast_ref::<E>().map_or(false, |entity| predicate(entity))
    });

    let mut persisted: BTreeMap<K, E> = BTreeMap::new();
    for entity in repo.query_entities(erased).await? {
        let entity = downcast::<E>(entity)?;
        persisted.insert(key_selector(&entity), entity);
    }

    let mut summary = ReconcileSummary::default();
    let mut kept = BTreeSet::new();
    let mut fresh = Vec::new();
    for item in items {
        let key = key_selector(&item);
        if key.is_default() || !persisted.contains_key(&key) {
            fresh.push(item);
            continue;
        }
        if !kept.insert(key.clone()) {
            return Err(RepoError::invalid_data(format!(
                "{} '{}' appears more than once in the collection",
                E::TYPE_NAME,
                key.to_storage_key()
            )));
        }
        repo.update_entity(Box::new(item), Some(&parent)).await?;
        summary.updated += 1;
    }

    for key in persisted.keys().filter(|key| !kept.contains(*key)) {
        repo.delete_entity_by_key(&RecordKey::of(key), Some(&parent)).await?;
        summary.deleted += 1;
    }

    for item in fresh {
        repo.add_entity(Box::new(item), Some(&parent)).await?;
        summary.added += 1;
    }

    info!(
        entity = E::TYPE_NAME,
        added = summary.added,
        updated = summary.updated,
        deleted = summary.deleted,
        "Reconciled nested collection"
    );
    Ok(summary)
}
