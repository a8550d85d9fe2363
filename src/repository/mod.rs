//! Typed repositories
//!
//! [`ScopedRepository`] works on a borrowed unit of work and is what hooks
//! and transaction bodies use. [`Repository`] is bound to a shared
//! [`DbContext`] and locks it for the length of each call; it must not be
//! used from inside a hook running on the same context.

mod cascade;
mod engine;
mod masked;
pub mod query;
pub mod reconcile;

use chrono::Utc;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

pub use engine::RepositoryCore;
pub use query::{Predicate, Query};
pub use reconcile::{update_nested_collection, DbRepository, ReconcileSummary};

use crate::behavior::EntityBehavior;
use crate::context::{OperationContext, OperationKind};
use crate::entity::{EntityDescriptor, EntityKey};
use crate::errors::{RepoError, RepoResult};
use crate::mask::DataGraphMask;
use crate::unit_of_work::{DbContext, ItemSource, UnitOfWork};
use query::QueryTarget;

/// Tenant filter for queries over `E`
fn query_tenant<E: EntityBehavior>(
    core: &RepositoryCore,
    descriptor: &EntityDescriptor<E>,
) -> RepoResult<Option<Uuid>> {
    if !descriptor.is_multitenant() {
        return Ok(None);
    }
    let tenant = core.tenant_id(true)?.ok_or_else(|| {
        RepoError::configuration(format!("{} is multitenant but no tenant is in scope", E::TYPE_NAME))
    })?;
    Ok(Some(tenant))
}

/// Repository over a borrowed unit of work
pub struct ScopedRepository<'a, E: EntityBehavior> {
    core: &'a RepositoryCore,
    uow: &'a mut UnitOfWork,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: EntityBehavior> ScopedRepository<'a, E> {
    pub fn new(core: &'a RepositoryCore, uow: &'a mut UnitOfWork) -> Self {
        Self {
            core,
            uow,
            _entity: PhantomData,
        }
    }

    pub fn descriptor(&self) -> RepoResult<Arc<EntityDescriptor<E>>> {
        self.core.descriptor::<E>()
    }

    pub fn unit_of_work(&mut self) -> &mut UnitOfWork {
        self.uow
    }

    /// Persisted rows visible to the current tenant
    pub fn query(&mut self, include_deleted: bool) -> RepoResult<Query<'_, E>> {
        let descriptor = self.descriptor()?;
        let tenant = query_tenant(self.core, &descriptor)?;
        Ok(Query::new(
            self.core,
            QueryTarget::Scoped(&mut *self.uow),
            tenant,
            include_deleted,
        ))
    }

    /// Tracked matches plus persisted matches that are not tracked
    pub async fn local_and_query(
        &mut self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
        include_deleted: bool,
    ) -> RepoResult<Vec<E>> {
        let predicate: Predicate<E> = Arc::new(predicate);
        let descriptor = self.descriptor()?;
        let tenant = query_tenant(self.core, &descriptor)?;

        let local: Vec<E> = self
            .uow
            .local::<E>()
            .into_iter()
            .filter(|&entity| {
                let visible = match (tenant, descriptor.tenant_accessor()) {
                    (Some(tenant), Some(accessor)) => accessor.get(entity) == Some(tenant),
                    _ => true,
                };
                visible && (include_deleted || !descriptor.is_deleted(entity)) && predicate(entity)
            })
            .cloned()
            .collect();

        let query = self.query(include_deleted)?.filter_shared(predicate);
        if local.is_empty() {
            return query.fetch().await;
        }

        let keys: Vec<E::Key> = local.iter().map(|entity| descriptor.key_of(entity)).collect();
        let persisted = query.exclude_keys(keys).fetch().await?;
        debug!(
            entity = E::TYPE_NAME,
            local = local.len(),
            persisted = persisted.len(),
            "Merged local and persisted rows"
        );
        Ok(local.into_iter().chain(persisted).collect())
    }

    /// Keyed lookup, including soft-deleted rows
    pub async fn find(&mut self, key: &E::Key, required: bool) -> RepoResult<Option<E>> {
        let descriptor = self.descriptor()?;
        let found = self.core.load_visible(self.uow, &descriptor, key).await?;
        if found.is_none() && required {
            return Err(RepoError::not_found(E::TYPE_NAME, key.to_storage_key()));
        }
        Ok(found)
    }

    pub async fn get(&mut self, key: &E::Key) -> RepoResult<E> {
        self.find(key, true)
            .await?
            .ok_or_else(|| RepoError::not_found(E::TYPE_NAME, key.to_storage_key()))
    }

    /// Tracked instance for in-place edits before [`Self::update_tracked`]
    pub fn tracked_mut(&mut self, key: &E::Key) -> Option<&mut E> {
        self.uow.tracked_mut::<E>(key)
    }

    pub async fn add(&mut self, entity: E) -> RepoResult<E> {
        self.add_in(entity, None).await
    }

    pub async fn add_in(&mut self, entity: E, parent: Option<&OperationContext<()>>) -> RepoResult<E> {
        let descriptor = self.descriptor()?;
        let added = self
            .core
            .register_added(self.uow, &descriptor, entity, false)
            .await?;
        let key = descriptor.key_of(&added);
        let ctx = self.core.context_for(OperationKind::ADD, added, parent)?;
        E::on_added(self.core, self.uow, &ctx).await?;
        Ok(self.uow.tracked::<E>(&key).cloned().unwrap_or_else(|| ctx.into_item()))
    }

    /// Masked update when a mask is given, full overwrite otherwise
    pub async fn update(&mut self, entity: E, mask: Option<DataGraphMask>) -> RepoResult<E> {
        self.update_in(entity, mask, None).await
    }

    pub async fn update_in(
        &mut self,
        entity: E,
        mask: Option<DataGraphMask>,
        parent: Option<&OperationContext<()>>,
    ) -> RepoResult<E> {
        let descriptor = self.descriptor()?;
        if let Some(mask) = mask {
            let ctx = self
                .core
                .context_for(OperationKind::UPDATE, entity, parent)?
                .with_mask(Some(Arc::new(mask)));
            return self.core.update_masked(self.uow, ctx, ItemSource::Detached).await;
        }

        let key = descriptor.key_of(&entity);
        if key.is_default() {
            return Err(RepoError::invalid_data(format!(
                "{} update requires a value for {}",
                E::TYPE_NAME,
                descriptor.key_name()
            )));
        }
        let existing = self
            .core
            .load_visible(self.uow, &descriptor, &key)
            .await?
            .ok_or_else(|| RepoError::not_found(E::TYPE_NAME, key.to_storage_key()))?;

        let mut merged = entity;
        if let Some(tenant) = descriptor.tenant_accessor() {
            if let (None, Some(existing_tenant)) = (tenant.get(&merged), tenant.get(&existing)) {
                tenant.set(&mut merged, existing_tenant);
            }
        }
        if let Some(audit) = descriptor.audit_accessor() {
            let created = audit.get(&existing).clone();
            let info = audit.get_mut(&mut merged);
            info.created_on = created.created_on;
            info.created_by = created.created_by;
            info.created_by_user_id = created.created_by_user_id;
        }
        let time = parent.map_or_else(Utc::now, |parent| parent.time());
        self.core.stamp_modified(&descriptor, &mut merged, time);

        self.uow.replace::<E>(&key, merged.clone())?;
        self.uow.mark_all_modified::<E>(&key)?;
        let ctx = self.core.context_for(OperationKind::UPDATE, merged, parent)?;
        E::on_updated(self.core, self.uow, &ctx).await?;
        Ok(self.uow.tracked::<E>(&key).cloned().unwrap_or_else(|| ctx.into_item()))
    }

    /// Apply the tracked instance's own values
    ///
    /// With a mask, every masked field is marked modified. Without one the
    /// whole entity is.
    pub async fn update_tracked(&mut self, key: &E::Key, mask: Option<DataGraphMask>) -> RepoResult<E> {
        let descriptor = self.descriptor()?;
        let tracked = self
            .core
            .load_visible(self.uow, &descriptor, key)
            .await?
            .ok_or_else(|| RepoError::not_found(E::TYPE_NAME, key.to_storage_key()))?;
        let ctx = self.core.create_context(OperationKind::UPDATE, tracked)?;

        match mask {
            Some(mask) => {
                let ctx = ctx.with_mask(Some(Arc::new(mask)));
                self.core.update_masked(self.uow, ctx, ItemSource::InPlace).await
            }
            None => {
                let mut entity = ctx.item().clone();
                self.core.stamp_modified(&descriptor, &mut entity, ctx.time());
                self.uow.replace::<E>(key, entity)?;
                self.uow.mark_all_modified::<E>(key)?;
                E::on_updated(self.core, self.uow, &ctx).await?;
                self.get(key).await
            }
        }
    }

    /// Physically delete by key; a missing row is not an error
    pub async fn delete(&mut self, key: &E::Key) -> RepoResult<()> {
        self.delete_in(key, None).await
    }

    pub async fn delete_in(&mut self, key: &E::Key, parent: Option<&OperationContext<()>>) -> RepoResult<()> {
        match self.find(key, false).await? {
            Some(entity) => self.delete_entity_in(entity, parent).await,
            None => {
                debug!(entity = E::TYPE_NAME, key = %key.to_storage_key(), "Delete of a missing row ignored");
                Ok(())
            }
        }
    }

    pub async fn delete_entity(&mut self, entity: E) -> RepoResult<()> {
        self.delete_entity_in(entity, None).await
    }

    pub async fn delete_entity_in(&mut self, entity: E, parent: Option<&OperationContext<()>>) -> RepoResult<()> {
        let descriptor = self.descriptor()?;
        let key = descriptor.key_of(&entity);
        if self.core.load_visible(self.uow, &descriptor, &key).await?.is_none() {
            debug!(entity = E::TYPE_NAME, key = %key.to_storage_key(), "Delete of a missing row ignored");
            return Ok(());
        }

        let ctx = self.core.context_for(OperationKind::DELETE, entity, parent)?;
        E::on_deleting(self.core, self.uow, &ctx).await?;
        self.uow.remove::<E>(&key)
    }

    /// Existence of a persisted row; a default key never exists
    pub async fn exists(&mut self, key: &E::Key) -> RepoResult<bool> {
        if key.is_default() {
            return Ok(false);
        }
        self.uow.reader().exists(E::TYPE_NAME, &key.to_storage_key()).await
    }

    pub async fn next_sequence_value(&mut self, name: &str) -> RepoResult<i64> {
        self.uow.reader().next_sequence_value(name).await
    }

    /// Mark the entity self-deleted and fire `on_updated` as an ordinary update
    pub async fn soft_delete(&mut self, key: &E::Key) -> RepoResult<E> {
        self.mark_deleted(key, OperationKind::UPDATE).await
    }

    /// Mark the entity recyclable-deleted and fire `on_updated` with a
    /// recycle-bin context, so dependents inherit the flag
    pub async fn move_to_recycle_bin(&mut self, key: &E::Key) -> RepoResult<E> {
        self.mark_deleted(key, OperationKind::MOVE_TO_RECYCLE_BIN).await
    }

    async fn mark_deleted(&mut self, key: &E::Key, operation: OperationKind) -> RepoResult<E> {
        let descriptor = self.descriptor()?;
        let accessor = descriptor
            .soft_delete_accessor()
            .ok_or_else(|| RepoError::configuration(format!("{} does not support soft delete", E::TYPE_NAME)))?;
        let mut entity = self.get(key).await?;

        let now = Utc::now();
        let stamp = self.core.actor().stamp(now);
        let state = accessor.get_mut(&mut entity);
        if operation == OperationKind::MOVE_TO_RECYCLE_BIN {
            state.is_recyclable_deleted = true;
            state.recyclable_deleted = stamp.clone();
        } else {
            state.is_self_deleted = true;
            state.self_deleted = stamp.clone();
        }
        self.core.complete_delete_info_with(&descriptor, &mut entity, || stamp)?;
        self.core.stamp_modified(&descriptor, &mut entity, now);
        self.uow.replace::<E>(key, entity.clone())?;

        // the origin snapshot must carry the new delete state
        let ctx = self.core.create_context(operation, entity)?;
        E::on_updated(self.core, self.uow, &ctx).await?;
        self.get(key).await
    }

    /// Ask the entity's restore hook to bring a self-deleted row back
    pub async fn restore_self_deleted(&mut self, key: &E::Key) -> RepoResult<bool> {
        let entity = self.get(key).await?;
        let ctx = self.core.create_context(OperationKind::RESTORE_SELF_DELETED, entity)?;
        E::restore_self_deleted(self.core, self.uow, &ctx).await
    }

    /// Ask the entity's restore hook to bring a cascade-deleted row back
    pub async fn restore_cascade_deleted(&mut self, key: &E::Key) -> RepoResult<bool> {
        let entity = self.get(key).await?;
        let ctx = self.core.create_context(OperationKind::RESTORE_CASCADE_DELETED, entity)?;
        E::restore_cascade_deleted(self.core, self.uow, &ctx).await
    }
}

/// Repository bound to a shared [`DbContext`]
pub struct Repository<E: EntityBehavior> {
    core: Arc<RepositoryCore>,
    context: Mutex<Option<DbContext>>,
    _entity: PhantomData<fn() -> E>,
}

macro_rules! with_scoped {
    ($self:ident, |$repo:ident| $body:expr) => {{
        let context = $self.context()?;
        let mut uow = context.lock().await;
        let mut $repo = $self.core.scoped::<E>(&mut uow);
        $body
    }};
}

impl<E: EntityBehavior> Repository<E> {
    pub fn new(core: Arc<RepositoryCore>) -> Self {
        Self {
            core,
            context: Mutex::new(None),
            _entity: PhantomData,
        }
    }

    pub fn bound(core: Arc<RepositoryCore>, context: DbContext) -> Self {
        Self {
            core,
            context: Mutex::new(Some(context)),
            _entity: PhantomData,
        }
    }

    /// Bind (or rebind) the repository to a unit of work
    pub fn use_context(&self, context: DbContext) -> RepoResult<()> {
        *self
            .context
            .lock()
            .map_err(|_| RepoError::configuration("repository context lock poisoned"))? = Some(context);
        Ok(())
    }

    pub fn context(&self) -> RepoResult<DbContext> {
        self.context
            .lock()
            .map_err(|_| RepoError::configuration("repository context lock poisoned"))?
            .clone()
            .ok_or_else(|| RepoError::configuration(format!("repository for {} is not bound to a context", E::TYPE_NAME)))
    }

    pub fn core(&self) -> &RepositoryCore {
        &self.core
    }

    pub fn descriptor(&self) -> RepoResult<Arc<EntityDescriptor<E>>> {
        self.core.descriptor::<E>()
    }

    pub fn query(&self, include_deleted: bool) -> RepoResult<Query<'_, E>> {
        let descriptor = self.descriptor()?;
        let tenant = query_tenant(&self.core, &descriptor)?;
        Ok(Query::new(
            &self.core,
            QueryTarget::Shared(self.context()?),
            tenant,
            include_deleted,
        ))
    }

    pub async fn local_and_query(
        &self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
        include_deleted: bool,
    ) -> RepoResult<Vec<E>> {
        with_scoped!(self, |repo| repo.local_and_query(predicate, include_deleted).await)
    }

    pub async fn find(&self, key: &E::Key, required: bool) -> RepoResult<Option<E>> {
        with_scoped!(self, |repo| repo.find(key, required).await)
    }

    pub async fn get(&self, key: &E::Key) -> RepoResult<E> {
        with_scoped!(self, |repo| repo.get(key).await)
    }

    pub async fn add(&self, entity: E) -> RepoResult<E> {
        with_scoped!(self, |repo| repo.add(entity).await)
    }

    pub async fn update(&self, entity: E, mask: Option<DataGraphMask>) -> RepoResult<E> {
        with_scoped!(self, |repo| repo.update(entity, mask).await)
    }

    pub async fn update_tracked(&self, key: &E::Key, mask: Option<DataGraphMask>) -> RepoResult<E> {
        with_scoped!(self, |repo| repo.update_tracked(key, mask).await)
    }

    /// Edit the tracked instance in place, loading it first if needed
    pub async fn edit_tracked(&self, key: &E::Key, edit: impl FnOnce(&mut E) + Send) -> RepoResult<()> {
        with_scoped!(self, |repo| {
            repo.get(key).await?;
            let tracked = repo
                .tracked_mut(key)
                .ok_or_else(|| RepoError::not_found(E::TYPE_NAME, key.to_storage_key()))?;
            edit(tracked);
            Ok(())
        })
    }

    pub async fn delete(&self, key: &E::Key) -> RepoResult<()> {
        with_scoped!(self, |repo| repo.delete(key).await)
    }

    pub async fn delete_entity(&self, entity: E) -> RepoResult<()> {
        with_scoped!(self, |repo| repo.delete_entity(entity).await)
    }

    pub async fn exists(&self, key: &E::Key) -> RepoResult<bool> {
        with_scoped!(self, |repo| repo.exists(key).await)
    }

    pub async fn next_sequence_value(&self, name: &str) -> RepoResult<i64> {
        with_scoped!(self, |repo| repo.next_sequence_value(name).await)
    }

    pub async fn soft_delete(&self, key: &E::Key) -> RepoResult<E> {
        with_scoped!(self, |repo| repo.soft_delete(key).await)
    }

    pub async fn move_to_recycle_bin(&self, key: &E::Key) -> RepoResult<E> {
        with_scoped!(self, |repo| repo.move_to_recycle_bin(key).await)
    }

    pub async fn restore_self_deleted(&self, key: &E::Key) -> RepoResult<bool> {
        with_scoped!(self, |repo| repo.restore_self_deleted(key).await)
    }

    pub async fn restore_cascade_deleted(&self, key: &E::Key) -> RepoResult<bool> {
        with_scoped!(self, |repo| repo.restore_cascade_deleted(key).await)
    }

    /// Save the bound context's tracked changes
    pub async fn save_changes(&self) -> RepoResult<usize> {
        self.context()?.save_changes().await
    }
}
