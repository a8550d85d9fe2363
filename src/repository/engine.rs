use chrono::Utc;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::ScopedRepository;
use crate::behavior::EntityBehavior;
use crate::context::{Actor, OperationContext, OperationKind, Origin, OriginInfo};
use crate::entity::{Entity, EntityDescriptor, EntityKey, IdentityResolver, KeyGeneration};
use crate::errors::{RepoError, RepoResult};
use crate::store::StoredRecord;
use crate::tenant::{ActorProvider, FixedActor, NoTenant, TenantProvider};
use crate::unit_of_work::UnitOfWork;

/// Per-store engine shared by every repository
///
/// Holds the identity cache and the injected tenant and actor providers.
/// Masked updates and cascades live here so that hooks can drive them for
/// any entity type.
pub struct RepositoryCore {
    identity: IdentityResolver,
    tenants: Arc<dyn TenantProvider>,
    actors: Arc<dyn ActorProvider>,
}

impl Default for RepositoryCore {
    fn default() -> Self {
        Self::new(Arc::new(NoTenant), Arc::new(FixedActor::default()))
    }
}

impl RepositoryCore {
    pub fn new(tenants: Arc<dyn TenantProvider>, actors: Arc<dyn ActorProvider>) -> Self {
        Self {
            identity: IdentityResolver::new(),
            tenants,
            actors,
        }
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn descriptor<E: Entity>(&self) -> RepoResult<Arc<EntityDescriptor<E>>> {
        self.identity.resolve::<E>()
    }

    pub fn tenant_id(&self, required: bool) -> RepoResult<Option<Uuid>> {
        self.tenants.tenant_id(required)
    }

    pub fn actor(&self) -> Actor {
        self.actors.current_actor()
    }

    /// Repository over a borrowed unit of work, for hooks and transactions
    pub fn scoped<'a, E: EntityBehavior>(&'a self, uow: &'a mut UnitOfWork) -> ScopedRepository<'a, E> {
        ScopedRepository::new(self, uow)
    }

    pub fn origin_of<E: Entity>(&self, entity: &E) -> RepoResult<Origin> {
        let descriptor = self.descriptor::<E>()?;
        Ok(Origin {
            info: OriginInfo {
                type_id: descriptor.entity_type_id(),
                type_name: E::TYPE_NAME.to_string(),
                instance_id: descriptor.key_of(entity).to_storage_key(),
            },
            delete_state: descriptor
                .soft_delete_accessor()
                .map(|accessor| accessor.get(entity).clone()),
        })
    }

    /// Root context with `entity` as the origin
    pub fn create_context<E: Entity>(&self, operation: OperationKind, entity: E) -> RepoResult<OperationContext<E>> {
        let origin = self.origin_of(&entity)?;
        Ok(OperationContext::new(
            operation,
            origin,
            entity,
            Utc::now(),
            self.actor(),
        ))
    }

    /// Context for `entity`, derived from `parent` when there is one
    pub fn context_for<E: Entity>(
        &self,
        operation: OperationKind,
        entity: E,
        parent: Option<&OperationContext<()>>,
    ) -> RepoResult<OperationContext<E>> {
        match parent {
            Some(parent) => Ok(parent.sub_context(entity, operation, None)),
            None => self.create_context(operation, entity),
        }
    }

    /// True when the entity is visible to the current tenant
    pub(crate) fn in_current_tenant<E: Entity>(
        &self,
        descriptor: &EntityDescriptor<E>,
        entity: &E,
    ) -> RepoResult<bool> {
        let Some(accessor) = descriptor.tenant_accessor() else {
            return Ok(true);
        };
        match self.tenant_id(false)? {
            Some(current) => Ok(accessor.get(entity) == Some(current)),
            None => Ok(true),
        }
    }

    pub(crate) fn stored_key<E: Entity>(&self, record: &StoredRecord) -> RepoResult<E::Key> {
        E::Key::from_storage_key(&record.key).ok_or_else(|| {
            RepoError::invalid_data(format!("{} has a malformed stored key '{}'", E::TYPE_NAME, record.key))
        })
    }

    /// Deserialize a stored row without tracking it
    pub(crate) fn decode<E: EntityBehavior>(
        &self,
        descriptor: &EntityDescriptor<E>,
        key: E::Key,
        data: serde_json::Value,
    ) -> RepoResult<E> {
        let mut entity: E = serde_json::from_value(data)?;
        descriptor.set_key(&mut entity, key);
        entity.on_loaded();
        Ok(entity)
    }

    /// Tracked instance for a stored row, tracking it first if needed
    ///
    /// Returns `None` when the row was removed in this unit of work.
    pub(crate) fn materialize<E: EntityBehavior>(
        &self,
        uow: &mut UnitOfWork,
        descriptor: &Arc<EntityDescriptor<E>>,
        record: StoredRecord,
    ) -> RepoResult<Option<E>> {
        let key = self.stored_key::<E>(&record)?;
        if uow.is_tracked::<E>(&key) {
            return Ok(uow.tracked::<E>(&key).cloned());
        }

        let entity = self.decode(descriptor, key, record.data)?;
        Ok(Some(uow.attach(descriptor, entity, record.version)?.clone()))
    }

    /// Tracked instance for a key, loading it from the store if needed
    pub(crate) async fn load_tracked<E: EntityBehavior>(
        &self,
        uow: &mut UnitOfWork,
        descriptor: &Arc<EntityDescriptor<E>>,
        key: &E::Key,
    ) -> RepoResult<Option<E>> {
        if uow.is_tracked::<E>(key) {
            return Ok(uow.tracked::<E>(key).cloned());
        }
        let record = uow.reader().load(E::TYPE_NAME, &key.to_storage_key()).await?;
        match record {
            Some(record) => self.materialize(uow, descriptor, record),
            None => Ok(None),
        }
    }

    /// [`Self::load_tracked`] restricted to rows of the current tenant
    pub(crate) async fn load_visible<E: EntityBehavior>(
        &self,
        uow: &mut UnitOfWork,
        descriptor: &Arc<EntityDescriptor<E>>,
        key: &E::Key,
    ) -> RepoResult<Option<E>> {
        match self.load_tracked(uow, descriptor, key).await? {
            Some(entity) if self.in_current_tenant(descriptor, &entity)? => Ok(Some(entity)),
            _ => Ok(None),
        }
    }

    async fn generate_key<E: Entity>(&self, uow: &UnitOfWork) -> RepoResult<E::Key> {
        let generated = match E::Key::GENERATION {
            KeyGeneration::Sequence => {
                let value = uow.reader().next_sequence_value(E::TYPE_NAME).await?;
                E::Key::from_sequence(value)
            }
            KeyGeneration::Random => E::Key::random(),
            KeyGeneration::Manual => {
                return Err(RepoError::invalid_data(format!(
                    "{} requires an explicit {}",
                    E::TYPE_NAME,
                    self.descriptor::<E>()?.key_name()
                )))
            }
        };
        generated.ok_or_else(|| RepoError::invalid_data(format!("cannot generate a key for {}", E::TYPE_NAME)))
    }

    /// Stamp tenant, key and audit fields, then track the entity as added
    pub(crate) async fn register_added<E: Entity>(
        &self,
        uow: &mut UnitOfWork,
        descriptor: &Arc<EntityDescriptor<E>>,
        mut entity: E,
        nested: bool,
    ) -> RepoResult<E> {
        if let Some(tenant) = descriptor.tenant_accessor() {
            if tenant.get(&entity).is_none() {
                let current = self.tenant_id(true)?.ok_or_else(|| {
                    RepoError::configuration(format!("{} is multitenant but no tenant is in scope", E::TYPE_NAME))
                })?;
                tenant.set(&mut entity, current);
            }
        }

        if descriptor.key_of(&entity).is_default() {
            let key = self.generate_key::<E>(uow).await?;
            descriptor.set_key(&mut entity, key);
        }

        if let Some(audit) = descriptor.audit_accessor() {
            let actor = self.actor();
            let info = audit.get_mut(&mut entity);
            info.created_on = Some(Utc::now());
            info.created_by = actor.name;
            info.created_by_user_id = actor.user_id;
        }

        let key = descriptor.key_of(&entity);
        uow.add(descriptor, entity.clone())?;
        if nested {
            uow.set_nested::<E>(&key)?;
        }
        debug!(entity = E::TYPE_NAME, key = %key.to_storage_key(), nested, "Registered added entity");
        Ok(entity)
    }

    pub(crate) fn stamp_modified<E: Entity>(&self, descriptor: &EntityDescriptor<E>, entity: &mut E, time: chrono::DateTime<Utc>) {
        if let Some(audit) = descriptor.audit_accessor() {
            let actor = self.actor();
            let info = audit.get_mut(entity);
            info.modified_on = Some(time);
            info.modified_by = actor.name;
            info.modified_by_user_id = actor.user_id;
        }
    }
}
