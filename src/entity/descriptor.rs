//! Per-type accessor tables
//!
//! A descriptor replaces runtime property lookup: each named field carries a
//! typed compare and copy function, and the optional capabilities (tenant key,
//! soft delete, audit, references) carry typed getters and setters.

use std::collections::BTreeSet;
use uuid::Uuid;

use super::delete_state::{AuditInfo, DeleteState};
use super::reference::ReferenceAccessor;
use super::{Entity, EntityKey};
use crate::errors::{RepoError, RepoResult};

/// Namespace for type ids derived from entity type names
const TYPE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_2a7c_90b4_4e0b_a3c5_51f0_8e2d_7b19);

/// Build a [`Field`] for a named struct field
///
/// ```rust,ignore
/// EntityDescriptor::new("id", |c: &Customer| c.id, |c, id| c.id = id)
///     .field(field!(Customer, name))
/// ```
#[macro_export]
macro_rules! field {
    ($ty:ty, $name:ident) => {
        $crate::entity::Field::<$ty>::new(
            stringify!($name),
            |a, b| a.$name == b.$name,
            |target, source| target.$name = source.$name.clone(),
        )
    };
}

/// Scalar field accessor
pub struct Field<E> {
    name: &'static str,
    eq: fn(&E, &E) -> bool,
    copy: fn(&mut E, &E),
}

impl<E> Field<E> {
    pub fn new(name: &'static str, eq: fn(&E, &E) -> bool, copy: fn(&mut E, &E)) -> Self {
        Self { name, eq, copy }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn differs(&self, a: &E, b: &E) -> bool {
        !(self.eq)(a, b)
    }

    pub fn copy(&self, target: &mut E, source: &E) {
        (self.copy)(target, source)
    }
}

pub struct TenantAccessor<E> {
    field: &'static str,
    get: fn(&E) -> Uuid,
    set: fn(&mut E, Uuid),
}

impl<E> TenantAccessor<E> {
    pub fn field(&self) -> &'static str {
        self.field
    }

    /// Tenant of the entity, `None` while unset
    pub fn get(&self, entity: &E) -> Option<Uuid> {
        let tenant = (self.get)(entity);
        (!tenant.is_nil()).then_some(tenant)
    }

    pub fn set(&self, entity: &mut E, tenant: Uuid) {
        (self.set)(entity, tenant)
    }
}

pub struct SoftDeleteAccessor<E> {
    get: fn(&E) -> &DeleteState,
    get_mut: fn(&mut E) -> &mut DeleteState,
}

impl<E> SoftDeleteAccessor<E> {
    pub fn get<'a>(&self, entity: &'a E) -> &'a DeleteState {
        (self.get)(entity)
    }

    pub fn get_mut<'a>(&self, entity: &'a mut E) -> &'a mut DeleteState {
        (self.get_mut)(entity)
    }

    pub fn is_deleted(&self, entity: &E) -> bool {
        self.get(entity).is_deleted
    }
}

pub struct AuditAccessor<E> {
    get: fn(&E) -> &AuditInfo,
    get_mut: fn(&mut E) -> &mut AuditInfo,
}

impl<E> AuditAccessor<E> {
    pub fn get<'a>(&self, entity: &'a E) -> &'a AuditInfo {
        (self.get)(entity)
    }

    pub fn get_mut<'a>(&self, entity: &'a mut E) -> &'a mut AuditInfo {
        (self.get_mut)(entity)
    }
}

/// Identity metadata and accessor table of one entity type
pub struct EntityDescriptor<E: Entity> {
    type_id: Uuid,
    key_name: &'static str,
    key: fn(&E) -> E::Key,
    set_key: fn(&mut E, E::Key),
    global_id: Option<fn(&E) -> Uuid>,
    tenant: Option<TenantAccessor<E>>,
    soft_delete: Option<SoftDeleteAccessor<E>>,
    audit: Option<AuditAccessor<E>>,
    fields: Vec<Field<E>>,
    references: Vec<Box<dyn ReferenceAccessor<E>>>,
}

impl<E: Entity> EntityDescriptor<E> {
    pub fn new(key_name: &'static str, key: fn(&E) -> E::Key, set_key: fn(&mut E, E::Key)) -> Self {
        Self {
            type_id: Uuid::new_v5(&TYPE_ID_NAMESPACE, E::TYPE_NAME.as_bytes()),
            key_name,
            key,
            set_key,
            global_id: None,
            tenant: None,
            soft_delete: None,
            audit: None,
            fields: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Override the type id derived from the type name
    pub fn type_id(mut self, type_id: Uuid) -> Self {
        self.type_id = type_id;
        self
    }

    pub fn global_id(mut self, get: fn(&E) -> Uuid) -> Self {
        self.global_id = Some(get);
        self
    }

    pub fn tenant(mut self, field: &'static str, get: fn(&E) -> Uuid, set: fn(&mut E, Uuid)) -> Self {
        self.tenant = Some(TenantAccessor { field, get, set });
        self
    }

    pub fn soft_delete(
        mut self,
        get: fn(&E) -> &DeleteState,
        get_mut: fn(&mut E) -> &mut DeleteState,
    ) -> Self {
        self.soft_delete = Some(SoftDeleteAccessor { get, get_mut });
        self
    }

    pub fn audit(mut self, get: fn(&E) -> &AuditInfo, get_mut: fn(&mut E) -> &mut AuditInfo) -> Self {
        self.audit = Some(AuditAccessor { get, get_mut });
        self
    }

    pub fn field(mut self, field: Field<E>) -> Self {
        self.fields.push(field);
        self
    }

    pub fn reference(mut self, reference: impl ReferenceAccessor<E> + 'static) -> Self {
        self.references.push(Box::new(reference));
        self
    }

    pub fn entity_type_id(&self) -> Uuid {
        self.type_id
    }

    pub fn key_name(&self) -> &'static str {
        self.key_name
    }

    pub fn key_of(&self, entity: &E) -> E::Key {
        (self.key)(entity)
    }

    pub fn set_key(&self, entity: &mut E, key: E::Key) {
        (self.set_key)(entity, key)
    }

    /// Global identifier, falling back to the key when it is itself a UUID
    pub fn global_id_of(&self, entity: &E) -> Option<Uuid> {
        match self.global_id {
            Some(get) => Some(get(entity)),
            None => self.key_of(entity).as_uuid(),
        }
    }

    pub fn tenant_accessor(&self) -> Option<&TenantAccessor<E>> {
        self.tenant.as_ref()
    }

    pub fn soft_delete_accessor(&self) -> Option<&SoftDeleteAccessor<E>> {
        self.soft_delete.as_ref()
    }

    pub fn audit_accessor(&self) -> Option<&AuditAccessor<E>> {
        self.audit.as_ref()
    }

    pub fn is_multitenant(&self) -> bool {
        self.tenant.is_some()
    }

    pub fn fields(&self) -> &[Field<E>] {
        &self.fields
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field<E>> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn reference_by_name(&self, name: &str) -> Option<&dyn ReferenceAccessor<E>> {
        self.references
            .iter()
            .find(|reference| reference.name() == name)
            .map(|reference| reference.as_ref())
    }

    pub fn references(&self) -> impl Iterator<Item = &dyn ReferenceAccessor<E>> + '_ {
        self.references.iter().map(|reference| reference.as_ref())
    }

    /// Copy of the entity without navigation values, as it is persisted
    pub fn persisted_form(&self, entity: &E) -> E {
        let mut persisted = entity.clone();
        for reference in &self.references {
            reference.clear_navigation(&mut persisted);
        }
        persisted
    }

    /// Stored deleted flag, false for types without soft delete
    pub fn is_deleted(&self, entity: &E) -> bool {
        self.soft_delete
            .as_ref()
            .map(|accessor| accessor.is_deleted(entity))
            .unwrap_or(false)
    }

    /// Names of everything that differs between two versions of an entity
    pub fn changed_fields(&self, original: &E, current: &E) -> Vec<&'static str> {
        let mut changed: Vec<&'static str> = self
            .fields
            .iter()
            .filter(|field| field.differs(original, current))
            .map(|field| field.name)
            .collect();

        if let Some(accessor) = &self.soft_delete {
            changed.extend(accessor.get(original).changed_fields(accessor.get(current)));
        }
        if let Some(accessor) = &self.audit {
            changed.extend(accessor.get(original).changed_fields(accessor.get(current)));
        }
        changed
    }

    /// Check that every declared name points at a declared field
    pub fn validate(&self) -> RepoResult<()> {
        let mut names = BTreeSet::new();
        for field in &self.fields {
            if !names.insert(field.name) {
                return Err(RepoError::configuration(format!(
                    "{} declares field '{}' twice",
                    E::TYPE_NAME,
                    field.name
                )));
            }
        }

        if !names.contains(self.key_name) {
            return Err(RepoError::configuration(format!(
                "{} declares key '{}' which is not a field",
                E::TYPE_NAME,
                self.key_name
            )));
        }

        if let Some(tenant) = &self.tenant {
            if !names.contains(tenant.field) {
                return Err(RepoError::configuration(format!(
                    "{} declares tenant key '{}' which is not a field",
                    E::TYPE_NAME,
                    tenant.field
                )));
            }
        }

        let mut references = BTreeSet::new();
        for reference in &self.references {
            if !references.insert(reference.name()) {
                return Err(RepoError::configuration(format!(
                    "{} declares reference '{}' twice",
                    E::TYPE_NAME,
                    reference.name()
                )));
            }
            if !names.contains(reference.foreign_key()) {
                return Err(RepoError::configuration(format!(
                    "{}.{} uses foreign key '{}' which is not a field",
                    E::TYPE_NAME,
                    reference.name(),
                    reference.foreign_key()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct Gadget {
        id: i64,
        tenant_id: Uuid,
        label: String,
        delete_state: DeleteState,
    }

    impl Entity for Gadget {
        type Key = i64;
        const TYPE_NAME: &'static str = "gadget";

        fn descriptor() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("id", |g| g.id, |g, id| g.id = id)
                .tenant("tenant_id", |g| g.tenant_id, |g, t| g.tenant_id = t)
                .soft_delete(|g| &g.delete_state, |g| &mut g.delete_state)
                .field(crate::field!(Gadget, id))
                .field(crate::field!(Gadget, tenant_id))
                .field(crate::field!(Gadget, label))
        }
    }

    #[test]
    fn test_valid_descriptor() {
        let descriptor = Gadget::descriptor();
        assert!(descriptor.validate().is_ok());
        assert!(descriptor.is_multitenant());
        assert!(descriptor.field_by_name("label").is_some());
        assert!(descriptor.field_by_name("colour").is_none());
    }

    #[test]
    fn test_key_must_be_a_field() {
        let descriptor = EntityDescriptor::<Gadget>::new("gadget_id", |g| g.id, |g, id| g.id = id)
            .field(crate::field!(Gadget, id));
        let err = descriptor.validate().unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
        assert!(err.to_string().contains("gadget_id"));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let descriptor = EntityDescriptor::<Gadget>::new("id", |g| g.id, |g, id| g.id = id)
            .field(crate::field!(Gadget, id))
            .field(crate::field!(Gadget, id));
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_changed_fields_covers_delete_state() {
        let descriptor = Gadget::descriptor();
        let original = Gadget {
            id: 1,
            label: "a".to_string(),
            ..Default::default()
        };
        let mut current = original.clone();
        current.label = "b".to_string();
        current.delete_state.is_self_deleted = true;

        assert_eq!(
            descriptor.changed_fields(&original, &current),
            vec!["label", "is_self_deleted"]
        );
    }

    #[test]
    fn test_tenant_accessor_treats_nil_as_unset() {
        let descriptor = Gadget::descriptor();
        let tenant = descriptor.tenant_accessor().unwrap();
        let mut gadget = Gadget::default();
        assert_eq!(tenant.get(&gadget), None);

        let id = Uuid::new_v4();
        tenant.set(&mut gadget, id);
        assert_eq!(tenant.get(&gadget), Some(id));
    }

    #[test]
    fn test_type_id_is_stable() {
        let a = Gadget::descriptor().entity_type_id();
        let b = Gadget::descriptor().entity_type_id();
        assert_eq!(a, b);
    }

    #[test]
    fn test_integer_key_has_no_global_id() {
        let descriptor = Gadget::descriptor();
        assert_eq!(descriptor.global_id_of(&Gadget::default()), None);
    }
}
