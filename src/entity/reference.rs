//! Single-valued references between entities
//!
//! A reference pairs a navigation property (`Option<C>` on the parent) with
//! the foreign key that identifies the referenced row. The navigation copy is
//! derived state and is never persisted with the parent.

use async_trait::async_trait;

use super::{Entity, EntityKey};
use crate::behavior::EntityBehavior;
use crate::context::OperationContext;
use crate::errors::RepoResult;
use crate::mask::DataGraphMask;
use crate::repository::RepositoryCore;
use crate::unit_of_work::UnitOfWork;

/// Build a [`Reference`] from a navigation field and its foreign key field
///
/// ```rust,ignore
/// .reference(reference!(Customer, address: Address, address_id))
/// ```
#[macro_export]
macro_rules! reference {
    ($ty:ty, $nav:ident : $child:ty, $fk:ident) => {
        $crate::entity::Reference::<$ty, $child>::new(
            stringify!($nav),
            stringify!($fk),
            |entity| entity.$nav.as_ref(),
            |entity, value| entity.$nav = value,
            |entity| entity.$fk.clone(),
            |entity, key| entity.$fk = key,
        )
    };
}

/// Type-erased view of a reference, stored in the parent's descriptor
#[async_trait]
pub trait ReferenceAccessor<E: Entity>: Send + Sync {
    fn name(&self) -> &'static str;

    fn foreign_key(&self) -> &'static str;

    fn foreign_key_differs(&self, a: &E, b: &E) -> bool;

    fn copy_foreign_key(&self, target: &mut E, source: &E);

    /// Drop the navigation copy before the parent is persisted
    fn clear_navigation(&self, entity: &mut E);

    /// Check the mask of an owned reference against the referenced type
    fn validate_nested(&self, core: &RepositoryCore, child_mask: &DataGraphMask) -> RepoResult<()>;

    /// Apply an owned (nested) reference of `ctx.item` onto `target`
    ///
    /// Returns true when the foreign key on `target` was assigned.
    async fn apply_nested(
        &self,
        core: &RepositoryCore,
        uow: &mut UnitOfWork,
        ctx: &OperationContext<E>,
        target: &mut E,
        child_mask: &DataGraphMask,
    ) -> RepoResult<bool>;
}

/// Typed accessors of a reference from `E` to `C`
pub struct Reference<E, C: Entity> {
    name: &'static str,
    foreign_key: &'static str,
    get: fn(&E) -> Option<&C>,
    set: fn(&mut E, Option<C>),
    get_key: fn(&E) -> Option<C::Key>,
    set_key: fn(&mut E, Option<C::Key>),
}

impl<E, C: Entity> Reference<E, C> {
    pub fn new(
        name: &'static str,
        foreign_key: &'static str,
        get: fn(&E) -> Option<&C>,
        set: fn(&mut E, Option<C>),
        get_key: fn(&E) -> Option<C::Key>,
        set_key: fn(&mut E, Option<C::Key>),
    ) -> Self {
        Self {
            name,
            foreign_key,
            get,
            set,
            get_key,
            set_key,
        }
    }

    pub fn navigation<'a>(&self, entity: &'a E) -> Option<&'a C> {
        (self.get)(entity)
    }

    pub fn set_navigation(&self, entity: &mut E, value: Option<C>) {
        (self.set)(entity, value)
    }

    /// Foreign key value, with a default key treated as unset
    pub fn key_of(&self, entity: &E) -> Option<C::Key> {
        (self.get_key)(entity).filter(|key| !key.is_default())
    }

    pub fn set_key(&self, entity: &mut E, key: Option<C::Key>) {
        (self.set_key)(entity, key)
    }
}

#[async_trait]
impl<E, C> ReferenceAccessor<E> for Reference<E, C>
where
    E: EntityBehavior,
    C: EntityBehavior,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn foreign_key(&self) -> &'static str {
        self.foreign_key
    }

    fn foreign_key_differs(&self, a: &E, b: &E) -> bool {
        self.key_of(a) != self.key_of(b)
    }

    fn copy_foreign_key(&self, target: &mut E, source: &E) {
        self.set_key(target, self.key_of(source));
    }

    fn clear_navigation(&self, entity: &mut E) {
        self.set_navigation(entity, None);
    }

    fn validate_nested(&self, core: &RepositoryCore, child_mask: &DataGraphMask) -> RepoResult<()> {
        core.validate_mask::<C>(child_mask)
    }

    async fn apply_nested(
        &self,
        core: &RepositoryCore,
        uow: &mut UnitOfWork,
        ctx: &OperationContext<E>,
        target: &mut E,
        child_mask: &DataGraphMask,
    ) -> RepoResult<bool> {
        core.apply_nested_reference(uow, ctx, target, self, child_mask)
            .await
    }
}
