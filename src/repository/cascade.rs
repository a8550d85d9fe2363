//! Soft-delete propagation along entity relationships
//!
//! An ordinary update of an origin marks its dependents cascade-deleted and
//! records which origin did it. Moving an origin to the recycle bin marks its
//! dependents recyclable-deleted, provided the origin itself carries that
//! flag. Every assignment is compared first, so running the same cascade
//! twice changes nothing.

use tracing::{debug, info};

use super::RepositoryCore;
use crate::behavior::EntityBehavior;
use crate::context::{OperationContext, OperationKind};
use crate::entity::{DeleteStamp, DeleteState, Entity, EntityDescriptor, EntityKey};
use crate::errors::{RepoError, RepoResult};
use crate::unit_of_work::UnitOfWork;

fn assign<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

fn delete_state_of<'a, D: Entity>(descriptor: &EntityDescriptor<D>, item: &'a mut D) -> RepoResult<&'a mut DeleteState> {
    descriptor
        .soft_delete_accessor()
        .map(|accessor| accessor.get_mut(item))
        .ok_or_else(|| RepoError::configuration(format!("{} does not support soft delete", D::TYPE_NAME)))
}

impl RepositoryCore {
    /// Apply the delete state implied by the context's origin to a dependent
    ///
    /// Returns whether anything changed.
    pub fn propagate_delete_state<D: Entity, T>(
        &self,
        descriptor: &EntityDescriptor<D>,
        item: &mut D,
        ctx: &OperationContext<T>,
    ) -> RepoResult<bool> {
        let origin = ctx.origin();
        if descriptor.entity_type_id() == origin.info.type_id
            && descriptor.key_of(item).to_storage_key() == origin.info.instance_id
        {
            return Ok(false);
        }

        let origin_state = origin.delete_state.clone().unwrap_or_default();
        let state = delete_state_of(descriptor, item)?;
        if state.is_deleted {
            return Ok(false);
        }

        let operation = ctx.origin_operation();
        if operation == OperationKind::MOVE_TO_RECYCLE_BIN {
            if !origin_state.is_recyclable_deleted {
                return Ok(false);
            }
            let mut changed = assign(&mut state.is_recyclable_deleted, true);
            changed |= assign(&mut state.recyclable_deleted, origin_state.recyclable_deleted);
            Ok(changed)
        } else if operation == OperationKind::UPDATE {
            let stamp = if origin_state.deleted.is_empty() {
                ctx.actor().stamp(ctx.time())
            } else {
                origin_state.deleted
            };
            let mut changed = assign(&mut state.is_cascade_deleted, true);
            changed |= assign(&mut state.cascade_deleted, stamp);
            changed |= assign(&mut state.cascade_deleted_by_origin_type_id, Some(origin.info.type_id));
            changed |= assign(
                &mut state.cascade_deleted_by_origin_id,
                Some(origin.info.instance_id.clone()),
            );
            Ok(changed)
        } else {
            Err(RepoError::invariant(format!(
                "cannot cascade delete state for origin operation {}",
                operation
            )))
        }
    }

    /// True when the item was cascade-deleted by the context's origin
    pub fn is_cascade_deleted_by_origin<D: Entity, T>(
        &self,
        descriptor: &EntityDescriptor<D>,
        item: &D,
        ctx: &OperationContext<T>,
    ) -> bool {
        let Some(accessor) = descriptor.soft_delete_accessor() else {
            return false;
        };
        let state = accessor.get(item);
        let origin = ctx.origin_info();
        state.is_cascade_deleted
            && state.cascade_deleted_by_origin_type_id == Some(origin.type_id)
            && state.cascade_deleted_by_origin_id.as_deref() == Some(origin.instance_id.as_str())
    }

    /// Fill the generic delete flag and stamp when a specific flag is set
    ///
    /// The stamp is taken from the first populated specific stamp, falling
    /// back to the context's time and actor.
    pub fn complete_delete_info<D: Entity, T>(
        &self,
        descriptor: &EntityDescriptor<D>,
        item: &mut D,
        ctx: &OperationContext<T>,
    ) -> RepoResult<bool> {
        self.complete_delete_info_with(descriptor, item, || ctx.actor().stamp(ctx.time()))
    }

    pub(crate) fn complete_delete_info_with<D: Entity>(
        &self,
        descriptor: &EntityDescriptor<D>,
        item: &mut D,
        fallback: impl FnOnce() -> DeleteStamp,
    ) -> RepoResult<bool> {
        let state = delete_state_of(descriptor, item)?;
        if !state.any_flag() {
            return Ok(false);
        }

        let mut changed = assign(&mut state.is_deleted, true);
        if state.deleted.is_empty() {
            let stamp: DeleteStamp = [&state.self_deleted, &state.cascade_deleted, &state.recyclable_deleted]
                .into_iter()
                .find(|stamp| !stamp.is_empty())
                .cloned()
                .unwrap_or_else(fallback);
            changed |= assign(&mut state.deleted, stamp);
        }
        Ok(changed)
    }

    /// Reset every delete flag group
    pub fn clear_deleted<D: Entity>(&self, descriptor: &EntityDescriptor<D>, item: &mut D) -> RepoResult<bool> {
        let state = delete_state_of(descriptor, item)?;
        Ok(assign(state, DeleteState::default()))
    }

    /// Propagate the context's delete state to the dependents of type `D`
    /// matching `predicate`
    ///
    /// Each changed dependent is completed, written back to the unit of work
    /// and passed to `D::on_updated` with a sub-context, so cascades continue
    /// through the dependent's own hooks. Returns the number of changed
    /// dependents.
    pub async fn cascade<D, T>(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext<T>,
        predicate: impl Fn(&D) -> bool + Send + Sync + 'static,
    ) -> RepoResult<usize>
    where
        D: EntityBehavior,
        T: Send + Sync,
    {
        let operation = ctx.origin_operation();
        if operation != OperationKind::UPDATE && operation != OperationKind::MOVE_TO_RECYCLE_BIN {
            return Err(RepoError::invariant(format!(
                "cannot cascade delete state for origin operation {}",
                operation
            )));
        }

        let descriptor = self.descriptor::<D>()?;
        let dependents = self.scoped::<D>(uow).local_and_query(predicate, false).await?;

        let mut changed = 0;
        for mut dependent in dependents {
            if self.is_cascade_deleted_by_origin(&descriptor, &dependent, ctx) {
                continue;
            }
            let propagated = self.propagate_delete_state(&descriptor, &mut dependent, ctx)?;
            if !propagated {
                continue;
            }
            self.complete_delete_info(&descriptor, &mut dependent, ctx)?;
            self.stamp_modified(&descriptor, &mut dependent, ctx.time());

            let key = descriptor.key_of(&dependent);
            uow.replace::<D>(&key, dependent.clone())?;
            debug!(
                entity = D::TYPE_NAME,
                key = %key.to_storage_key(),
                origin = %ctx.origin_info().type_name,
                "Propagated delete state"
            );

            let sub = ctx.sub_context(dependent, OperationKind::UPDATE, None);
            D::on_updated(self, uow, &sub).await?;
            changed += 1;
        }

        if changed > 0 {
            info!(
                entity = D::TYPE_NAME,
                origin = %ctx.origin_info().type_name,
                origin_id = %ctx.origin_info().instance_id,
                changed,
                "Cascade completed"
            );
        }
        Ok(changed)
    }
}
