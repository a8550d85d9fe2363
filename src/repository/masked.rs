//! Masked partial updates
//!
//! Only the fields and references named by the update mask are applied to
//! the tracked target. Leaf fields coming from a detached item are copied and
//! marked only when they differ, which makes reapplying an unchanged mask a
//! no-op write. Nested references are created or updated recursively through
//! sub-contexts; an established nested reference can never be cleared or
//! re-pointed.

use std::sync::Arc;
use tracing::debug;

use super::RepositoryCore;
use crate::behavior::EntityBehavior;
use crate::context::{OperationContext, OperationKind};
use crate::entity::{EntityDescriptor, EntityKey, Field, Reference, ReferenceAccessor};
use crate::errors::{RepoError, RepoResult};
use crate::mask::{Binding, Cardinality, DataGraphMask, ReferenceMask};
use crate::unit_of_work::{ItemSource, UnitOfWork};

fn masked_field<'d, E: EntityBehavior>(descriptor: &'d EntityDescriptor<E>, name: &str) -> RepoResult<&'d Field<E>> {
    descriptor
        .field_by_name(name)
        .ok_or_else(|| RepoError::configuration(format!("{} has no field '{}'", E::TYPE_NAME, name)))
}

/// Resolve a single-valued reference named by the mask
fn masked_reference<'d, E: EntityBehavior>(
    descriptor: &'d EntityDescriptor<E>,
    reference_mask: &ReferenceMask,
) -> RepoResult<&'d dyn ReferenceAccessor<E>> {
    if reference_mask.cardinality == Cardinality::Many {
        return Err(RepoError::configuration(format!(
            "{}.{}: many-valued references are not supported by masked updates",
            E::TYPE_NAME,
            reference_mask.property
        )));
    }
    let reference = descriptor.reference_by_name(&reference_mask.property).ok_or_else(|| {
        RepoError::configuration(format!(
            "{} has no reference '{}'",
            E::TYPE_NAME,
            reference_mask.property
        ))
    })?;
    if reference.foreign_key() != reference_mask.foreign_key {
        return Err(RepoError::configuration(format!(
            "{}.{} uses foreign key '{}', not '{}'",
            E::TYPE_NAME,
            reference.name(),
            reference.foreign_key(),
            reference_mask.foreign_key
        )));
    }
    if reference_mask.binding == Binding::Nested && reference_mask.to.is_none() {
        return Err(RepoError::configuration(format!(
            "{}.{} is nested but its mask has no target fields",
            E::TYPE_NAME,
            reference.name()
        )));
    }
    Ok(reference)
}

impl RepositoryCore {
    /// Check `mask` against `E` and every nested type it reaches
    pub fn validate_mask<E: EntityBehavior>(&self, mask: &DataGraphMask) -> RepoResult<()> {
        let descriptor = self.descriptor::<E>()?;
        for name in &mask.fields {
            masked_field(&*descriptor, name)?;
        }
        for reference_mask in &mask.references {
            let reference = masked_reference(&*descriptor, reference_mask)?;
            if let (Binding::Nested, Some(child_mask)) = (reference_mask.binding, &reference_mask.to) {
                reference.validate_nested(self, child_mask)?;
            }
        }
        Ok(())
    }

    /// Apply `ctx.item()` onto the tracked entity with the same key,
    /// restricted to `ctx.update_mask()`
    ///
    /// The whole mask is checked before anything is touched. When a later
    /// step fails, the tracked state is put back as it was before the call.
    pub async fn update_masked<E: EntityBehavior>(
        &self,
        uow: &mut UnitOfWork,
        ctx: OperationContext<E>,
        source: ItemSource,
    ) -> RepoResult<E> {
        let mask = ctx
            .shared_mask()
            .ok_or_else(|| RepoError::configuration(format!("masked update of {} without a mask", E::TYPE_NAME)))?;
        self.validate_mask::<E>(&mask)?;

        let checkpoint = uow.checkpoint();
        match self.apply_mask(uow, ctx, source).await {
            Ok(updated) => Ok(updated),
            Err(err) => {
                uow.restore(checkpoint);
                debug!(entity = E::TYPE_NAME, error = %err, "Masked update discarded");
                Err(err)
            }
        }
    }

    async fn apply_mask<E: EntityBehavior>(
        &self,
        uow: &mut UnitOfWork,
        ctx: OperationContext<E>,
        source: ItemSource,
    ) -> RepoResult<E> {
        let descriptor = self.descriptor::<E>()?;
        let mask = ctx
            .shared_mask()
            .ok_or_else(|| RepoError::configuration(format!("masked update of {} without a mask", E::TYPE_NAME)))?;
        let item = ctx.item();

        let key = descriptor.key_of(item);
        if key.is_default() {
            return Err(RepoError::invalid_data(format!(
                "{} update requires a value for {}",
                E::TYPE_NAME,
                descriptor.key_name()
            )));
        }
        let mut target = self.load_visible(uow, &descriptor, &key).await?.ok_or_else(|| {
            RepoError::invalid_data(format!("{} '{}' does not exist", E::TYPE_NAME, key.to_storage_key()))
        })?;

        let in_place = source == ItemSource::InPlace;
        let mut marks: Vec<&'static str> = Vec::new();

        for name in &mask.fields {
            let field = masked_field(&*descriptor, name)?;
            if in_place {
                marks.push(field.name());
            } else if field.differs(&target, item) {
                field.copy(&mut target, item);
                marks.push(field.name());
            }
        }

        for reference_mask in &mask.references {
            let reference = masked_reference(&*descriptor, reference_mask)?;
            match (reference_mask.binding, &reference_mask.to) {
                (Binding::Loose, _) => {
                    if reference.foreign_key_differs(&target, item) {
                        reference.copy_foreign_key(&mut target, item);
                        marks.push(reference.foreign_key());
                    }
                }
                (Binding::Nested, Some(child_mask)) => {
                    if reference.apply_nested(self, uow, &ctx, &mut target, child_mask).await? {
                        marks.push(reference.foreign_key());
                    }
                }
                (Binding::Nested, None) => {}
            }
        }

        if !marks.is_empty() {
            self.stamp_modified(&descriptor, &mut target, ctx.time());
        }
        uow.replace::<E>(&key, target.clone())?;
        for field in marks.iter().copied() {
            uow.mark_modified::<E>(&key, field)?;
        }
        debug!(
            entity = E::TYPE_NAME,
            key = %key.to_storage_key(),
            modified = marks.len(),
            depth = ctx.depth(),
            "Applied masked update"
        );

        let updated = ctx.sub_context(target, ctx.operation(), Some(mask));
        E::on_updated(self, uow, &updated).await?;

        Ok(uow.tracked::<E>(&key).cloned().unwrap_or_else(|| updated.into_item()))
    }

    /// Create or update the nested object behind `reference`
    ///
    /// Returns true when the foreign key on `target` was assigned.
    pub async fn apply_nested_reference<E, C>(
        &self,
        uow: &mut UnitOfWork,
        ctx: &OperationContext<E>,
        target: &mut E,
        reference: &Reference<E, C>,
        child_mask: &DataGraphMask,
    ) -> RepoResult<bool>
    where
        E: EntityBehavior,
        C: EntityBehavior,
    {
        let item = ctx.item();
        let incoming = reference.navigation(item).cloned();
        let established = reference.key_of(target);
        let child_descriptor = self.descriptor::<C>()?;

        match (incoming, established) {
            (None, None) => Ok(false),
            (None, Some(_)) => Err(RepoError::invariant(format!(
                "{}.{} is an established nested reference and cannot be cleared",
                E::TYPE_NAME,
                reference.name()
            ))),
            (Some(child), None) => {
                let created = self
                    .register_added::<C>(uow, &child_descriptor, child, true)
                    .await?;
                let child_key = child_descriptor.key_of(&created);
                let added = ctx
                    .sub_context(created, OperationKind::ADD, Some(Arc::new(child_mask.clone())))
                    .as_nested();
                C::on_added(self, uow, &added).await?;

                let tracked = uow
                    .tracked::<C>(&child_key)
                    .cloned()
                    .unwrap_or_else(|| added.into_item());
                reference.set_key(target, Some(child_key));
                reference.set_navigation(target, Some(tracked));
                Ok(true)
            }
            (Some(mut child), Some(established)) => {
                let child_key = child_descriptor.key_of(&child);
                let repointed = (!child_key.is_default() && child_key != established)
                    || reference.key_of(item).map_or(false, |key| key != established);
                if repointed {
                    return Err(RepoError::invariant(format!(
                        "{}.{} is an established nested reference to {} '{}' and cannot be re-pointed",
                        E::TYPE_NAME,
                        reference.name(),
                        C::TYPE_NAME,
                        established.to_storage_key()
                    )));
                }

                child_descriptor.set_key(&mut child, established);
                let nested = ctx.sub_context(child, OperationKind::UPDATE, Some(Arc::new(child_mask.clone())));
                let updated = self.apply_mask::<C>(uow, nested, ItemSource::Detached).await?;
                reference.set_navigation(target, Some(updated));
                Ok(false)
            }
        }
    }
}
