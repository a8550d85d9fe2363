//! Entity lifecycle hooks
//!
//! Every hook is a no-op by default. An error returned by an overriding hook
//! aborts the operation and, inside [`crate::unit_of_work::DbContext::transaction`],
//! the whole transaction. Hooks receive the unit of work so they can reach
//! other repositories through [`RepositoryCore::scoped`], which is how
//! applications trigger cascades:
//!
//! ```rust,ignore
//! #[async_trait]
//! impl EntityBehavior for Customer {
//!     async fn on_updated(
//!         core: &RepositoryCore,
//!         uow: &mut UnitOfWork,
//!         ctx: &OperationContext<Self>,
//!     ) -> RepoResult<()> {
//!         let id = ctx.item().id;
//!         core.cascade::<Order, _>(uow, ctx, move |o| o.customer_id == id).await?;
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::context::OperationContext;
use crate::entity::Entity;
use crate::errors::RepoResult;
use crate::repository::RepositoryCore;
use crate::unit_of_work::UnitOfWork;

#[async_trait]
pub trait EntityBehavior: Entity {
    /// Called after a row is materialized from the store, before tracking
    fn on_loaded(&mut self) {}

    /// Called after the entity is registered as added; `ctx.item()` is the
    /// tracked value
    async fn on_added(
        _core: &RepositoryCore,
        _uow: &mut UnitOfWork,
        _ctx: &OperationContext<Self>,
    ) -> RepoResult<()> {
        Ok(())
    }

    /// Called after an update has been applied to the tracked entity
    async fn on_updated(
        _core: &RepositoryCore,
        _uow: &mut UnitOfWork,
        _ctx: &OperationContext<Self>,
    ) -> RepoResult<()> {
        Ok(())
    }

    /// Called before the entity is removed from the unit of work
    async fn on_deleting(
        _core: &RepositoryCore,
        _uow: &mut UnitOfWork,
        _ctx: &OperationContext<Self>,
    ) -> RepoResult<()> {
        Ok(())
    }

    /// Bring a self-deleted entity back; returns whether it was restored
    async fn restore_self_deleted(
        _core: &RepositoryCore,
        _uow: &mut UnitOfWork,
        _ctx: &OperationContext<Self>,
    ) -> RepoResult<bool> {
        Ok(false)
    }

    /// Bring a cascade-deleted entity back; returns whether it was restored
    async fn restore_cascade_deleted(
        _core: &RepositoryCore,
        _uow: &mut UnitOfWork,
        _ctx: &OperationContext<Self>,
    ) -> RepoResult<bool> {
        Ok(false)
    }
}
