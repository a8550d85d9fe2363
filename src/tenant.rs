//! Current tenant and actor providers
//!
//! Both are injected into [`crate::repository::RepositoryCore`] at
//! construction. Request-scoped applications implement the traits over their
//! own session state.

use std::sync::RwLock;
use uuid::Uuid;

use crate::context::Actor;
use crate::errors::{RepoError, RepoResult};

/// Source of the tenant the current caller acts for
pub trait TenantProvider: Send + Sync {
    /// Current tenant id
    ///
    /// With `required = false` a missing tenant is `Ok(None)`; with
    /// `required = true` it is a configuration error.
    fn tenant_id(&self, required: bool) -> RepoResult<Option<Uuid>>;
}

/// Provider for single-tenant deployments and tools
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTenant;

impl TenantProvider for NoTenant {
    fn tenant_id(&self, required: bool) -> RepoResult<Option<Uuid>> {
        if required {
            return Err(RepoError::configuration("no current tenant is in scope"));
        }
        Ok(None)
    }
}

/// Provider holding a switchable tenant id
#[derive(Debug, Default)]
pub struct FixedTenant {
    current: RwLock<Option<Uuid>>,
}

impl FixedTenant {
    pub fn new(tenant_id: Uuid) -> Self {
        Self {
            current: RwLock::new(Some(tenant_id)),
        }
    }

    pub fn set(&self, tenant_id: Option<Uuid>) -> RepoResult<()> {
        *self
            .current
            .write()
            .map_err(|_| RepoError::configuration("tenant lock poisoned"))? = tenant_id;
        Ok(())
    }
}

impl TenantProvider for FixedTenant {
    fn tenant_id(&self, required: bool) -> RepoResult<Option<Uuid>> {
        let current = self
            .current
            .read()
            .map_err(|_| RepoError::configuration("tenant lock poisoned"))?;
        match *current {
            Some(id) => Ok(Some(id)),
            None if required => Err(RepoError::configuration("no current tenant is in scope")),
            None => Ok(None),
        }
    }
}

/// Source of the actor recorded in audit and delete stamps
pub trait ActorProvider: Send + Sync {
    fn current_actor(&self) -> Actor;
}

#[derive(Clone, Debug, Default)]
pub struct FixedActor(pub Actor);

impl ActorProvider for FixedActor {
    fn current_actor(&self) -> Actor {
        self.0.clone()
    }
}
