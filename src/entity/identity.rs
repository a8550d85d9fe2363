use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::{Entity, EntityDescriptor};
use crate::errors::{RepoError, RepoResult};

type CachedDescriptor = Arc<dyn Any + Send + Sync>;

/// Resolves and caches entity descriptors, once per type
///
/// Descriptors are built and validated on first access and shared afterwards.
/// Concurrent first accesses may both build a descriptor; the first one stored
/// wins and the other is dropped.
#[derive(Default)]
pub struct IdentityResolver {
    cache: RwLock<HashMap<TypeId, CachedDescriptor>>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve<E: Entity>(&self) -> RepoResult<Arc<EntityDescriptor<E>>> {
        if let Some(found) = self.cached::<E>()? {
            return Ok(found);
        }

        let descriptor = E::descriptor();
        descriptor.validate()?;
        debug!(
            entity = E::TYPE_NAME,
            multitenant = descriptor.is_multitenant(),
            soft_delete = descriptor.soft_delete_accessor().is_some(),
            "Resolved entity identity"
        );

        let mut cache = self
            .cache
            .write()
            .map_err(|_| RepoError::configuration("identity cache lock poisoned"))?;
        let entry = cache
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Arc::new(descriptor) as CachedDescriptor)
            .clone();
        drop(cache);

        Self::downcast::<E>(entry)
    }

    /// Number of types resolved so far
    pub fn len(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached<E: Entity>(&self) -> RepoResult<Option<Arc<EntityDescriptor<E>>>> {
        let cache = self
            .cache
            .read()
            .map_err(|_| RepoError::configuration("identity cache lock poisoned"))?;
        match cache.get(&TypeId::of::<E>()) {
            Some(entry) => Self::downcast::<E>(entry.clone()).map(Some),
            None => Ok(None),
        }
    }

    fn downcast<E: Entity>(entry: CachedDescriptor) -> RepoResult<Arc<EntityDescriptor<E>>> {
        entry.downcast::<EntityDescriptor<E>>().map_err(|_| {
            RepoError::configuration(format!("cached descriptor for {} has the wrong type", E::TYPE_NAME))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct Widget {
        id: i64,
        name: String,
    }

    impl Entity for Widget {
        type Key = i64;
        const TYPE_NAME: &'static str = "widget";

        fn descriptor() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("id", |w| w.id, |w, id| w.id = id)
                .field(crate::field!(Widget, id))
                .field(crate::field!(Widget, name))
        }
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct Broken {
        id: i64,
    }

    impl Entity for Broken {
        type Key = i64;
        const TYPE_NAME: &'static str = "broken";

        fn descriptor() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("broken_id", |b| b.id, |b, id| b.id = id)
        }
    }

    #[test]
    fn test_resolve_once_per_type() {
        let resolver = IdentityResolver::new();
        let first = resolver.resolve::<Widget>().unwrap();
        let second = resolver.resolve::<Widget>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn test_invalid_descriptor_is_not_cached() {
        let resolver = IdentityResolver::new();
        let Err(err) = resolver.resolve::<Broken>() else {
            panic!("a descriptor with an undeclared key field must be rejected");
        };
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_concurrent_first_access() {
        let resolver = Arc::new(IdentityResolver::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                std::thread::spawn(move || resolver.resolve::<Widget>().unwrap())
            })
            .collect();
        let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(resolved.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }
}
