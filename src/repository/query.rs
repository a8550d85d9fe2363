use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use super::RepositoryCore;
use crate::behavior::EntityBehavior;
use crate::entity::{Entity, EntityDescriptor};
use crate::errors::RepoResult;
use crate::store::ScanFilter;
use crate::unit_of_work::{DbContext, UnitOfWork};

/// Row predicate evaluated against materialized entities
pub type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

type Comparator<E> = Box<dyn Fn(&E, &E) -> Ordering + Send + Sync>;

pub(crate) enum QueryTarget<'r> {
    Shared(DbContext),
    Scoped(&'r mut UnitOfWork),
}

/// Lazily evaluated query over persisted rows of one type
///
/// Tenant and soft-delete filters are fixed when the query is created.
/// Nothing is read until [`Query::fetch`], [`Query::fetch_one`] or
/// [`Query::count`] runs. Rows already tracked are returned as their tracked
/// value.
pub struct Query<'r, E: Entity> {
    core: &'r RepositoryCore,
    target: QueryTarget<'r>,
    tenant_id: Option<Uuid>,
    include_deleted: bool,
    predicates: Vec<Predicate<E>>,
    excluded: BTreeSet<E::Key>,
    order: Option<Comparator<E>>,
    skip: usize,
    limit: Option<usize>,
}

impl<'r, E: EntityBehavior> Query<'r, E> {
    pub(crate) fn new(
        core: &'r RepositoryCore,
        target: QueryTarget<'r>,
        tenant_id: Option<Uuid>,
        include_deleted: bool,
    ) -> Self {
        Self {
            core,
            target,
            tenant_id,
            include_deleted,
            predicates: Vec::new(),
            excluded: BTreeSet::new(),
            order: None,
            skip: 0,
            limit: None,
        }
    }

    pub fn filter(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub(crate) fn filter_shared(mut self, predicate: Predicate<E>) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Leave out rows with these keys
    pub fn exclude_keys(mut self, keys: impl IntoIterator<Item = E::Key>) -> Self {
        self.excluded.extend(keys);
        self
    }

    pub fn order_by<K: Ord + 'static>(mut self, key: impl Fn(&E) -> K + Send + Sync + 'static) -> Self {
        self.order = Some(Box::new(move |a: &E, b: &E| key(a).cmp(&key(b))));
        self
    }

    pub fn skip(mut self, count: usize) -> Self {
        self.skip = count;
        self
    }

    pub fn limit(mut self, count: usize) -> Self {
        self.limit = Some(count);
        self
    }

    pub async fn fetch(self) -> RepoResult<Vec<E>> {
        let Query {
            core,
            target,
            tenant_id,
            include_deleted,
            predicates,
            excluded,
            order,
            skip,
            limit,
        } = self;
        let plan = QueryPlan {
            tenant_id,
            include_deleted,
            predicates,
            excluded,
        };

        let mut rows = match target {
            QueryTarget::Shared(context) => {
                let mut uow = context.lock().await;
                plan.run(core, &mut uow).await?
            }
            QueryTarget::Scoped(uow) => plan.run(core, uow).await?,
        };

        if let Some(order) = order {
            rows.sort_by(|a, b| order(a, b));
        }
        let rows = rows.into_iter().skip(skip);
        Ok(match limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    pub async fn fetch_one(self) -> RepoResult<Option<E>> {
        Ok(self.limit(1).fetch().await?.into_iter().next())
    }

    pub async fn count(self) -> RepoResult<usize> {
        Ok(self.fetch().await?.len())
    }
}

struct QueryPlan<E: Entity> {
    tenant_id: Option<Uuid>,
    include_deleted: bool,
    predicates: Vec<Predicate<E>>,
    excluded: BTreeSet<E::Key>,
}

impl<E: EntityBehavior> QueryPlan<E> {
    fn matches(&self, descriptor: &EntityDescriptor<E>, entity: &E) -> bool {
        if !self.include_deleted && descriptor.is_deleted(entity) {
            return false;
        }
        if let (Some(tenant), Some(accessor)) = (self.tenant_id, descriptor.tenant_accessor()) {
            if accessor.get(entity) != Some(tenant) {
                return false;
            }
        }
        self.predicates.iter().all(|predicate| predicate(entity))
    }

    async fn run(&self, core: &RepositoryCore, uow: &mut UnitOfWork) -> RepoResult<Vec<E>> {
        let descriptor = core.descriptor::<E>()?;
        let filter = ScanFilter::new(E::TYPE_NAME)
            .tenant(self.tenant_id)
            .include_deleted(self.include_deleted);
        let records = uow.reader().scan(&filter).await?;

        let mut rows = Vec::new();
        for record in records {
            let key = core.stored_key::<E>(&record)?;
            if self.excluded.contains(&key) {
                continue;
            }
            // tracked values win over the stored row, removed rows are skipped
            if uow.is_tracked::<E>(&key) {
                if let Some(entity) = uow.tracked::<E>(&key) {
                    if self.matches(&descriptor, entity) {
                        rows.push(entity.clone());
                    }
                }
                continue;
            }

            let version = record.version;
            let entity = core.decode(&descriptor, key, record.data)?;
            if self.matches(&descriptor, &entity) {
                rows.push(uow.attach(&descriptor, entity, version)?.clone());
            }
        }
        Ok(rows)
    }
}
