pub mod behavior;
pub mod config;
pub mod context;
pub mod entity;
pub mod errors;
pub mod mask;
pub mod repository;
pub mod store;
pub mod tenant;
pub mod unit_of_work;

pub mod database;

pub use behavior::EntityBehavior;
pub use config::{StoreBackend, StoreConfig};
pub use context::{Actor, OperationContext, OperationKind, Origin, OriginInfo};
pub use entity::{
    AuditInfo, DeleteStamp, DeleteState, Entity, EntityDescriptor, EntityKey, KeyGeneration, RecordKey,
    Reference,
};
pub use errors::{RepoError, RepoResult};
pub use mask::{Binding, Cardinality, DataGraphMask, ReferenceMask};
pub use repository::{
    update_nested_collection, DbRepository, Query, ReconcileSummary, Repository, RepositoryCore,
    ScopedRepository,
};
pub use store::{DataStore, MemoryStore, SeaOrmStore};
pub use tenant::{ActorProvider, FixedActor, FixedTenant, NoTenant, TenantProvider};
pub use unit_of_work::{DbContext, EntryState, ItemSource, UnitOfWork};
