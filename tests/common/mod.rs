//! Shared fixtures for the integration tests
//!
//! Customers own a nested address and cascade their delete state to orders.
//! Notes are plain records without tenant or soft delete.

#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use recordgraph::{
    field, reference, Actor, AuditInfo, DataStore, DbContext, DeleteState, Entity, EntityBehavior,
    EntityDescriptor, FixedActor, FixedTenant, MemoryStore, OperationContext, OperationKind, RepoError, RepoResult,
    Repository, RepositoryCore, UnitOfWork,
};
use recordgraph::store::ScanFilter;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub id: i64,
    pub tenant_id: Uuid,
    pub street: String,
    pub city: String,
}

impl Entity for Address {
    type Key = i64;
    const TYPE_NAME: &'static str = "address";

    fn descriptor() -> EntityDescriptor<Self> {
        EntityDescriptor::<Self>::new("id", |a| a.id, |a, id| a.id = id)
            .tenant("tenant_id", |a| a.tenant_id, |a, t| a.tenant_id = t)
            .field(field!(Address, id))
            .field(field!(Address, tenant_id))
            .field(field!(Address, street))
            .field(field!(Address, city))
    }
}

impl EntityBehavior for Address {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub tenant_id: Uuid,
    pub name: String,
    pub email: String,
    pub address_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default)]
    pub delete_state: DeleteState,
    #[serde(default)]
    pub audit: AuditInfo,
}

impl Entity for Customer {
    type Key = i64;
    const TYPE_NAME: &'static str = "customer";

    fn descriptor() -> EntityDescriptor<Self> {
        EntityDescriptor::<Self>::new("id", |c| c.id, |c, id| c.id = id)
            .tenant("tenant_id", |c| c.tenant_id, |c, t| c.tenant_id = t)
            .soft_delete(|c| &c.delete_state, |c| &mut c.delete_state)
            .audit(|c| &c.audit, |c| &mut c.audit)
            .field(field!(Customer, id))
            .field(field!(Customer, tenant_id))
            .field(field!(Customer, name))
            .field(field!(Customer, email))
            .field(field!(Customer, address_id))
            .reference(reference!(Customer, address: Address, address_id))
    }
}

#[async_trait]
impl EntityBehavior for Customer {
    async fn on_updated(core: &RepositoryCore, uow: &mut UnitOfWork, ctx: &OperationContext<Self>) -> RepoResult<()> {
        let email = &ctx.item().email;
        if !email.is_empty() && !email.contains('@') {
            return Err(RepoError::invalid_data(format!("customer email '{}' has no '@'", email)));
        }
        if !ctx.item().delete_state.is_deleted {
            return Ok(());
        }
        let id = ctx.item().id;
        core.cascade::<Order, _>(uow, ctx, move |order: &Order| order.customer_id == id)
            .await?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub tenant_id: Uuid,
    pub customer_id: i64,
    pub total: i64,
    #[serde(default)]
    pub delete_state: DeleteState,
    #[serde(default)]
    pub audit: AuditInfo,
}

impl Entity for Order {
    type Key = i64;
    const TYPE_NAME: &'static str = "order";

    fn descriptor() -> EntityDescriptor<Self> {
        EntityDescriptor::<Self>::new("id", |o| o.id, |o, id| o.id = id)
            .tenant("tenant_id", |o| o.tenant_id, |o, t| o.tenant_id = t)
            .soft_delete(|o| &o.delete_state, |o| &mut o.delete_state)
            .audit(|o| &o.audit, |o| &mut o.audit)
            .field(field!(Order, id))
            .field(field!(Order, tenant_id))
            .field(field!(Order, customer_id))
            .field(field!(Order, total))
    }
}

impl EntityBehavior for Order {}

/// Hook calls on notes, by note id
static NOTE_HOOKS: Mutex<Vec<(Uuid, OperationKind)>> = Mutex::new(Vec::new());

pub fn note_hooks(id: Uuid) -> Vec<OperationKind> {
    NOTE_HOOKS
        .lock()
        .unwrap()
        .iter()
        .filter(|(note, _)| *note == id)
        .map(|(_, operation)| *operation)
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: Uuid,
    pub name: String,
    pub body: String,
}

impl Entity for Note {
    type Key = Uuid;
    const TYPE_NAME: &'static str = "note";

    fn descriptor() -> EntityDescriptor<Self> {
        EntityDescriptor::<Self>::new("id", |n| n.id, |n, id| n.id = id)
            .field(field!(Note, id))
            .field(field!(Note, name))
            .field(field!(Note, body))
    }
}

#[async_trait]
impl EntityBehavior for Note {
    async fn on_added(_core: &RepositoryCore, _uow: &mut UnitOfWork, ctx: &OperationContext<Self>) -> RepoResult<()> {
        NOTE_HOOKS.lock().unwrap().push((ctx.item().id, ctx.operation()));
        Ok(())
    }

    async fn on_updated(_core: &RepositoryCore, _uow: &mut UnitOfWork, ctx: &OperationContext<Self>) -> RepoResult<()> {
        NOTE_HOOKS.lock().unwrap().push((ctx.item().id, ctx.operation()));
        Ok(())
    }
}

pub struct Fixture {
    pub store: Arc<dyn DataStore>,
    pub tenants: Arc<FixedTenant>,
    pub core: Arc<RepositoryCore>,
    pub context: DbContext,
    pub tenant: Uuid,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn DataStore>) -> Self {
        let tenant = Uuid::new_v4();
        let tenants = Arc::new(FixedTenant::new(tenant));
        let core = Arc::new(RepositoryCore::new(
            tenants.clone(),
            Arc::new(FixedActor(Actor::named("tester"))),
        ));
        let context = DbContext::new(store.clone());
        Self {
            store,
            tenants,
            core,
            context,
            tenant,
        }
    }

    pub fn repo<E: EntityBehavior>(&self) -> Repository<E> {
        Repository::bound(self.core.clone(), self.context.clone())
    }

    /// Repository over a new unit of work on the same store
    pub fn detached_repo<E: EntityBehavior>(&self) -> Repository<E> {
        Repository::bound(self.core.clone(), DbContext::new(self.store.clone()))
    }

    pub async fn save(&self) -> RepoResult<usize> {
        self.context.save_changes().await
    }

    /// Stored rows of a type across all tenants, deleted rows included
    pub async fn stored(&self, type_name: &str) -> RepoResult<usize> {
        let filter = ScanFilter::new(type_name).include_deleted(true);
        Ok(self.store.as_reader().scan(&filter).await?.len())
    }
}

pub fn customer(name: &str) -> Customer {
    Customer {
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
        ..Default::default()
    }
}

pub fn order(customer_id: i64, total: i64) -> Order {
    Order {
        customer_id,
        total,
        ..Default::default()
    }
}

pub fn note(name: &str) -> Note {
    Note {
        name: name.to_string(),
        body: String::new(),
        ..Default::default()
    }
}

/// Saved customer with `orders` saved orders
pub async fn customer_with_orders(fixture: &Fixture, name: &str, orders: usize) -> RepoResult<(Customer, Vec<Order>)> {
    let customers = fixture.repo::<Customer>();
    let order_repo = fixture.repo::<Order>();

    let customer = customers.add(customer(name)).await?;
    let mut added = Vec::new();
    for i in 0..orders {
        added.push(order_repo.add(order(customer.id, 100 * (i as i64 + 1))).await?);
    }
    fixture.save().await?;
    Ok((customer, added))
}
