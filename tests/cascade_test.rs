//! Soft-delete cascade tests
//!
//! Customers cascade their delete state to their orders from `on_updated`.

mod common;

use anyhow::Result;
use common::*;
use chrono::Utc;
use recordgraph::{Actor, Entity, OperationKind, RepoError};

async fn orders_of(fixture: &Fixture, customer_id: i64) -> Result<Vec<Order>> {
    let mut orders = fixture
        .detached_repo::<Order>()
        .query(true)?
        .filter(move |o| o.customer_id == customer_id)
        .fetch()
        .await?;
    orders.sort_by_key(|o| o.id);
    Ok(orders)
}

#[tokio::test]
async fn test_soft_delete_cascades_to_dependents() -> Result<()> {
    let fixture = Fixture::new();
    let (ada, _) = customer_with_orders(&fixture, "Ada", 3).await?;
    let (grace, _) = customer_with_orders(&fixture, "Grace", 1).await?;

    let deleted = fixture.repo::<Customer>().soft_delete(&ada.id).await?;
    assert!(deleted.delete_state.is_self_deleted);
    assert!(deleted.delete_state.is_deleted);
    assert_eq!(deleted.delete_state.deleted.by.as_deref(), Some("tester"));
    assert_eq!(fixture.save().await?, 4);

    let type_id = Customer::descriptor().entity_type_id();
    for order in orders_of(&fixture, ada.id).await? {
        let state = &order.delete_state;
        assert!(state.is_cascade_deleted);
        assert!(state.is_deleted);
        assert!(!state.is_self_deleted);
        assert_eq!(state.cascade_deleted_by_origin_type_id, Some(type_id));
        assert_eq!(state.cascade_deleted_by_origin_id.as_deref(), Some(ada.id.to_string().as_str()));
        assert_eq!(state.cascade_deleted, deleted.delete_state.deleted);
        assert_eq!(state.deleted, state.cascade_deleted);
        assert_eq!(order.audit.modified_by.as_deref(), Some("tester"));
    }

    for order in orders_of(&fixture, grace.id).await? {
        assert!(!order.delete_state.is_deleted);
    }
    Ok(())
}

#[tokio::test]
async fn test_cascade_is_attributed_and_idempotent() -> Result<()> {
    let fixture = Fixture::new();
    let (ada, _) = customer_with_orders(&fixture, "Ada", 2).await?;
    let (grace, _) = customer_with_orders(&fixture, "Grace", 0).await?;

    let deleted = fixture.repo::<Customer>().soft_delete(&ada.id).await?;
    fixture.save().await?;

    let descriptor = fixture.core.descriptor::<Order>()?;
    let same_origin = fixture.core.create_context(OperationKind::UPDATE, deleted.clone())?;
    let other_origin = fixture.core.create_context(OperationKind::UPDATE, grace)?;
    for order in orders_of(&fixture, ada.id).await? {
        assert!(fixture.core.is_cascade_deleted_by_origin(&descriptor, &order, &same_origin));
        assert!(!fixture.core.is_cascade_deleted_by_origin(&descriptor, &order, &other_origin));
    }

    let ada_id = ada.id;
    let changed = {
        let mut uow = fixture.context.lock().await;
        fixture
            .core
            .cascade::<Order, _>(&mut uow, &same_origin, move |o: &Order| o.customer_id == ada_id)
            .await?
    };
    assert_eq!(changed, 0);
    assert_eq!(fixture.save().await?, 0);

    // deleting the origin again leaves its dependents alone
    fixture.repo::<Customer>().soft_delete(&ada.id).await?;
    let uow = fixture.context.lock().await;
    assert!(uow.modified_fields::<Order>(&1).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cascade_skips_dependent_already_attributed_to_origin() -> Result<()> {
    let fixture = Fixture::new();
    let (ada, orders) = customer_with_orders(&fixture, "Ada", 2).await?;

    // flagged by this customer earlier but never completed
    let type_id = Customer::descriptor().entity_type_id();
    let origin_id = ada.id.to_string();
    fixture
        .repo::<Order>()
        .edit_tracked(&orders[0].id, move |o| {
            o.delete_state.is_cascade_deleted = true;
            o.delete_state.cascade_deleted_by_origin_type_id = Some(type_id);
            o.delete_state.cascade_deleted_by_origin_id = Some(origin_id);
        })
        .await?;

    fixture.repo::<Customer>().soft_delete(&ada.id).await?;

    let uow = fixture.context.lock().await;
    let attributed = uow.tracked::<Order>(&orders[0].id).expect("tracked order");
    assert!(attributed.delete_state.is_cascade_deleted);
    assert!(!attributed.delete_state.is_deleted);
    assert!(attributed.delete_state.cascade_deleted.is_empty());
    assert!(attributed.audit.modified_on.is_none());

    let fresh = uow.tracked::<Order>(&orders[1].id).expect("tracked order");
    assert!(fresh.delete_state.is_cascade_deleted);
    assert!(fresh.delete_state.is_deleted);
    Ok(())
}

#[tokio::test]
async fn test_move_to_recycle_bin_cascades_recyclable_flag() -> Result<()> {
    let fixture = Fixture::new();
    let (ada, orders) = customer_with_orders(&fixture, "Ada", 3).await?;
    assert_eq!(orders.len(), 3);

    let recycled = fixture.repo::<Customer>().move_to_recycle_bin(&ada.id).await?;
    assert!(recycled.delete_state.is_recyclable_deleted);
    assert!(recycled.delete_state.is_deleted);
    assert_eq!(fixture.save().await?, 4);

    let orders = orders_of(&fixture, ada.id).await?;
    assert_eq!(orders.len(), 3);
    for order in orders {
        let state = &order.delete_state;
        assert!(state.is_recyclable_deleted);
        assert!(!state.is_cascade_deleted);
        assert!(state.is_deleted);
        assert_eq!(state.recyclable_deleted, recycled.delete_state.recyclable_deleted);
        assert_eq!(state.deleted, state.recyclable_deleted);
    }
    Ok(())
}

#[tokio::test]
async fn test_recycle_cascade_requires_recyclable_origin() -> Result<()> {
    let fixture = Fixture::new();
    let (ada, _) = customer_with_orders(&fixture, "Ada", 3).await?;

    let ctx = fixture.core.create_context(OperationKind::MOVE_TO_RECYCLE_BIN, ada.clone())?;
    let ada_id = ada.id;
    let changed = {
        let mut uow = fixture.context.lock().await;
        fixture
            .core
            .cascade::<Order, _>(&mut uow, &ctx, move |o: &Order| o.customer_id == ada_id)
            .await?
    };
    assert_eq!(changed, 0);
    assert_eq!(fixture.save().await?, 0);

    for order in orders_of(&fixture, ada.id).await? {
        assert_eq!(order.delete_state, Default::default());
    }
    Ok(())
}

#[tokio::test]
async fn test_cascade_rejects_other_origin_operations() -> Result<()> {
    let fixture = Fixture::new();
    let (ada, _) = customer_with_orders(&fixture, "Ada", 1).await?;

    let ctx = fixture.core.create_context(OperationKind::ADD, ada)?;
    let mut uow = fixture.context.lock().await;
    let err = fixture
        .core
        .cascade::<Order, _>(&mut uow, &ctx, |_: &Order| true)
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::InvariantViolation(_)));
    Ok(())
}

#[tokio::test]
async fn test_propagation_skips_the_origin_itself() -> Result<()> {
    let fixture = Fixture::new();
    let (ada, _) = customer_with_orders(&fixture, "Ada", 0).await?;

    let descriptor = fixture.core.descriptor::<Customer>()?;
    let ctx = fixture.core.create_context(OperationKind::UPDATE, ada.clone())?;
    let mut item = ada.clone();
    assert!(!fixture.core.propagate_delete_state(&descriptor, &mut item, &ctx)?);
    assert_eq!(item, ada);
    Ok(())
}

#[tokio::test]
async fn test_complete_and_clear_delete_info() -> Result<()> {
    let fixture = Fixture::new();
    let descriptor = fixture.core.descriptor::<Order>()?;
    let mut flagged = order(1, 10);
    flagged.delete_state.is_self_deleted = true;
    let ctx = fixture.core.create_context(OperationKind::UPDATE, flagged.clone())?;

    assert!(fixture.core.complete_delete_info(&descriptor, &mut flagged, &ctx)?);
    let state = &flagged.delete_state;
    assert!(state.is_deleted);
    assert_eq!(state.deleted.on, Some(ctx.time()));
    assert_eq!(state.deleted.by.as_deref(), Some("tester"));

    // completing again is a no-op
    assert!(!fixture.core.complete_delete_info(&descriptor, &mut flagged, &ctx)?);

    let mut stamped = order(1, 10);
    stamped.delete_state.is_cascade_deleted = true;
    stamped.delete_state.cascade_deleted = Actor::named("importer").stamp(Utc::now());
    fixture.core.complete_delete_info(&descriptor, &mut stamped, &ctx)?;
    assert_eq!(stamped.delete_state.deleted.by.as_deref(), Some("importer"));

    assert!(fixture.core.clear_deleted(&descriptor, &mut stamped)?);
    assert_eq!(stamped.delete_state, Default::default());

    let mut active = order(1, 10);
    assert!(!fixture.core.complete_delete_info(&descriptor, &mut active, &ctx)?);
    Ok(())
}

#[tokio::test]
async fn test_restore_hooks_default_to_no_op() -> Result<()> {
    let fixture = Fixture::new();
    let (ada, _) = customer_with_orders(&fixture, "Ada", 0).await?;
    let repo = fixture.repo::<Customer>();
    repo.soft_delete(&ada.id).await?;

    assert!(!repo.restore_self_deleted(&ada.id).await?);
    assert!(!repo.restore_cascade_deleted(&ada.id).await?);
    assert!(repo.get(&ada.id).await?.delete_state.is_deleted);
    Ok(())
}

#[tokio::test]
async fn test_soft_delete_requires_soft_delete_support() -> Result<()> {
    let fixture = Fixture::new();
    let plain = fixture.repo::<Note>().add(note("plain")).await?;
    let err = fixture.repo::<Note>().soft_delete(&plain.id).await.unwrap_err();
    assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    Ok(())
}
