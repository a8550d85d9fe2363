//! Nested collection sync and type-erased repository access

mod common;

use anyhow::Result;
use common::*;
use recordgraph::{update_nested_collection, DbRepository, OperationKind, RecordKey, ReconcileSummary};

#[tokio::test]
async fn test_update_nested_collection_three_way_diff() -> Result<()> {
    let fixture = Fixture::new();
    let (ada, orders) = customer_with_orders(&fixture, "Ada", 3).await?;
    let (grace, _) = customer_with_orders(&fixture, "Grace", 1).await?;

    let desired = vec![
        Order {
            total: 150,
            ..orders[0].clone()
        },
        orders[2].clone(),
        order(ada.id, 75),
    ];

    let ctx = fixture.core.create_context(OperationKind::UPDATE, ada.clone())?;
    let mut repo = fixture.repo::<Order>();
    let ada_id = ada.id;
    let summary = update_nested_collection(
        desired,
        move |o: &Order| o.customer_id == ada_id,
        |o: &Order| o.id,
        &mut repo,
        &ctx,
    )
    .await?;

    assert_eq!(
        summary,
        ReconcileSummary {
            added: 1,
            updated: 2,
            deleted: 1,
        }
    );
    fixture.save().await?;

    let check = fixture.detached_repo::<Order>();
    let mut remaining = check.query(true)?.filter(move |o| o.customer_id == ada_id).fetch().await?;
    remaining.sort_by_key(|o| o.id);
    let totals: Vec<i64> = remaining.iter().map(|o| o.total).collect();
    assert_eq!(totals, vec![150, 300, 75]);
    // the absent row is physically gone, not soft-deleted
    assert!(!check.exists(&orders[1].id).await?);

    let grace_id = grace.id;
    let untouched = check.query(false)?.filter(move |o| o.customer_id == grace_id).count().await?;
    assert_eq!(untouched, 1);
    Ok(())
}

#[tokio::test]
async fn test_update_nested_collection_with_empty_target_deletes_all() -> Result<()> {
    let fixture = Fixture::new();
    let (ada, _) = customer_with_orders(&fixture, "Ada", 2).await?;

    let ctx = fixture.core.create_context(OperationKind::UPDATE, ada.clone())?;
    let mut repo = fixture.repo::<Order>();
    let ada_id = ada.id;
    let summary = update_nested_collection(
        Vec::new(),
        move |o: &Order| o.customer_id == ada_id,
        |o: &Order| o.id,
        &mut repo,
        &ctx,
    )
    .await?;

    assert_eq!(summary.deleted, 2);
    assert_eq!(fixture.save().await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_update_nested_collection_rejects_mismatched_repository() -> Result<()> {
    let fixture = Fixture::new();
    let (ada, _) = customer_with_orders(&fixture, "Ada", 0).await?;

    let ctx = fixture.core.create_context(OperationKind::UPDATE, ada)?;
    let mut notes = fixture.repo::<Note>();
    let err = update_nested_collection(Vec::<Order>::new(), |_: &Order| true, |o: &Order| o.id, &mut notes, &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    Ok(())
}

#[tokio::test]
async fn test_erased_repository_round_trip() -> Result<()> {
    let fixture = Fixture::new();
    let mut repo: Box<dyn DbRepository> = Box::new(fixture.repo::<Customer>());
    assert_eq!(repo.entity_type(), "customer");

    let added = repo.add_entity(Box::new(customer("Ada")), None).await?;
    let added = added.downcast::<Customer>().expect("customer");
    let key = RecordKey::of(&added.id);

    let found = repo.find_entity(&key).await?.expect("tracked customer");
    assert_eq!(found.downcast_ref::<Customer>().map(|c| c.name.as_str()), Some("Ada"));

    let err = repo.add_entity(Box::new(note("wrong type")), None).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_DATA");

    let err = repo.find_entity(&RecordKey::from("not-a-number")).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_DATA");

    fixture.save().await?;
    repo.delete_entity_by_key(&key, None).await?;
    assert_eq!(fixture.save().await?, 1);
    assert!(repo.find_entity(&key).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_erased_updates_derive_from_parent_context() -> Result<()> {
    let fixture = Fixture::new();
    let (ada, orders) = customer_with_orders(&fixture, "Ada", 1).await?;

    let parent = fixture.core.create_context(OperationKind::UPDATE, ada)?.detached();
    let mut repo = fixture.repo::<Order>();
    let updated = repo
        .update_entity(
            Box::new(Order {
                total: 1,
                ..orders[0].clone()
            }),
            Some(&parent),
        )
        .await?;
    let updated = updated.downcast::<Order>().expect("order");
    assert_eq!(updated.total, 1);
    assert_eq!(updated.audit.modified_on, Some(parent.time()));
    Ok(())
}
