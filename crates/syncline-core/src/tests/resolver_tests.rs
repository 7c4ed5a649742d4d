use std::sync::Arc;

use syncline_api::types::DestinationPolicy;
use syncline_api::{DeliveryStatus, Destination, DestinationStatus, MetaData, ObjectStatus};

use crate::store::{
    compare_destinations, destinations_from_meta, InMemoryStore, Storage,
};

fn dest(id: &str) -> Destination {
    Destination {
        org_id: "org".to_string(),
        dest_type: "edge".to_string(),
        dest_id: id.to_string(),
        communication: "http".to_string(),
        code_version: String::new(),
    }
}

fn with_status(id: &str, status: DeliveryStatus) -> DestinationStatus {
    DestinationStatus {
        destination: dest(id),
        status,
        message: String::new(),
    }
}

async fn store_with_destinations(ids: &[&str]) -> Arc<dyn Storage> {
    let store: Arc<dyn Storage> = Arc::new(InMemoryStore::default());
    for id in ids {
        store.store_destination(dest(id)).await.unwrap();
    }
    store
}

#[test]
fn reconciliation_partitions_old_and_new() {
    let old = vec![
        with_status("a", DeliveryStatus::Delivered),
        with_status("b", DeliveryStatus::Pending),
    ];
    let new = vec![
        with_status("a", DeliveryStatus::Pending),
        with_status("c", DeliveryStatus::Pending),
    ];
    let (merged, deleted, added) = compare_destinations(&old, new, true);

    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].destination.dest_id, "b");
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].destination.dest_id, "c");
    assert_eq!(merged.len(), 2);
    // The surviving destination keeps its old status.
    let a = merged.iter().find(|d| d.destination.dest_id == "a").unwrap();
    assert_eq!(a.status, DeliveryStatus::Delivered);
}

#[test]
fn reconciliation_with_empty_sets() {
    let (merged, deleted, added) = compare_destinations(&[], Vec::new(), true);
    assert!(merged.is_empty() && deleted.is_empty() && added.is_empty());

    let old = vec![with_status("a", DeliveryStatus::Delivered)];
    let (merged, deleted, added) = compare_destinations(&old, Vec::new(), true);
    assert!(merged.is_empty() && added.is_empty());
    assert_eq!(deleted.len(), 1);
}

#[tokio::test]
async fn policy_defers_resolution_to_empty() {
    let store = store_with_destinations(&["e1"]).await;
    let mut meta = MetaData::new("org", "model", "m1");
    meta.destination_policy = Some(DestinationPolicy {
        services: Vec::new(),
        properties: Vec::new(),
        constraints: vec!["location == factory".to_string()],
        timestamp: 0,
    });
    let (merged, deleted, added) = destinations_from_meta(&store, &meta).await.unwrap();
    assert!(merged.is_empty() && deleted.is_empty() && added.is_empty());
}

#[tokio::test]
async fn missing_single_destination_is_empty_not_error() {
    let store = store_with_destinations(&[]).await;
    let mut meta = MetaData::new("org", "model", "m1");
    meta.dest_type = "edge".to_string();
    meta.dest_id = "ghost".to_string();
    let (merged, _, _) = destinations_from_meta(&store, &meta).await.unwrap();
    assert!(merged.is_empty());
}

#[tokio::test]
async fn missing_list_entry_is_invalid_request() {
    let store = store_with_destinations(&["e1"]).await;
    let mut meta = MetaData::new("org", "model", "m1");
    meta.destinations_list = vec!["edge:e1".to_string(), "edge:ghost".to_string()];
    let err = destinations_from_meta(&store, &meta).await.unwrap_err();
    assert!(matches!(err, crate::error::SyncError::InvalidRequest(_)));
}

#[tokio::test]
async fn broadcast_matches_type_and_org() {
    let store = store_with_destinations(&["e1", "e2"]).await;
    store
        .store_destination(Destination {
            org_id: "org".to_string(),
            dest_type: "gateway".to_string(),
            dest_id: "g1".to_string(),
            communication: "http".to_string(),
            code_version: String::new(),
        })
        .await
        .unwrap();

    let mut meta = MetaData::new("org", "model", "m1");
    meta.dest_type = "edge".to_string();
    let (merged, _, _) = destinations_from_meta(&store, &meta).await.unwrap();
    assert_eq!(merged.len(), 2);

    // Empty type is an org-wide broadcast.
    let meta = MetaData::new("org", "model", "m2");
    let (merged, _, _) = destinations_from_meta(&store, &meta).await.unwrap();
    assert_eq!(merged.len(), 3);
}

#[tokio::test]
async fn stored_statuses_survive_re_resolution() {
    let store = store_with_destinations(&["e1", "e2"]).await;
    let mut meta = MetaData::new("org", "model", "m1");
    meta.dest_type = "edge".to_string();
    store
        .store_object(meta.clone(), None, ObjectStatus::Ready)
        .await
        .unwrap();
    store
        .update_object_delivery_status(
            DeliveryStatus::Delivered,
            "",
            "org",
            "model",
            "m1",
            "edge",
            "e1",
        )
        .await
        .unwrap();

    let (merged, deleted, added) = destinations_from_meta(&store, &meta).await.unwrap();
    assert!(deleted.is_empty() && added.is_empty());
    let e1 = merged.iter().find(|d| d.destination.dest_id == "e1").unwrap();
    assert_eq!(e1.status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn no_data_broadcast_without_destinations_resolves_empty() {
    let store = store_with_destinations(&[]).await;
    let mut meta = MetaData::new("org", "model", "m1");
    meta.no_data = true;
    let (merged, deleted, added) = destinations_from_meta(&store, &meta).await.unwrap();
    assert!(merged.is_empty() && deleted.is_empty() && added.is_empty());
}
