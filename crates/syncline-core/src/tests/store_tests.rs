use std::sync::Arc;

use syncline_api::{DeliveryStatus, Destination, MetaData, ObjectStatus};

use crate::error::SyncError;
use crate::store::{InMemoryStore, Storage};

fn store() -> Arc<dyn Storage> {
    Arc::new(InMemoryStore::default())
}

fn meta(org: &str, ty: &str, id: &str) -> MetaData {
    MetaData::new(org, ty, id)
}

fn dest(org: &str, ty: &str, id: &str) -> Destination {
    Destination {
        org_id: org.to_string(),
        dest_type: ty.to_string(),
        dest_id: id.to_string(),
        communication: "http".to_string(),
        code_version: String::new(),
    }
}

#[tokio::test]
async fn store_object_is_upsert_by_primary_key() {
    let store = store();
    let mut first = meta("org", "model", "m1");
    first.instance_id = 1;
    store
        .store_object(first, Some(b"v1".to_vec()), ObjectStatus::Ready)
        .await
        .unwrap();

    let (loaded, status) = store.retrieve_object_and_status("org", "model", "m1").await.unwrap();
    assert_eq!(loaded.instance_id, 1);
    assert_eq!(status, ObjectStatus::Ready);
    let again = store.retrieve_object_and_status("org", "model", "m1").await.unwrap();
    assert_eq!((loaded, status), again);

    let mut second = meta("org", "model", "m1");
    second.instance_id = 2;
    second.description = "updated".to_string();
    store
        .store_object(second, None, ObjectStatus::Ready)
        .await
        .unwrap();
    let loaded = store.retrieve_object("org", "model", "m1").await.unwrap();
    assert_eq!(loaded.instance_id, 2);
    assert_eq!(loaded.description, "updated");
    assert_eq!(store.get_number_of_stored_objects().await.unwrap(), 1);
}

#[tokio::test]
async fn missing_keys_return_not_found() {
    let store = store();
    assert!(store
        .retrieve_object("org", "model", "nope")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store
        .retrieve_notification_record("org", "model", "nope", "edge", "e1")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store
        .retrieve_destination("org", "edge", "nope")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn concurrent_consumer_decrements_are_distinct() {
    let store = store();
    let expected = 8;
    let mut object = meta("org", "model", "m1");
    object.expected_consumers = expected;
    store.store_object(object, None, ObjectStatus::Ready).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..(expected + 1) {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .decrement_and_return_remaining_consumers("org", "model", "m1")
                .await
                .unwrap()
        }));
    }
    let mut seen = Vec::new();
    for handle in handles {
        seen.push(handle.await.unwrap());
    }
    seen.sort();
    let want: Vec<i32> = (-1..expected).collect();
    assert_eq!(seen, want);
}

#[tokio::test]
async fn append_chunks_completes_only_when_contiguous_and_last() {
    let store = store();
    let mut object = meta("org", "file", "f1");
    object.object_size = 300;
    store
        .store_object(object, None, ObjectStatus::PartiallyReceived)
        .await
        .unwrap();

    let complete = store
        .append_object_data("org", "file", "f1", vec![1; 100], 0, 300, true, false)
        .await
        .unwrap();
    assert!(!complete);
    // Out of order but within the buffer allowance.
    let complete = store
        .append_object_data("org", "file", "f1", vec![3; 100], 200, 300, false, true)
        .await
        .unwrap();
    assert!(!complete);
    let complete = store
        .append_object_data("org", "file", "f1", vec![2; 100], 100, 300, false, false)
        .await
        .unwrap();
    assert!(complete);
    assert_eq!(
        store.retrieve_object_status("org", "file", "f1").await.unwrap(),
        ObjectStatus::CompletelyReceived
    );

    // Replay of a chunk is a no-op.
    let complete = store
        .append_object_data("org", "file", "f1", vec![2; 100], 100, 300, false, false)
        .await
        .unwrap();
    assert!(!complete);

    let (data, eof) = store.read_object_data("org", "file", "f1", 300, 0).await.unwrap();
    assert!(eof);
    assert_eq!(&data[..100], &[1; 100][..]);
    assert_eq!(&data[100..200], &[2; 100][..]);
    assert_eq!(&data[200..], &[3; 100][..]);
}

#[tokio::test]
async fn append_rejects_chunks_beyond_buffer_policy() {
    let store: Arc<dyn Storage> = Arc::new(InMemoryStore::new(64));
    let mut object = meta("org", "file", "f1");
    object.object_size = 1000;
    store
        .store_object(object, None, ObjectStatus::PartiallyReceived)
        .await
        .unwrap();
    let err = store
        .append_object_data("org", "file", "f1", vec![0; 100], 900, 1000, false, true)
        .await
        .unwrap_err();
    assert!(err.is_discarded());
}

#[tokio::test]
async fn leader_cas_has_exactly_one_winner() {
    let store = store();
    assert!(store.insert_initial_leader("a", 30).await.unwrap());
    assert!(!store.insert_initial_leader("b", 30).await.unwrap());
    let leader = store.retrieve_leader().await.unwrap();
    assert_eq!(leader.leader_id, "a");

    let mut handles = Vec::new();
    for candidate in ["b", "c", "d", "e"] {
        let store = store.clone();
        let version = leader.version;
        handles.push(tokio::spawn(async move {
            store.update_leader(candidate, version).await.unwrap()
        }));
    }
    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);

    // The loser's stale version keeps failing.
    assert!(!store.update_leader("z", leader.version).await.unwrap());
}

#[tokio::test]
async fn resigned_leadership_allows_takeover() {
    let store = store();
    store.insert_initial_leader("a", 30).await.unwrap();
    assert!(store.leader_periodic_update("a").await.unwrap());
    assert!(!store.leader_periodic_update("b").await.unwrap());

    store.resign_leadership("a").await.unwrap();
    let leader = store.retrieve_leader().await.unwrap();
    assert_eq!(leader.last_heartbeat_ms, 0);
    assert!(store.update_leader("b", leader.version).await.unwrap());
    assert_eq!(store.retrieve_leader().await.unwrap().leader_id, "b");
}

#[tokio::test]
async fn delivery_status_reports_deletion_convergence_once() {
    let store = store();
    store.store_destination(dest("org", "edge", "e1")).await.unwrap();
    store.store_destination(dest("org", "edge", "e2")).await.unwrap();
    let mut object = meta("org", "model", "m1");
    object.dest_type = "edge".to_string();
    store.store_object(object, None, ObjectStatus::Ready).await.unwrap();

    let done = store
        .update_object_delivery_status(DeliveryStatus::Deleted, "", "org", "model", "m1", "edge", "e1")
        .await
        .unwrap();
    assert!(!done);
    let done = store
        .update_object_delivery_status(DeliveryStatus::Deleted, "", "org", "model", "m1", "edge", "e2")
        .await
        .unwrap();
    assert!(done);
}

#[tokio::test]
async fn acl_bulk_add_and_remove() {
    let store = store();
    store
        .add_users_to_acl(
            "objects",
            "org",
            "keyX",
            &["u1".to_string(), "u2".to_string()],
        )
        .await
        .unwrap();
    store
        .remove_users_from_acl("objects", "org", "keyX", &["u2".to_string()])
        .await
        .unwrap();
    assert_eq!(
        store.retrieve_acl("objects", "org", "keyX").await.unwrap(),
        vec!["u1".to_string()]
    );

    // Removing the last username deletes the ACL.
    store
        .remove_users_from_acl("objects", "org", "keyX", &["u1".to_string()])
        .await
        .unwrap();
    assert!(store
        .retrieve_acl("objects", "org", "keyX")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn webhooks_have_set_semantics() {
    let store = store();
    store.add_webhook("org", "model", "http://a").await.unwrap();
    store.add_webhook("org", "model", "http://a").await.unwrap();
    store.add_webhook("org", "model", "http://b").await.unwrap();
    assert_eq!(
        store.retrieve_webhooks("org", "model").await.unwrap(),
        vec!["http://a".to_string(), "http://b".to_string()]
    );
    store.delete_webhook("org", "model", "http://a").await.unwrap();
    store.delete_webhook("org", "model", "http://b").await.unwrap();
    assert!(store
        .retrieve_webhooks("org", "model")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn organization_delete_cascades() {
    let store = store();
    store
        .store_organization(syncline_api::Organization {
            org_id: "org".to_string(),
            address: "broker".to_string(),
        })
        .await
        .unwrap();
    store.store_destination(dest("org", "edge", "e1")).await.unwrap();
    store
        .store_object(meta("org", "model", "m1"), None, ObjectStatus::Ready)
        .await
        .unwrap();
    store.add_webhook("org", "model", "http://a").await.unwrap();
    store
        .store_org_to_messaging_group("org", "group")
        .await
        .unwrap();

    store.delete_organization("org").await.unwrap();
    assert!(store.retrieve_organization_info("org").await.unwrap_err().is_not_found());
    assert!(store.retrieve_object("org", "model", "m1").await.unwrap_err().is_not_found());
    assert_eq!(store.get_number_of_destinations().await.unwrap(), 0);
    assert!(store.retrieve_messaging_group("org").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn objects_to_activate_respects_activation_time() {
    let store = store();
    let mut inactive = meta("org", "model", "due");
    inactive.inactive = true;
    inactive.activation_time = 1;
    store
        .store_object(inactive, None, ObjectStatus::NotReady)
        .await
        .unwrap();
    let mut future = meta("org", "model", "later");
    future.inactive = true;
    future.activation_time = u64::MAX;
    store
        .store_object(future, None, ObjectStatus::NotReady)
        .await
        .unwrap();

    let due = store.get_objects_to_activate().await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].object_id, "due");

    store.activate_object("org", "model", "due").await.unwrap();
    assert_eq!(
        store.retrieve_object_status("org", "model", "due").await.unwrap(),
        ObjectStatus::Ready
    );
    assert!(store.get_objects_to_activate().await.unwrap().is_empty());
}

#[tokio::test]
async fn data_reader_round_trip() {
    let store = store();
    store
        .store_object(meta("org", "model", "m1"), Some(b"payload".to_vec()), ObjectStatus::Ready)
        .await
        .unwrap();
    let reader = store
        .retrieve_object_data("org", "model", "m1")
        .await
        .unwrap()
        .expect("data");
    let mut reader = reader;
    let mut buffer = Vec::new();
    use tokio::io::AsyncReadExt;
    reader.read_to_end(&mut buffer).await.unwrap();
    assert_eq!(buffer, b"payload");
    store.close_data_reader(reader).await.unwrap();
}

#[tokio::test]
async fn object_field_updates_and_destination_queries() {
    let store = store();
    store.store_destination(dest("org", "edge", "e1")).await.unwrap();
    assert!(store.destination_exists("org", "edge", "e1").await.unwrap());
    assert!(!store.destination_exists("org", "edge", "e2").await.unwrap());
    assert_eq!(
        store
            .retrieve_destination_protocol("org", "edge", "e1")
            .await
            .unwrap(),
        "http"
    );

    let mut object = meta("org", "model", "m1");
    object.dest_type = "edge".to_string();
    object.expected_consumers = 3;
    store.store_object(object.clone(), None, ObjectStatus::Ready).await.unwrap();

    assert_eq!(
        store
            .get_object_destinations(&object)
            .await
            .unwrap()
            .len(),
        1
    );

    // Replacing the data in one call keeps the record.
    assert!(store
        .store_object_data("org", "model", "m1", b"fresh".to_vec())
        .await
        .unwrap());
    assert!(!store
        .store_object_data("org", "model", "ghost", b"x".to_vec())
        .await
        .unwrap());
    let loaded = store.retrieve_object("org", "model", "m1").await.unwrap();
    assert_eq!(loaded.object_size, 5);

    store
        .update_object_source_data_uri("org", "model", "m1", "file:///tmp/m1")
        .await
        .unwrap();
    assert_eq!(
        store.retrieve_object("org", "model", "m1").await.unwrap().source_data_uri,
        "file:///tmp/m1"
    );

    store
        .decrement_and_return_remaining_consumers("org", "model", "m1")
        .await
        .unwrap();
    store
        .reset_object_remaining_consumers("org", "model", "m1")
        .await
        .unwrap();
    assert_eq!(
        store
            .retrieve_object_remaining_consumers("org", "model", "m1")
            .await
            .unwrap(),
        3
    );

    store.update_object_delivering("org", "model", "m1").await.unwrap();
    let destinations = store
        .get_object_destinations_list("org", "model", "m1")
        .await
        .unwrap();
    assert!(destinations
        .iter()
        .all(|dest| dest.status == DeliveryStatus::Delivering));

    store
        .mark_destination_policy_received("org", "model", "m1")
        .await
        .unwrap();
    assert!(store
        .mark_object_app_received("org", "model", "ghost")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn not_found_error_kind_is_distinguishable() {
    let err = SyncError::NotFound;
    assert!(err.is_not_found());
    assert!(!err.is_discarded());
}
