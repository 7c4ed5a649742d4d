use syncline_api::{MetaData, Notification, NotificationStatus, ObjectStatus};

use crate::store::{FileStore, Storage};

fn meta(id: &str) -> MetaData {
    MetaData::new("org", "model", id)
}

#[tokio::test]
async fn snapshot_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let store = FileStore::open(dir.path(), 1024 * 1024).await.unwrap();
    let mut object = meta("m1");
    object.instance_id = 7;
    store
        .store_object(object, Some(b"payload".to_vec()), ObjectStatus::Ready)
        .await
        .unwrap();
    store
        .update_notification_record(Notification {
            org_id: "org".to_string(),
            object_type: "model".to_string(),
            object_id: "m1".to_string(),
            dest_type: "edge".to_string(),
            dest_id: "e1".to_string(),
            status: NotificationStatus::Update,
            instance_id: 7,
            resend_time: 0,
            last_error: String::new(),
            data_offset: 0,
        })
        .await
        .unwrap();
    store.stop().await;

    let reopened = FileStore::open(dir.path(), 1024 * 1024).await.unwrap();
    let (loaded, status) = reopened
        .retrieve_object_and_status("org", "model", "m1")
        .await
        .unwrap();
    assert_eq!(loaded.instance_id, 7);
    assert_eq!(status, ObjectStatus::Ready);
    let (data, eof) = reopened
        .read_object_data("org", "model", "m1", 16, 0)
        .await
        .unwrap();
    assert!(eof);
    assert_eq!(data, b"payload");
    let record = reopened
        .retrieve_notification_record("org", "model", "m1", "edge", "e1")
        .await
        .unwrap();
    assert_eq!(record.status, NotificationStatus::Update);
}

#[tokio::test]
async fn clean_objects_drops_only_partially_received() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path(), 1024 * 1024).await.unwrap();

    store
        .store_object(meta("partial"), None, ObjectStatus::PartiallyReceived)
        .await
        .unwrap();
    store
        .store_object(
            meta("complete"),
            Some(b"x".to_vec()),
            ObjectStatus::CompletelyReceived,
        )
        .await
        .unwrap();
    store
        .store_object(meta("local"), None, ObjectStatus::Ready)
        .await
        .unwrap();

    store.clean_objects().await.unwrap();
    assert!(store
        .retrieve_object("org", "model", "partial")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store.retrieve_object("org", "model", "complete").await.is_ok());
    assert!(store.retrieve_object("org", "model", "local").await.is_ok());

    // A restart sees the cleaned state.
    store.stop().await;
    let reopened = FileStore::open(dir.path(), 1024 * 1024).await.unwrap();
    assert!(reopened
        .retrieve_object("org", "model", "partial")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(reopened.retrieve_object("org", "model", "complete").await.is_ok());
}

#[tokio::test]
async fn persistent_flag_differs_between_backends() {
    let dir = tempfile::tempdir().unwrap();
    let file_store = FileStore::open(dir.path(), 1024).await.unwrap();
    assert!(file_store.is_persistent());
    let memory = crate::store::InMemoryStore::default();
    assert!(!Storage::is_persistent(&memory));
}
