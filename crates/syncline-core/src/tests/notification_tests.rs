use syncline_api::{DeliveryStatus, NotificationStatus, ObjectStatus};

use crate::comm::InProcessCommunicator;
use crate::error::SyncError;
use crate::store::resend_eligible;
use crate::tests::{eventually, meta_for, start_css, start_ess};

#[test]
fn resend_eligibility_matches_the_status_set() {
    let eligible = [
        NotificationStatus::Update,
        NotificationStatus::Consumed,
        NotificationStatus::Getdata,
        NotificationStatus::Delete,
        NotificationStatus::Deleted,
        NotificationStatus::Received,
    ];
    for status in eligible {
        assert!(resend_eligible(status, false), "{:?}", status);
    }
    let conditional = [
        NotificationStatus::Data,
        NotificationStatus::ReceivedByDestination,
    ];
    for status in conditional {
        assert!(!resend_eligible(status, false), "{:?}", status);
        assert!(resend_eligible(status, true), "{:?}", status);
    }
    for status in [
        NotificationStatus::Updated,
        NotificationStatus::AckConsumed,
        NotificationStatus::AckDeleted,
        NotificationStatus::Error,
    ] {
        assert!(!resend_eligible(status, true), "{:?}", status);
    }
}

#[tokio::test]
async fn object_with_data_is_delivered_end_to_end() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;
    let ess = start_ess(&comm, "org", "e1").await;

    let meta = meta_for("org", "model", "m1");
    css.update_object("org", "model", "m1", meta, Some(b"weights".to_vec()))
        .await
        .unwrap();

    // The in-process transport runs the whole exchange inline.
    let (loaded, status) = ess
        .store()
        .retrieve_object_and_status("org", "model", "m1")
        .await
        .unwrap();
    assert_eq!(status, ObjectStatus::CompletelyReceived);
    assert_eq!(loaded.object_size, 7);
    let (data, eof) = ess
        .store()
        .read_object_data("org", "model", "m1", 64, 0)
        .await
        .unwrap();
    assert!(eof);
    assert_eq!(data, b"weights");

    let destinations = css
        .get_object_destinations_status("org", "model", "m1")
        .await
        .unwrap();
    assert_eq!(destinations.len(), 1);
    assert_eq!(destinations[0].status, DeliveryStatus::Delivered);

    let updated = ess.list_updated_objects("org", "model", false).await.unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].object_id, "m1");
}

#[tokio::test]
async fn no_data_object_is_completely_received_on_metadata() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;
    let ess = start_ess(&comm, "org", "e1").await;

    let mut meta = meta_for("org", "config", "c1");
    meta.no_data = true;
    css.update_object("org", "config", "c1", meta, None).await.unwrap();

    assert_eq!(
        ess.store()
            .retrieve_object_status("org", "config", "c1")
            .await
            .unwrap(),
        ObjectStatus::CompletelyReceived
    );
    let destinations = css
        .get_object_destinations_status("org", "config", "c1")
        .await
        .unwrap();
    assert_eq!(destinations[0].status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn large_object_is_chunked_and_replay_is_idempotent() {
    let comm = InProcessCommunicator::new();
    let mut config = crate::tests::css_config();
    config.max_data_chunk_size = 120_000;
    config.max_inflight_chunks = 1;
    let css = crate::tests::start_css_with(
        &comm,
        config,
        std::sync::Arc::new(crate::store::InMemoryStore::default()),
    )
    .await;
    let ess = start_ess(&comm, "org", "e1").await;

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let meta = meta_for("org", "blob", "b1");
    css.update_object("org", "blob", "b1", meta, Some(payload.clone()))
        .await
        .unwrap();

    assert_eq!(
        ess.store().retrieve_object_status("org", "blob", "b1").await.unwrap(),
        ObjectStatus::CompletelyReceived
    );
    let (data, _) = ess
        .store()
        .read_object_data("org", "blob", "b1", payload.len(), 0)
        .await
        .unwrap();
    assert_eq!(data, payload);

    // Replaying a middle chunk changes nothing.
    let replay = ess
        .store()
        .append_object_data(
            "org",
            "blob",
            "b1",
            payload[120_000..240_000].to_vec(),
            120_000,
            300_000,
            false,
            false,
        )
        .await
        .unwrap();
    assert!(!replay);
    assert_eq!(
        ess.store().retrieve_object_status("org", "blob", "b1").await.unwrap(),
        ObjectStatus::CompletelyReceived
    );
}

#[tokio::test]
async fn removed_destination_gets_delete_only() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;
    let ess_a = start_ess(&comm, "org", "a").await;
    let ess_b = start_ess(&comm, "org", "b").await;

    let mut meta = meta_for("org", "model", "m1");
    meta.dest_type = String::new();
    meta.destinations_list = vec!["edge:a".to_string(), "edge:b".to_string()];
    css.update_object("org", "model", "m1", meta.clone(), None)
        .await
        .unwrap();
    assert!(ess_a.store().retrieve_object("org", "model", "m1").await.is_ok());
    assert!(ess_b.store().retrieve_object("org", "model", "m1").await.is_ok());

    let a_instance = ess_a
        .store()
        .retrieve_object("org", "model", "m1")
        .await
        .unwrap()
        .instance_id;

    let mut update = meta_for("org", "model", "m1");
    update.dest_type = String::new();
    update.destinations_list = vec!["edge:a".to_string()];
    css.update_object("org", "model", "m1", update, None).await.unwrap();

    // b learned about the removal, a did not get a new update.
    assert!(eventually(|| async {
        matches!(
            ess_b.store().retrieve_object_status("org", "model", "m1").await,
            Ok(ObjectStatus::Deleted)
        )
    })
    .await);
    let a_after = ess_a
        .store()
        .retrieve_object("org", "model", "m1")
        .await
        .unwrap();
    assert_eq!(a_after.instance_id, a_instance);
}

#[tokio::test]
async fn consumed_flow_decrements_and_converges() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;
    let ess = start_ess(&comm, "org", "e1").await;

    let meta = meta_for("org", "model", "m1");
    css.update_object("org", "model", "m1", meta, Some(b"data".to_vec()))
        .await
        .unwrap();
    ess.object_consumed("org", "model", "m1").await.unwrap();

    let destinations = css
        .get_object_destinations_status("org", "model", "m1")
        .await
        .unwrap();
    assert_eq!(destinations[0].status, DeliveryStatus::Consumed);
    assert_eq!(
        css.store()
            .retrieve_object_remaining_consumers("org", "model", "m1")
            .await
            .unwrap(),
        0
    );
    // The receiver's record was finalized by the ack.
    assert!(ess
        .store()
        .retrieve_notification_record("org", "model", "m1", "edge", "e1")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn consuming_an_incomplete_object_is_invalid() {
    let comm = InProcessCommunicator::new();
    let _css = start_css(&comm).await;
    let ess = start_ess(&comm, "org", "e1").await;
    let err = ess.object_consumed("org", "model", "ghost").await.unwrap_err();
    assert!(err.is_not_found());

    ess.store()
        .store_object(
            meta_for("org", "model", "m1"),
            None,
            ObjectStatus::PartiallyReceived,
        )
        .await
        .unwrap();
    let err = ess.object_consumed("org", "model", "m1").await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidRequest(_)));
}

#[tokio::test]
async fn delete_propagates_and_origin_removes_after_all_confirm() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;
    let ess = start_ess(&comm, "org", "e1").await;

    let meta = meta_for("org", "model", "m1");
    css.update_object("org", "model", "m1", meta, Some(b"data".to_vec()))
        .await
        .unwrap();

    css.delete_object("org", "model", "m1").await.unwrap();
    // The receiver sees the deletion and waits for the application.
    assert_eq!(
        ess.store().retrieve_object_status("org", "model", "m1").await.unwrap(),
        ObjectStatus::Deleted
    );
    assert!(css.store().retrieve_object("org", "model", "m1").await.is_ok());

    ess.object_deleted("org", "model", "m1").await.unwrap();
    // Deletion converged; both sides dropped the object.
    assert!(css
        .store()
        .retrieve_object("org", "model", "m1")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(ess
        .store()
        .retrieve_object("org", "model", "m1")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn update_failure_is_recovered_by_the_resend_loop() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;
    // Register the destination without attaching the node, so delivery fails.
    css.store()
        .store_destination(syncline_api::Destination {
            org_id: "org".to_string(),
            dest_type: "edge".to_string(),
            dest_id: "e1".to_string(),
            communication: "http".to_string(),
            code_version: String::new(),
        })
        .await
        .unwrap();

    let meta = meta_for("org", "model", "m1");
    css.update_object("org", "model", "m1", meta, Some(b"data".to_vec()))
        .await
        .unwrap();
    let record = css
        .store()
        .retrieve_notification_record("org", "model", "m1", "edge", "e1")
        .await
        .unwrap();
    assert_eq!(record.status, NotificationStatus::Update);
    assert!(!record.last_error.is_empty());

    // Now the node comes up; the resend loop delivers within a few intervals.
    let ess = start_ess(&comm, "org", "e1").await;
    assert!(eventually(|| async {
        matches!(
            ess.store().retrieve_object_status("org", "model", "m1").await,
            Ok(ObjectStatus::CompletelyReceived)
        )
    })
    .await);
}

#[tokio::test]
async fn ess_originated_object_reaches_the_css() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;
    let ess = start_ess(&comm, "org", "e1").await;

    let mut meta = meta_for("org", "telemetry", "t1");
    meta.dest_type = String::new();
    ess.update_object("org", "telemetry", "t1", meta, Some(b"readings".to_vec()))
        .await
        .unwrap();

    assert_eq!(
        css.store()
            .retrieve_object_status("org", "telemetry", "t1")
            .await
            .unwrap(),
        ObjectStatus::CompletelyReceived
    );
    let updated = css.list_updated_objects("org", "telemetry", false).await.unwrap();
    assert_eq!(updated.len(), 1);

    // The cloud application consumes it; the edge is acknowledged.
    css.object_consumed("org", "telemetry", "t1").await.unwrap();
    assert!(eventually(|| async {
        ess.store()
            .retrieve_notification_record("org", "telemetry", "t1", "edge", "e1")
            .await
            .map(|n| n.status != NotificationStatus::Consumed)
            .unwrap_or(true)
    })
    .await);
}

#[tokio::test]
async fn registration_resends_pending_objects() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;

    // Object stored while no destination matches: empty set, no error.
    let meta = meta_for("org", "model", "m1");
    css.update_object("org", "model", "m1", meta, Some(b"data".to_vec()))
        .await
        .unwrap();
    assert!(css
        .get_object_destinations_status("org", "model", "m1")
        .await
        .unwrap()
        .is_empty());

    // The destination registers later and receives the object.
    let ess = start_ess(&comm, "org", "e1").await;
    assert!(eventually(|| async {
        matches!(
            ess.store().retrieve_object_status("org", "model", "m1").await,
            Ok(ObjectStatus::CompletelyReceived)
        )
    })
    .await);
}

#[tokio::test]
async fn stuck_data_send_is_recovered_on_a_received_pass() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;
    let ess = start_ess(&comm, "org", "e1").await;

    let payload = b"chunked payload".to_vec();
    let meta = meta_for("org", "model", "m1");
    css.update_object("org", "model", "m1", meta, Some(payload.clone()))
        .await
        .unwrap();

    // A sender that died mid-stream: the record is stuck in Data and the
    // receiver lost its copy.
    let mut record = css
        .store()
        .retrieve_notification_record("org", "model", "m1", "edge", "e1")
        .await
        .unwrap();
    record.status = NotificationStatus::Data;
    record.resend_time = 0;
    record.data_offset = 0;
    css.store().update_notification_record(record).await.unwrap();
    ess.store().delete_stored_data("org", "model", "m1").await.unwrap();
    ess.store()
        .update_object_status("org", "model", "m1", ObjectStatus::PartiallyReceived)
        .await
        .unwrap();

    // A base pass does not touch data-phase notifications.
    css.resend_notifications(false).await.unwrap();
    assert_eq!(
        ess.store().retrieve_object_status("org", "model", "m1").await.unwrap(),
        ObjectStatus::PartiallyReceived
    );

    // A retrieve-received pass restarts the window and completes the object.
    css.resend_notifications(true).await.unwrap();
    assert_eq!(
        ess.store().retrieve_object_status("org", "model", "m1").await.unwrap(),
        ObjectStatus::CompletelyReceived
    );
    let (data, _) = ess
        .store()
        .read_object_data("org", "model", "m1", payload.len(), 0)
        .await
        .unwrap();
    assert_eq!(data, payload);
}

#[tokio::test]
async fn replayed_received_ack_does_not_double_decrement() {
    let comm = InProcessCommunicator::new();
    let store = std::sync::Arc::new(crate::store::InMemoryStore::default());
    let css = crate::tests::start_css_with(&comm, crate::tests::css_config(), store.clone()).await;
    let ess = start_ess(&comm, "org", "e1").await;

    let meta = meta_for("org", "model", "m1");
    css.update_object("org", "model", "m1", meta, Some(b"data".to_vec()))
        .await
        .unwrap();
    let before = store
        .snapshot()
        .await
        .objects
        .get("org:model:m1")
        .unwrap()
        .remaining_receivers;

    // The receiver replays its ack exchange as if AckReceived was lost.
    let mut record = ess
        .store()
        .retrieve_notification_record("org", "model", "m1", "edge", "e1")
        .await
        .unwrap();
    assert_eq!(record.status, NotificationStatus::ReceivedByDestination);
    record.resend_time = 0;
    ess.store().update_notification_record(record).await.unwrap();
    ess.resend_notifications(true).await.unwrap();

    let after = store
        .snapshot()
        .await
        .objects
        .get("org:model:m1")
        .unwrap()
        .remaining_receivers;
    assert_eq!(before, after);
}

#[tokio::test]
async fn stale_instance_update_is_rejected() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;

    let mut meta = meta_for("org", "model", "m1");
    meta.instance_id = 100;
    css.update_object("org", "model", "m1", meta, None).await.unwrap();

    let mut stale = meta_for("org", "model", "m1");
    stale.instance_id = 50;
    let err = css
        .update_object("org", "model", "m1", stale, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidRequest(_)));
}
