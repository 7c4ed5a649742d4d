use std::sync::Arc;

use syncline_api::ObjectStatus;

use crate::comm::InProcessCommunicator;
use crate::error::SyncError;
use crate::store::InMemoryStore;
use crate::tests::{css_config, eventually, meta_for, start_css, start_css_with, start_ess};
use crate::time::now_secs;

#[tokio::test]
async fn inactive_object_is_activated_by_the_loop() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;
    let ess = start_ess(&comm, "org", "e1").await;

    let mut meta = meta_for("org", "model", "m1");
    meta.inactive = true;
    meta.activation_time = now_secs() + 2;
    css.update_object("org", "model", "m1", meta, Some(b"data".to_vec()))
        .await
        .unwrap();

    assert_eq!(
        css.get_object_status("org", "model", "m1").await.unwrap(),
        ObjectStatus::NotReady
    );
    assert!(ess
        .store()
        .retrieve_object("org", "model", "m1")
        .await
        .unwrap_err()
        .is_not_found());

    // The activation loop promotes it once the time passes and the update
    // reaches the destination.
    assert!(eventually(|| async {
        matches!(
            ess.store().retrieve_object_status("org", "model", "m1").await,
            Ok(ObjectStatus::CompletelyReceived)
        )
    })
    .await);
    assert_eq!(
        css.get_object_status("org", "model", "m1").await.unwrap(),
        ObjectStatus::Ready
    );
}

#[tokio::test]
async fn explicit_activation_skips_the_wait() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;
    let ess = start_ess(&comm, "org", "e1").await;

    let mut meta = meta_for("org", "model", "m1");
    meta.inactive = true;
    meta.activation_time = now_secs() + 3600;
    css.update_object("org", "model", "m1", meta, None).await.unwrap();

    css.activate_object("org", "model", "m1").await.unwrap();
    assert_eq!(
        css.get_object_status("org", "model", "m1").await.unwrap(),
        ObjectStatus::Ready
    );
    assert!(ess.store().retrieve_object("org", "model", "m1").await.is_ok());
}

#[tokio::test]
async fn stopped_service_refuses_api_calls() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;

    css.stop(0).await;
    let err = css
        .update_object("org", "model", "m1", meta_for("org", "model", "m1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotRunning));
    let err = css.list_destinations("org").await.unwrap_err();
    assert!(matches!(err, SyncError::NotRunning));

    // A restart brings the API back.
    css.clone().start().await.unwrap();
    assert!(css.list_destinations("org").await.is_ok());
}

#[tokio::test]
async fn css_becomes_leader_and_hands_over_on_resign() {
    let comm = InProcessCommunicator::new();
    let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::default());

    let mut config_a = css_config();
    config_a.leadership_timeout_secs = 3;
    let a = start_css_with(&comm, config_a, store.clone()).await;
    assert!(eventually(|| async { a.is_leader() }).await);

    let comm_b = InProcessCommunicator::new();
    let mut config_b = css_config();
    config_b.leadership_timeout_secs = 3;
    let b = start_css_with(&comm_b, config_b, store.clone()).await;
    // A holds the lease; B stays a follower.
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    assert!(!b.is_leader());

    // Graceful shutdown resigns, so B takes over on its next tick.
    a.stop(0).await;
    assert!(eventually(|| async { b.is_leader() }).await);
}

#[tokio::test]
async fn restart_preserves_store_contents() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;
    let meta = meta_for("org", "model", "m1");
    css.update_object("org", "model", "m1", meta, Some(b"data".to_vec()))
        .await
        .unwrap();

    css.clone().restart(1).await.unwrap();
    assert!(css.is_running());
    assert!(css.get_object("org", "model", "m1").await.is_ok());
}

#[tokio::test]
async fn messaging_group_lookup_uses_the_cache() {
    let comm = InProcessCommunicator::new();
    let css = start_css(&comm).await;
    css.store()
        .store_org_to_messaging_group("org", "group-a")
        .await
        .unwrap();
    assert_eq!(css.messaging_group("org").await.unwrap(), "group-a");

    // The mapping changes underneath; the cached value is served until the
    // TTL expires.
    css.store()
        .store_org_to_messaging_group("org", "group-b")
        .await
        .unwrap();
    assert_eq!(css.messaging_group("org").await.unwrap(), "group-a");
}
