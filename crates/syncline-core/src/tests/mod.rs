mod file_store_tests;
mod lifecycle_tests;
mod notification_tests;
mod resolver_tests;
mod store_tests;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use syncline_api::MetaData;

use crate::comm::InProcessCommunicator;
use crate::config::{CommunicationProtocol, Config, NodeType};
use crate::security::OpenAuthenticator;
use crate::store::{InMemoryStore, Storage};
use crate::SyncService;

pub(crate) fn css_config() -> Config {
    let mut cfg = Config::default();
    cfg.node_type = NodeType::Css;
    cfg.destination_type = "cloud".to_string();
    cfg.destination_id = "css1".to_string();
    cfg.communication_protocol = CommunicationProtocol::Http;
    cfg.resend_interval_secs = 1;
    cfg.object_activation_interval_secs = 1;
    cfg.storage_maintenance_interval_secs = 2;
    cfg.leadership_timeout_secs = 3;
    cfg
}

pub(crate) fn ess_config(org_id: &str, dest_id: &str) -> Config {
    let mut cfg = Config::default();
    cfg.node_type = NodeType::Ess;
    cfg.org_id = org_id.to_string();
    cfg.destination_type = "edge".to_string();
    cfg.destination_id = dest_id.to_string();
    cfg.communication_protocol = CommunicationProtocol::Http;
    cfg.http_css_host = "localhost".to_string();
    cfg.http_css_port = 8080;
    cfg.resend_interval_secs = 1;
    cfg.object_activation_interval_secs = 1;
    cfg.storage_maintenance_interval_secs = 2;
    cfg
}

pub(crate) async fn start_css(comm: &InProcessCommunicator) -> Arc<SyncService> {
    start_css_with(comm, css_config(), Arc::new(InMemoryStore::default())).await
}

pub(crate) async fn start_css_with(
    comm: &InProcessCommunicator,
    config: Config,
    store: Arc<dyn Storage>,
) -> Arc<SyncService> {
    let service = SyncService::init(
        config,
        store,
        Arc::new(comm.clone()),
        Arc::new(OpenAuthenticator),
    )
    .await
    .expect("css init");
    comm.attach(service.party(), service.clone()).await;
    service
}

/// Starts an ESS coupled to the communicator and registers it with the CSS.
pub(crate) async fn start_ess(
    comm: &InProcessCommunicator,
    org_id: &str,
    dest_id: &str,
) -> Arc<SyncService> {
    let service = SyncService::init(
        ess_config(org_id, dest_id),
        Arc::new(InMemoryStore::default()),
        Arc::new(comm.clone()),
        Arc::new(OpenAuthenticator),
    )
    .await
    .expect("ess init");
    comm.attach(service.party(), service.clone()).await;
    service.send_registration().await.expect("register");
    assert!(service.is_registered());
    service
}

pub(crate) fn meta_for(org_id: &str, object_type: &str, object_id: &str) -> MetaData {
    let mut meta = MetaData::new(org_id, object_type, object_id);
    meta.dest_type = "edge".to_string();
    meta
}

/// Polls the condition every 50ms for up to five seconds.
pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
