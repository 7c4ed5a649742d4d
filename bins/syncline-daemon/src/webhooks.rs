use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use syncline_core::error::SyncError;
use syncline_core::events::ObjectEventKind;
use syncline_core::SyncService;

/// Forwards object events to the webhooks registered for (org, object type).
/// Failures are logged and dropped; applications that need reliability poll
/// the updated-objects API instead.
pub fn start_dispatcher(service: Arc<SyncService>) {
    let mut events = service.subscribe();
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!("webhook dispatcher disabled: {}", err);
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("webhook dispatcher lagged, {} events dropped", skipped);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let urls = match service
                .store()
                .retrieve_webhooks(&event.meta.org_id, &event.meta.object_type)
                .await
            {
                Ok(urls) => urls,
                Err(SyncError::NotFound) => continue,
                Err(err) => {
                    warn!("webhook lookup failed: {}", err);
                    continue;
                }
            };
            let kind = match event.kind {
                ObjectEventKind::Updated => "update",
                ObjectEventKind::Deleted => "delete",
            };
            let body = serde_json::json!({
                "action": kind,
                "meta": event.meta,
            });
            for url in urls {
                match client.post(&url).json(&body).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!("webhook {} notified for {}", url, event.meta.key());
                    }
                    Ok(response) => {
                        warn!("webhook {} answered {}", url, response.status());
                    }
                    Err(err) => {
                        warn!("webhook {} failed: {}", url, err);
                    }
                }
            }
        }
    });
}
