pub mod chunks;
pub mod comm;
pub mod config;
pub mod error;
pub mod events;
pub mod leader;
pub mod notifications;
pub mod objects;
pub mod security;
pub mod store;
pub mod time;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::comm::{Communicator, Party};
use crate::config::{Config, NodeType};
use crate::error::SyncError;
use crate::events::{EventBus, EventReceiver};
use crate::security::Authenticator;
use crate::store::Storage;
use crate::time::now_ms;

/// One synchronization node: a CSS or an ESS. All state lives in the store;
/// the service owns the maintenance workers and the protocol handlers.
pub struct SyncService {
    config: Config,
    store: Arc<dyn Storage>,
    comm: Arc<dyn Communicator>,
    auth: Arc<dyn Authenticator>,
    events: EventBus,
    node_id: String,
    running: AtomicBool,
    registered: AtomicBool,
    is_leader: AtomicBool,
    in_flight: AtomicUsize,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    messaging_groups: Mutex<HashMap<String, (String, u64)>>,
}

impl SyncService {
    pub async fn init(
        mut config: Config,
        store: Arc<dyn Storage>,
        comm: Arc<dyn Communicator>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Arc<Self>, SyncError> {
        config.validate()?;
        store.init().await?;
        if config.node_type == NodeType::Ess {
            // Stale partial state from a previous run is dropped before any
            // traffic; persistent backends keep completed objects.
            store.clean_objects().await?;
        }
        let service = Arc::new(Self {
            node_id: Uuid::new_v4().to_string(),
            config,
            store,
            comm,
            auth,
            events: EventBus::new(256),
            running: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            is_leader: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            shutdown: Mutex::new(None),
            messaging_groups: Mutex::new(HashMap::new()),
        });
        service.clone().start().await?;
        Ok(service)
    }

    /// Starts the maintenance workers. A no-op while already running.
    pub async fn start(self: Arc<Self>) -> Result<(), SyncError> {
        let mut shutdown = self.shutdown.lock().await;
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, rx) = watch::channel(false);
        *shutdown = Some(tx);
        self.running.store(true, Ordering::SeqCst);
        self.registered.store(false, Ordering::SeqCst);

        self.clone().start_resend_worker(rx.clone());
        self.clone().start_activation_worker(rx.clone());
        self.clone().start_maintenance_worker(rx.clone());
        if self.config.node_type == NodeType::Css {
            self.clone().start_leader_worker(rx);
        }
        info!(
            "sync service started as {:?} node {}",
            self.config.node_type, self.node_id
        );
        Ok(())
    }

    /// Flips the running flag, waits up to `quiesce_secs` for in-flight work
    /// to drain, then stops the workers and the store.
    pub async fn stop(&self, quiesce_secs: u64) {
        self.running.store(false, Ordering::SeqCst);
        let deadline = now_ms() + quiesce_secs * 1000;
        while self.in_flight.load(Ordering::SeqCst) > 0 && now_ms() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.is_leader.load(Ordering::SeqCst) {
            if let Err(err) = self.store.resign_leadership(&self.node_id).await {
                warn!("failed to resign leadership: {}", err);
            }
            self.is_leader.store(false, Ordering::SeqCst);
        }
        let mut shutdown = self.shutdown.lock().await;
        if let Some(tx) = shutdown.take() {
            let _ = tx.send(true);
        }
        self.store.stop().await;
        info!("sync service stopped");
    }

    /// Stop followed by start.
    pub async fn restart(self: Arc<Self>, quiesce_secs: u64) -> Result<(), SyncError> {
        self.stop(quiesce_secs).await;
        self.store.init().await?;
        self.start().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// ESS only: true once the CSS acknowledged this node's registration.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.auth
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The party this node answers as on the wire.
    pub fn party(&self) -> Party {
        match self.config.node_type {
            NodeType::Css => Party::Css,
            NodeType::Ess => Party::node(
                &self.config.org_id,
                &self.config.destination_type,
                &self.config.destination_id,
            ),
        }
    }

    pub(crate) fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub(crate) fn check_running(&self) -> Result<(), SyncError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SyncError::NotRunning)
        }
    }

    pub(crate) fn track(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { service: self }
    }

    fn start_resend_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.resend_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut pass: u64 = 0;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if !self.is_running() {
                            continue;
                        }
                        if self.config.node_type == NodeType::Ess {
                            if !self.is_registered() {
                                if let Err(err) = self.send_registration().await {
                                    warn!("registration failed: {}", err);
                                }
                            } else if let Err(err) = self.send_ping().await {
                                warn!("ping failed: {}", err);
                            }
                        }
                        // Every sixth pass also sweeps notifications stuck in
                        // the data phase or waiting on a lost received ack.
                        pass += 1;
                        let retrieve_received = pass % 6 == 0;
                        if let Err(err) = self.resend_notifications(retrieve_received).await {
                            if err.is_not_connected() {
                                warn!("resend skipped, store unreachable");
                            } else {
                                warn!("resend pass failed: {}", err);
                            }
                        }
                    }
                }
            }
        });
    }

    fn start_activation_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.object_activation_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if !self.is_running() {
                            continue;
                        }
                        if let Err(err) = self.activate_due_objects().await {
                            warn!("activation pass failed: {}", err);
                        }
                    }
                }
            }
        });
    }

    fn start_maintenance_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.storage_maintenance_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if !self.is_running() {
                            continue;
                        }
                        self.store.perform_maintenance().await;
                        if self.config.node_type == NodeType::Css && self.is_leader() {
                            let cutoff = now_ms().saturating_sub(
                                self.config.destination_liveness_timeout_secs * 1000,
                            );
                            if let Err(err) =
                                self.store.remove_inactive_destinations(cutoff).await
                            {
                                warn!("destination cleanup failed: {}", err);
                            }
                            if let Err(err) = self.reconcile_messaging_groups().await {
                                warn!("messaging group reconciliation failed: {}", err);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Leader-only: every organization gets a messaging group mapping; orgs
    /// updated since the last pass refresh theirs.
    async fn reconcile_messaging_groups(&self) -> Result<(), SyncError> {
        let since = {
            let cache = self.messaging_groups.lock().await;
            cache.values().map(|(_, at)| *at).max().unwrap_or(0)
        };
        for stored in self.store.retrieve_updated_organizations(since).await? {
            let org_id = stored.org.org_id;
            match self.store.retrieve_messaging_group(&org_id).await {
                Ok(_) => {}
                Err(SyncError::NotFound) => {
                    self.store
                        .store_org_to_messaging_group(&org_id, &org_id)
                        .await?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Messaging group of the org, with a TTL cache in front of the store.
    pub async fn messaging_group(&self, org_id: &str) -> Result<String, SyncError> {
        let ttl_ms = self.config.messaging_group_cache_expiration_minutes * 60 * 1000;
        {
            let cache = self.messaging_groups.lock().await;
            if let Some((group, cached_at)) = cache.get(org_id) {
                if now_ms().saturating_sub(*cached_at) <= ttl_ms {
                    return Ok(group.clone());
                }
            }
        }
        let group = self.store.retrieve_messaging_group(org_id).await?;
        let mut cache = self.messaging_groups.lock().await;
        cache.insert(org_id.to_string(), (group.clone(), now_ms()));
        Ok(group)
    }

    async fn activate_due_objects(&self) -> Result<(), SyncError> {
        for meta in self.store.get_objects_to_activate().await? {
            if let Err(err) = self
                .activate_object(&meta.org_id, &meta.object_type, &meta.object_id)
                .await
            {
                warn!("failed to activate {}: {}", meta.key(), err);
            }
        }
        Ok(())
    }

    pub(crate) fn mark_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    pub(crate) fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::SeqCst);
    }

    pub(crate) fn leadership_timeout_secs(&self) -> u64 {
        self.config.leadership_timeout_secs
    }
}

pub(crate) struct InFlightGuard<'a> {
    service: &'a SyncService,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.service.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests;
