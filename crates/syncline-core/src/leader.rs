use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::watch;

use crate::error::SyncError;
use crate::time::now_ms;
use crate::SyncService;

impl SyncService {
    /// CSS only: drives the single-writer election. The worker ticks at a
    /// third of the leadership timeout; a leader heartbeats, a follower
    /// checks whether the leader record has gone stale and tries a CAS
    /// takeover.
    pub(crate) fn start_leader_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs((self.leadership_timeout_secs() / 3).max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if !self.is_running() {
                            continue;
                        }
                        if let Err(err) = self.leader_tick().await {
                            if err.is_not_connected() {
                                warn!("leader election skipped, store unreachable");
                            } else {
                                warn!("leader election tick failed: {}", err);
                            }
                        }
                    }
                }
            }
        });
    }

    async fn leader_tick(&self) -> Result<(), SyncError> {
        if self.is_leader() {
            let still_leader = self.store().leader_periodic_update(self.node_id()).await?;
            if !still_leader {
                warn!("lost the leadership");
                self.set_leader(false);
            }
            return Ok(());
        }

        match self
            .store()
            .insert_initial_leader(self.node_id(), self.leadership_timeout_secs())
            .await
        {
            Ok(true) => {
                info!("became the initial leader");
                self.set_leader(true);
                return Ok(());
            }
            Ok(false) => {}
            Err(err) => return Err(err),
        }

        let leader = self.store().retrieve_leader().await?;
        let expired =
            leader.last_heartbeat_ms + leader.timeout_secs * 1000 < now_ms();
        if !expired {
            return Ok(());
        }
        if self.store().update_leader(self.node_id(), leader.version).await? {
            info!("took over the leadership from {}", leader.leader_id);
            self.set_leader(true);
        }
        Ok(())
    }
}
