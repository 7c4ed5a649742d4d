use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::comm::{Communicator, MessageEnvelope, Party};
use crate::error::SyncError;
use crate::SyncService;

/// Couples services running in one process: envelopes addressed to a party
/// are handed straight to that service's message handler. The transport for
/// tests and embedded deployments.
#[derive(Clone, Default)]
pub struct InProcessCommunicator {
    parties: Arc<Mutex<HashMap<String, Arc<SyncService>>>>,
}

impl InProcessCommunicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service as the handler for a party. Call after init, once
    /// per coupled node.
    pub async fn attach(&self, party: Party, service: Arc<SyncService>) {
        let mut parties = self.parties.lock().await;
        parties.insert(party.key(), service);
    }

    pub async fn detach(&self, party: &Party) {
        let mut parties = self.parties.lock().await;
        parties.remove(&party.key());
    }
}

#[async_trait]
impl Communicator for InProcessCommunicator {
    async fn send(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let target = {
            let parties = self.parties.lock().await;
            parties.get(&envelope.to.key()).cloned()
        };
        match target {
            Some(service) => service.handle_message(envelope).await,
            None => Err(SyncError::NotConnected),
        }
    }
}
