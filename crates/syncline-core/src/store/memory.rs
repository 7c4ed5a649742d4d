use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use syncline_api::{
    Destination, DestinationStatus, DeliveryStatus, MetaData, Notification, ObjectStatus,
    Organization, StoredOrganization,
};
use tokio::sync::RwLock;

use crate::chunks::{AppendOutcome, ChunkTracker};
use crate::error::SyncError;
use crate::store::{
    destination_key, notification_key, object_key, resend_eligible, DataReader, LeaderRecord,
    Storage,
};
use crate::time::{now_ms, now_secs};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ObjectRecord {
    pub meta: MetaData,
    pub status: ObjectStatus,
    pub data: Option<Vec<u8>>,
    pub chunks: Option<ChunkTracker>,
    pub remaining_consumers: i32,
    pub remaining_receivers: i32,
    pub policy_received: bool,
    pub app_received: bool,
    pub destinations: Vec<DestinationStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct DestinationRecord {
    pub destination: Destination,
    pub last_ping_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct StoredLeader {
    pub leader_id: String,
    pub timeout_secs: u64,
    pub last_heartbeat_ms: u64,
    pub version: i64,
}

#[derive(Default, Serialize, Deserialize)]
pub(crate) struct State {
    pub objects: HashMap<String, ObjectRecord>,
    pub notifications: HashMap<String, Notification>,
    pub destinations: HashMap<String, DestinationRecord>,
    pub webhooks: HashMap<String, Vec<String>>,
    pub acls: HashMap<String, Vec<String>>,
    pub organizations: HashMap<String, StoredOrganization>,
    pub messaging_groups: HashMap<String, (String, u64)>,
    pub leader: Option<StoredLeader>,
}

/// The in-memory backend. All critical sections run under one lock, which
/// makes the decrement and leader contracts trivially atomic.
pub struct InMemoryStore {
    state: RwLock<State>,
    max_chunk_buffer_bytes: usize,
}

impl InMemoryStore {
    pub fn new(max_chunk_buffer_bytes: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            max_chunk_buffer_bytes,
        }
    }

    pub(crate) fn with_state(state: State, max_chunk_buffer_bytes: usize) -> Self {
        Self {
            state: RwLock::new(state),
            max_chunk_buffer_bytes,
        }
    }

    pub(crate) async fn snapshot(&self) -> State {
        let state = self.state.read().await;
        State {
            objects: state.objects.clone(),
            notifications: state.notifications.clone(),
            destinations: state.destinations.clone(),
            webhooks: state.webhooks.clone(),
            acls: state.acls.clone(),
            organizations: state.organizations.clone(),
            messaging_groups: state.messaging_groups.clone(),
            leader: state.leader.clone(),
        }
    }

    /// Destination set of the routing metadata, resolved against the
    /// destination table of this store. Runs under the caller's lock so the
    /// upsert in store_object is atomic.
    fn resolve_destinations(
        state: &State,
        meta: &MetaData,
    ) -> Result<Vec<DestinationStatus>, SyncError> {
        if meta.destination_policy.is_some() {
            return Ok(Vec::new());
        }
        let mut dests = Vec::new();
        if !meta.dest_id.is_empty() {
            let key = destination_key(&meta.org_id, &meta.dest_type, &meta.dest_id);
            if let Some(record) = state.destinations.get(&key) {
                dests.push(DestinationStatus {
                    destination: record.destination.clone(),
                    status: DeliveryStatus::Pending,
                    message: String::new(),
                });
            }
        } else if !meta.destinations_list.is_empty() {
            for entry in meta.destinations_list.iter() {
                let mut parts = entry.splitn(2, ':');
                let (dest_type, dest_id) = match (parts.next(), parts.next()) {
                    (Some(t), Some(i)) if !t.is_empty() && !i.is_empty() => (t, i),
                    _ => {
                        return Err(SyncError::invalid(format!("invalid destination {}", entry)));
                    }
                };
                let key = destination_key(&meta.org_id, dest_type, dest_id);
                match state.destinations.get(&key) {
                    Some(record) => dests.push(DestinationStatus {
                        destination: record.destination.clone(),
                        status: DeliveryStatus::Pending,
                        message: String::new(),
                    }),
                    None => {
                        return Err(SyncError::invalid(format!(
                            "invalid destination {}:{}",
                            dest_type, dest_id
                        )));
                    }
                }
            }
        } else {
            for record in state.destinations.values() {
                if record.destination.org_id == meta.org_id
                    && (meta.dest_type.is_empty()
                        || record.destination.dest_type == meta.dest_type)
                {
                    dests.push(DestinationStatus {
                        destination: record.destination.clone(),
                        status: DeliveryStatus::Pending,
                        message: String::new(),
                    });
                }
            }
        }
        Ok(dests)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

#[async_trait]
impl Storage for InMemoryStore {
    async fn init(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn perform_maintenance(&self) {
        let now = now_secs();
        let mut state = self.state.write().await;
        let expired: Vec<String> = state
            .objects
            .iter()
            .filter(|(_, record)| {
                record.meta.expiration > 0 && record.meta.expiration < now
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.objects.remove(&key);
            let prefix = format!("{}:", key);
            state.notifications.retain(|k, _| !k.starts_with(&prefix));
        }
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn store_object(
        &self,
        meta: MetaData,
        data: Option<Vec<u8>>,
        status: ObjectStatus,
    ) -> Result<Vec<DestinationStatus>, SyncError> {
        let mut state = self.state.write().await;
        let key = meta.key();

        let (destinations, deleted) = if status.is_received_side() || status == ObjectStatus::Deleted
        {
            (Vec::new(), Vec::new())
        } else {
            let resolved = Self::resolve_destinations(&state, &meta)?;
            let old = state
                .objects
                .get(&key)
                .map(|record| record.destinations.clone())
                .unwrap_or_default();
            let (merged, deleted, _) = crate::store::compare_destinations(&old, resolved, true);
            (merged, deleted)
        };

        let previous = state.objects.get(&key);
        let remaining_consumers = meta.expected_consumers;
        let remaining_receivers = match previous {
            Some(record) if record.meta.instance_id == meta.instance_id => {
                record.remaining_receivers
            }
            _ => meta.expected_consumers,
        };

        let record = ObjectRecord {
            data: match data {
                Some(bytes) => Some(bytes),
                None => {
                    if let Some(prev) = previous {
                        if prev.meta.instance_id == meta.instance_id {
                            prev.data.clone()
                        } else {
                            None
                        }
                    } else {
                        None
                    }
                }
            },
            chunks: None,
            remaining_consumers,
            remaining_receivers,
            policy_received: false,
            app_received: false,
            destinations,
            meta,
            status,
        };
        state.objects.insert(key, record);
        Ok(deleted)
    }

    async fn store_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        data: Vec<u8>,
    ) -> Result<bool, SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        match state.objects.get_mut(&key) {
            Some(record) => {
                record.meta.object_size = data.len() as i64;
                record.data = Some(data);
                record.chunks = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        data: Vec<u8>,
        offset: u64,
        total: u64,
        is_first: bool,
        is_last: bool,
    ) -> Result<bool, SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;

        if record.chunks.is_none() {
            record.chunks = Some(ChunkTracker::new());
            if is_first {
                record.data = Some(Vec::new());
            }
        }
        let tracker = record.chunks.as_mut().ok_or(SyncError::NotFound)?;
        let outcome = tracker.record(
            offset,
            data.len() as u64,
            total,
            is_last,
            self.max_chunk_buffer_bytes,
        )?;
        match outcome {
            AppendOutcome::Duplicate => Ok(false),
            AppendOutcome::Accepted { complete } => {
                let buffer = record.data.get_or_insert_with(Vec::new);
                let end = offset as usize + data.len();
                if buffer.len() < end {
                    buffer.resize(end, 0);
                }
                buffer[offset as usize..end].copy_from_slice(&data);
                if complete {
                    record.status = ObjectStatus::CompletelyReceived;
                }
                Ok(complete)
            }
        }
    }

    async fn update_object_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        status: ObjectStatus,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;
        record.status = status;
        if status == ObjectStatus::CompletelyReceived {
            record.app_received = false;
        }
        Ok(())
    }

    async fn update_object_source_data_uri(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        source_data_uri: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;
        record.meta.source_data_uri = source_data_uri.to_string();
        Ok(())
    }

    async fn retrieve_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<MetaData, SyncError> {
        let state = self.state.read().await;
        let key = object_key(org_id, object_type, object_id);
        state
            .objects
            .get(&key)
            .map(|record| record.meta.clone())
            .ok_or(SyncError::NotFound)
    }

    async fn retrieve_object_and_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(MetaData, ObjectStatus), SyncError> {
        let state = self.state.read().await;
        let key = object_key(org_id, object_type, object_id);
        state
            .objects
            .get(&key)
            .map(|record| (record.meta.clone(), record.status))
            .ok_or(SyncError::NotFound)
    }

    async fn retrieve_object_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<ObjectStatus, SyncError> {
        let state = self.state.read().await;
        let key = object_key(org_id, object_type, object_id);
        state
            .objects
            .get(&key)
            .map(|record| record.status)
            .ok_or(SyncError::NotFound)
    }

    async fn retrieve_object_remaining_consumers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<i32, SyncError> {
        let state = self.state.read().await;
        let key = object_key(org_id, object_type, object_id);
        state
            .objects
            .get(&key)
            .map(|record| record.remaining_consumers)
            .ok_or(SyncError::NotFound)
    }

    async fn decrement_and_return_remaining_consumers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<i32, SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;
        record.remaining_consumers -= 1;
        Ok(record.remaining_consumers)
    }

    async fn decrement_and_return_remaining_receivers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<i32, SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;
        record.remaining_receivers -= 1;
        Ok(record.remaining_receivers)
    }

    async fn reset_object_remaining_consumers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;
        record.remaining_consumers = record.meta.expected_consumers;
        Ok(())
    }

    async fn retrieve_updated_objects(
        &self,
        org_id: &str,
        object_type: &str,
        received: bool,
    ) -> Result<Vec<MetaData>, SyncError> {
        let state = self.state.read().await;
        let mut updated = Vec::new();
        for record in state.objects.values() {
            if record.meta.org_id != org_id || record.meta.object_type != object_type {
                continue;
            }
            let visible = match record.status {
                ObjectStatus::CompletelyReceived => !record.app_received || received,
                ObjectStatus::Deleted => record.meta.deleted,
                _ => false,
            };
            if visible {
                updated.push(record.meta.clone());
            }
        }
        Ok(updated)
    }

    async fn retrieve_objects_for_destination(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Vec<MetaData>, SyncError> {
        let mut state = self.state.write().await;
        let destination = state
            .destinations
            .get(&destination_key(org_id, dest_type, dest_id))
            .map(|record| record.destination.clone());
        let mut objects = Vec::new();
        for record in state.objects.values_mut() {
            if record.meta.org_id != org_id || record.status != ObjectStatus::Ready {
                continue;
            }
            // Match on the routing metadata, so objects stored before the
            // destination registered are picked up too.
            let routed = if record.meta.destination_policy.is_some() {
                false
            } else if !record.meta.dest_id.is_empty() {
                record.meta.dest_type == dest_type && record.meta.dest_id == dest_id
            } else if !record.meta.destinations_list.is_empty() {
                let entry = format!("{}:{}", dest_type, dest_id);
                record.meta.destinations_list.iter().any(|d| d == &entry)
            } else {
                record.meta.dest_type.is_empty() || record.meta.dest_type == dest_type
            };
            if !routed {
                continue;
            }
            let tracked = record.destinations.iter().any(|dest| {
                dest.destination.dest_type == dest_type && dest.destination.dest_id == dest_id
            });
            if !tracked {
                if let Some(destination) = destination.clone() {
                    record.destinations.push(DestinationStatus {
                        destination,
                        status: DeliveryStatus::Pending,
                        message: String::new(),
                    });
                }
            }
            objects.push(record.meta.clone());
        }
        Ok(objects)
    }

    async fn retrieve_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Option<DataReader>, SyncError> {
        let state = self.state.read().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get(&key).ok_or(SyncError::NotFound)?;
        Ok(record
            .data
            .clone()
            .map(|bytes| DataReader::new(Box::new(Cursor::new(bytes)))))
    }

    async fn read_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        size: usize,
        offset: u64,
    ) -> Result<(Vec<u8>, bool), SyncError> {
        let state = self.state.read().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get(&key).ok_or(SyncError::NotFound)?;
        let data = record.data.as_deref().unwrap_or(&[]);
        let start = (offset as usize).min(data.len());
        let end = (start + size).min(data.len());
        let eof = end >= data.len();
        Ok((data[start..end].to_vec(), eof))
    }

    async fn close_data_reader(&self, reader: DataReader) -> Result<(), SyncError> {
        drop(reader);
        Ok(())
    }

    async fn mark_object_deleted(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;
        record.meta.deleted = true;
        record.status = ObjectStatus::Deleted;
        Ok(())
    }

    async fn mark_object_app_received(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;
        record.app_received = true;
        Ok(())
    }

    async fn mark_destination_policy_received(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;
        record.policy_received = true;
        Ok(())
    }

    async fn activate_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;
        record.meta.inactive = false;
        if record.status == ObjectStatus::NotReady {
            record.status = ObjectStatus::Ready;
        }
        Ok(())
    }

    async fn get_objects_to_activate(&self) -> Result<Vec<MetaData>, SyncError> {
        let now = now_secs();
        let state = self.state.read().await;
        Ok(state
            .objects
            .values()
            .filter(|record| {
                record.status == ObjectStatus::NotReady
                    && record.meta.inactive
                    && record.meta.activation_time <= now
            })
            .map(|record| record.meta.clone())
            .collect())
    }

    async fn delete_stored_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        state.objects.remove(&key);
        Ok(())
    }

    async fn delete_stored_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;
        record.data = None;
        record.chunks = None;
        Ok(())
    }

    async fn clean_objects(&self) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let stale: Vec<String> = state
            .objects
            .iter()
            .filter(|(_, record)| record.status.is_received_side())
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            state.objects.remove(&key);
            let prefix = format!("{}:", key);
            state.notifications.retain(|k, _| !k.starts_with(&prefix));
        }
        Ok(())
    }

    async fn get_number_of_stored_objects(&self) -> Result<u32, SyncError> {
        let state = self.state.read().await;
        Ok(state.objects.len() as u32)
    }

    async fn get_object_destinations(
        &self,
        meta: &MetaData,
    ) -> Result<Vec<Destination>, SyncError> {
        let state = self.state.read().await;
        Ok(Self::resolve_destinations(&state, meta)?
            .into_iter()
            .map(|dest| dest.destination)
            .collect())
    }

    async fn get_object_destinations_list(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Vec<DestinationStatus>, SyncError> {
        let state = self.state.read().await;
        let key = object_key(org_id, object_type, object_id);
        state
            .objects
            .get(&key)
            .map(|record| record.destinations.clone())
            .ok_or(SyncError::NotFound)
    }

    async fn update_object_delivery_status(
        &self,
        status: DeliveryStatus,
        message: &str,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<bool, SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;
        let entry = record
            .destinations
            .iter_mut()
            .find(|dest| {
                dest.destination.dest_type == dest_type && dest.destination.dest_id == dest_id
            })
            .ok_or(SyncError::NotFound)?;
        entry.status = status;
        entry.message = message.to_string();
        if status != DeliveryStatus::Deleted {
            return Ok(false);
        }
        Ok(record
            .destinations
            .iter()
            .all(|dest| dest.status == DeliveryStatus::Deleted))
    }

    async fn update_object_delivering(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = object_key(org_id, object_type, object_id);
        let record = state.objects.get_mut(&key).ok_or(SyncError::NotFound)?;
        for dest in record.destinations.iter_mut() {
            if dest.status == DeliveryStatus::Pending {
                dest.status = DeliveryStatus::Delivering;
            }
        }
        Ok(())
    }

    async fn update_notification_record(
        &self,
        notification: Notification,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        state
            .notifications
            .insert(notification.key(), notification);
        Ok(())
    }

    async fn update_notification_resend_time(
        &self,
        notification: &Notification,
        resend_interval_secs: u64,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let record = state
            .notifications
            .get_mut(&notification.key())
            .ok_or(SyncError::NotFound)?;
        record.resend_time = now_secs() + 6 * resend_interval_secs;
        Ok(())
    }

    async fn retrieve_notification_record(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Notification, SyncError> {
        let state = self.state.read().await;
        let key = notification_key(org_id, object_type, object_id, dest_type, dest_id);
        state
            .notifications
            .get(&key)
            .cloned()
            .ok_or(SyncError::NotFound)
    }

    async fn delete_notification_records(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        if dest_type.is_empty() && dest_id.is_empty() {
            let prefix = format!("{}:", object_key(org_id, object_type, object_id));
            state.notifications.retain(|k, _| !k.starts_with(&prefix));
        } else {
            let key = notification_key(org_id, object_type, object_id, dest_type, dest_id);
            state.notifications.remove(&key);
        }
        Ok(())
    }

    async fn retrieve_notifications(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
        retrieve_received: bool,
    ) -> Result<Vec<Notification>, SyncError> {
        let now = now_secs();
        let state = self.state.read().await;
        Ok(state
            .notifications
            .values()
            .filter(|n| {
                (org_id.is_empty() || n.org_id == org_id)
                    && (dest_type.is_empty()
                        || (n.dest_type == dest_type && n.dest_id == dest_id))
                    && resend_eligible(n.status, retrieve_received)
                    && n.resend_time <= now
            })
            .cloned()
            .collect())
    }

    async fn store_destination(&self, destination: Destination) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        state.destinations.insert(
            destination.key(),
            DestinationRecord {
                destination,
                last_ping_ms: now_ms(),
            },
        );
        Ok(())
    }

    async fn delete_destination(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = destination_key(org_id, dest_type, dest_id);
        state.destinations.remove(&key);
        for record in state.objects.values_mut() {
            record.destinations.retain(|dest| {
                !(dest.destination.org_id == org_id
                    && dest.destination.dest_type == dest_type
                    && dest.destination.dest_id == dest_id)
            });
        }
        let suffix = format!(":{}:{}", dest_type, dest_id);
        state
            .notifications
            .retain(|k, n| !(n.org_id == org_id && k.ends_with(&suffix)));
        Ok(())
    }

    async fn retrieve_destination(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Destination, SyncError> {
        let state = self.state.read().await;
        let key = destination_key(org_id, dest_type, dest_id);
        state
            .destinations
            .get(&key)
            .map(|record| record.destination.clone())
            .ok_or(SyncError::NotFound)
    }

    async fn destination_exists(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<bool, SyncError> {
        let state = self.state.read().await;
        let key = destination_key(org_id, dest_type, dest_id);
        Ok(state.destinations.contains_key(&key))
    }

    async fn retrieve_destinations(
        &self,
        org_id: &str,
        dest_type: &str,
    ) -> Result<Vec<Destination>, SyncError> {
        let state = self.state.read().await;
        Ok(state
            .destinations
            .values()
            .filter(|record| {
                record.destination.org_id == org_id
                    && (dest_type.is_empty() || record.destination.dest_type == dest_type)
            })
            .map(|record| record.destination.clone())
            .collect())
    }

    async fn retrieve_destination_protocol(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<String, SyncError> {
        let state = self.state.read().await;
        let key = destination_key(org_id, dest_type, dest_id);
        state
            .destinations
            .get(&key)
            .map(|record| record.destination.communication.clone())
            .ok_or(SyncError::NotFound)
    }

    async fn update_destination_last_ping_time(
        &self,
        destination: &Destination,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let record = state
            .destinations
            .get_mut(&destination.key())
            .ok_or(SyncError::NotFound)?;
        record.last_ping_ms = now_ms();
        Ok(())
    }

    async fn remove_inactive_destinations(&self, before: u64) -> Result<(), SyncError> {
        let stale: Vec<Destination> = {
            let state = self.state.read().await;
            state
                .destinations
                .values()
                .filter(|record| record.last_ping_ms < before)
                .map(|record| record.destination.clone())
                .collect()
        };
        for dest in stale {
            self.delete_destination(&dest.org_id, &dest.dest_type, &dest.dest_id)
                .await?;
        }
        Ok(())
    }

    async fn get_number_of_destinations(&self) -> Result<u32, SyncError> {
        let state = self.state.read().await;
        Ok(state.destinations.len() as u32)
    }

    async fn add_webhook(
        &self,
        org_id: &str,
        object_type: &str,
        url: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = format!("{}:{}", org_id, object_type);
        let urls = state.webhooks.entry(key).or_default();
        if !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
        Ok(())
    }

    async fn delete_webhook(
        &self,
        org_id: &str,
        object_type: &str,
        url: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let key = format!("{}:{}", org_id, object_type);
        if let Some(urls) = state.webhooks.get_mut(&key) {
            urls.retain(|u| u != url);
            if urls.is_empty() {
                state.webhooks.remove(&key);
            }
        }
        Ok(())
    }

    async fn retrieve_webhooks(
        &self,
        org_id: &str,
        object_type: &str,
    ) -> Result<Vec<String>, SyncError> {
        let state = self.state.read().await;
        let key = format!("{}:{}", org_id, object_type);
        match state.webhooks.get(&key) {
            Some(urls) if !urls.is_empty() => Ok(urls.clone()),
            _ => Err(SyncError::NotFound),
        }
    }

    async fn add_users_to_acl(
        &self,
        acl_type: &str,
        org_id: &str,
        key: &str,
        usernames: &[String],
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let acl_key = format!("{}:{}:{}", acl_type, org_id, key);
        let users = state.acls.entry(acl_key).or_default();
        for user in usernames.iter() {
            if !users.iter().any(|u| u == user) {
                users.push(user.clone());
            }
        }
        Ok(())
    }

    async fn remove_users_from_acl(
        &self,
        acl_type: &str,
        org_id: &str,
        key: &str,
        usernames: &[String],
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        let acl_key = format!("{}:{}:{}", acl_type, org_id, key);
        if let Some(users) = state.acls.get_mut(&acl_key) {
            users.retain(|u| !usernames.iter().any(|removed| removed == u));
            if users.is_empty() {
                state.acls.remove(&acl_key);
            }
        }
        Ok(())
    }

    async fn retrieve_acl(
        &self,
        acl_type: &str,
        org_id: &str,
        key: &str,
    ) -> Result<Vec<String>, SyncError> {
        let state = self.state.read().await;
        let acl_key = format!("{}:{}:{}", acl_type, org_id, key);
        state
            .acls
            .get(&acl_key)
            .cloned()
            .ok_or(SyncError::NotFound)
    }

    async fn retrieve_acls_in_org(
        &self,
        acl_type: &str,
        org_id: &str,
    ) -> Result<Vec<String>, SyncError> {
        let state = self.state.read().await;
        let prefix = format!("{}:{}:", acl_type, org_id);
        Ok(state
            .acls
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .map(|key| key[prefix.len()..].to_string())
            .collect())
    }

    async fn store_organization(&self, org: Organization) -> Result<u64, SyncError> {
        let mut state = self.state.write().await;
        let timestamp = now_ms();
        state.organizations.insert(
            org.org_id.clone(),
            StoredOrganization { org, timestamp },
        );
        Ok(timestamp)
    }

    async fn retrieve_organization_info(
        &self,
        org_id: &str,
    ) -> Result<StoredOrganization, SyncError> {
        let state = self.state.read().await;
        state
            .organizations
            .get(org_id)
            .cloned()
            .ok_or(SyncError::NotFound)
    }

    async fn retrieve_organizations(&self) -> Result<Vec<StoredOrganization>, SyncError> {
        let state = self.state.read().await;
        Ok(state.organizations.values().cloned().collect())
    }

    async fn retrieve_updated_organizations(
        &self,
        since_ms: u64,
    ) -> Result<Vec<StoredOrganization>, SyncError> {
        let state = self.state.read().await;
        Ok(state
            .organizations
            .values()
            .filter(|stored| stored.timestamp > since_ms)
            .cloned()
            .collect())
    }

    async fn delete_organization_info(&self, org_id: &str) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        state.organizations.remove(org_id);
        Ok(())
    }

    async fn delete_organization(&self, org_id: &str) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        state.organizations.remove(org_id);
        state.messaging_groups.remove(org_id);
        let prefix = format!("{}:", org_id);
        state.objects.retain(|key, _| !key.starts_with(&prefix));
        state.notifications.retain(|key, _| !key.starts_with(&prefix));
        state.destinations.retain(|key, _| !key.starts_with(&prefix));
        state.webhooks.retain(|key, _| !key.starts_with(&prefix));
        let acl_infix = format!(":{}:", org_id);
        state.acls.retain(|key, _| !key.contains(&acl_infix));
        Ok(())
    }

    async fn store_org_to_messaging_group(
        &self,
        org_id: &str,
        messaging_group: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        state
            .messaging_groups
            .insert(org_id.to_string(), (messaging_group.to_string(), now_ms()));
        Ok(())
    }

    async fn delete_org_to_messaging_group(&self, org_id: &str) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        state.messaging_groups.remove(org_id);
        Ok(())
    }

    async fn retrieve_messaging_group(&self, org_id: &str) -> Result<String, SyncError> {
        let state = self.state.read().await;
        state
            .messaging_groups
            .get(org_id)
            .map(|(group, _)| group.clone())
            .ok_or(SyncError::NotFound)
    }

    async fn retrieve_updated_messaging_groups(
        &self,
        since_ms: u64,
    ) -> Result<Vec<(String, String)>, SyncError> {
        let state = self.state.read().await;
        Ok(state
            .messaging_groups
            .iter()
            .filter(|(_, (_, updated))| *updated > since_ms)
            .map(|(org, (group, _))| (org.clone(), group.clone()))
            .collect())
    }

    async fn insert_initial_leader(
        &self,
        leader_id: &str,
        timeout_secs: u64,
    ) -> Result<bool, SyncError> {
        let mut state = self.state.write().await;
        if state.leader.is_some() {
            return Ok(false);
        }
        state.leader = Some(StoredLeader {
            leader_id: leader_id.to_string(),
            timeout_secs,
            last_heartbeat_ms: now_ms(),
            version: 1,
        });
        Ok(true)
    }

    async fn leader_periodic_update(&self, leader_id: &str) -> Result<bool, SyncError> {
        let mut state = self.state.write().await;
        match state.leader.as_mut() {
            Some(leader) if leader.leader_id == leader_id => {
                leader.last_heartbeat_ms = now_ms();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn retrieve_leader(&self) -> Result<LeaderRecord, SyncError> {
        let state = self.state.read().await;
        state
            .leader
            .as_ref()
            .map(|leader| LeaderRecord {
                leader_id: leader.leader_id.clone(),
                timeout_secs: leader.timeout_secs,
                last_heartbeat_ms: leader.last_heartbeat_ms,
                version: leader.version,
            })
            .ok_or(SyncError::NotFound)
    }

    async fn update_leader(&self, leader_id: &str, version: i64) -> Result<bool, SyncError> {
        let mut state = self.state.write().await;
        match state.leader.as_mut() {
            Some(leader) if leader.version == version => {
                leader.leader_id = leader_id.to_string();
                leader.last_heartbeat_ms = now_ms();
                leader.version += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(SyncError::NotFound),
        }
    }

    async fn resign_leadership(&self, leader_id: &str) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        if let Some(leader) = state.leader.as_mut() {
            if leader.leader_id == leader_id {
                leader.last_heartbeat_ms = 0;
                leader.version += 1;
            }
        }
        Ok(())
    }
}
