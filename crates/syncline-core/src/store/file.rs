use std::path::{Path, PathBuf};

use async_trait::async_trait;
use syncline_api::{
    Destination, DestinationStatus, DeliveryStatus, MetaData, Notification, ObjectStatus,
    Organization, StoredOrganization,
};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::store::memory::{InMemoryStore, State};
use crate::store::{DataReader, LeaderRecord, Storage};

/// Persistent backend: the in-memory structures plus a JSON snapshot that is
/// rewritten after every mutation and reloaded on init. Suited to an ESS with
/// `ess_persistent_storage` and to single-node CSS deployments.
pub struct FileStore {
    inner: InMemoryStore,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>, max_chunk_buffer_bytes: usize) -> Self {
        let path = root.as_ref().join("syncline-store.json");
        Self {
            inner: InMemoryStore::new(max_chunk_buffer_bytes),
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn open(
        root: impl AsRef<Path>,
        max_chunk_buffer_bytes: usize,
    ) -> Result<Self, SyncError> {
        let root = root.as_ref();
        fs::create_dir_all(root)
            .await
            .map_err(|err| SyncError::internal(format!("create {}: {}", root.display(), err)))?;
        let path = root.join("syncline-store.json");
        let inner = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|err| SyncError::internal(format!("read snapshot: {}", err)))?;
            let state: State = serde_json::from_str(&content)
                .map_err(|err| SyncError::internal(format!("decode snapshot: {}", err)))?;
            InMemoryStore::with_state(state, max_chunk_buffer_bytes)
        } else {
            InMemoryStore::new(max_chunk_buffer_bytes)
        };
        Ok(Self {
            inner,
            path,
            write_lock: Mutex::new(()),
        })
    }

    async fn persist(&self) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        let state = self.inner.snapshot().await;
        let encoded = serde_json::to_vec(&state)
            .map_err(|err| SyncError::internal(format!("encode snapshot: {}", err)))?;
        fs::write(&self.path, encoded)
            .await
            .map_err(|err| SyncError::internal(format!("write snapshot: {}", err)))?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStore {
    async fn init(&self) -> Result<(), SyncError> {
        self.inner.init().await
    }

    async fn stop(&self) {
        let _ = self.persist().await;
    }

    async fn perform_maintenance(&self) {
        self.inner.perform_maintenance().await;
        let _ = self.persist().await;
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn store_object(
        &self,
        meta: MetaData,
        data: Option<Vec<u8>>,
        status: ObjectStatus,
    ) -> Result<Vec<DestinationStatus>, SyncError> {
        let deleted = self.inner.store_object(meta, data, status).await?;
        self.persist().await?;
        Ok(deleted)
    }

    async fn store_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        data: Vec<u8>,
    ) -> Result<bool, SyncError> {
        let found = self
            .inner
            .store_object_data(org_id, object_type, object_id, data)
            .await?;
        self.persist().await?;
        Ok(found)
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
        let complete = self
            .inner
            .append_object_data(
                org_id,
                object_type,
                object_id,
                data,
                offset,
                total,
                is_first,
                is_last,
            )
            .await?;
        self.persist().await?;
        Ok(complete)
    }

    async fn update_object_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        status: ObjectStatus,
    ) -> Result<(), SyncError> {
        self.inner
            .update_object_status(org_id, object_type, object_id, status)
            .await?;
        self.persist().await
    }

    async fn update_object_source_data_uri(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        source_data_uri: &str,
    ) -> Result<(), SyncError> {
        self.inner
            .update_object_source_data_uri(org_id, object_type, object_id, source_data_uri)
            .await?;
        self.persist().await
    }

    async fn retrieve_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<MetaData, SyncError> {
        self.inner.retrieve_object(org_id, object_type, object_id).await
    }

    async fn retrieve_object_and_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(MetaData, ObjectStatus), SyncError> {
        self.inner
            .retrieve_object_and_status(org_id, object_type, object_id)
            .await
    }

    async fn retrieve_object_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<ObjectStatus, SyncError> {
        self.inner
            .retrieve_object_status(org_id, object_type, object_id)
            .await
    }

    async fn retrieve_object_remaining_consumers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<i32, SyncError> {
        self.inner
            .retrieve_object_remaining_consumers(org_id, object_type, object_id)
            .await
    }

    async fn decrement_and_return_remaining_consumers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<i32, SyncError> {
        let remaining = self
            .inner
            .decrement_and_return_remaining_consumers(org_id, object_type, object_id)
            .await?;
        self.persist().await?;
        Ok(remaining)
    }

    async fn decrement_and_return_remaining_receivers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<i32, SyncError> {
        let remaining = self
            .inner
            .decrement_and_return_remaining_receivers(org_id, object_type, object_id)
            .await?;
        self.persist().await?;
        Ok(remaining)
    }

    async fn reset_object_remaining_consumers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.inner
            .reset_object_remaining_consumers(org_id, object_type, object_id)
            .await?;
        self.persist().await
    }

    async fn retrieve_updated_objects(
        &self,
        org_id: &str,
        object_type: &str,
        received: bool,
    ) -> Result<Vec<MetaData>, SyncError> {
        self.inner
            .retrieve_updated_objects(org_id, object_type, received)
            .await
    }

    async fn retrieve_objects_for_destination(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Vec<MetaData>, SyncError> {
        self.inner
            .retrieve_objects_for_destination(org_id, dest_type, dest_id)
            .await
    }

    async fn retrieve_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Option<DataReader>, SyncError> {
        self.inner
            .retrieve_object_data(org_id, object_type, object_id)
            .await
    }

    async fn read_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        size: usize,
        offset: u64,
    ) -> Result<(Vec<u8>, bool), SyncError> {
        self.inner
            .read_object_data(org_id, object_type, object_id, size, offset)
            .await
    }

    async fn close_data_reader(&self, reader: DataReader) -> Result<(), SyncError> {
        self.inner.close_data_reader(reader).await
    }

    async fn mark_object_deleted(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.inner
            .mark_object_deleted(org_id, object_type, object_id)
            .await?;
        self.persist().await
    }

    async fn mark_object_app_received(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.inner
            .mark_object_app_received(org_id, object_type, object_id)
            .await?;
        self.persist().await
    }

    async fn mark_destination_policy_received(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.inner
            .mark_destination_policy_received(org_id, object_type, object_id)
            .await?;
        self.persist().await
    }

    async fn activate_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.inner
            .activate_object(org_id, object_type, object_id)
            .await?;
        self.persist().await
    }

    async fn get_objects_to_activate(&self) -> Result<Vec<MetaData>, SyncError> {
        self.inner.get_objects_to_activate().await
    }

    async fn delete_stored_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.inner
            .delete_stored_object(org_id, object_type, object_id)
            .await?;
        self.persist().await
    }

    async fn delete_stored_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.inner
            .delete_stored_data(org_id, object_type, object_id)
            .await?;
        self.persist().await
    }

    async fn clean_objects(&self) -> Result<(), SyncError> {
        // Unlike the memory backend, only partially received objects are
        // dropped; completed ones survive a restart.
        for meta in self.all_partially_received().await? {
            self.inner
                .delete_stored_object(&meta.org_id, &meta.object_type, &meta.object_id)
                .await?;
            self.inner
                .delete_notification_records(
                    &meta.org_id,
                    &meta.object_type,
                    &meta.object_id,
                    "",
                    "",
                )
                .await?;
        }
        self.persist().await
    }

    async fn get_number_of_stored_objects(&self) -> Result<u32, SyncError> {
        self.inner.get_number_of_stored_objects().await
    }

    async fn get_object_destinations(
        &self,
        meta: &MetaData,
    ) -> Result<Vec<Destination>, SyncError> {
        self.inner.get_object_destinations(meta).await
    }

    async fn get_object_destinations_list(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Vec<DestinationStatus>, SyncError> {
        self.inner
            .get_object_destinations_list(org_id, object_type, object_id)
            .await
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
        let all_deleted = self
            .inner
            .update_object_delivery_status(
                status, message, org_id, object_type, object_id, dest_type, dest_id,
            )
            .await?;
        self.persist().await?;
        Ok(all_deleted)
    }

    async fn update_object_delivering(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.inner
            .update_object_delivering(org_id, object_type, object_id)
            .await?;
        self.persist().await
    }

    async fn update_notification_record(
        &self,
        notification: Notification,
    ) -> Result<(), SyncError> {
        self.inner.update_notification_record(notification).await?;
        self.persist().await
    }

    async fn update_notification_resend_time(
        &self,
        notification: &Notification,
        resend_interval_secs: u64,
    ) -> Result<(), SyncError> {
        self.inner
            .update_notification_resend_time(notification, resend_interval_secs)
            .await?;
        self.persist().await
    }

    async fn retrieve_notification_record(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Notification, SyncError> {
        self.inner
            .retrieve_notification_record(org_id, object_type, object_id, dest_type, dest_id)
            .await
    }

    async fn delete_notification_records(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<(), SyncError> {
        self.inner
            .delete_notification_records(org_id, object_type, object_id, dest_type, dest_id)
            .await?;
        self.persist().await
    }

    async fn retrieve_notifications(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
        retrieve_received: bool,
    ) -> Result<Vec<Notification>, SyncError> {
        self.inner
            .retrieve_notifications(org_id, dest_type, dest_id, retrieve_received)
            .await
    }

    async fn store_destination(&self, destination: Destination) -> Result<(), SyncError> {
        self.inner.store_destination(destination).await?;
        self.persist().await
    }

    async fn delete_destination(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<(), SyncError> {
        self.inner
            .delete_destination(org_id, dest_type, dest_id)
            .await?;
        self.persist().await
    }

    async fn retrieve_destination(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Destination, SyncError> {
        self.inner
            .retrieve_destination(org_id, dest_type, dest_id)
            .await
    }

    async fn destination_exists(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<bool, SyncError> {
        self.inner.destination_exists(org_id, dest_type, dest_id).await
    }

    async fn retrieve_destinations(
        &self,
        org_id: &str,
        dest_type: &str,
    ) -> Result<Vec<Destination>, SyncError> {
        self.inner.retrieve_destinations(org_id, dest_type).await
    }

    async fn retrieve_destination_protocol(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<String, SyncError> {
        self.inner
            .retrieve_destination_protocol(org_id, dest_type, dest_id)
            .await
    }

    async fn update_destination_last_ping_time(
        &self,
        destination: &Destination,
    ) -> Result<(), SyncError> {
        self.inner
            .update_destination_last_ping_time(destination)
            .await?;
        self.persist().await
    }

    async fn remove_inactive_destinations(&self, before: u64) -> Result<(), SyncError> {
        self.inner.remove_inactive_destinations(before).await?;
        self.persist().await
    }

    async fn get_number_of_destinations(&self) -> Result<u32, SyncError> {
        self.inner.get_number_of_destinations().await
    }

    async fn add_webhook(
        &self,
        org_id: &str,
        object_type: &str,
        url: &str,
    ) -> Result<(), SyncError> {
        self.inner.add_webhook(org_id, object_type, url).await?;
        self.persist().await
    }

    async fn delete_webhook(
        &self,
        org_id: &str,
        object_type: &str,
        url: &str,
    ) -> Result<(), SyncError> {
        self.inner.delete_webhook(org_id, object_type, url).await?;
        self.persist().await
    }

    async fn retrieve_webhooks(
        &self,
        org_id: &str,
        object_type: &str,
    ) -> Result<Vec<String>, SyncError> {
        self.inner.retrieve_webhooks(org_id, object_type).await
    }

    async fn add_users_to_acl(
        &self,
        acl_type: &str,
        org_id: &str,
        key: &str,
        usernames: &[String],
    ) -> Result<(), SyncError> {
        self.inner
            .add_users_to_acl(acl_type, org_id, key, usernames)
            .await?;
        self.persist().await
    }

    async fn remove_users_from_acl(
        &self,
        acl_type: &str,
        org_id: &str,
        key: &str,
        usernames: &[String],
    ) -> Result<(), SyncError> {
        self.inner
            .remove_users_from_acl(acl_type, org_id, key, usernames)
            .await?;
        self.persist().await
    }

    async fn retrieve_acl(
        &self,
        acl_type: &str,
        org_id: &str,
        key: &str,
    ) -> Result<Vec<String>, SyncError> {
        self.inner.retrieve_acl(acl_type, org_id, key).await
    }

    async fn retrieve_acls_in_org(
        &self,
        acl_type: &str,
        org_id: &str,
    ) -> Result<Vec<String>, SyncError> {
        self.inner.retrieve_acls_in_org(acl_type, org_id).await
    }

    async fn store_organization(&self, org: Organization) -> Result<u64, SyncError> {
        let timestamp = self.inner.store_organization(org).await?;
        self.persist().await?;
        Ok(timestamp)
    }

    async fn retrieve_organization_info(
        &self,
        org_id: &str,
    ) -> Result<StoredOrganization, SyncError> {
        self.inner.retrieve_organization_info(org_id).await
    }

    async fn retrieve_organizations(&self) -> Result<Vec<StoredOrganization>, SyncError> {
        self.inner.retrieve_organizations().await
    }

    async fn retrieve_updated_organizations(
        &self,
        since_ms: u64,
    ) -> Result<Vec<StoredOrganization>, SyncError> {
        self.inner.retrieve_updated_organizations(since_ms).await
    }

    async fn delete_organization_info(&self, org_id: &str) -> Result<(), SyncError> {
        self.inner.delete_organization_info(org_id).await?;
        self.persist().await
    }

    async fn delete_organization(&self, org_id: &str) -> Result<(), SyncError> {
        self.inner.delete_organization(org_id).await?;
        self.persist().await
    }

    async fn store_org_to_messaging_group(
        &self,
        org_id: &str,
        messaging_group: &str,
    ) -> Result<(), SyncError> {
        self.inner
            .store_org_to_messaging_group(org_id, messaging_group)
            .await?;
        self.persist().await
    }

    async fn delete_org_to_messaging_group(&self, org_id: &str) -> Result<(), SyncError> {
        self.inner.delete_org_to_messaging_group(org_id).await?;
        self.persist().await
    }

    async fn retrieve_messaging_group(&self, org_id: &str) -> Result<String, SyncError> {
        self.inner.retrieve_messaging_group(org_id).await
    }

    async fn retrieve_updated_messaging_groups(
        &self,
        since_ms: u64,
    ) -> Result<Vec<(String, String)>, SyncError> {
        self.inner.retrieve_updated_messaging_groups(since_ms).await
    }

    async fn insert_initial_leader(
        &self,
        leader_id: &str,
        timeout_secs: u64,
    ) -> Result<bool, SyncError> {
        let inserted = self.inner.insert_initial_leader(leader_id, timeout_secs).await?;
        if inserted {
            self.persist().await?;
        }
        Ok(inserted)
    }

    async fn leader_periodic_update(&self, leader_id: &str) -> Result<bool, SyncError> {
        let updated = self.inner.leader_periodic_update(leader_id).await?;
        if updated {
            self.persist().await?;
        }
        Ok(updated)
    }

    async fn retrieve_leader(&self) -> Result<LeaderRecord, SyncError> {
        self.inner.retrieve_leader().await
    }

    async fn update_leader(&self, leader_id: &str, version: i64) -> Result<bool, SyncError> {
        let taken = self.inner.update_leader(leader_id, version).await?;
        if taken {
            self.persist().await?;
        }
        Ok(taken)
    }

    async fn resign_leadership(&self, leader_id: &str) -> Result<(), SyncError> {
        self.inner.resign_leadership(leader_id).await?;
        self.persist().await
    }
}

impl FileStore {
    async fn all_partially_received(&self) -> Result<Vec<MetaData>, SyncError> {
        let snapshot = self.inner.snapshot().await;
        Ok(snapshot
            .objects
            .values()
            .filter(|record| record.status == ObjectStatus::PartiallyReceived)
            .map(|record| record.meta.clone())
            .collect())
    }
}
