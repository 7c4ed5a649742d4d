use log::{debug, info};
use syncline_api::validation::validate_meta;
use syncline_api::{
    DeliveryStatus, DestinationsStatus, Destination, MetaData, NotificationStatus, ObjectStatus,
    Organization, StoredOrganization,
};

use crate::comm::{MessageEnvelope, Party};
use crate::config::NodeType;
use crate::error::SyncError;
use crate::security::{DESTINATIONS_ACL_TYPE, OBJECTS_ACL_TYPE};
use crate::store::DataReader;
use crate::time::{now_ms, now_secs};
use crate::SyncService;

impl SyncService {
    /// Create or update an object. Path components override the body's key
    /// fields; a fresh instance timestamp is assigned unless the caller set a
    /// newer one explicitly.
    pub async fn update_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        mut meta: MetaData,
        data: Option<Vec<u8>>,
    ) -> Result<(), SyncError> {
        self.check_running()?;
        let _guard = self.track();

        meta.org_id = org_id.to_string();
        meta.object_type = object_type.to_string();
        meta.object_id = object_id.to_string();
        meta.origin_type = self.config().destination_type.clone();
        meta.origin_id = self.config().destination_id.clone();
        if meta.no_data && data.is_some() {
            return Err(SyncError::invalid("data sent with no_data set"));
        }
        if let Some(bytes) = data.as_ref() {
            meta.object_size = bytes.len() as i64;
        }
        validate_meta(&meta)?;

        let provided_instance = meta.instance_id != 0;
        if !provided_instance {
            meta.instance_id = now_ms() as i64;
        }
        match self.store().retrieve_object(org_id, object_type, object_id).await {
            Ok(existing) => {
                if meta.instance_id <= existing.instance_id {
                    if provided_instance {
                        return Err(SyncError::invalid(format!(
                            "instance {} is not newer than the stored {}",
                            meta.instance_id, existing.instance_id
                        )));
                    }
                    meta.instance_id = existing.instance_id + 1;
                }
            }
            Err(SyncError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let status = if meta.inactive && meta.activation_time > now_secs() {
            ObjectStatus::NotReady
        } else {
            meta.inactive = false;
            ObjectStatus::Ready
        };
        let data_present = data.is_some();
        let deleted = self.store().store_object(meta.clone(), data, status).await?;
        debug!("stored {} as {:?}", meta.key(), status);

        if status != ObjectStatus::Ready {
            // Still inactive; the activation loop picks it up later, but
            // removed destinations learn about the rerouting right away.
            for dest in deleted.iter() {
                self.send_delete_notification(
                    &meta,
                    &dest.destination.dest_type,
                    &dest.destination.dest_id,
                )
                .await?;
            }
            return Ok(());
        }

        if self.config().node_type == NodeType::Ess {
            return self
                .send_update_notification(
                    &meta,
                    &self.config().destination_type.clone(),
                    &self.config().destination_id.clone(),
                )
                .await;
        }

        for dest in deleted.iter() {
            self.send_delete_notification(
                &meta,
                &dest.destination.dest_type,
                &dest.destination.dest_id,
            )
            .await?;
        }
        let destinations = self
            .store()
            .get_object_destinations_list(org_id, object_type, object_id)
            .await?;
        for dest in destinations.iter() {
            // A metadata-only update reaches only destinations that have not
            // been notified yet; inline data makes this a fresh delivery for
            // everyone.
            if data_present || dest.status == DeliveryStatus::Pending {
                self.send_update_notification(
                    &meta,
                    &dest.destination.dest_type,
                    &dest.destination.dest_id,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Delete an object and propagate the deletion to its destinations.
    pub async fn delete_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.check_running()?;
        let _guard = self.track();

        let meta = self.store().retrieve_object(org_id, object_type, object_id).await?;
        self.store()
            .mark_object_deleted(org_id, object_type, object_id)
            .await?;
        let mut meta = meta;
        meta.deleted = true;

        if self.config().node_type == NodeType::Ess {
            return self
                .send_delete_notification(
                    &meta,
                    &self.config().destination_type.clone(),
                    &self.config().destination_id.clone(),
                )
                .await;
        }

        let destinations = self
            .store()
            .get_object_destinations_list(org_id, object_type, object_id)
            .await?;
        if destinations.is_empty() {
            info!("deleting {} with no destinations", meta.key());
            self.store()
                .delete_notification_records(org_id, object_type, object_id, "", "")
                .await?;
            return self
                .store()
                .delete_stored_object(org_id, object_type, object_id)
                .await;
        }
        for dest in destinations.iter() {
            self.send_delete_notification(
                &meta,
                &dest.destination.dest_type,
                &dest.destination.dest_id,
            )
            .await?;
        }
        Ok(())
    }

    /// Application acknowledgement: the object has been consumed.
    pub async fn object_consumed(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.check_running()?;
        let _guard = self.track();

        let (meta, status) = self
            .store()
            .retrieve_object_and_status(org_id, object_type, object_id)
            .await?;
        if status != ObjectStatus::CompletelyReceived {
            return Err(SyncError::invalid(format!(
                "object is {} rather than completelyReceived",
                status.as_str()
            )));
        }
        self.store()
            .update_object_status(org_id, object_type, object_id, ObjectStatus::Consumed)
            .await?;

        let (dest_type, dest_id) = self.receiver_identity(&meta);
        let mut notification = match self
            .store()
            .retrieve_notification_record(org_id, object_type, object_id, &dest_type, &dest_id)
            .await
        {
            Ok(record) => record,
            Err(SyncError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        notification.status = NotificationStatus::Consumed;
        notification.resend_time = now_secs() + 6 * self.config().resend_interval_secs;
        self.store().update_notification_record(notification).await?;

        let envelope = MessageEnvelope::control(
            NotificationStatus::Consumed,
            self.receiver_peer(&meta),
            self.party(),
            &meta,
        );
        self.comm().send(envelope).await
    }

    /// Application acknowledgement: the object's deletion has been processed.
    pub async fn object_deleted(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.check_running()?;
        let _guard = self.track();

        let (meta, status) = self
            .store()
            .retrieve_object_and_status(org_id, object_type, object_id)
            .await?;
        if status != ObjectStatus::Deleted {
            return Err(SyncError::invalid("object is not marked deleted"));
        }
        let (dest_type, dest_id) = self.receiver_identity(&meta);
        let mut notification = self.make_receiver_notification(&meta, NotificationStatus::Deleted);
        notification.dest_type = dest_type;
        notification.dest_id = dest_id;
        self.store().update_notification_record(notification).await?;

        let envelope = MessageEnvelope::control(
            NotificationStatus::Deleted,
            self.receiver_peer(&meta),
            self.party(),
            &meta,
        );
        self.comm().send(envelope).await
    }

    /// Application acknowledgement: the object has been received; it drops
    /// out of the default updated-objects listing.
    pub async fn object_received(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.check_running()?;
        let _guard = self.track();
        let status = self
            .store()
            .retrieve_object_status(org_id, object_type, object_id)
            .await?;
        if status != ObjectStatus::CompletelyReceived {
            return Err(SyncError::invalid(format!(
                "object is {} rather than completelyReceived",
                status.as_str()
            )));
        }
        self.store()
            .mark_object_app_received(org_id, object_type, object_id)
            .await
    }

    /// Promote an inactive object and notify its destinations.
    pub async fn activate_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError> {
        self.check_running()?;
        let _guard = self.track();

        let (_, status) = self
            .store()
            .retrieve_object_and_status(org_id, object_type, object_id)
            .await?;
        if status != ObjectStatus::NotReady {
            // Already active; nothing to drive.
            return Ok(());
        }
        self.store()
            .activate_object(org_id, object_type, object_id)
            .await?;
        let meta = self.store().retrieve_object(org_id, object_type, object_id).await?;
        info!("activated {}", meta.key());

        if self.config().node_type == NodeType::Ess {
            return self
                .send_update_notification(
                    &meta,
                    &self.config().destination_type.clone(),
                    &self.config().destination_id.clone(),
                )
                .await;
        }
        let destinations = self
            .store()
            .get_object_destinations_list(org_id, object_type, object_id)
            .await?;
        for dest in destinations.iter() {
            if dest.status == DeliveryStatus::Pending {
                self.send_update_notification(
                    &meta,
                    &dest.destination.dest_type,
                    &dest.destination.dest_id,
                )
                .await?;
            }
        }
        Ok(())
    }

    pub async fn get_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<MetaData, SyncError> {
        self.check_running()?;
        self.store().retrieve_object(org_id, object_type, object_id).await
    }

    pub async fn get_object_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<ObjectStatus, SyncError> {
        self.check_running()?;
        self.store()
            .retrieve_object_status(org_id, object_type, object_id)
            .await
    }

    /// The payload as a stream. Callers must return the reader through
    /// `close_object_data` on every path.
    pub async fn get_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Option<DataReader>, SyncError> {
        self.check_running()?;
        self.store()
            .retrieve_object_data(org_id, object_type, object_id)
            .await
    }

    pub async fn close_object_data(&self, reader: DataReader) -> Result<(), SyncError> {
        self.store().close_data_reader(reader).await
    }

    /// Replace the object's payload without touching the rest of the
    /// metadata. Returns false when the object does not exist. The new data
    /// is a fresh instance and is pushed to every destination.
    pub async fn put_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        data: Vec<u8>,
    ) -> Result<bool, SyncError> {
        self.check_running()?;
        let _guard = self.track();

        let mut meta = match self.store().retrieve_object(org_id, object_type, object_id).await {
            Ok(meta) => meta,
            Err(SyncError::NotFound) => return Ok(false),
            Err(err) => return Err(err),
        };
        if meta.no_data {
            return Err(SyncError::invalid("object was stored with no_data"));
        }
        meta.instance_id = now_ms() as i64;
        self.update_object(org_id, object_type, object_id, meta, Some(data))
            .await?;
        Ok(true)
    }

    pub async fn list_updated_objects(
        &self,
        org_id: &str,
        object_type: &str,
        received: bool,
    ) -> Result<Vec<MetaData>, SyncError> {
        self.check_running()?;
        self.store()
            .retrieve_updated_objects(org_id, object_type, received)
            .await
    }

    /// Per-destination delivery report (CSS).
    pub async fn get_object_destinations_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Vec<DestinationsStatus>, SyncError> {
        self.check_running()?;
        let destinations = self
            .store()
            .get_object_destinations_list(org_id, object_type, object_id)
            .await?;
        Ok(destinations
            .into_iter()
            .map(|dest| DestinationsStatus {
                dest_type: dest.destination.dest_type,
                dest_id: dest.destination.dest_id,
                status: dest.status,
                message: dest.message,
            })
            .collect())
    }

    pub async fn list_destinations(&self, org_id: &str) -> Result<Vec<Destination>, SyncError> {
        self.check_running()?;
        self.store().retrieve_destinations(org_id, "").await
    }

    pub async fn register_webhook(
        &self,
        org_id: &str,
        object_type: &str,
        url: &str,
    ) -> Result<(), SyncError> {
        self.check_running()?;
        if url.trim().is_empty() {
            return Err(SyncError::invalid("empty webhook url"));
        }
        self.store().add_webhook(org_id, object_type, url).await
    }

    pub async fn delete_webhook(
        &self,
        org_id: &str,
        object_type: &str,
        url: &str,
    ) -> Result<(), SyncError> {
        self.check_running()?;
        self.store().delete_webhook(org_id, object_type, url).await
    }

    pub async fn get_webhooks(
        &self,
        org_id: &str,
        object_type: &str,
    ) -> Result<Vec<String>, SyncError> {
        self.check_running()?;
        self.store().retrieve_webhooks(org_id, object_type).await
    }

    // ACLs.

    pub async fn add_users_to_acl(
        &self,
        acl_type: &str,
        org_id: &str,
        key: &str,
        usernames: &[String],
    ) -> Result<(), SyncError> {
        self.check_running()?;
        check_acl_type(acl_type)?;
        self.store()
            .add_users_to_acl(acl_type, org_id, key, usernames)
            .await
    }

    pub async fn remove_users_from_acl(
        &self,
        acl_type: &str,
        org_id: &str,
        key: &str,
        usernames: &[String],
    ) -> Result<(), SyncError> {
        self.check_running()?;
        check_acl_type(acl_type)?;
        self.store()
            .remove_users_from_acl(acl_type, org_id, key, usernames)
            .await
    }

    pub async fn get_acl(
        &self,
        acl_type: &str,
        org_id: &str,
        key: &str,
    ) -> Result<Vec<String>, SyncError> {
        self.check_running()?;
        check_acl_type(acl_type)?;
        self.store().retrieve_acl(acl_type, org_id, key).await
    }

    pub async fn get_acls_in_org(
        &self,
        acl_type: &str,
        org_id: &str,
    ) -> Result<Vec<String>, SyncError> {
        self.check_running()?;
        check_acl_type(acl_type)?;
        self.store().retrieve_acls_in_org(acl_type, org_id).await
    }

    // Organizations (CSS).

    pub async fn update_organization(
        &self,
        org_id: &str,
        org: Organization,
    ) -> Result<(), SyncError> {
        self.check_running()?;
        self.css_only()?;
        let mut org = org;
        org.org_id = org_id.to_string();
        self.store().store_organization(org).await?;
        Ok(())
    }

    pub async fn delete_organization(&self, org_id: &str) -> Result<(), SyncError> {
        self.check_running()?;
        self.css_only()?;
        self.store().delete_organization(org_id).await
    }

    pub async fn list_organizations(&self) -> Result<Vec<StoredOrganization>, SyncError> {
        self.check_running()?;
        self.css_only()?;
        self.store().retrieve_organizations().await
    }

    fn css_only(&self) -> Result<(), SyncError> {
        if self.config().node_type == NodeType::Css {
            Ok(())
        } else {
            Err(SyncError::invalid("operation is only supported on a CSS"))
        }
    }

    /// The edge party of a conversation this node takes part in as the
    /// receiver: the origin node on a CSS, the CSS on an ESS.
    fn receiver_peer(&self, meta: &MetaData) -> Party {
        match self.config().node_type {
            NodeType::Ess => Party::Css,
            NodeType::Css => Party::node(&meta.org_id, &meta.origin_type, &meta.origin_id),
        }
    }

    fn receiver_identity(&self, meta: &MetaData) -> (String, String) {
        match self.config().node_type {
            NodeType::Ess => (
                self.config().destination_type.clone(),
                self.config().destination_id.clone(),
            ),
            NodeType::Css => (meta.origin_type.clone(), meta.origin_id.clone()),
        }
    }

    fn make_receiver_notification(
        &self,
        meta: &MetaData,
        status: NotificationStatus,
    ) -> syncline_api::Notification {
        syncline_api::Notification {
            org_id: meta.org_id.clone(),
            object_type: meta.object_type.clone(),
            object_id: meta.object_id.clone(),
            dest_type: String::new(),
            dest_id: String::new(),
            status,
            instance_id: meta.instance_id,
            resend_time: now_secs() + 6 * self.config().resend_interval_secs,
            last_error: String::new(),
            data_offset: 0,
        }
    }
}

fn check_acl_type(acl_type: &str) -> Result<(), SyncError> {
    if acl_type == DESTINATIONS_ACL_TYPE || acl_type == OBJECTS_ACL_TYPE {
        Ok(())
    } else {
        Err(SyncError::invalid(format!("unknown ACL type {}", acl_type)))
    }
}
