use log::{debug, info, warn};
use rand::Rng;
use syncline_api::{DeliveryStatus, MetaData, Notification, NotificationStatus, ObjectStatus};

use crate::chunks::chunk_offsets;
use crate::comm::{ChunkPayload, MessageEnvelope, Party};
use crate::config::NodeType;
use crate::error::SyncError;
use crate::events::{ObjectEvent, ObjectEventKind};
use crate::time::now_secs;
use crate::SyncService;

impl SyncService {
    /// Entry point for inbound protocol messages, regardless of transport.
    pub async fn handle_message(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        self.check_running()?;
        let _guard = self.track();
        debug!(
            "handling {:?} for {}:{}:{}",
            envelope.kind, envelope.org_id, envelope.object_type, envelope.object_id
        );
        match envelope.kind {
            NotificationStatus::Update => self.handle_update(envelope).await,
            NotificationStatus::Updated => self.handle_updated(envelope).await,
            NotificationStatus::Getdata => self.handle_getdata(envelope).await,
            NotificationStatus::Data => self.handle_data(envelope).await,
            NotificationStatus::Received => self.handle_received(envelope).await,
            NotificationStatus::AckReceived => self.handle_ack_received(envelope).await,
            NotificationStatus::Consumed => self.handle_consumed(envelope).await,
            NotificationStatus::AckConsumed => self.handle_ack_consumed(envelope).await,
            NotificationStatus::Delete => self.handle_delete(envelope).await,
            NotificationStatus::Deleted => self.handle_deleted(envelope).await,
            NotificationStatus::AckDeleted => self.handle_ack_deleted(envelope).await,
            NotificationStatus::Register => self.handle_register(envelope).await,
            NotificationStatus::AckRegister => self.handle_ack_register(envelope).await,
            NotificationStatus::Resend => self.handle_resend_request(envelope).await,
            NotificationStatus::Ping => self.handle_ping(envelope).await,
            NotificationStatus::Error => self.handle_error(envelope).await,
            NotificationStatus::ReceivedByDestination => {
                Err(SyncError::invalid("receivedByDestination is not a message"))
            }
        }
    }

    pub(crate) async fn send_update_notification(
        &self,
        meta: &MetaData,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<(), SyncError> {
        let notification = self.build_notification(meta, dest_type, dest_id, NotificationStatus::Update);
        self.store().update_notification_record(notification.clone()).await?;
        let envelope = MessageEnvelope::control(
            NotificationStatus::Update,
            self.peer_party(&notification),
            self.party(),
            meta,
        )
        .carrying_meta(meta.clone());
        self.dispatch(&notification, envelope).await;
        Ok(())
    }

    pub(crate) async fn send_delete_notification(
        &self,
        meta: &MetaData,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<(), SyncError> {
        let notification = self.build_notification(meta, dest_type, dest_id, NotificationStatus::Delete);
        self.store().update_notification_record(notification.clone()).await?;
        let envelope = MessageEnvelope::control(
            NotificationStatus::Delete,
            self.peer_party(&notification),
            self.party(),
            meta,
        )
        .carrying_meta(meta.clone());
        self.dispatch(&notification, envelope).await;
        Ok(())
    }

    /// ESS: announce this node to the CSS. Retried at the base resend
    /// interval until acknowledged.
    pub(crate) async fn send_registration(&self) -> Result<(), SyncError> {
        let destination = self.config().node_destination();
        info!(
            "registering {}:{} with the CSS",
            destination.dest_type, destination.dest_id
        );
        let envelope = MessageEnvelope {
            kind: NotificationStatus::Register,
            to: Party::Css,
            from: self.party(),
            org_id: destination.org_id.clone(),
            object_type: String::new(),
            object_id: String::new(),
            instance_id: 0,
            meta: None,
            chunk: None,
            destination: Some(destination),
            error_message: None,
        };
        self.comm().send(envelope).await
    }

    pub(crate) async fn send_ping(&self) -> Result<(), SyncError> {
        let destination = self.config().node_destination();
        let envelope = MessageEnvelope {
            kind: NotificationStatus::Ping,
            to: Party::Css,
            from: self.party(),
            org_id: destination.org_id.clone(),
            object_type: String::new(),
            object_id: String::new(),
            instance_id: 0,
            meta: None,
            chunk: None,
            destination: Some(destination),
            error_message: None,
        };
        self.comm().send(envelope).await
    }

    /// ESS to CSS: ask for every object addressed to this node to be resent.
    pub async fn resend_objects(&self) -> Result<(), SyncError> {
        self.check_running()?;
        if self.config().node_type != NodeType::Ess {
            return Err(SyncError::invalid(
                "resend is only supported from an ESS".to_string(),
            ));
        }
        let destination = self.config().node_destination();
        let envelope = MessageEnvelope {
            kind: NotificationStatus::Resend,
            to: Party::Css,
            from: self.party(),
            org_id: destination.org_id.clone(),
            object_type: String::new(),
            object_id: String::new(),
            instance_id: 0,
            meta: None,
            chunk: None,
            destination: Some(destination),
            error_message: None,
        };
        self.comm().send(envelope).await
    }

    /// One pass of the resend loop: every due notification is re-dispatched
    /// according to its status and pushed out by six resend intervals. With
    /// `retrieve_received` the pass also covers notifications stuck in Data
    /// or ReceivedByDestination.
    pub(crate) async fn resend_notifications(
        &self,
        retrieve_received: bool,
    ) -> Result<(), SyncError> {
        let due = self
            .store()
            .retrieve_notifications("", "", "", retrieve_received)
            .await?;
        for notification in due {
            let _guard = self.track();
            if let Err(err) = self.resend_one(&notification).await {
                warn!(
                    "resend of {:?} for {} failed: {}",
                    notification.status,
                    notification.key(),
                    err
                );
            }
            // The exchange above may have finalized the record; a missing one
            // needs no new due time.
            match self
                .store()
                .update_notification_resend_time(&notification, self.config().resend_interval_secs)
                .await
            {
                Ok(()) | Err(SyncError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn resend_one(&self, notification: &Notification) -> Result<(), SyncError> {
        let peer = self.peer_party(notification);
        match notification.status {
            NotificationStatus::Update | NotificationStatus::Delete => {
                let Some(meta) = self.object_for_resend(notification).await? else {
                    return Ok(());
                };
                let envelope =
                    MessageEnvelope::control(notification.status, peer, self.party(), &meta)
                        .carrying_meta(meta.clone());
                self.dispatch(notification, envelope).await;
            }
            NotificationStatus::Getdata
            | NotificationStatus::Received
            | NotificationStatus::Consumed
            | NotificationStatus::Deleted => {
                let envelope = MessageEnvelope {
                    kind: notification.status,
                    to: peer,
                    from: self.party(),
                    org_id: notification.org_id.clone(),
                    object_type: notification.object_type.clone(),
                    object_id: notification.object_id.clone(),
                    instance_id: notification.instance_id,
                    meta: None,
                    chunk: None,
                    destination: None,
                    error_message: None,
                };
                self.dispatch(notification, envelope).await;
            }
            // A send that died mid-stream: start the window over. Replayed
            // chunks are no-ops on the receiver.
            NotificationStatus::Data => {
                let Some(meta) = self.object_for_resend(notification).await? else {
                    return Ok(());
                };
                let mut record = notification.clone();
                record.data_offset = 0;
                self.store().update_notification_record(record.clone()).await?;
                self.send_data_chunks(&meta, &mut record).await?;
            }
            // A lost ack exchange: the receiver repeats Received, the origin
            // repeats AckReceived.
            NotificationStatus::ReceivedByDestination => {
                let Some(meta) = self.object_for_resend(notification).await? else {
                    return Ok(());
                };
                let status = self
                    .store()
                    .retrieve_object_status(
                        &notification.org_id,
                        &notification.object_type,
                        &notification.object_id,
                    )
                    .await?;
                let kind = if status.is_received_side() {
                    NotificationStatus::Received
                } else {
                    NotificationStatus::AckReceived
                };
                let envelope = MessageEnvelope {
                    kind,
                    to: peer,
                    from: self.party(),
                    org_id: notification.org_id.clone(),
                    object_type: notification.object_type.clone(),
                    object_id: notification.object_id.clone(),
                    instance_id: meta.instance_id,
                    meta: None,
                    chunk: None,
                    destination: None,
                    error_message: None,
                };
                self.dispatch(notification, envelope).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// The object behind a due notification; a missing object drops the
    /// orphaned record.
    async fn object_for_resend(
        &self,
        notification: &Notification,
    ) -> Result<Option<MetaData>, SyncError> {
        match self
            .store()
            .retrieve_object(
                &notification.org_id,
                &notification.object_type,
                &notification.object_id,
            )
            .await
        {
            Ok(meta) => Ok(Some(meta)),
            Err(SyncError::NotFound) => {
                self.store()
                    .delete_notification_records(
                        &notification.org_id,
                        &notification.object_type,
                        &notification.object_id,
                        &notification.dest_type,
                        &notification.dest_id,
                    )
                    .await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    // Receiver side: new or updated object metadata arrived.
    async fn handle_update(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let meta = envelope
            .meta
            .clone()
            .ok_or_else(|| SyncError::invalid("update without metadata"))?;
        let (dest_type, dest_id) = self.notification_dest_fields(&envelope.from);

        match self
            .store()
            .retrieve_object_and_status(&meta.org_id, &meta.object_type, &meta.object_id)
            .await
        {
            Ok((existing, status)) => {
                if existing.instance_id > meta.instance_id {
                    // Stale resend of an older instance.
                    return Ok(());
                }
                if existing.instance_id == meta.instance_id {
                    // Duplicate of the current instance; re-ack so the sender
                    // stops resending.
                    return self.ack_current_state(&meta, status, envelope.from).await;
                }
            }
            Err(SyncError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let complete = meta.no_data || meta.meta_only;
        let status = if complete {
            ObjectStatus::CompletelyReceived
        } else {
            ObjectStatus::PartiallyReceived
        };
        self.store().store_object(meta.clone(), None, status).await?;

        let mut notification =
            self.build_notification(&meta, &dest_type, &dest_id, NotificationStatus::Updated);
        self.store().update_notification_record(notification.clone()).await?;
        let ack = MessageEnvelope::control(
            NotificationStatus::Updated,
            envelope.from.clone(),
            self.party(),
            &meta,
        );
        self.dispatch(&notification, ack).await;

        if complete {
            notification.status = NotificationStatus::Received;
            self.store().update_notification_record(notification.clone()).await?;
            let received = MessageEnvelope::control(
                NotificationStatus::Received,
                envelope.from,
                self.party(),
                &meta,
            );
            self.dispatch(&notification, received).await;
            self.events().publish(ObjectEvent {
                kind: ObjectEventKind::Updated,
                meta,
            });
        } else {
            notification.status = NotificationStatus::Getdata;
            self.store().update_notification_record(notification.clone()).await?;
            let getdata = MessageEnvelope::control(
                NotificationStatus::Getdata,
                envelope.from,
                self.party(),
                &meta,
            );
            self.dispatch(&notification, getdata).await;
        }
        Ok(())
    }

    /// Re-acknowledge a duplicate Update according to how far this side got.
    async fn ack_current_state(
        &self,
        meta: &MetaData,
        status: ObjectStatus,
        to: Party,
    ) -> Result<(), SyncError> {
        let kind = match status {
            ObjectStatus::PartiallyReceived => NotificationStatus::Getdata,
            ObjectStatus::CompletelyReceived => NotificationStatus::Received,
            ObjectStatus::Consumed => NotificationStatus::Consumed,
            _ => return Ok(()),
        };
        let envelope = MessageEnvelope::control(kind, to, self.party(), meta);
        self.comm().send(envelope).await
    }

    // Origin side: the destination received the metadata.
    async fn handle_updated(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let Some(mut notification) = self.lookup_notification(&envelope).await? else {
            return Ok(());
        };
        if notification.status != NotificationStatus::Update {
            return Ok(());
        }
        notification.status = NotificationStatus::Updated;
        self.store().update_notification_record(notification).await?;
        let (dest_type, dest_id) = self.notification_dest_fields(&envelope.from);
        self.set_delivery_status(
            DeliveryStatus::Delivering,
            &envelope.org_id,
            &envelope.object_type,
            &envelope.object_id,
            &dest_type,
            &dest_id,
        )
        .await?;
        Ok(())
    }

    /// Updates one destination's delivery entry; an object without tracked
    /// destinations (the ESS-origin direction) has none, which is fine.
    async fn set_delivery_status(
        &self,
        status: DeliveryStatus,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<bool, SyncError> {
        match self
            .store()
            .update_object_delivery_status(
                status, "", org_id, object_type, object_id, dest_type, dest_id,
            )
            .await
        {
            Ok(all_deleted) => Ok(all_deleted),
            Err(SyncError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    // Origin side: the destination asks for the payload.
    async fn handle_getdata(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let Some(mut notification) = self.lookup_notification(&envelope).await? else {
            return Ok(());
        };
        let meta = self
            .store()
            .retrieve_object(&envelope.org_id, &envelope.object_type, &envelope.object_id)
            .await?;
        notification.status = NotificationStatus::Data;
        notification.data_offset = 0;
        self.store().update_notification_record(notification.clone()).await?;
        self.send_data_chunks(&meta, &mut notification).await
    }

    /// Streams the payload in ascending chunks, at most max_inflight_chunks
    /// outstanding at a time, advancing the notification's cursor batch by
    /// batch.
    async fn send_data_chunks(
        &self,
        meta: &MetaData,
        notification: &mut Notification,
    ) -> Result<(), SyncError> {
        let chunk_size = if meta.chunk_size > 0 {
            (meta.chunk_size as usize).min(self.config().max_data_chunk_size)
        } else {
            self.config().max_data_chunk_size
        };
        let total = meta.object_size.max(0) as u64;
        let offsets = chunk_offsets(total, chunk_size);
        let window = self.config().max_inflight_chunks.max(1);
        let peer = self.peer_party(notification);

        for batch in offsets.chunks(window) {
            for (offset, len) in batch.iter() {
                if *offset < notification.data_offset.max(0) as u64 {
                    continue;
                }
                let (data, _eof) = self
                    .store()
                    .read_object_data(
                        &meta.org_id,
                        &meta.object_type,
                        &meta.object_id,
                        *len,
                        *offset,
                    )
                    .await?;
                let is_last = offset + data.len() as u64 >= total;
                let chunk = ChunkPayload {
                    offset: *offset,
                    total,
                    is_first: *offset == 0,
                    is_last,
                    data,
                };
                let envelope = MessageEnvelope {
                    kind: NotificationStatus::Data,
                    to: peer.clone(),
                    from: self.party(),
                    org_id: meta.org_id.clone(),
                    object_type: meta.object_type.clone(),
                    object_id: meta.object_id.clone(),
                    instance_id: meta.instance_id,
                    meta: None,
                    chunk: Some(chunk),
                    destination: None,
                    error_message: None,
                };
                self.comm().send(envelope).await?;
            }
            let sent_through = batch
                .last()
                .map(|(offset, len)| offset + *len as u64)
                .unwrap_or(0);
            notification.data_offset = sent_through as i64;
            self.store()
                .update_notification_record(notification.clone())
                .await?;
        }
        Ok(())
    }

    // Receiver side: one payload chunk arrived.
    async fn handle_data(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let chunk = envelope
            .chunk
            .clone()
            .ok_or_else(|| SyncError::invalid("data without chunk"))?;
        let (dest_type, dest_id) = self.notification_dest_fields(&envelope.from);
        let appended = self
            .store()
            .append_object_data(
                &envelope.org_id,
                &envelope.object_type,
                &envelope.object_id,
                chunk.data,
                chunk.offset,
                chunk.total,
                chunk.is_first,
                chunk.is_last,
            )
            .await;

        let mut notification = match self
            .store()
            .retrieve_notification_record(
                &envelope.org_id,
                &envelope.object_type,
                &envelope.object_id,
                &dest_type,
                &dest_id,
            )
            .await
        {
            Ok(record) => record,
            Err(SyncError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };

        match appended {
            Ok(true) => {
                let meta = self
                    .store()
                    .retrieve_object(&envelope.org_id, &envelope.object_type, &envelope.object_id)
                    .await?;
                notification.status = NotificationStatus::Received;
                notification.resend_time =
                    now_secs() + 6 * self.config().resend_interval_secs;
                self.store().update_notification_record(notification.clone()).await?;
                let received = MessageEnvelope::control(
                    NotificationStatus::Received,
                    envelope.from,
                    self.party(),
                    &meta,
                );
                self.dispatch(&notification, received).await;
                self.events().publish(ObjectEvent {
                    kind: ObjectEventKind::Updated,
                    meta,
                });
            }
            Ok(false) => {
                // Data is flowing; push the re-request out.
                notification.resend_time =
                    now_secs() + 6 * self.config().resend_interval_secs;
                self.store().update_notification_record(notification).await?;
            }
            Err(SyncError::Discarded) => {
                // Out-of-order chunk refused; ask again soon without touching
                // the bitmap.
                notification.last_error = "chunk discarded".to_string();
                notification.resend_time = now_secs() + self.config().resend_interval_secs;
                self.store().update_notification_record(notification).await?;
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    // Origin side: the destination holds the complete object.
    async fn handle_received(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let Some(mut notification) = self.lookup_notification(&envelope).await? else {
            return Ok(());
        };
        if notification.status == NotificationStatus::ReceivedByDestination {
            // Repeated Received; re-ack without decrementing again.
            let ack = MessageEnvelope {
                kind: NotificationStatus::AckReceived,
                to: envelope.from,
                from: self.party(),
                org_id: envelope.org_id,
                object_type: envelope.object_type,
                object_id: envelope.object_id,
                instance_id: envelope.instance_id,
                meta: None,
                chunk: None,
                destination: None,
                error_message: None,
            };
            return self.comm().send(ack).await;
        }
        notification.status = NotificationStatus::ReceivedByDestination;
        self.store().update_notification_record(notification.clone()).await?;
        let (dest_type, dest_id) = self.notification_dest_fields(&envelope.from);
        self.set_delivery_status(
            DeliveryStatus::Delivered,
            &envelope.org_id,
            &envelope.object_type,
            &envelope.object_id,
            &dest_type,
            &dest_id,
        )
        .await?;
        let remaining = self
            .store()
            .decrement_and_return_remaining_receivers(
                &envelope.org_id,
                &envelope.object_type,
                &envelope.object_id,
            )
            .await?;
        debug!(
            "{}:{}:{} received by {}:{}, {} receivers remaining",
            envelope.org_id, envelope.object_type, envelope.object_id, dest_type, dest_id, remaining
        );
        let ack = MessageEnvelope {
            kind: NotificationStatus::AckReceived,
            to: envelope.from.clone(),
            from: self.party(),
            org_id: envelope.org_id,
            object_type: envelope.object_type,
            object_id: envelope.object_id,
            instance_id: envelope.instance_id,
            meta: None,
            chunk: None,
            destination: None,
            error_message: None,
        };
        self.comm().send(ack).await
    }

    // Receiver side: stop resending Received.
    async fn handle_ack_received(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let Some(mut notification) = self.lookup_notification(&envelope).await? else {
            return Ok(());
        };
        if notification.status == NotificationStatus::Received {
            notification.status = NotificationStatus::ReceivedByDestination;
            self.store().update_notification_record(notification).await?;
        }
        Ok(())
    }

    // Origin side: the application at the destination consumed the object.
    async fn handle_consumed(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let (dest_type, dest_id) = self.notification_dest_fields(&envelope.from);
        self.set_delivery_status(
            DeliveryStatus::Consumed,
            &envelope.org_id,
            &envelope.object_type,
            &envelope.object_id,
            &dest_type,
            &dest_id,
        )
        .await?;
        let remaining = self
            .store()
            .decrement_and_return_remaining_consumers(
                &envelope.org_id,
                &envelope.object_type,
                &envelope.object_id,
            )
            .await?;
        let ack = MessageEnvelope {
            kind: NotificationStatus::AckConsumed,
            to: envelope.from.clone(),
            from: self.party(),
            org_id: envelope.org_id.clone(),
            object_type: envelope.object_type.clone(),
            object_id: envelope.object_id.clone(),
            instance_id: envelope.instance_id,
            meta: None,
            chunk: None,
            destination: None,
            error_message: None,
        };
        self.comm().send(ack).await?;

        if remaining <= 0 {
            let meta = self
                .store()
                .retrieve_object(&envelope.org_id, &envelope.object_type, &envelope.object_id)
                .await?;
            if meta.auto_delete {
                info!("all consumers done, deleting {}", meta.key());
                self.store()
                    .delete_notification_records(
                        &envelope.org_id,
                        &envelope.object_type,
                        &envelope.object_id,
                        "",
                        "",
                    )
                    .await?;
                self.store()
                    .delete_stored_object(
                        &envelope.org_id,
                        &envelope.object_type,
                        &envelope.object_id,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    // Receiver side: consumption acknowledged; the record is finalized.
    async fn handle_ack_consumed(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let (dest_type, dest_id) = self.notification_dest_fields(&envelope.from);
        self.store()
            .delete_notification_records(
                &envelope.org_id,
                &envelope.object_type,
                &envelope.object_id,
                &dest_type,
                &dest_id,
            )
            .await
    }

    // Receiver side: the origin deleted the object.
    async fn handle_delete(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        match self
            .store()
            .retrieve_object(&envelope.org_id, &envelope.object_type, &envelope.object_id)
            .await
        {
            Ok(meta) => {
                if envelope.instance_id != 0 && meta.instance_id > envelope.instance_id {
                    // A newer instance exists locally; the delete is stale.
                    return Ok(());
                }
                self.store()
                    .mark_object_deleted(&envelope.org_id, &envelope.object_type, &envelope.object_id)
                    .await?;
                let mut deleted_meta = meta;
                deleted_meta.deleted = true;
                self.events().publish(ObjectEvent {
                    kind: ObjectEventKind::Deleted,
                    meta: deleted_meta,
                });
                Ok(())
            }
            Err(SyncError::NotFound) => {
                // Nothing to delete locally; confirm right away.
                let confirm = MessageEnvelope {
                    kind: NotificationStatus::Deleted,
                    to: envelope.from,
                    from: self.party(),
                    org_id: envelope.org_id,
                    object_type: envelope.object_type,
                    object_id: envelope.object_id,
                    instance_id: envelope.instance_id,
                    meta: None,
                    chunk: None,
                    destination: None,
                    error_message: None,
                };
                self.comm().send(confirm).await
            }
            Err(err) => Err(err),
        }
    }

    // Origin side: one destination finished deleting.
    async fn handle_deleted(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let (dest_type, dest_id) = self.notification_dest_fields(&envelope.from);
        let mut all_deleted = self
            .set_delivery_status(
                DeliveryStatus::Deleted,
                &envelope.org_id,
                &envelope.object_type,
                &envelope.object_id,
                &dest_type,
                &dest_id,
            )
            .await?;
        if !all_deleted {
            // An object without tracked destinations converges on the single
            // confirming peer.
            all_deleted = match self
                .store()
                .get_object_destinations_list(&envelope.org_id, &envelope.object_type, &envelope.object_id)
                .await
            {
                Ok(list) => list.is_empty(),
                Err(SyncError::NotFound) => false,
                Err(err) => return Err(err),
            };
        }

        let ack = MessageEnvelope {
            kind: NotificationStatus::AckDeleted,
            to: envelope.from.clone(),
            from: self.party(),
            org_id: envelope.org_id.clone(),
            object_type: envelope.object_type.clone(),
            object_id: envelope.object_id.clone(),
            instance_id: envelope.instance_id,
            meta: None,
            chunk: None,
            destination: None,
            error_message: None,
        };
        self.comm().send(ack).await?;

        if all_deleted {
            info!(
                "every destination deleted {}:{}:{}, removing the object",
                envelope.org_id, envelope.object_type, envelope.object_id
            );
            self.store()
                .delete_notification_records(
                    &envelope.org_id,
                    &envelope.object_type,
                    &envelope.object_id,
                    "",
                    "",
                )
                .await?;
            self.store()
                .delete_stored_object(&envelope.org_id, &envelope.object_type, &envelope.object_id)
                .await?;
        } else {
            self.store()
                .delete_notification_records(
                    &envelope.org_id,
                    &envelope.object_type,
                    &envelope.object_id,
                    &dest_type,
                    &dest_id,
                )
                .await?;
        }
        Ok(())
    }

    // Receiver side: deletion acknowledged; remove every trace.
    async fn handle_ack_deleted(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let (dest_type, dest_id) = self.notification_dest_fields(&envelope.from);
        self.store()
            .delete_notification_records(
                &envelope.org_id,
                &envelope.object_type,
                &envelope.object_id,
                &dest_type,
                &dest_id,
            )
            .await?;
        match self
            .store()
            .delete_stored_object(&envelope.org_id, &envelope.object_type, &envelope.object_id)
            .await
        {
            Ok(()) | Err(SyncError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    // CSS: an ESS announces itself.
    async fn handle_register(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        if self.config().node_type != NodeType::Css {
            return Err(SyncError::invalid("register sent to a non-CSS node"));
        }
        let destination = envelope
            .destination
            .clone()
            .ok_or_else(|| SyncError::invalid("register without destination"))?;
        info!(
            "destination {}:{} registered in {}",
            destination.dest_type, destination.dest_id, destination.org_id
        );
        self.store().store_destination(destination.clone()).await?;

        let ack = MessageEnvelope {
            kind: NotificationStatus::AckRegister,
            to: envelope.from,
            from: self.party(),
            org_id: destination.org_id.clone(),
            object_type: String::new(),
            object_id: String::new(),
            instance_id: 0,
            meta: None,
            chunk: None,
            destination: None,
            error_message: None,
        };
        self.comm().send(ack).await?;
        self.resend_objects_for(&destination.org_id, &destination.dest_type, &destination.dest_id)
            .await
    }

    // ESS: the CSS confirmed registration.
    async fn handle_ack_register(&self, _envelope: MessageEnvelope) -> Result<(), SyncError> {
        self.mark_registered(true);
        Ok(())
    }

    // CSS: an ESS asks for everything addressed to it.
    async fn handle_resend_request(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let destination = envelope
            .destination
            .ok_or_else(|| SyncError::invalid("resend without destination"))?;
        self.resend_objects_for(&destination.org_id, &destination.dest_type, &destination.dest_id)
            .await
    }

    async fn resend_objects_for(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<(), SyncError> {
        // Re-resolve objects whose routing now matches the destination; a
        // broadcast object stored before this node registered picks it up
        // here.
        let objects = self
            .store()
            .retrieve_objects_for_destination(org_id, dest_type, dest_id)
            .await?;
        for meta in objects {
            self.send_update_notification(&meta, dest_type, dest_id).await?;
        }
        Ok(())
    }

    // CSS: liveness ping from an ESS.
    async fn handle_ping(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let destination = envelope
            .destination
            .ok_or_else(|| SyncError::invalid("ping without destination"))?;
        match self.store().update_destination_last_ping_time(&destination).await {
            Ok(()) => Ok(()),
            // An unknown pinger re-registers implicitly.
            Err(SyncError::NotFound) => self.store().store_destination(destination).await,
            Err(err) => Err(err),
        }
    }

    // Either side: the peer reports a protocol failure for the object.
    async fn handle_error(&self, envelope: MessageEnvelope) -> Result<(), SyncError> {
        let Some(mut notification) = self.lookup_notification(&envelope).await? else {
            return Ok(());
        };
        notification.status = NotificationStatus::Error;
        notification.last_error = envelope
            .error_message
            .unwrap_or_else(|| "unknown error".to_string());
        self.store().update_notification_record(notification).await?;
        Ok(())
    }

    /// Sends the envelope; a transport failure never drops the notification,
    /// it records the error and makes the record due again soon.
    async fn dispatch(&self, notification: &Notification, envelope: MessageEnvelope) {
        if let Err(err) = self.comm().send(envelope).await {
            warn!(
                "delivery of {:?} for {} failed: {}",
                notification.status,
                notification.key(),
                err
            );
            let mut record = notification.clone();
            record.last_error = err.to_string();
            record.resend_time = now_secs() + self.config().resend_interval_secs;
            if let Err(store_err) = self.store().update_notification_record(record).await {
                warn!("failed to record delivery error: {}", store_err);
            }
        }
    }

    fn build_notification(
        &self,
        meta: &MetaData,
        dest_type: &str,
        dest_id: &str,
        status: NotificationStatus,
    ) -> Notification {
        let interval = self.config().resend_interval_secs;
        let jitter = rand::thread_rng().gen_range(0..=interval);
        Notification {
            org_id: meta.org_id.clone(),
            object_type: meta.object_type.clone(),
            object_id: meta.object_id.clone(),
            dest_type: dest_type.to_string(),
            dest_id: dest_id.to_string(),
            status,
            instance_id: meta.instance_id,
            resend_time: now_secs() + 6 * interval + jitter,
            last_error: String::new(),
            data_offset: 0,
        }
    }

    async fn lookup_notification(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<Option<Notification>, SyncError> {
        let (dest_type, dest_id) = self.notification_dest_fields(&envelope.from);
        match self
            .store()
            .retrieve_notification_record(
                &envelope.org_id,
                &envelope.object_type,
                &envelope.object_id,
                &dest_type,
                &dest_id,
            )
            .await
        {
            Ok(record) => {
                if envelope.instance_id != 0 && record.instance_id > envelope.instance_id {
                    // Message about an older instance.
                    return Ok(None);
                }
                Ok(Some(record))
            }
            Err(SyncError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The edge party of a (object, destination) conversation: the ESS's own
    /// identity on an ESS, the remote node's identity on the CSS.
    fn notification_dest_fields(&self, from: &Party) -> (String, String) {
        match from {
            Party::Node {
                dest_type, dest_id, ..
            } => (dest_type.clone(), dest_id.clone()),
            Party::Css => (
                self.config().destination_type.clone(),
                self.config().destination_id.clone(),
            ),
        }
    }

    fn peer_party(&self, notification: &Notification) -> Party {
        match self.config().node_type {
            NodeType::Ess => Party::Css,
            NodeType::Css => Party::node(
                &notification.org_id,
                &notification.dest_type,
                &notification.dest_id,
            ),
        }
    }
}
