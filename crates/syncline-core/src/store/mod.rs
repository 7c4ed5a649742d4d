pub mod file;
pub mod memory;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use syncline_api::{
    Destination, DestinationStatus, DeliveryStatus, MetaData, Notification, NotificationStatus,
    ObjectStatus, Organization, StoredOrganization,
};
use tokio::io::{AsyncRead, ReadBuf};

use crate::error::SyncError;

pub use file::FileStore;
pub use memory::InMemoryStore;

/// Streamable object payload. Callers must hand the reader back through
/// `Storage::close_data_reader` on every exit path.
pub struct DataReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
}

impl DataReader {
    pub fn new(inner: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self { inner }
    }
}

impl AsyncRead for DataReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Snapshot of the leader record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderRecord {
    pub leader_id: String,
    pub timeout_secs: u64,
    /// Epoch milliseconds of the last heartbeat.
    pub last_heartbeat_ms: u64,
    pub version: i64,
}

/// Persistence contract backing the whole engine. Implementations are
/// thread-safe; every operation is linearizable per primary key, and the
/// decrement/leader operations are atomic read-modify-write.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn init(&self) -> Result<(), SyncError>;
    async fn stop(&self);
    async fn perform_maintenance(&self);
    fn is_connected(&self) -> bool;
    fn is_persistent(&self) -> bool;

    // Objects.

    /// Upsert by primary key. Returns the destinations present in the old
    /// status set but absent from the new routing; callers emit Delete
    /// notifications for them.
    async fn store_object(
        &self,
        meta: MetaData,
        data: Option<Vec<u8>>,
        status: ObjectStatus,
    ) -> Result<Vec<DestinationStatus>, SyncError>;

    /// Replaces the object's data. Returns false without error when the
    /// object does not exist.
    async fn store_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        data: Vec<u8>,
    ) -> Result<bool, SyncError>;

    /// Appends one chunk. Returns true when the object is now completely
    /// received. Duplicate ranges are no-ops; out-of-order chunks beyond the
    /// buffer policy fail with `Discarded`.
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
    ) -> Result<bool, SyncError>;

    async fn update_object_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        status: ObjectStatus,
    ) -> Result<(), SyncError>;

    async fn update_object_source_data_uri(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        source_data_uri: &str,
    ) -> Result<(), SyncError>;

    async fn retrieve_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<MetaData, SyncError>;

    async fn retrieve_object_and_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(MetaData, ObjectStatus), SyncError>;

    async fn retrieve_object_status(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<ObjectStatus, SyncError>;

    async fn retrieve_object_remaining_consumers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<i32, SyncError>;

    /// Atomic decrement; the returned post-decrement value is observed by at
    /// most one caller.
    async fn decrement_and_return_remaining_consumers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<i32, SyncError>;

    async fn decrement_and_return_remaining_receivers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<i32, SyncError>;

    async fn reset_object_remaining_consumers(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError>;

    /// Objects of the type with pending updates for applications. With
    /// `received` also includes objects already marked received.
    async fn retrieve_updated_objects(
        &self,
        org_id: &str,
        object_type: &str,
        received: bool,
    ) -> Result<Vec<MetaData>, SyncError>;

    /// Objects that must be (re)sent to the given destination.
    async fn retrieve_objects_for_destination(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Vec<MetaData>, SyncError>;

    async fn retrieve_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Option<DataReader>, SyncError>;

    /// Reads up to `size` bytes at `offset`. Returns (bytes, eof).
    async fn read_object_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        size: usize,
        offset: u64,
    ) -> Result<(Vec<u8>, bool), SyncError>;

    async fn close_data_reader(&self, reader: DataReader) -> Result<(), SyncError>;

    async fn mark_object_deleted(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError>;

    /// Marks a completely received object as seen by the application, hiding
    /// it from the default updated-objects listing.
    async fn mark_object_app_received(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError>;

    async fn mark_destination_policy_received(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError>;

    async fn activate_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError>;

    /// Inactive objects whose activation time has passed.
    async fn get_objects_to_activate(&self) -> Result<Vec<MetaData>, SyncError>;

    async fn delete_stored_object(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError>;

    async fn delete_stored_data(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError>;

    /// Drops objects received from the other side; persistent backends only
    /// drop partially received ones.
    async fn clean_objects(&self) -> Result<(), SyncError>;

    async fn get_number_of_stored_objects(&self) -> Result<u32, SyncError>;

    // Object destination linkage.

    /// Current destination set of the object per its routing metadata.
    async fn get_object_destinations(
        &self,
        meta: &MetaData,
    ) -> Result<Vec<Destination>, SyncError>;

    async fn get_object_destinations_list(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<Vec<DestinationStatus>, SyncError>;

    /// Returns true iff `status` is Deleted and every destination of the
    /// object is now in status Deleted.
    async fn update_object_delivery_status(
        &self,
        status: DeliveryStatus,
        message: &str,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<bool, SyncError>;

    /// Marks every destination of the object as Delivering.
    async fn update_object_delivering(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
    ) -> Result<(), SyncError>;

    // Notifications.

    /// Upsert keyed by (org, object type, object id, dest type, dest id).
    async fn update_notification_record(
        &self,
        notification: Notification,
    ) -> Result<(), SyncError>;

    /// Pushes the resend time out to now + 6 x resend interval.
    async fn update_notification_resend_time(
        &self,
        notification: &Notification,
        resend_interval_secs: u64,
    ) -> Result<(), SyncError>;

    async fn retrieve_notification_record(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Notification, SyncError>;

    async fn delete_notification_records(
        &self,
        org_id: &str,
        object_type: &str,
        object_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<(), SyncError>;

    /// Notifications due for resend to the given destination (empty dest
    /// matches all destinations).
    async fn retrieve_notifications(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
        retrieve_received: bool,
    ) -> Result<Vec<Notification>, SyncError>;

    // Destinations.

    async fn store_destination(&self, destination: Destination) -> Result<(), SyncError>;

    async fn delete_destination(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<(), SyncError>;

    async fn retrieve_destination(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<Destination, SyncError>;

    async fn destination_exists(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<bool, SyncError>;

    /// All destinations of the org with the given type; empty type matches
    /// the whole org.
    async fn retrieve_destinations(
        &self,
        org_id: &str,
        dest_type: &str,
    ) -> Result<Vec<Destination>, SyncError>;

    async fn retrieve_destination_protocol(
        &self,
        org_id: &str,
        dest_type: &str,
        dest_id: &str,
    ) -> Result<String, SyncError>;

    async fn update_destination_last_ping_time(
        &self,
        destination: &Destination,
    ) -> Result<(), SyncError>;

    /// Removes destinations whose last ping is older than `before` (epoch ms).
    async fn remove_inactive_destinations(&self, before: u64) -> Result<(), SyncError>;

    async fn get_number_of_destinations(&self) -> Result<u32, SyncError>;

    // Webhooks.

    async fn add_webhook(
        &self,
        org_id: &str,
        object_type: &str,
        url: &str,
    ) -> Result<(), SyncError>;

    async fn delete_webhook(
        &self,
        org_id: &str,
        object_type: &str,
        url: &str,
    ) -> Result<(), SyncError>;

    async fn retrieve_webhooks(
        &self,
        org_id: &str,
        object_type: &str,
    ) -> Result<Vec<String>, SyncError>;

    // ACLs.

    async fn add_users_to_acl(
        &self,
        acl_type: &str,
        org_id: &str,
        key: &str,
        usernames: &[String],
    ) -> Result<(), SyncError>;

    /// Removing the last username deletes the ACL.
    async fn remove_users_from_acl(
        &self,
        acl_type: &str,
        org_id: &str,
        key: &str,
        usernames: &[String],
    ) -> Result<(), SyncError>;

    async fn retrieve_acl(
        &self,
        acl_type: &str,
        org_id: &str,
        key: &str,
    ) -> Result<Vec<String>, SyncError>;

    async fn retrieve_acls_in_org(
        &self,
        acl_type: &str,
        org_id: &str,
    ) -> Result<Vec<String>, SyncError>;

    // Organizations (CSS only).

    /// Returns the stored record timestamp (epoch ms).
    async fn store_organization(&self, org: Organization) -> Result<u64, SyncError>;

    async fn retrieve_organization_info(
        &self,
        org_id: &str,
    ) -> Result<StoredOrganization, SyncError>;

    async fn retrieve_organizations(&self) -> Result<Vec<StoredOrganization>, SyncError>;

    async fn retrieve_updated_organizations(
        &self,
        since_ms: u64,
    ) -> Result<Vec<StoredOrganization>, SyncError>;

    async fn delete_organization_info(&self, org_id: &str) -> Result<(), SyncError>;

    /// Removes every record associated with the organization.
    async fn delete_organization(&self, org_id: &str) -> Result<(), SyncError>;

    // Messaging groups (CSS only).

    async fn store_org_to_messaging_group(
        &self,
        org_id: &str,
        messaging_group: &str,
    ) -> Result<(), SyncError>;

    async fn delete_org_to_messaging_group(&self, org_id: &str) -> Result<(), SyncError>;

    async fn retrieve_messaging_group(&self, org_id: &str) -> Result<String, SyncError>;

    async fn retrieve_updated_messaging_groups(
        &self,
        since_ms: u64,
    ) -> Result<Vec<(String, String)>, SyncError>;

    // Leader election (CSS only). Optimistic concurrency on a monotonically
    // increasing version.

    /// Inserts the initial leader record; returns false if one exists.
    async fn insert_initial_leader(
        &self,
        leader_id: &str,
        timeout_secs: u64,
    ) -> Result<bool, SyncError>;

    /// Heartbeat by the current leader; returns false when the caller is no
    /// longer the leader.
    async fn leader_periodic_update(&self, leader_id: &str) -> Result<bool, SyncError>;

    async fn retrieve_leader(&self) -> Result<LeaderRecord, SyncError>;

    /// CAS takeover: succeeds iff the stored version equals `version`.
    async fn update_leader(&self, leader_id: &str, version: i64) -> Result<bool, SyncError>;

    async fn resign_leadership(&self, leader_id: &str) -> Result<(), SyncError>;
}

pub fn object_key(org_id: &str, object_type: &str, object_id: &str) -> String {
    format!("{}:{}:{}", org_id, object_type, object_id)
}

pub fn notification_key(
    org_id: &str,
    object_type: &str,
    object_id: &str,
    dest_type: &str,
    dest_id: &str,
) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        org_id, object_type, object_id, dest_type, dest_id
    )
}

pub fn destination_key(org_id: &str, dest_type: &str, dest_id: &str) -> String {
    format!("{}:{}:{}", org_id, dest_type, dest_id)
}

/// Resend eligibility of a notification status.
pub fn resend_eligible(status: NotificationStatus, retrieve_received: bool) -> bool {
    matches!(
        status,
        NotificationStatus::Update
            | NotificationStatus::Consumed
            | NotificationStatus::Getdata
            | NotificationStatus::Delete
            | NotificationStatus::Deleted
            | NotificationStatus::Received
    ) || (retrieve_received
        && matches!(
            status,
            NotificationStatus::Data | NotificationStatus::ReceivedByDestination
        ))
}

/// Looks up each "type:id" entry of a destinations list. A missing
/// destination is an invalid request.
pub async fn destinations_from_list(
    store: &Arc<dyn Storage>,
    org_id: &str,
    destinations_list: &[String],
) -> Result<Vec<DestinationStatus>, SyncError> {
    let mut dests = Vec::with_capacity(destinations_list.len());
    for entry in destinations_list.iter() {
        let mut parts = entry.splitn(2, ':');
        let (dest_type, dest_id) = match (parts.next(), parts.next()) {
            (Some(t), Some(i)) if !t.is_empty() && !i.is_empty() => (t, i),
            _ => {
                return Err(SyncError::invalid(format!("invalid destination {}", entry)));
            }
        };
        match store.retrieve_destination(org_id, dest_type, dest_id).await {
            Ok(dest) => dests.push(DestinationStatus {
                destination: dest,
                status: DeliveryStatus::Pending,
                message: String::new(),
            }),
            Err(SyncError::NotFound) => {
                return Err(SyncError::invalid(format!(
                    "invalid destination {}:{}",
                    dest_type, dest_id
                )));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(dests)
}

/// Reconciles an old destination set with a new one. Returns
/// (merged, deleted, added); destinations present in both keep their old
/// status when `use_old_status` is set.
pub fn compare_destinations(
    old_list: &[DestinationStatus],
    mut new_list: Vec<DestinationStatus>,
    use_old_status: bool,
) -> (
    Vec<DestinationStatus>,
    Vec<DestinationStatus>,
    Vec<DestinationStatus>,
) {
    let mut deleted = Vec::new();
    for old in old_list.iter() {
        match new_list
            .iter_mut()
            .find(|new| new.destination.same_node(&old.destination))
        {
            Some(new) => {
                if use_old_status {
                    *new = old.clone();
                }
            }
            None => deleted.push(old.clone()),
        }
    }
    let added = new_list
        .iter()
        .filter(|new| {
            !old_list
                .iter()
                .any(|old| old.destination.same_node(&new.destination))
        })
        .cloned()
        .collect();
    (new_list, deleted, added)
}

/// Computes the destination set of the object's routing metadata and
/// reconciles it with the stored one. Returns (merged, deleted, added).
pub async fn destinations_from_meta(
    store: &Arc<dyn Storage>,
    meta: &MetaData,
) -> Result<
    (
        Vec<DestinationStatus>,
        Vec<DestinationStatus>,
        Vec<DestinationStatus>,
    ),
    SyncError,
> {
    let new_list = if meta.destination_policy.is_some() {
        // Resolution is deferred until the policy engine re-evaluates.
        Vec::new()
    } else if !meta.dest_id.is_empty() {
        // A missing destination is not an error; the object waits for it to
        // register.
        match store
            .retrieve_destination(&meta.org_id, &meta.dest_type, &meta.dest_id)
            .await
        {
            Ok(dest) => vec![DestinationStatus {
                destination: dest,
                status: DeliveryStatus::Pending,
                message: String::new(),
            }],
            Err(SyncError::NotFound) => Vec::new(),
            Err(err) => return Err(err),
        }
    } else if !meta.destinations_list.is_empty() {
        destinations_from_list(store, &meta.org_id, &meta.destinations_list).await?
    } else {
        store
            .retrieve_destinations(&meta.org_id, &meta.dest_type)
            .await?
            .into_iter()
            .map(|dest| DestinationStatus {
                destination: dest,
                status: DeliveryStatus::Pending,
                message: String::new(),
            })
            .collect()
    };

    let old_list = match store
        .get_object_destinations_list(&meta.org_id, &meta.object_type, &meta.object_id)
        .await
    {
        Ok(list) => list,
        Err(SyncError::NotFound) => Vec::new(),
        Err(err) => return Err(err),
    };
    let (merged, deleted, added) = compare_destinations(&old_list, new_list, true);
    Ok((merged, deleted, added))
}
