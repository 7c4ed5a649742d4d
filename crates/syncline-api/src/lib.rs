pub mod selector;
pub mod types;
pub mod validation;

pub use selector::DestinationSelector;
pub use types::{
    AuthCode, BulkAclUpdate, DeliveryStatus, Destination, DestinationStatus, DestinationsStatus,
    MetaData, Notification, NotificationStatus, ObjectStatus, ObjectUpdatePayload, Organization,
    PolicyProperty, PolicyService, StoredOrganization, WebhookUpdate,
};
