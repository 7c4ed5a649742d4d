use serde::{Deserialize, Serialize};

/// Object lifecycle states. `NotReady`/`Ready` apply to objects originated on
/// this node, the rest to objects received from the other side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectStatus {
    #[serde(rename = "notReady")]
    NotReady,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "partiallyReceived")]
    PartiallyReceived,
    #[serde(rename = "completelyReceived")]
    CompletelyReceived,
    #[serde(rename = "consumed")]
    Consumed,
    #[serde(rename = "deleted")]
    Deleted,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::NotReady => "notReady",
            ObjectStatus::Ready => "ready",
            ObjectStatus::PartiallyReceived => "partiallyReceived",
            ObjectStatus::CompletelyReceived => "completelyReceived",
            ObjectStatus::Consumed => "consumed",
            ObjectStatus::Deleted => "deleted",
        }
    }

    /// True for the states an object received from the other side moves through.
    pub fn is_received_side(&self) -> bool {
        matches!(
            self,
            ObjectStatus::PartiallyReceived
                | ObjectStatus::CompletelyReceived
                | ObjectStatus::Consumed
        )
    }
}

/// Per-(object, destination) wire status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Update,
    Updated,
    Getdata,
    Data,
    Received,
    AckReceived,
    #[serde(rename = "receivedByDestination")]
    ReceivedByDestination,
    Consumed,
    AckConsumed,
    Delete,
    Deleted,
    AckDeleted,
    Register,
    AckRegister,
    Resend,
    Ping,
    Error,
}

/// Delivery progress of an object at one destination, as tracked by the origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivering,
    Delivered,
    Consumed,
    Deleted,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyService {
    pub org_id: String,
    pub service_name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyProperty {
    pub name: String,
    pub value: serde_json::Value,
}

/// Rule-based destination selector evaluated by an external policy engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationPolicy {
    #[serde(default)]
    pub services: Vec<PolicyService>,
    #[serde(default)]
    pub properties: Vec<PolicyProperty>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Object metadata. The triple (org_id, object_type, object_id) is the
/// primary key everywhere.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaData {
    pub object_id: String,
    pub object_type: String,
    pub org_id: String,

    #[serde(default)]
    pub dest_id: String,
    #[serde(default)]
    pub dest_type: String,
    #[serde(default)]
    pub destinations_list: Vec<String>,
    #[serde(default)]
    pub destination_policy: Option<DestinationPolicy>,

    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub inactive: bool,
    /// Epoch seconds; while in the future and inactive, the object is pinned
    /// in notReady.
    #[serde(default)]
    pub activation_time: u64,
    /// Epoch seconds after which the object is removed by maintenance.
    #[serde(default)]
    pub expiration: u64,

    #[serde(default)]
    pub no_data: bool,
    #[serde(default)]
    pub meta_only: bool,
    #[serde(default)]
    pub object_size: i64,
    #[serde(default)]
    pub chunk_size: i32,
    #[serde(default)]
    pub source_data_uri: String,
    #[serde(default)]
    pub destination_data_uri: String,

    #[serde(default = "default_consumers")]
    pub expected_consumers: i32,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub deleted: bool,

    #[serde(default)]
    pub origin_id: String,
    #[serde(default)]
    pub origin_type: String,
    /// Monotonic version of the object; a newer instance supersedes the state
    /// machine of the previous one.
    #[serde(default)]
    pub instance_id: i64,
}

fn default_consumers() -> i32 {
    1
}

impl MetaData {
    pub fn new(org_id: &str, object_type: &str, object_id: &str) -> Self {
        Self {
            object_id: object_id.to_string(),
            object_type: object_type.to_string(),
            org_id: org_id.to_string(),
            dest_id: String::new(),
            dest_type: String::new(),
            destinations_list: Vec::new(),
            destination_policy: None,
            description: String::new(),
            version: String::new(),
            inactive: false,
            activation_time: 0,
            expiration: 0,
            no_data: false,
            meta_only: false,
            object_size: 0,
            chunk_size: 0,
            source_data_uri: String::new(),
            destination_data_uri: String::new(),
            expected_consumers: 1,
            auto_delete: false,
            deleted: false,
            origin_id: String::new(),
            origin_type: String::new(),
            instance_id: 0,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.org_id, self.object_type, self.object_id)
    }
}

/// An ESS node as seen by the CSS.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub org_id: String,
    pub dest_type: String,
    pub dest_id: String,
    #[serde(default)]
    pub communication: String,
    #[serde(default)]
    pub code_version: String,
}

impl Destination {
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.org_id, self.dest_type, self.dest_id)
    }

    pub fn same_node(&self, other: &Destination) -> bool {
        self.org_id == other.org_id
            && self.dest_type == other.dest_type
            && self.dest_id == other.dest_id
    }
}

/// A destination together with the delivery status the origin tracks for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationStatus {
    pub destination: Destination,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub message: String,
}

/// Per-destination delivery status as returned by the destinations API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationsStatus {
    pub dest_type: String,
    pub dest_id: String,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub message: String,
}

/// Per-(object, destination) delivery record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub org_id: String,
    pub object_type: String,
    pub object_id: String,
    pub dest_type: String,
    pub dest_id: String,
    pub status: NotificationStatus,
    pub instance_id: i64,
    /// Epoch seconds at which the notification becomes due for resend.
    #[serde(default)]
    pub resend_time: u64,
    #[serde(default)]
    pub last_error: String,
    /// Sender-side cursor: the next data offset to send.
    #[serde(default)]
    pub data_offset: i64,
}

impl Notification {
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.org_id, self.object_type, self.object_id, self.dest_type, self.dest_id
        )
    }

    pub fn object_key(&self) -> String {
        format!("{}:{}:{}", self.org_id, self.object_type, self.object_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOrganization {
    pub org: Organization,
    /// Epoch milliseconds of the last update.
    pub timestamp: u64,
}

/// Outcome of authenticating an API caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthCode {
    Failed,
    EdgeNode,
    User,
    Admin,
    SyncAdmin,
}

/// Body of object upsert: metadata plus optional inline data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdatePayload {
    pub meta: MetaData,
    #[serde(default, with = "base64_bytes")]
    pub data: Option<Vec<u8>>,
}

/// Body of webhook registration: action is "register" or "delete".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookUpdate {
    pub action: String,
    pub url: String,
}

/// Body of a bulk ACL update: action is "add" or "remove".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkAclUpdate {
    pub action: String,
    pub usernames: Vec<String>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => ser.serialize_str(&STANDARD.encode(bytes)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(de)?;
        match encoded {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_status_strings() {
        assert_eq!(ObjectStatus::PartiallyReceived.as_str(), "partiallyReceived");
        assert_eq!(ObjectStatus::Ready.as_str(), "ready");
        assert!(ObjectStatus::CompletelyReceived.is_received_side());
        assert!(!ObjectStatus::Ready.is_received_side());
    }

    #[test]
    fn notification_status_wire_names() {
        let json = serde_json::to_string(&NotificationStatus::ReceivedByDestination).unwrap();
        assert_eq!(json, "\"receivedByDestination\"");
        let json = serde_json::to_string(&NotificationStatus::Getdata).unwrap();
        assert_eq!(json, "\"getdata\"");
    }

    #[test]
    fn object_update_data_round_trips_as_base64() {
        let payload = ObjectUpdatePayload {
            meta: MetaData::new("org", "type", "id"),
            data: Some(vec![1, 2, 3, 255]),
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(encoded.contains("\"data\":\"AQID/w==\""));
        let decoded: ObjectUpdatePayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.data.as_deref(), Some(&[1u8, 2, 3, 255][..]));
    }

    #[test]
    fn meta_defaults_apply() {
        let meta: MetaData =
            serde_json::from_str(r#"{"object_id":"i","object_type":"t","org_id":"o"}"#).unwrap();
        assert_eq!(meta.expected_consumers, 1);
        assert!(meta.destinations_list.is_empty());
        assert!(meta.destination_policy.is_none());
    }
}
