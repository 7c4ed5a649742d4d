pub mod inprocess;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use syncline_api::{Destination, MetaData, NotificationStatus};

use crate::error::SyncError;

pub use inprocess::InProcessCommunicator;

/// A party on the wire: the cloud service or one edge node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Party {
    Css,
    Node {
        org_id: String,
        dest_type: String,
        dest_id: String,
    },
}

impl Party {
    pub fn node(org_id: &str, dest_type: &str, dest_id: &str) -> Self {
        Party::Node {
            org_id: org_id.to_string(),
            dest_type: dest_type.to_string(),
            dest_id: dest_id.to_string(),
        }
    }

    pub fn key(&self) -> String {
        match self {
            Party::Css => "css".to_string(),
            Party::Node {
                org_id,
                dest_type,
                dest_id,
            } => format!("{}:{}:{}", org_id, dest_type, dest_id),
        }
    }
}

/// One data chunk on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub offset: u64,
    pub total: u64,
    pub is_first: bool,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// A discrete protocol message: the notification status, the object primary
/// key, the instance timestamp, and for data chunks the offset/total/flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub kind: NotificationStatus,
    pub to: Party,
    pub from: Party,
    pub org_id: String,
    pub object_type: String,
    pub object_id: String,
    pub instance_id: i64,
    /// Carried by Update and Delete.
    pub meta: Option<MetaData>,
    /// Carried by Data.
    pub chunk: Option<ChunkPayload>,
    /// Carried by Register, Ping and Resend.
    pub destination: Option<Destination>,
    /// Carried by Error.
    pub error_message: Option<String>,
}

impl MessageEnvelope {
    pub fn control(kind: NotificationStatus, to: Party, from: Party, meta: &MetaData) -> Self {
        Self {
            kind,
            to,
            from,
            org_id: meta.org_id.clone(),
            object_type: meta.object_type.clone(),
            object_id: meta.object_id.clone(),
            instance_id: meta.instance_id,
            meta: None,
            chunk: None,
            destination: None,
            error_message: None,
        }
    }

    pub fn carrying_meta(mut self, meta: MetaData) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Outbound edge of the notification engine. Implementations deliver
/// envelopes to the addressed party; delivery failures surface as errors and
/// are retried by the resend loop.
#[async_trait]
pub trait Communicator: Send + Sync {
    async fn send(&self, envelope: MessageEnvelope) -> Result<(), SyncError>;
}
