use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::GroupId;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    From,
    Display,
    Deref,
    FromStr,
)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// The tuple handed from the SMTP frontend to the queue. The body is opaque
/// bytes and immutable after enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub headers: BTreeMap<String, String>,
    #[serde(with = "body_bytes")]
    pub body: Vec<u8>,
}

/// Bodies are stored as base64 when an envelope travels through JSON (the
/// DLQ payload); a raw byte array would not survive arbitrary MIME content.
mod body_bytes {
    use base64ct::{Base64, Encoding};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&Base64::encode_string(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        Base64::decode_vec(&s).map_err(serde::de::Error::custom)
    }
}

impl Envelope {
    pub fn sender_domain(&self) -> &str {
        Self::domain_of(&self.sender)
    }

    pub fn domain_of(address: &str) -> &str {
        address.rsplit_once('@').map(|(_, d)| d).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Processing,
    Delivered,
    Failed,
    Dead,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Processing => "processing",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(MessageStatus::Queued),
            "processing" => Some(MessageStatus::Processing),
            "delivered" => Some(MessageStatus::Delivered),
            "failed" => Some(MessageStatus::Failed),
            "dead" => Some(MessageStatus::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub group_id: GroupId,
    pub envelope: Envelope,
    pub status: MessageStatus,
    pub retry_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Metadata projection for listing: everything but headers and body.
#[derive(Debug, Clone, Serialize)]
pub struct MessageMetadata {
    pub id: MessageId,
    pub group_id: GroupId,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub status: MessageStatus,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<&Message> for MessageMetadata {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id,
            group_id: m.group_id,
            sender: m.envelope.sender.clone(),
            recipients: m.envelope.recipients.clone(),
            subject: m.envelope.subject.clone(),
            status: m.status,
            retry_count: m.retry_count,
            created_at: m.created_at,
            processed_at: m.processed_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub group_id: GroupId,
    pub envelope: Envelope,
}
