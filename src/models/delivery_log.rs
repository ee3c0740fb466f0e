use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MessageId, ProviderId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, From, Display, Deref, FromStr,
)]
#[serde(transparent)]
pub struct DeliveryLogId(pub Uuid);

impl DeliveryLogId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Per-attempt outcome, later overwritten by webhook reconciliation. The
/// first three states come from the adapter; the rest only ever arrive
/// asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sent,
    QueuedByProvider,
    Failed,
    Bounced,
    Complained,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Sent => "sent",
            DeliveryState::QueuedByProvider => "queued_by_provider",
            DeliveryState::Failed => "failed",
            DeliveryState::Bounced => "bounced",
            DeliveryState::Complained => "complained",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(DeliveryState::Sent),
            "queued_by_provider" => Some(DeliveryState::QueuedByProvider),
            "failed" => Some(DeliveryState::Failed),
            "bounced" => Some(DeliveryState::Bounced),
            "complained" => Some(DeliveryState::Complained),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryLog {
    pub id: DeliveryLogId,
    pub message_id: MessageId,
    pub provider_id: ProviderId,
    pub status: DeliveryState,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    /// Opaque ESP id, unique where present; correlates webhook events.
    pub provider_message_id: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One row appended per send attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub provider_id: ProviderId,
    pub status: DeliveryState,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub provider_message_id: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub metadata: serde_json::Value,
}
