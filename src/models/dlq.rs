use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Envelope, GroupId, MessageId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, From, Display, Deref, FromStr,
)]
#[serde(transparent)]
pub struct DlqEntryId(pub Uuid);

impl DlqEntryId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Self-contained record of a permanently failed message. The payload alone
/// must suffice to re-inject without touching the original message row.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DlqEntry {
    pub id: DlqEntryId,
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub failure_reason: String,
    pub payload: DlqPayload,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DlqPayload {
    pub envelope: Envelope,
    pub last_error: String,
    /// Attempt count at the time of promotion.
    pub attempts: i32,
}
