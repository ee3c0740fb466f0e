use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the bootstrap group. It cannot be deleted.
pub const SYSTEM_GROUP: &str = "system";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, From, Display, Deref, FromStr,
)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl GroupId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Active,
    Suspended,
    Deleted,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Active => "active",
            GroupStatus::Suspended => "suspended",
            GroupStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(GroupStatus::Active),
            "suspended" => Some(GroupStatus::Suspended),
            "deleted" => Some(GroupStatus::Deleted),
            _ => None,
        }
    }
}

/// The tenancy boundary: owns users, providers, rules, messages and DLQ
/// entries.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub status: GroupStatus,
    /// Opt-in that turns an empty per-user allowed-domain set into "no
    /// restriction". Default is deny.
    pub allow_any_sender: bool,
    /// Ordered provider names tried when no routing rule yields a healthy
    /// provider.
    pub fallback_providers: Vec<String>,
    pub monthly_limit: i64,
    pub monthly_sent: i64,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn is_system(&self) -> bool {
        self.name == SYSTEM_GROUP
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewGroup {
    pub name: String,
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: i64,
    #[serde(default)]
    pub allow_any_sender: bool,
    #[serde(default)]
    pub fallback_providers: Vec<String>,
}

fn default_monthly_limit() -> i64 {
    100_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(MemberRole::Owner),
            "admin" => Some(MemberRole::Admin),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Membership {
    pub group_id: GroupId,
    pub user_id: super::UserId,
    pub role: MemberRole,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the send-time monthly gate. Best effort: a race between
/// workers may overshoot by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStatus {
    Within,
    Exceeded,
}
