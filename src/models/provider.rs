use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::GroupId;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, From, Display, Deref, FromStr,
)]
#[serde(transparent)]
pub struct ProviderId(pub Uuid);

impl ProviderId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Sendgrid,
    Mailgun,
    Ses,
    Smtp,
    Msgraph,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Sendgrid => "sendgrid",
            ProviderKind::Mailgun => "mailgun",
            ProviderKind::Ses => "ses",
            ProviderKind::Smtp => "smtp",
            ProviderKind::Msgraph => "msgraph",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sendgrid" => Some(ProviderKind::Sendgrid),
            "mailgun" => Some(ProviderKind::Mailgun),
            "ses" => Some(ProviderKind::Ses),
            "smtp" => Some(ProviderKind::Smtp),
            "msgraph" => Some(ProviderKind::Msgraph),
            _ => None,
        }
    }
}

/// A configured outbound ESP account, owned by one group. Adapter-specific
/// settings (relay host, Mailgun domain, SES region, Graph tenant...) live in
/// the `smtp_config` document and are deserialized by the adapter
/// constructor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Provider {
    pub id: ProviderId,
    pub group_id: GroupId,
    pub name: String,
    pub kind: ProviderKind,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub smtp_config: serde_json::Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NewProvider {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub smtp_config: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
