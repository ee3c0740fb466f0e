use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{Envelope, GroupId, ProviderId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, From, Display, Deref, FromStr,
)]
#[serde(transparent)]
pub struct RuleId(pub Uuid);

impl RuleId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Rule predicate over an envelope. All present keys must match; an empty
/// object matches everything.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuleConditions {
    /// Sender domain, exact, case-insensitive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Glob against the full sender address, `*` matches any run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Matches when any recipient's domain equals this, case-insensitive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_domain: Option<String>,
    /// Header name to glob over its value. Header names compare
    /// case-insensitively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<BTreeMap<String, String>>,
}

impl RuleConditions {
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(domain) = &self.domain {
            if !envelope.sender_domain().eq_ignore_ascii_case(domain) {
                return false;
            }
        }
        if let Some(pattern) = &self.from {
            if !glob_match(pattern, &envelope.sender) {
                return false;
            }
        }
        if let Some(domain) = &self.recipient_domain {
            let any = envelope
                .recipients
                .iter()
                .any(|r| Envelope::domain_of(r).eq_ignore_ascii_case(domain));
            if !any {
                return false;
            }
        }
        if let Some(headers) = &self.header {
            for (name, pattern) in headers {
                let value = envelope
                    .headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v.as_str());
                match value {
                    Some(value) if glob_match(pattern, value) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

/// Minimal glob: `*` matches any run of characters, everything else is
/// literal and case-insensitive.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    fn inner(p: &[u8], s: &[u8]) -> bool {
        match p.first() {
            None => s.is_empty(),
            Some(b'*') => {
                (0..=s.len()).any(|skip| inner(&p[1..], &s[skip..]))
            }
            Some(c) => match s.first() {
                Some(d) if c.eq_ignore_ascii_case(d) => inner(&p[1..], &s[1..]),
                _ => false,
            },
        }
    }
    inner(pattern.as_bytes(), input.as_bytes())
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingRule {
    pub id: RuleId,
    pub group_id: GroupId,
    pub priority: i32,
    pub conditions: RuleConditions,
    pub provider_id: ProviderId,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NewRoutingRule {
    pub priority: i32,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub provider_id: ProviderId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
