use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

use super::GroupId;

/// Append-only activity record. The core only emits these; querying and
/// retention belong to the audit collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub group_id: Option<GroupId>,
    pub actor: String,
    pub action: String,
    pub resource_type: &'static str,
    pub resource_id: String,
    pub changes: serde_json::Value,
    pub ip: Option<IpAddr>,
    pub ts: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        group_id: Option<GroupId>,
        actor: impl Into<String>,
        action: impl Into<String>,
        resource_type: &'static str,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            group_id,
            actor: actor.into(),
            action: action.into(),
            resource_type,
            resource_id: resource_id.into(),
            changes: serde_json::Value::Null,
            ip: None,
            ts: Utc::now(),
        }
    }

    pub fn with_changes(mut self, changes: serde_json::Value) -> Self {
        self.changes = changes;
        self
    }

    pub fn with_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.ip = ip;
        self
    }
}
