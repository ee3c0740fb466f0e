//! Maps provider webhook payloads onto normalized events and merges them
//! into the delivery log. The reconciler is advisory: events without a
//! matching log row are dropped, and replaying an event leaves the row in
//! the same final state. Message status is never touched from here.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::models::DeliveryState;
use crate::store::{Store, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizedEvent {
    Sent,
    Bounced,
    Failed,
    Complained,
}

impl From<NormalizedEvent> for DeliveryState {
    fn from(event: NormalizedEvent) -> Self {
        match event {
            NormalizedEvent::Sent => DeliveryState::Sent,
            NormalizedEvent::Bounced => DeliveryState::Bounced,
            NormalizedEvent::Failed => DeliveryState::Failed,
            NormalizedEvent::Complained => DeliveryState::Complained,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub provider_message_id: String,
    pub event: NormalizedEvent,
    pub reason: Option<String>,
}

/// SendGrid posts a flat array of events. The `sg_message_id` carries a
/// filter suffix after the first dot which the send-time id lacks.
pub fn parse_sendgrid(body: &Value) -> Vec<WebhookEvent> {
    let Some(events) = body.as_array() else {
        return Vec::new();
    };
    events
        .iter()
        .filter_map(|event| {
            let normalized = match event.get("event").and_then(Value::as_str)? {
                "delivered" => NormalizedEvent::Sent,
                "bounce" => NormalizedEvent::Bounced,
                "dropped" | "failed" => NormalizedEvent::Failed,
                "spamreport" => NormalizedEvent::Complained,
                other => {
                    trace!(event = other, "ignoring sendgrid event");
                    return None;
                }
            };
            let pid = event.get("sg_message_id").and_then(Value::as_str)?;
            Some(WebhookEvent {
                provider_message_id: pid.split('.').next().unwrap_or(pid).to_string(),
                event: normalized,
                reason: event
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect()
}

/// SES notifications arrive wrapped in an SNS envelope whose `Message`
/// field is a JSON string.
pub fn parse_ses(body: &Value) -> Vec<WebhookEvent> {
    if body.get("Type").and_then(Value::as_str) != Some("Notification") {
        trace!("ignoring non-notification SNS message");
        return Vec::new();
    }
    let Some(inner) = body
        .get("Message")
        .and_then(Value::as_str)
        .and_then(|m| serde_json::from_str::<Value>(m).ok())
    else {
        return Vec::new();
    };

    let normalized = match inner.get("notificationType").and_then(Value::as_str) {
        Some("Delivery") => NormalizedEvent::Sent,
        Some("Bounce") => NormalizedEvent::Bounced,
        Some("Complaint") => NormalizedEvent::Complained,
        other => {
            trace!(event = ?other, "ignoring ses notification");
            return Vec::new();
        }
    };
    let Some(pid) = inner
        .pointer("/mail/messageId")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return Vec::new();
    };
    let reason = inner
        .pointer("/bounce/bouncedRecipients/0/diagnosticCode")
        .or_else(|| inner.pointer("/complaint/complaintFeedbackType"))
        .and_then(Value::as_str)
        .map(str::to_string);

    vec![WebhookEvent {
        provider_message_id: pid,
        event: normalized,
        reason,
    }]
}

/// Mailgun posts `{signature, event-data}` with the message id buried in
/// the stored message headers.
pub fn parse_mailgun(body: &Value) -> Vec<WebhookEvent> {
    let Some(data) = body.get("event-data") else {
        return Vec::new();
    };
    let normalized = match data.get("event").and_then(Value::as_str) {
        Some("delivered") => NormalizedEvent::Sent,
        Some("bounced") => NormalizedEvent::Bounced,
        Some("failed") => NormalizedEvent::Failed,
        Some("complained") => NormalizedEvent::Complained,
        other => {
            trace!(event = ?other, "ignoring mailgun event");
            return Vec::new();
        }
    };
    let Some(pid) = data
        .pointer("/message/headers/message-id")
        .and_then(Value::as_str)
    else {
        return Vec::new();
    };
    let reason = data
        .pointer("/delivery-status/message")
        .or_else(|| data.pointer("/delivery-status/description"))
        .or_else(|| data.get("reason"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    vec![WebhookEvent {
        provider_message_id: pid.trim_matches(['<', '>']).to_string(),
        event: normalized,
        reason,
    }]
}

/// Applies events to the delivery log. Returns how many rows were updated;
/// unmatched events are logged and skipped, which also makes replays
/// harmless.
pub async fn apply(store: &Arc<dyn Store>, events: Vec<WebhookEvent>) -> StoreResult<usize> {
    let mut applied = 0;
    for event in events {
        let Some(log) = store
            .log_by_provider_message_id(&event.provider_message_id)
            .await?
        else {
            // the webhook may have outrun the adapter's log write
            debug!(
                provider_message_id = event.provider_message_id,
                "no delivery log for webhook event"
            );
            continue;
        };
        store
            .update_log_state(log.id, event.event.into(), event.reason.as_deref())
            .await?;
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn sendgrid_events_normalize_and_strip_the_filter_suffix() {
        let body = json!([
            {"event": "bounce", "sg_message_id": "abc123.filter001.123", "reason": "550"},
            {"event": "delivered", "sg_message_id": "def456"},
            {"event": "open", "sg_message_id": "ghi789"},
        ]);
        let events = parse_sendgrid(&body);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].provider_message_id, "abc123");
        assert_eq!(events[0].event, NormalizedEvent::Bounced);
        assert_eq!(events[0].reason.as_deref(), Some("550"));
        assert_eq!(events[1].event, NormalizedEvent::Sent);
    }

    #[test]
    fn ses_notification_unwraps_the_sns_envelope() {
        let inner = json!({
            "notificationType": "Bounce",
            "mail": {"messageId": "ses-msg-1"},
            "bounce": {"bouncedRecipients": [{"diagnosticCode": "smtp; 550 user unknown"}]},
        });
        let body = json!({
            "Type": "Notification",
            "Message": inner.to_string(),
        });
        let events = parse_ses(&body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].provider_message_id, "ses-msg-1");
        assert_eq!(events[0].event, NormalizedEvent::Bounced);
        assert_eq!(events[0].reason.as_deref(), Some("smtp; 550 user unknown"));
    }

    #[test]
    fn ses_subscription_confirmation_is_ignored() {
        let body = json!({"Type": "SubscriptionConfirmation", "Token": "t"});
        assert!(parse_ses(&body).is_empty());
    }

    #[test]
    fn mailgun_event_data_yields_the_message_id() {
        let body = json!({
            "signature": {"timestamp": "1", "token": "t", "signature": "s"},
            "event-data": {
                "event": "failed",
                "message": {"headers": {"message-id": "<mg-msg-1@mg.test>"}},
                "delivery-status": {"message": "mailbox full"},
            }
        });
        let events = parse_mailgun(&body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].provider_message_id, "mg-msg-1@mg.test");
        assert_eq!(events[0].event, NormalizedEvent::Failed);
        assert_eq!(events[0].reason.as_deref(), Some("mailbox full"));
    }

    #[test]
    fn unknown_events_are_dropped_not_errors() {
        assert!(parse_sendgrid(&json!([{"event": "click", "sg_message_id": "x"}])).is_empty());
        assert!(parse_mailgun(&json!({"event-data": {"event": "opened"}})).is_empty());
    }
}
