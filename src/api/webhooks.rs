//! Provider webhook intake. Unauthenticated by design, but verified
//! against per-provider secrets where configured: Mailgun with its native
//! `signature` block, SendGrid and SES with an HMAC of the raw body in
//! `X-Webhook-Signature`. Replays are harmless; unknown events and
//! unmatched ids answer 200.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::debug;

use super::{ApiState, error::{ApiError, ApiResult}};
use crate::reconcile;

type HmacSha256 = Hmac<Sha256>;

/// Per-provider shared secrets; `None` disables verification for that
/// source.
#[derive(Debug, Default, Clone)]
pub struct WebhookSecrets {
    pub sendgrid: Option<String>,
    pub ses: Option<String>,
    pub mailgun: Option<String>,
}

impl WebhookSecrets {
    pub fn from_env() -> Self {
        Self {
            sendgrid: std::env::var("MAILBRIDGE_WEBHOOK_SECRET_SENDGRID").ok(),
            ses: std::env::var("MAILBRIDGE_WEBHOOK_SECRET_SES").ok(),
            mailgun: std::env::var("MAILBRIDGE_WEBHOOK_SECRET_MAILGUN").ok(),
        }
    }
}

fn hmac_hex(secret: &str, message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(message);
    hex_encode(&mac.finalize().into_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn verify_body_signature(
    secret: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), ApiError> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let presented = headers
        .get("X-Webhook-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    if presented != hmac_hex(secret, body) {
        debug!("webhook signature mismatch");
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

/// Mailgun signs `timestamp + token` with the account signing key.
fn verify_mailgun_signature(secret: Option<&str>, body: &Value) -> Result<(), ApiError> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let signature = body.get("signature").ok_or(ApiError::Unauthorized)?;
    let timestamp = signature
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or(ApiError::Unauthorized)?;
    let token = signature
        .get("token")
        .and_then(Value::as_str)
        .ok_or(ApiError::Unauthorized)?;
    let presented = signature
        .get("signature")
        .and_then(Value::as_str)
        .ok_or(ApiError::Unauthorized)?;

    if presented != hmac_hex(secret, format!("{timestamp}{token}").as_bytes()) {
        debug!("mailgun signature mismatch");
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

fn parse_body(body: &[u8]) -> Result<Value, ApiError> {
    serde_json::from_slice(body)
        .map_err(|_| ApiError::Validation("invalid webhook payload".into()))
}

pub async fn sendgrid(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Value> {
    verify_body_signature(state.webhook_secrets.sendgrid.as_deref(), &headers, &body)?;
    let payload = parse_body(&body)?;
    if !payload.is_array() {
        return Err(ApiError::Validation("expected an event array".into()));
    }
    let applied = reconcile::apply(&state.store, reconcile::parse_sendgrid(&payload)).await?;
    Ok(Json(json!({"processed": applied})))
}

pub async fn ses(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Value> {
    verify_body_signature(state.webhook_secrets.ses.as_deref(), &headers, &body)?;
    let payload = parse_body(&body)?;
    let applied = reconcile::apply(&state.store, reconcile::parse_ses(&payload)).await?;
    Ok(Json(json!({"processed": applied})))
}

pub async fn mailgun(
    State(state): State<ApiState>,
    body: Bytes,
) -> ApiResult<Value> {
    let payload = parse_body(&body)?;
    verify_mailgun_signature(state.webhook_secrets.mailgun.as_deref(), &payload)?;
    let applied = reconcile::apply(&state.store, reconcile::parse_mailgun(&payload)).await?;
    Ok(Json(json!({"processed": applied})))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn body_signature_round_trip() {
        let mut headers = HeaderMap::new();
        let body = br#"[{"event":"delivered"}]"#;
        headers.insert(
            "X-Webhook-Signature",
            hmac_hex("secret", body).parse().unwrap(),
        );
        assert!(verify_body_signature(Some("secret"), &headers, body).is_ok());
        assert!(verify_body_signature(Some("other"), &headers, body).is_err());
        // verification is off when no secret is configured
        assert!(verify_body_signature(None, &HeaderMap::new(), body).is_ok());
    }

    #[test]
    fn mailgun_signature_covers_timestamp_and_token() {
        let signature = hmac_hex("key", b"1700000000tok");
        let body = json!({
            "signature": {"timestamp": "1700000000", "token": "tok", "signature": signature},
            "event-data": {"event": "delivered"},
        });
        assert!(verify_mailgun_signature(Some("key"), &body).is_ok());
        assert!(verify_mailgun_signature(Some("wrong"), &body).is_err());
    }
}
