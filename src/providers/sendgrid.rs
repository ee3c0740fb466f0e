//! SendGrid v3 mail send. The acknowledgement id comes back in the
//! `X-Message-Id` response header.

use async_trait::async_trait;
use chrono::Utc;
use mail_parser::MessageParser;
use serde::Deserialize;
use serde_json::json;

use super::{
    DeliveryResult, EspClient, ProviderError, SendStatus, classify_http_failure,
    classify_transport_failure, config_error,
};
use crate::models::{Envelope, Provider};

const DEFAULT_BASE_URL: &str = "https://api.sendgrid.com";

#[derive(Debug, Deserialize, Default)]
struct SendGridConfig {
    #[serde(default)]
    base_url: Option<String>,
}

pub struct SendGridClient {
    name: String,
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl SendGridClient {
    pub fn new(provider: &Provider, http: reqwest::Client) -> Result<Self, ProviderError> {
        let api_key = provider
            .api_key
            .clone()
            .ok_or_else(|| config_error("sendgrid requires an api_key"))?;
        let config: SendGridConfig = serde_json::from_value(provider.smtp_config.clone())
            .unwrap_or_default();
        Ok(Self {
            name: provider.name.clone(),
            api_key,
            base_url: config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v3/mail/send", self.base_url)
    }
}

/// The v3 payload: personalizations carry the recipients, content carries
/// the extracted text/html parts of the stored MIME body.
pub(crate) fn payload(envelope: &Envelope) -> serde_json::Value {
    let parsed = MessageParser::default().parse(&envelope.body);
    let text = parsed
        .as_ref()
        .and_then(|m| m.body_text(0))
        .map(|t| t.to_string())
        .unwrap_or_else(|| String::from_utf8_lossy(&envelope.body).to_string());
    let html = parsed.as_ref().and_then(|m| m.body_html(0));

    let mut content = vec![json!({"type": "text/plain", "value": text})];
    if let Some(html) = html {
        content.push(json!({"type": "text/html", "value": html.to_string()}));
    }

    json!({
        "personalizations": [{
            "to": envelope.recipients.iter().map(|r| json!({"email": r})).collect::<Vec<_>>(),
        }],
        "from": {"email": envelope.sender},
        "subject": envelope.subject,
        "content": content,
    })
}

#[async_trait]
impl EspClient for SendGridClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: &Envelope) -> Result<DeliveryResult, ProviderError> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload(envelope))
            .send()
            .await
            .map_err(classify_transport_failure)?;

        if !response.status().is_success() {
            return Err(classify_http_failure(response).await);
        }

        let code = response.status().as_u16();
        let provider_message_id = response
            .headers()
            .get("X-Message-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(DeliveryResult {
            provider_message_id,
            status: SendStatus::QueuedByProvider,
            timestamp: Utc::now(),
            metadata: json!({"response_code": code}),
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        // scopes is the cheapest authenticated endpoint
        let response = self
            .http
            .get(format!("{}/v3/scopes", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(classify_transport_failure)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(classify_http_failure(response).await)
        }
    }
}
