//! Mailgun messages API: form-encoded for plain mail, multipart
//! `messages.mime` carrying the raw MIME when attachments are present.

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

const DEFAULT_BASE_URL: &str = "https://api.mailgun.net";

#[derive(Debug, Deserialize)]
struct MailgunConfig {
    domain: String,
    #[serde(default)]
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MailgunResponse {
    #[serde(default)]
    id: Option<String>,
}

pub struct MailgunClient {
    name: String,
    api_key: String,
    domain: String,
    base_url: String,
    http: reqwest::Client,
}

impl MailgunClient {
    pub fn new(provider: &Provider, http: reqwest::Client) -> Result<Self, ProviderError> {
        let api_key = provider
            .api_key
            .clone()
            .ok_or_else(|| config_error("mailgun requires an api_key"))?;
        let config: MailgunConfig = serde_json::from_value(provider.smtp_config.clone())
            .map_err(|e| config_error(format!("mailgun config: {e}")))?;
        Ok(Self {
            name: provider.name.clone(),
            api_key,
            domain: config.domain,
            base_url: config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            http,
        })
    }

    fn has_attachments(envelope: &Envelope) -> bool {
        MessageParser::default()
            .parse(&envelope.body)
            .is_some_and(|m| m.attachment_count() > 0)
    }

    async fn send_form(&self, envelope: &Envelope) -> Result<reqwest::Response, ProviderError> {
        let parsed = MessageParser::default().parse(&envelope.body);
        let text = parsed
            .as_ref()
            .and_then(|m| m.body_text(0))
            .map(|t| t.to_string())
            .unwrap_or_else(|| String::from_utf8_lossy(&envelope.body).to_string());
        let html = parsed
            .as_ref()
            .and_then(|m| m.body_html(0))
            .map(|h| h.to_string());

        let mut form = vec![
            ("from".to_string(), envelope.sender.clone()),
            ("subject".to_string(), envelope.subject.clone()),
            ("text".to_string(), text),
        ];
        for recipient in &envelope.recipients {
            form.push(("to".to_string(), recipient.clone()));
        }
        if let Some(html) = html {
            form.push(("html".to_string(), html));
        }

        self.http
            .post(format!("{}/v3/{}/messages", self.base_url, self.domain))
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .send()
            .await
            .map_err(classify_transport_failure)
    }

    async fn send_mime(&self, envelope: &Envelope) -> Result<reqwest::Response, ProviderError> {
        let mut form = reqwest::multipart::Form::new();
        for recipient in &envelope.recipients {
            form = form.text("to", recipient.clone());
        }
        form = form.part(
            "message",
            reqwest::multipart::Part::bytes(envelope.body.clone()).file_name("message.mime"),
        );

        self.http
            .post(format!(
                "{}/v3/{}/messages.mime",
                self.base_url, self.domain
            ))
            .basic_auth("api", Some(&self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(classify_transport_failure)
    }
}

#[async_trait]
impl EspClient for MailgunClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: &Envelope) -> Result<DeliveryResult, ProviderError> {
        let response = if Self::has_attachments(envelope) {
            self.send_mime(envelope).await?
        } else {
            self.send_form(envelope).await?
        };

        if !response.status().is_success() {
            return Err(classify_http_failure(response).await);
        }

        let code = response.status().as_u16();
        let body: MailgunResponse = response.json().await.unwrap_or(MailgunResponse { id: None });
        // Mailgun wraps the id in angle brackets; webhooks report it bare.
        let provider_message_id = body
            .id
            .map(|id| id.trim_matches(['<', '>']).to_string());

        Ok(DeliveryResult {
            provider_message_id,
            status: SendStatus::QueuedByProvider,
            timestamp: Utc::now(),
            metadata: json!({"response_code": code}),
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let response = self
            .http
            .get(format!("{}/v3/domains/{}", self.base_url, self.domain))
            .basic_auth("api", Some(&self.api_key))
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{ProviderId, ProviderKind};
    use std::collections::BTreeMap;

    fn provider(config: serde_json::Value, api_key: Option<&str>) -> Provider {
        Provider {
            id: ProviderId::random(),
            group_id: crate::models::GroupId::random(),
            name: "mg".into(),
            kind: ProviderKind::Mailgun,
            api_key: api_key.map(str::to_string),
            smtp_config: config,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn requires_api_key_and_domain() {
        let http = reqwest::Client::new();
        assert!(MailgunClient::new(&provider(json!({"domain": "mg.test"}), None), http.clone()).is_err());
        assert!(MailgunClient::new(&provider(json!({}), Some("key")), http.clone()).is_err());
        assert!(MailgunClient::new(&provider(json!({"domain": "mg.test"}), Some("key")), http).is_ok());
    }

    #[test]
    fn attachment_detection_on_plain_message() {
        let envelope = Envelope {
            sender: "a@b.c".into(),
            recipients: vec!["d@e.f".into()],
            subject: "Hi".into(),
            headers: BTreeMap::new(),
            body: b"Subject: Hi\r\n\r\nplain body".to_vec(),
        };
        assert!(!MailgunClient::has_attachments(&envelope));
    }
}
