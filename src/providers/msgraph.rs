//! Microsoft Graph sendMail behind the OAuth2 client-credentials flow.
//! Graph answers 202 with an empty body, so there is never an
//! acknowledgement id to correlate.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use super::{
    DeliveryResult, EspClient, ProviderError, SendStatus, classify_http_failure,
    classify_transport_failure, config_error,
};
use crate::models::{Envelope, Provider};

const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com";
const DEFAULT_LOGIN_URL: &str = "https://login.microsoftonline.com";

#[derive(Debug, Deserialize)]
struct GraphConfig {
    tenant_id: String,
    client_id: String,
    /// Mailbox the proxy submits as; MAIL FROM may differ per message.
    sender: String,
    #[serde(default)]
    graph_url: Option<String>,
    #[serde(default)]
    login_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct MsGraphClient {
    name: String,
    client_secret: String,
    config: GraphConfig,
    graph_url: String,
    login_url: String,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl MsGraphClient {
    pub fn new(provider: &Provider, http: reqwest::Client) -> Result<Self, ProviderError> {
        let client_secret = provider
            .api_key
            .clone()
            .ok_or_else(|| config_error("msgraph requires the client secret in api_key"))?;
        let config: GraphConfig = serde_json::from_value(provider.smtp_config.clone())
            .map_err(|e| config_error(format!("msgraph config: {e}")))?;
        Ok(Self {
            name: provider.name.clone(),
            client_secret,
            graph_url: config
                .graph_url
                .clone()
                .unwrap_or_else(|| DEFAULT_GRAPH_URL.to_string()),
            login_url: config
                .login_url
                .clone()
                .unwrap_or_else(|| DEFAULT_LOGIN_URL.to_string()),
            config,
            http,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() + ChronoDuration::seconds(60) {
                return Ok(token.token.clone());
            }
        }

        let response = self
            .http
            .post(format!(
                "{}/{}/oauth2/v2.0/token",
                self.login_url, self.config.tenant_id
            ))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", "https://graph.microsoft.com/.default"),
            ])
            .send()
            .await
            .map_err(classify_transport_failure)?;

        if !response.status().is_success() {
            let mut err = classify_http_failure(response).await;
            // a rejected token request is always a credential problem
            err.kind = super::ErrorKind::Auth;
            return Err(err);
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::transient(format!("token response: {e}")))?;
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            token: token.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(token.expires_in),
        });
        Ok(access_token)
    }

    fn payload(&self, envelope: &Envelope) -> serde_json::Value {
        let parsed = mail_parser::MessageParser::default().parse(&envelope.body);
        let (content_type, content) = match parsed.as_ref().and_then(|m| m.body_html(0)) {
            Some(html) => ("HTML", html.to_string()),
            None => (
                "Text",
                parsed
                    .as_ref()
                    .and_then(|m| m.body_text(0))
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| String::from_utf8_lossy(&envelope.body).to_string()),
            ),
        };
        json!({
            "message": {
                "subject": envelope.subject,
                "body": {"contentType": content_type, "content": content},
                "from": {"emailAddress": {"address": envelope.sender}},
                "toRecipients": envelope
                    .recipients
                    .iter()
                    .map(|r| json!({"emailAddress": {"address": r}}))
                    .collect::<Vec<_>>(),
            },
            "saveToSentItems": false,
        })
    }
}

#[async_trait]
impl EspClient for MsGraphClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: &Envelope) -> Result<DeliveryResult, ProviderError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!(
                "{}/v1.0/users/{}/sendMail",
                self.graph_url, self.config.sender
            ))
            .bearer_auth(token)
            .json(&self.payload(envelope))
            .send()
            .await
            .map_err(classify_transport_failure)?;

        if !response.status().is_success() {
            return Err(classify_http_failure(response).await);
        }

        Ok(DeliveryResult {
            provider_message_id: None,
            status: SendStatus::QueuedByProvider,
            timestamp: Utc::now(),
            metadata: json!({"response_code": response.status().as_u16()}),
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        self.access_token().await.map(|_| ())
    }
}
