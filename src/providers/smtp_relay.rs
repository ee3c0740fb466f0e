//! Plain SMTP relay over TLS to a configured upstream, via mail-send. The
//! relay gives no acknowledgement id; webhook correlation does not apply.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{DeliveryResult, EspClient, ProviderError, SendStatus, config_error};
use crate::models::{Envelope, Provider};

#[derive(Debug, Clone, Deserialize)]
struct RelayConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    implicit_tls: bool,
    #[serde(default)]
    allow_invalid_certs: bool,
}

fn default_port() -> u16 {
    587
}

pub struct SmtpRelayClient {
    name: String,
    config: RelayConfig,
}

impl SmtpRelayClient {
    pub fn new(provider: &Provider) -> Result<Self, ProviderError> {
        let config: RelayConfig = serde_json::from_value(provider.smtp_config.clone())
            .map_err(|e| config_error(format!("smtp relay config: {e}")))?;
        Ok(Self {
            name: provider.name.clone(),
            config,
        })
    }

    fn builder(&self) -> mail_send::SmtpClientBuilder<String> {
        let mut builder =
            mail_send::SmtpClientBuilder::new(self.config.host.clone(), self.config.port)
                .implicit_tls(self.config.implicit_tls)
                .timeout(Duration::from_secs(30));
        if self.config.allow_invalid_certs {
            builder = builder.allow_invalid_certs();
        }
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            builder = builder.credentials((user.clone(), pass.clone()));
        }
        builder
    }

    fn classify(err: mail_send::Error) -> ProviderError {
        match err {
            mail_send::Error::AuthenticationFailed(response) => {
                ProviderError::auth(format!("relay rejected credentials: {}", response.message))
                    .with_code(response.code as i32)
            }
            mail_send::Error::UnexpectedReply(response) => {
                let code = response.code as i32;
                let message = format!("relay answered {}: {}", response.code, response.message);
                if response.severity() == smtp_proto::Severity::TransientNegativeCompletion {
                    ProviderError::transient(message).with_code(code)
                } else {
                    ProviderError::permanent(message).with_code(code)
                }
            }
            mail_send::Error::Io(_)
            | mail_send::Error::Tls(_)
            | mail_send::Error::Base64(_)
            | mail_send::Error::UnparseableReply
            | mail_send::Error::InvalidTLSName
            | mail_send::Error::Timeout => ProviderError::transient(format!("relay error: {err}")),
            _ => ProviderError::permanent(format!("relay error: {err}")),
        }
    }
}

#[async_trait]
impl EspClient for SmtpRelayClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: &Envelope) -> Result<DeliveryResult, ProviderError> {
        let message = mail_send::smtp::message::Message {
            mail_from: envelope.sender.clone().into(),
            rcpt_to: envelope
                .recipients
                .iter()
                .map(|r| r.clone().into())
                .collect(),
            body: envelope.body.as_slice().into(),
        };

        let mut client = self.builder().connect().await.map_err(Self::classify)?;
        let result = client.send(message).await;
        client.quit().await.ok();
        result.map_err(Self::classify)?;

        Ok(DeliveryResult {
            provider_message_id: None,
            status: SendStatus::Sent,
            timestamp: Utc::now(),
            metadata: json!({"response_code": 250}),
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let client = self.builder().connect().await.map_err(Self::classify)?;
        client.quit().await.ok();
        Ok(())
    }
}
