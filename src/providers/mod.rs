//! Outbound ESP adapters. Each adapter freezes its configuration at
//! construction and maps transport/HTTP outcomes onto the shared error
//! classification; rotation of credentials requires re-construction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::{DeliveryState, Envelope, Provider, ProviderKind};

pub mod mailgun;
pub mod msgraph;
pub mod sendgrid;
pub mod ses;
pub mod smtp_relay;

#[cfg(test)]
pub mod mock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry with backoff.
    Transient,
    /// Straight to the DLQ.
    Permanent,
    /// Permanent, and worth an alert: credentials are broken.
    Auth,
    /// Transient, honoring Retry-After when the provider sent one.
    RateLimited,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
    pub response_code: Option<i32>,
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
            response_code: None,
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
            response_code: None,
            retry_after: None,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Auth,
            message: message.into(),
            response_code: None,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            message: message.into(),
            response_code: None,
            retry_after,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.response_code = Some(code);
        self
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient | ErrorKind::RateLimited)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    QueuedByProvider,
}

impl From<SendStatus> for DeliveryState {
    fn from(status: SendStatus) -> Self {
        match status {
            SendStatus::Sent => DeliveryState::Sent,
            SendStatus::QueuedByProvider => DeliveryState::QueuedByProvider,
        }
    }
}

/// Successful hand-off to a provider. A missing `provider_message_id` means
/// the provider gave no acknowledgement id.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub provider_message_id: Option<String>,
    pub status: SendStatus,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl DeliveryResult {
    pub fn response_code(&self) -> Option<i32> {
        self.metadata
            .get("response_code")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
    }
}

#[async_trait]
pub trait EspClient: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, envelope: &Envelope) -> Result<DeliveryResult, ProviderError>;
    async fn health_check(&self) -> Result<(), ProviderError>;
}

/// Seam between the worker pool and the concrete adapters, so tests can
/// substitute a scriptable ESP.
pub trait EspFactory: Send + Sync {
    fn build(&self, provider: &Provider) -> Result<Arc<dyn EspClient>, ProviderError>;
}

/// Builds real adapters; one shared HTTP client feeds every constructed
/// adapter.
pub struct DefaultEspFactory {
    http: reqwest::Client,
}

impl DefaultEspFactory {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for DefaultEspFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EspFactory for DefaultEspFactory {
    fn build(&self, provider: &Provider) -> Result<Arc<dyn EspClient>, ProviderError> {
        Ok(match provider.kind {
            ProviderKind::Sendgrid => {
                Arc::new(sendgrid::SendGridClient::new(provider, self.http.clone())?)
            }
            ProviderKind::Mailgun => {
                Arc::new(mailgun::MailgunClient::new(provider, self.http.clone())?)
            }
            ProviderKind::Ses => Arc::new(ses::SesClient::new(provider)?),
            ProviderKind::Smtp => Arc::new(smtp_relay::SmtpRelayClient::new(provider)?),
            ProviderKind::Msgraph => {
                Arc::new(msgraph::MsGraphClient::new(provider, self.http.clone())?)
            }
        })
    }
}

/// Shared HTTP classification: 2xx is success even with an empty body, 429
/// respects Retry-After, 5xx retries, remaining 4xx are final.
pub(crate) async fn classify_http_failure(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(http::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(512).collect();
    let message = format!("provider answered {status}: {snippet}");
    let code = status.as_u16() as i32;

    match status.as_u16() {
        401 | 403 => ProviderError::auth(message).with_code(code),
        429 => ProviderError::rate_limited(message, retry_after).with_code(code),
        s if s >= 500 => ProviderError::transient(message).with_code(code),
        _ => ProviderError::permanent(message).with_code(code),
    }
}

pub(crate) fn classify_transport_failure(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() {
        ProviderError::transient(format!("transport error: {err}"))
    } else if err.is_builder() || err.is_request() {
        ProviderError::permanent(format!("malformed request: {err}"))
    } else {
        ProviderError::transient(format!("transport error: {err}"))
    }
}

pub(crate) fn config_error(message: impl Into<String>) -> ProviderError {
    ProviderError::permanent(format!("provider misconfigured: {}", message.into()))
}
