//! Amazon SES v2 SendEmail with the stored MIME as raw content. The SDK
//! performs SignatureV4 signing; credentials are frozen into the client at
//! construction.

use async_trait::async_trait;
use aws_sdk_sesv2::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_sesv2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sesv2::primitives::Blob;
use aws_sdk_sesv2::types::{Destination, EmailContent, RawMessage};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::{DeliveryResult, EspClient, ProviderError, SendStatus, config_error};
use crate::models::{Envelope, Provider};

#[derive(Debug, Deserialize)]
struct SesConfig {
    region: String,
    access_key_id: String,
}

pub struct SesClient {
    name: String,
    client: aws_sdk_sesv2::Client,
}

impl SesClient {
    pub fn new(provider: &Provider) -> Result<Self, ProviderError> {
        let secret = provider
            .api_key
            .clone()
            .ok_or_else(|| config_error("ses requires the secret access key in api_key"))?;
        let config: SesConfig = serde_json::from_value(provider.smtp_config.clone())
            .map_err(|e| config_error(format!("ses config: {e}")))?;

        let sdk_config = aws_sdk_sesv2::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(Credentials::new(
                config.access_key_id,
                secret,
                None,
                None,
                "mailbridge-provider",
            ))
            .build();

        Ok(Self {
            name: provider.name.clone(),
            client: aws_sdk_sesv2::Client::from_conf(sdk_config),
        })
    }

    fn classify<E, R>(err: SdkError<E, R>) -> ProviderError
    where
        E: ProvideErrorMetadata + std::fmt::Debug,
    {
        match &err {
            SdkError::ServiceError(ctx) => {
                let code = ctx.err().code().unwrap_or("unknown").to_string();
                let message = ctx
                    .err()
                    .message()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{:?}", ctx.err()));
                let message = format!("ses {code}: {message}");
                match code.as_str() {
                    "TooManyRequestsException" | "LimitExceededException" => {
                        ProviderError::rate_limited(message, None)
                    }
                    "BadRequestException"
                    | "MessageRejected"
                    | "MailFromDomainNotVerifiedException"
                    | "NotFoundException" => ProviderError::permanent(message),
                    "AccountSuspendedException" | "SendingPausedException" => {
                        ProviderError::auth(message)
                    }
                    _ => ProviderError::transient(message),
                }
            }
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                ProviderError::transient(format!("ses transport error: {err}"))
            }
            _ => ProviderError::permanent(format!("ses request error: {err}")),
        }
    }
}

#[async_trait]
impl EspClient for SesClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: &Envelope) -> Result<DeliveryResult, ProviderError> {
        let raw = RawMessage::builder()
            .data(Blob::new(envelope.body.clone()))
            .build()
            .map_err(|e| config_error(format!("raw message: {e}")))?;
        let destination = Destination::builder()
            .set_to_addresses(Some(envelope.recipients.clone()))
            .build();

        let output = self
            .client
            .send_email()
            .from_email_address(&envelope.sender)
            .destination(destination)
            .content(EmailContent::builder().raw(raw).build())
            .send()
            .await
            .map_err(Self::classify)?;

        Ok(DeliveryResult {
            provider_message_id: output.message_id,
            status: SendStatus::Sent,
            timestamp: Utc::now(),
            metadata: json!({"response_code": 200}),
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        self.client
            .get_account()
            .send()
            .await
            .map_err(Self::classify)?;
        Ok(())
    }
}
