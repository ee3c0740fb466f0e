use std::sync::Arc;
use tokio::{signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod delivery;
pub mod models;
pub mod providers;
pub mod reconcile;
pub mod routing;
pub mod smtp;
pub mod store;

#[cfg(test)]
mod test;

use crate::api::{ApiServer, WebhookSecrets};
use crate::config::{HealthConfig, JwtConfig, QueueConfig, RetryConfig, WorkerConfig};
use crate::delivery::DeliveryWorkerPool;
use crate::models::{AccountType, AuditEntry, MemberRole, NewGroup, NewUser, SYSTEM_GROUP};
use crate::providers::EspFactory;
use crate::routing::HealthChecker;
use crate::smtp::{SmtpConfig, SmtpServer};
use crate::store::{Store, StoreResult};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,tower_http=info,info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Seeds the system group and its owner on first start. Credentials may be
/// overridden via `MAILBRIDGE_SYSTEM_OWNER_EMAIL` /
/// `MAILBRIDGE_SYSTEM_OWNER_PASSWORD`.
pub async fn bootstrap(store: &Arc<dyn Store>) -> StoreResult<()> {
    if store.group_by_name(SYSTEM_GROUP).await?.is_some() {
        return Ok(());
    }

    let email = std::env::var("MAILBRIDGE_SYSTEM_OWNER_EMAIL")
        .unwrap_or_else(|_| "admin@localhost".to_string());
    let password = std::env::var("MAILBRIDGE_SYSTEM_OWNER_PASSWORD").unwrap_or_else(|_| {
        warn!("MAILBRIDGE_SYSTEM_OWNER_PASSWORD not set, using the default; change it");
        "changeme".to_string()
    });

    let group = store
        .create_group(NewGroup {
            name: SYSTEM_GROUP.to_string(),
            monthly_limit: 1_000_000,
            allow_any_sender: false,
            fallback_providers: vec![],
        })
        .await?;
    let owner = store
        .create_user(NewUser {
            email: email.clone(),
            username: None,
            password,
            account_type: AccountType::User,
            group_id: None,
            allowed_domains: vec![],
        })
        .await?;
    store.add_member(group.id, owner.id, MemberRole::Owner).await?;
    store
        .append_audit(AuditEntry::new(
            Some(group.id),
            "bootstrap",
            "group.bootstrap",
            "group",
            group.id.to_string(),
        ))
        .await?;

    info!(owner = email, "seeded the system group");
    Ok(())
}

/// Message path: SMTP ingress plus the delivery worker pool.
pub fn run_gateway(
    store: Arc<dyn Store>,
    smtp_config: SmtpConfig,
    worker_config: WorkerConfig,
    retry_config: RetryConfig,
    queue_config: QueueConfig,
    health_config: HealthConfig,
    esp: Arc<dyn EspFactory>,
    shutdown: CancellationToken,
) {
    let health = Arc::new(HealthChecker::new(health_config));

    SmtpServer::new(store.clone(), Arc::new(smtp_config), shutdown.clone()).spawn();
    DeliveryWorkerPool::new(
        store,
        health,
        esp,
        worker_config,
        retry_config,
        queue_config,
        shutdown,
    )
    .spawn();
}

pub async fn run_api_server(
    store: Arc<dyn Store>,
    socket: std::net::SocketAddr,
    jwt_config: JwtConfig,
    webhook_secrets: WebhookSecrets,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    ApiServer::new(socket, store, jwt_config, webhook_secrets, shutdown)
        .await
        .spawn()
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
