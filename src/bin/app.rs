use anyhow::Context;
use mailbridge::{
    api::WebhookSecrets,
    bootstrap,
    config::{HealthConfig, JwtConfig, QueueConfig, RetryConfig, WorkerConfig},
    providers::DefaultEspFactory,
    run_api_server, run_gateway, shutdown_signal,
    smtp::SmtpConfig,
    store::{PgStore, Store},
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::ConnectOptions;
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    mailbridge::init_tracing();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set")?
        .parse()
        .context("DATABASE_URL must be a valid URL")?;
    let db_options = PgConnectOptions::from_url(&database_url)?.application_name("mailbridge");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let pg = PgStore::new(pool);
    pg.migrate().await.context("failed to run migrations")?;
    let store: Arc<dyn Store> = Arc::new(pg);
    bootstrap(&store).await.context("failed to seed the system group")?;

    let http_port: u16 = std::env::var("MAILBRIDGE_HTTP_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let http_socket = SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), http_port);

    let shutdown = CancellationToken::new();

    run_gateway(
        store.clone(),
        SmtpConfig::from_env(),
        WorkerConfig::from_env(),
        RetryConfig::from_env(),
        QueueConfig::from_env(),
        HealthConfig::from_env(),
        Arc::new(DefaultEspFactory::new()),
        shutdown.clone(),
    );
    run_api_server(
        store,
        http_socket.into(),
        JwtConfig::from_env(),
        WebhookSecrets::from_env(),
        shutdown.clone(),
    )
    .await;

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    // give the pool and the SMTP listener time to drain
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
