use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::GroupId;
use crate::smtp::ratelimit::AuthRateLimiter;
use crate::store::Store;

mod auth;
mod dlq;
mod error;
mod groups;
mod messages;
mod providers;
mod routing_rules;
mod users;
mod webhooks;

pub use auth::{AuthUser, JwtKeys, RevokedTokens, TokenPair};
pub use error::{ApiError, ApiResult};
pub use webhooks::WebhookSecrets;

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("failed to bind to address: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub jwt: Arc<JwtKeys>,
    pub revoked: Arc<RevokedTokens>,
    pub login_limiter: Arc<AuthRateLimiter>,
    pub webhook_secrets: Arc<WebhookSecrets>,
    /// Resolved at startup so authorization checks do not re-read it.
    pub system_group: Option<GroupId>,
}

pub struct ApiServer {
    router: Router,
    socket: SocketAddr,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub async fn new(
        socket: SocketAddr,
        store: Arc<dyn Store>,
        jwt_config: JwtConfig,
        webhook_secrets: WebhookSecrets,
        shutdown: CancellationToken,
    ) -> ApiServer {
        let system_group = store
            .group_by_name(crate::models::SYSTEM_GROUP)
            .await
            .ok()
            .flatten()
            .map(|g| g.id);

        let state = ApiState {
            store,
            jwt: Arc::new(JwtKeys::new(jwt_config)),
            revoked: Arc::new(RevokedTokens::default()),
            login_limiter: Arc::new(AuthRateLimiter::default()),
            webhook_secrets: Arc::new(webhook_secrets),
            system_group,
        };

        let api = Router::new()
            .route("/auth/login", post(auth::login))
            .route("/auth/refresh", post(auth::refresh))
            .route("/auth/logout", post(auth::logout))
            .route(
                "/providers",
                post(providers::create_provider).get(providers::list_providers),
            )
            .route(
                "/providers/{id}",
                get(providers::get_provider)
                    .put(providers::update_provider)
                    .delete(providers::delete_provider),
            )
            .route(
                "/routing-rules",
                post(routing_rules::create_rule).get(routing_rules::list_rules),
            )
            .route(
                "/routing-rules/{id}",
                get(routing_rules::get_rule)
                    .put(routing_rules::update_rule)
                    .delete(routing_rules::delete_rule),
            )
            .route("/groups", post(groups::create_group).get(groups::list_groups))
            .route(
                "/groups/{id}",
                get(groups::get_group).delete(groups::delete_group),
            )
            .route(
                "/groups/{id}/members",
                post(groups::add_member).get(groups::list_members),
            )
            .route(
                "/groups/{id}/members/{user_id}",
                axum::routing::patch(groups::change_member_role).delete(groups::remove_member),
            )
            .route("/users", post(users::create_user))
            .route("/messages", get(messages::list_messages))
            .route("/messages/{id}", get(messages::get_message))
            .route("/dlq", get(dlq::list_dlq))
            .route("/dlq/reprocess", post(dlq::reprocess))
            .route("/webhooks/sendgrid", post(webhooks::sendgrid))
            .route("/webhooks/ses", post(webhooks::ses))
            .route("/webhooks/mailgun", post(webhooks::mailgun));

        let router = Router::new()
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .nest("/api/v1", api)
            .layer((
                TraceLayer::new_for_http(),
                TimeoutLayer::new(Duration::from_secs(15)),
                CatchPanicLayer::new(),
                middleware::from_fn(correlation_id),
            ))
            .with_state(state);

        ApiServer {
            router,
            socket,
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), ApiServerError> {
        let listener = TcpListener::bind(self.socket)
            .await
            .map_err(ApiServerError::Bind)?;

        info!("api server listening on {}", self.socket);

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(wait_for_shutdown(self.shutdown))
        .await
        .map_err(ApiServerError::Serve)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async {
            let token = self.shutdown.clone();
            if let Err(e) = self.serve().await {
                error!("api server error: {e:?}");
                token.cancel();
            }
        })
    }
}

async fn wait_for_shutdown(token: CancellationToken) {
    token.cancelled().await;
}

/// Echoes `X-Correlation-ID`, minting one when the request lacks it.
async fn correlation_id(request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(request).await;
    let value = HeaderValue::from_str(&id)
        .unwrap_or_else(|_| HeaderValue::from_static("invalid-correlation-id"));
    response.headers_mut().insert("X-Correlation-ID", value);
    response
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn readyz(State(state): State<ApiState>) -> Response {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ready"}))).into_response(),
        Err(e) => {
            error!("readiness probe failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [(http::header::RETRY_AFTER, "5")],
                Json(json!({"status": "unavailable"})),
            )
                .into_response()
        }
    }
}
