use axum::{
    Json,
    extract::{FromRequest, Request},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

use crate::store::StoreError;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// `Json` with the rejection downgraded to a plain 400: malformed bodies
/// are validation errors, not 422s.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => Err(ApiError::Validation(rejection.body_text())),
        }
    }
}

/// Error taxonomy of the control plane. Every variant surfaces as a fixed,
/// canonical string; internal error text never crosses the boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("too many requests")]
    RateLimited { retry_after_secs: u64 },
    #[error("internal error")]
    Internal,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict | StoreError::LastOwner => ApiError::Conflict,
            StoreError::NotFound(_) => ApiError::NotFound,
            StoreError::ForeignKeyViolation => {
                ApiError::Validation("referenced resource does not exist in this tenant".into())
            }
            StoreError::Database(e) => {
                error!("database error: {e}");
                ApiError::Internal
            }
            StoreError::Serialization(e) => {
                error!("serialization error: {e}");
                ApiError::Internal
            }
            StoreError::Internal(e) => {
                error!("store error: {e}");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        debug!("request failed: {self}");

        let (status, message) = match &self {
            ApiError::Validation(message) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": message})),
                )
                    .into_response();
            }
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found"),
            ApiError::Conflict => (StatusCode::CONFLICT, "conflict"),
            ApiError::RateLimited { retry_after_secs } => {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(http::header::RETRY_AFTER, retry_after_secs.to_string())],
                    Json(json!({"error": "too many requests"})),
                )
                    .into_response();
            }
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        };

        (status, Json(json!({"error": message}))).into_response()
    }
}
