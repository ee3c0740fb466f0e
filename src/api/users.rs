use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use super::{ApiState, auth::AuthUser, error::{ApiError, ValidatedJson}};
use crate::models::{AccountType, AuditEntry, NewUser, UserId, UserStatus};

/// Creation response; the api_key of an smtp account is only ever shown
/// here.
#[derive(Debug, Serialize)]
pub struct CreatedUser {
    pub id: UserId,
    pub email: String,
    pub username: Option<String>,
    pub account_type: AccountType,
    pub status: UserStatus,
    pub api_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub async fn create_user(
    State(state): State<ApiState>,
    auth: AuthUser,
    ValidatedJson(request): ValidatedJson<NewUser>,
) -> Result<(StatusCode, Json<CreatedUser>), ApiError> {
    if request.email.is_empty() || request.password.is_empty() {
        return Err(ApiError::Validation("email and password are required".into()));
    }
    match (request.account_type, request.group_id) {
        (AccountType::Smtp, None) => {
            return Err(ApiError::Validation(
                "smtp accounts must be bound to a group".into(),
            ));
        }
        (AccountType::Smtp, Some(group)) => {
            if !auth.can_admin(&state, group) {
                return Err(ApiError::Forbidden);
            }
        }
        (AccountType::User, Some(group)) => {
            if !auth.can_admin(&state, group) {
                return Err(ApiError::Forbidden);
            }
        }
        (AccountType::User, None) => {
            if !auth.is_system_admin(&state) {
                return Err(ApiError::Forbidden);
            }
        }
    }

    let group = request.group_id;
    let user = state.store.create_user(request).await?;
    state
        .store
        .append_audit(
            AuditEntry::new(
                group,
                &auth.user.email,
                "user.create",
                "user",
                user.id.to_string(),
            )
            .with_changes(json!({"email": user.email, "account_type": user.account_type})),
        )
        .await
        .ok();

    Ok((
        StatusCode::CREATED,
        Json(CreatedUser {
            id: user.id,
            email: user.email,
            username: user.username,
            account_type: user.account_type,
            status: user.status,
            api_key: user.api_key,
            created_at: user.created_at,
        }),
    ))
}
