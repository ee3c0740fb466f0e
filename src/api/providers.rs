use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::json;

use super::{ApiState, auth::AuthUser, error::{ApiError, ApiResult, ValidatedJson}};
use crate::models::{AuditEntry, NewProvider, Provider, ProviderId, ProviderKind};

pub async fn create_provider(
    State(state): State<ApiState>,
    auth: AuthUser,
    ValidatedJson(request): ValidatedJson<NewProvider>,
) -> Result<(StatusCode, Json<Provider>), ApiError> {
    let group = auth.group_context()?;
    if !auth.can_admin(&state, group) {
        return Err(ApiError::Forbidden);
    }
    if request.name.is_empty() {
        return Err(ApiError::Validation("provider name is required".into()));
    }

    let provider = state.store.create_provider(group, request).await?;
    state
        .store
        .append_audit(
            AuditEntry::new(
                Some(group),
                &auth.user.email,
                "provider.create",
                "provider",
                provider.id.to_string(),
            )
            .with_changes(json!({"name": provider.name, "type": provider.kind.as_str()})),
        )
        .await
        .ok();
    Ok((StatusCode::CREATED, Json(provider)))
}

pub async fn list_providers(State(state): State<ApiState>, auth: AuthUser) -> ApiResult<Vec<Provider>> {
    let group = auth.group_context()?;
    if !auth.can_read(&state, group) {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(state.store.providers_for_group(group).await?))
}

pub async fn get_provider(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path(id): Path<ProviderId>,
) -> ApiResult<Provider> {
    let provider = state.store.provider(id).await?.ok_or(ApiError::NotFound)?;
    if !auth.can_read(&state, provider.group_id) {
        return Err(ApiError::NotFound);
    }
    Ok(Json(provider))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProvider {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<ProviderKind>,
    #[serde(default, with = "double_option")]
    pub api_key: Option<Option<String>>,
    pub smtp_config: Option<serde_json::Value>,
    pub enabled: Option<bool>,
}

/// Distinguishes an absent `api_key` field (keep) from an explicit null
/// (clear).
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Some(Option::deserialize(de)?))
    }
}

pub async fn update_provider(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path(id): Path<ProviderId>,
    ValidatedJson(request): ValidatedJson<UpdateProvider>,
) -> ApiResult<Provider> {
    let mut provider = state.store.provider(id).await?.ok_or(ApiError::NotFound)?;
    if !auth.can_admin(&state, provider.group_id) {
        return Err(ApiError::NotFound);
    }

    if let Some(name) = request.name {
        provider.name = name;
    }
    if let Some(kind) = request.kind {
        provider.kind = kind;
    }
    if let Some(api_key) = request.api_key {
        provider.api_key = api_key;
    }
    if let Some(config) = request.smtp_config {
        provider.smtp_config = config;
    }
    if let Some(enabled) = request.enabled {
        provider.enabled = enabled;
    }

    state.store.update_provider(&provider).await?;
    state
        .store
        .append_audit(AuditEntry::new(
            Some(provider.group_id),
            &auth.user.email,
            "provider.update",
            "provider",
            provider.id.to_string(),
        ))
        .await
        .ok();
    Ok(Json(provider))
}

pub async fn delete_provider(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path(id): Path<ProviderId>,
) -> Result<StatusCode, ApiError> {
    let provider = state.store.provider(id).await?.ok_or(ApiError::NotFound)?;
    if !auth.can_admin(&state, provider.group_id) {
        return Err(ApiError::NotFound);
    }
    state.store.delete_provider(provider.group_id, id).await?;
    state
        .store
        .append_audit(AuditEntry::new(
            Some(provider.group_id),
            &auth.user.email,
            "provider.delete",
            "provider",
            id.to_string(),
        ))
        .await
        .ok();
    Ok(StatusCode::NO_CONTENT)
}
