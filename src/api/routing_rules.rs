use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::json;

use super::{ApiState, auth::AuthUser, error::{ApiError, ApiResult, ValidatedJson}};
use crate::models::{AuditEntry, NewRoutingRule, ProviderId, RoutingRule, RuleConditions, RuleId};

pub async fn create_rule(
    State(state): State<ApiState>,
    auth: AuthUser,
    ValidatedJson(request): ValidatedJson<NewRoutingRule>,
) -> Result<(StatusCode, Json<RoutingRule>), ApiError> {
    let group = auth.group_context()?;
    if !auth.can_admin(&state, group) {
        return Err(ApiError::Forbidden);
    }

    let rule = state.store.create_rule(group, request).await?;
    state
        .store
        .append_audit(
            AuditEntry::new(
                Some(group),
                &auth.user.email,
                "routing_rule.create",
                "routing_rule",
                rule.id.to_string(),
            )
            .with_changes(json!({"priority": rule.priority, "provider_id": rule.provider_id})),
        )
        .await
        .ok();
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn list_rules(State(state): State<ApiState>, auth: AuthUser) -> ApiResult<Vec<RoutingRule>> {
    let group = auth.group_context()?;
    if !auth.can_read(&state, group) {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(state.store.rules_for_group(group).await?))
}

pub async fn get_rule(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path(id): Path<RuleId>,
) -> ApiResult<RoutingRule> {
    let rule = state.store.rule(id).await?.ok_or(ApiError::NotFound)?;
    if !auth.can_read(&state, rule.group_id) {
        return Err(ApiError::NotFound);
    }
    Ok(Json(rule))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRule {
    pub priority: Option<i32>,
    pub conditions: Option<RuleConditions>,
    pub provider_id: Option<ProviderId>,
    pub enabled: Option<bool>,
}

pub async fn update_rule(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path(id): Path<RuleId>,
    ValidatedJson(request): ValidatedJson<UpdateRule>,
) -> ApiResult<RoutingRule> {
    let mut rule = state.store.rule(id).await?.ok_or(ApiError::NotFound)?;
    if !auth.can_admin(&state, rule.group_id) {
        return Err(ApiError::NotFound);
    }

    if let Some(priority) = request.priority {
        rule.priority = priority;
    }
    if let Some(conditions) = request.conditions {
        rule.conditions = conditions;
    }
    if let Some(provider_id) = request.provider_id {
        rule.provider_id = provider_id;
    }
    if let Some(enabled) = request.enabled {
        rule.enabled = enabled;
    }

    state.store.update_rule(&rule).await?;
    state
        .store
        .append_audit(AuditEntry::new(
            Some(rule.group_id),
            &auth.user.email,
            "routing_rule.update",
            "routing_rule",
            rule.id.to_string(),
        ))
        .await
        .ok();
    Ok(Json(rule))
}

pub async fn delete_rule(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path(id): Path<RuleId>,
) -> Result<StatusCode, ApiError> {
    let rule = state.store.rule(id).await?.ok_or(ApiError::NotFound)?;
    if !auth.can_admin(&state, rule.group_id) {
        return Err(ApiError::NotFound);
    }
    state.store.delete_rule(rule.group_id, id).await?;
    state
        .store
        .append_audit(AuditEntry::new(
            Some(rule.group_id),
            &auth.user.email,
            "routing_rule.delete",
            "routing_rule",
            id.to_string(),
        ))
        .await
        .ok();
    Ok(StatusCode::NO_CONTENT)
}
