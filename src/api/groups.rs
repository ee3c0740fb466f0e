use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::json;

use super::{ApiState, auth::AuthUser, error::{ApiError, ApiResult, ValidatedJson}};
use crate::models::{AuditEntry, Group, GroupId, MemberRole, Membership, NewGroup, UserId};

pub async fn create_group(
    State(state): State<ApiState>,
    auth: AuthUser,
    ValidatedJson(request): ValidatedJson<NewGroup>,
) -> Result<(StatusCode, Json<Group>), ApiError> {
    if request.name.is_empty() {
        return Err(ApiError::Validation("group name is required".into()));
    }

    let group = state.store.create_group(request).await?;
    state
        .store
        .add_member(group.id, auth.user.id, MemberRole::Owner)
        .await?;
    state
        .store
        .append_audit(
            AuditEntry::new(
                Some(group.id),
                &auth.user.email,
                "group.create",
                "group",
                group.id.to_string(),
            )
            .with_changes(json!({"name": group.name})),
        )
        .await
        .ok();
    Ok((StatusCode::CREATED, Json(group)))
}

pub async fn list_groups(State(state): State<ApiState>, auth: AuthUser) -> ApiResult<Vec<Group>> {
    let groups = state.store.list_groups().await?;
    if auth.is_system_admin(&state) {
        return Ok(Json(groups));
    }
    Ok(Json(
        groups
            .into_iter()
            .filter(|g| auth.is_member_of(g.id))
            .collect(),
    ))
}

pub async fn get_group(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path(id): Path<GroupId>,
) -> ApiResult<Group> {
    if !auth.can_read(&state, id) {
        return Err(ApiError::NotFound);
    }
    let group = state.store.group(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(group))
}

pub async fn delete_group(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path(id): Path<GroupId>,
) -> Result<StatusCode, ApiError> {
    let is_owner = auth
        .membership(id)
        .is_some_and(|m| m.role == MemberRole::Owner);
    if !is_owner && !auth.is_system_admin(&state) {
        return Err(ApiError::NotFound);
    }
    state.store.delete_group(id).await?;
    state
        .store
        .append_audit(AuditEntry::new(
            Some(id),
            &auth.user.email,
            "group.delete",
            "group",
            id.to_string(),
        ))
        .await
        .ok();
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AddMember {
    pub user_id: UserId,
    pub role: MemberRole,
}

pub async fn add_member(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path(id): Path<GroupId>,
    ValidatedJson(request): ValidatedJson<AddMember>,
) -> Result<StatusCode, ApiError> {
    if !auth.can_admin(&state, id) {
        return Err(ApiError::Forbidden);
    }
    state
        .store
        .add_member(id, request.user_id, request.role)
        .await?;
    state
        .store
        .append_audit(
            AuditEntry::new(
                Some(id),
                &auth.user.email,
                "group.member_add",
                "membership",
                request.user_id.to_string(),
            )
            .with_changes(json!({"role": request.role})),
        )
        .await
        .ok();
    Ok(StatusCode::CREATED)
}

pub async fn list_members(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path(id): Path<GroupId>,
) -> ApiResult<Vec<Membership>> {
    if !auth.can_read(&state, id) {
        return Err(ApiError::NotFound);
    }
    Ok(Json(state.store.members(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ChangeRole {
    pub role: MemberRole,
}

/// Role changes that would leave the group without an owner answer 409.
pub async fn change_member_role(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path((id, user_id)): Path<(GroupId, UserId)>,
    ValidatedJson(request): ValidatedJson<ChangeRole>,
) -> Result<StatusCode, ApiError> {
    if !auth.can_admin(&state, id) {
        return Err(ApiError::Forbidden);
    }
    state
        .store
        .change_member_role(id, user_id, request.role)
        .await?;
    state
        .store
        .append_audit(
            AuditEntry::new(
                Some(id),
                &auth.user.email,
                "group.member_role",
                "membership",
                user_id.to_string(),
            )
            .with_changes(json!({"role": request.role})),
        )
        .await
        .ok();
    Ok(StatusCode::OK)
}

pub async fn remove_member(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path((id, user_id)): Path<(GroupId, UserId)>,
) -> Result<StatusCode, ApiError> {
    if !auth.can_admin(&state, id) {
        return Err(ApiError::Forbidden);
    }
    state.store.remove_member(id, user_id).await?;
    state
        .store
        .append_audit(AuditEntry::new(
            Some(id),
            &auth.user.email,
            "group.member_remove",
            "membership",
            user_id.to_string(),
        ))
        .await
        .ok();
    Ok(StatusCode::NO_CONTENT)
}
