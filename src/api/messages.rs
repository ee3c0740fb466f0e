use axum::{
    Json,
    extract::{Path, State},
};

use super::{ApiState, auth::AuthUser, error::{ApiError, ApiResult}};
use crate::models::{MessageId, MessageMetadata};

pub async fn list_messages(
    State(state): State<ApiState>,
    auth: AuthUser,
) -> ApiResult<Vec<MessageMetadata>> {
    let group = auth.group_context()?;
    if !auth.can_read(&state, group) {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(state.store.list_messages(group).await?))
}

pub async fn get_message(
    State(state): State<ApiState>,
    auth: AuthUser,
    Path(id): Path<MessageId>,
) -> ApiResult<MessageMetadata> {
    let message = state.store.message(id).await?.ok_or(ApiError::NotFound)?;
    if !auth.can_read(&state, message.group_id) {
        return Err(ApiError::NotFound);
    }
    Ok(Json(MessageMetadata::from(&message)))
}
