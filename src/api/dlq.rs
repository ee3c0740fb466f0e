use axum::{Json, extract::State};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{ApiState, auth::AuthUser, error::{ApiError, ApiResult, ValidatedJson}};
use crate::models::{AuditEntry, DlqEntry, MessageId, NewMessage};

pub async fn list_dlq(State(state): State<ApiState>, auth: AuthUser) -> ApiResult<Vec<DlqEntry>> {
    let group = auth.group_context()?;
    if !auth.can_read(&state, group) {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(state.store.list_dlq(group).await?))
}

#[derive(Debug, Deserialize)]
pub struct ReprocessRequest {
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Serialize)]
pub struct ReprocessResponse {
    pub reprocessed: usize,
    pub total: usize,
}

/// Re-injects DLQ envelopes as fresh queued messages. Per-entry failures
/// are logged and reported through the count, never aborting the batch.
pub async fn reprocess(
    State(state): State<ApiState>,
    auth: AuthUser,
    ValidatedJson(request): ValidatedJson<ReprocessRequest>,
) -> ApiResult<ReprocessResponse> {
    let group = auth.group_context()?;
    if !auth.can_admin(&state, group) {
        return Err(ApiError::Forbidden);
    }
    if request.message_ids.is_empty() {
        return Err(ApiError::Validation("message_ids must not be empty".into()));
    }

    let total = request.message_ids.len();
    let mut reprocessed = 0;

    for message_id in request.message_ids {
        let entry = match state.store.dlq_entry_for_message(group, message_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                warn!(message_id = %message_id, "no DLQ entry for message");
                continue;
            }
            Err(e) => {
                warn!(message_id = %message_id, "DLQ lookup failed: {e}");
                continue;
            }
        };

        // the payload is self-sufficient: a new message is born with a
        // fresh id, retry_count 0 and an immediate next attempt
        let enqueued = state
            .store
            .enqueue(NewMessage {
                group_id: entry.group_id,
                envelope: entry.payload.envelope.clone(),
            })
            .await;
        match enqueued {
            Ok(new_id) => {
                if let Err(e) = state.store.remove_dlq(entry.id).await {
                    warn!(message_id = %message_id, "failed to drop DLQ entry: {e}");
                }
                info!(
                    original = %message_id,
                    requeued = %new_id,
                    "reprocessed DLQ entry"
                );
                reprocessed += 1;
            }
            Err(e) => {
                warn!(message_id = %message_id, "failed to re-enqueue: {e}");
            }
        }
    }

    state
        .store
        .append_audit(
            AuditEntry::new(Some(group), &auth.user.email, "dlq.reprocess", "dlq", "")
                .with_changes(json!({"reprocessed": reprocessed, "total": total, "at": Utc::now()})),
        )
        .await
        .ok();

    Ok(Json(ReprocessResponse { reprocessed, total }))
}
