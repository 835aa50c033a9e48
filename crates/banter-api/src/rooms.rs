use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};

use banter_hub::blocking;
use banter_hub::rooms::validate_room_id;
use banter_types::api::{AuthenticatedSession, GroupMessageResponse, HistoryQuery, MarkReadResponse};
use banter_types::models::{GroupMessage, clock_label};

use crate::auth::AppState;
use crate::error::ApiError;

const MAX_HISTORY: u32 = 200;

/// Room history, paged backwards by message id.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    Extension(_session): Extension<AuthenticatedSession>,
) -> Result<Json<Vec<GroupMessageResponse>>, ApiError> {
    validate_room_id(&room_id, state.hub.config().max_room_id_len)?;

    let limit = query.limit.clamp(1, MAX_HISTORY);
    let before = query.before;
    let messages = blocking(state.hub.db(), move |db| {
        db.get_room_messages(&room_id, limit, before)?
            .into_iter()
            .map(GroupMessage::try_from)
            .collect::<anyhow::Result<Vec<_>>>()
    })
    .await?;

    let messages = messages
        .into_iter()
        .map(|m| GroupMessageResponse {
            time: clock_label(&m.timestamp),
            id: m.id,
            sender_id: m.sender_id,
            sender_name: m.sender_name,
            text: m.text,
            room_id: m.room_id,
            timestamp: m.timestamp,
        })
        .collect();

    Ok(Json(messages))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Extension(session): Extension<AuthenticatedSession>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let count = state
        .hub
        .receipts()
        .mark_room_read(session.user_id, &room_id)
        .await?;

    if count > 0 {
        state.hub.push_unread_counts(session.user_id).await?;
    }

    Ok(Json(MarkReadResponse { success: true, count }))
}
