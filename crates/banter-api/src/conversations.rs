use std::cmp::Reverse;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use uuid::Uuid;

use banter_hub::{HubError, blocking};
use banter_types::api::{
    AuthenticatedSession, ConversationSummary, MarkReadResponse, PageQuery, PrivateMessageResponse,
};
use banter_types::models::{PrivateMessage, User};

use crate::auth::AppState;
use crate::error::ApiError;

const MAX_PAGE_SIZE: u32 = 100;
const PREVIEW_CHARS: usize = 50;

/// Chat list: one row per other user, most recent conversation first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(session): Extension<AuthenticatedSession>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let me = session.user_id.to_string();
    let rows = blocking(state.hub.db(), move |db| {
        let mut rows = Vec::new();
        for row in db.list_users_except(&me)? {
            let last = db
                .last_message_between(&me, &row.id)?
                .map(PrivateMessage::try_from)
                .transpose()?;
            let unread = db.count_private_unread_from(&me, &row.id)?;
            rows.push((User::try_from(row)?, last, unread));
        }
        Ok(rows)
    })
    .await?;

    let presence = state.hub.presence();
    let mut summaries: Vec<ConversationSummary> = rows
        .into_iter()
        .map(|(user, last, unread_count)| ConversationSummary {
            is_online: presence.is_online(user.id),
            user_id: user.id,
            display_name: user.display_name,
            last_seen: user.last_seen,
            last_message: last.as_ref().map(|m| preview(&m.text)),
            last_message_time: last.map(|m| m.timestamp),
            unread_count,
        })
        .collect();

    // Newest conversation first; users never talked to go last, by name
    summaries.sort_by(|a, b| {
        Reverse(a.last_message_time)
            .cmp(&Reverse(b.last_message_time))
            .then_with(|| a.display_name.cmp(&b.display_name))
    });

    Ok(Json(summaries))
}

/// One page of the conversation with `user_id`, oldest first.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
    Extension(session): Extension<AuthenticatedSession>,
) -> Result<Json<Vec<PrivateMessageResponse>>, ApiError> {
    let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);
    let offset = query.page.max(1).saturating_sub(1).saturating_mul(page_size);

    let me = session.user_id.to_string();
    let other = user_id.to_string();
    let rows = blocking(state.hub.db(), move |db| {
        if !db.user_exists(&other)? {
            return Ok(None);
        }
        let rows = db
            .get_conversation(&me, &other, page_size, offset)?
            .into_iter()
            .map(|row| {
                let sender_name = row.sender_name.clone();
                PrivateMessage::try_from(row).map(|m| (m, sender_name))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Some(rows))
    })
    .await?
    .ok_or(HubError::UnknownRecipient(user_id))?;

    let messages = rows
        .into_iter()
        .map(|(m, sender_name)| PrivateMessageResponse {
            is_own_message: m.sender_id == session.user_id,
            id: m.id,
            sender_id: m.sender_id,
            receiver_id: m.receiver_id,
            sender_name,
            text: m.text,
            timestamp: m.timestamp,
            is_read: m.is_read,
            read_at: m.read_at,
        })
        .collect();

    Ok(Json(messages))
}

/// Mark everything `user_id` sent to the caller as read.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(session): Extension<AuthenticatedSession>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let count = state
        .hub
        .receipts()
        .mark_conversation_read(session.user_id, user_id)
        .await?;

    if count > 0 {
        state.hub.push_unread_counts(session.user_id).await?;
    }

    Ok(Json(MarkReadResponse { success: true, count }))
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{}...", cut)
}
