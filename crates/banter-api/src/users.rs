use axum::{Extension, Json, extract::State};

use banter_hub::blocking;
use banter_types::api::{AuthenticatedSession, UserSummary};
use banter_types::models::{UnreadCounts, User};

use crate::auth::AppState;
use crate::error::ApiError;

/// Everyone but the caller, online first, then by display name.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(session): Extension<AuthenticatedSession>,
) -> Result<Json<Vec<UserSummary>>, ApiError> {
    let me = session.user_id.to_string();
    let users = blocking(state.hub.db(), move |db| {
        db.list_users_except(&me)?
            .into_iter()
            .map(User::try_from)
            .collect::<anyhow::Result<Vec<_>>>()
    })
    .await?;

    let presence = state.hub.presence();
    let mut summaries: Vec<UserSummary> = users
        .into_iter()
        .map(|user| UserSummary {
            is_online: presence.is_online(user.id),
            id: user.id,
            username: user.username,
            display_name: user.display_name,
            last_seen: user.last_seen,
        })
        .collect();

    // The stored flag may lag the registry, so re-sort on the live value
    summaries.sort_by(|a, b| {
        b.is_online
            .cmp(&a.is_online)
            .then_with(|| a.display_name.cmp(&b.display_name))
    });

    Ok(Json(summaries))
}

pub async fn unread_counts(
    State(state): State<AppState>,
    Extension(session): Extension<AuthenticatedSession>,
) -> Result<Json<UnreadCounts>, ApiError> {
    let counts = state.hub.unread().get_counts(session.user_id).await?;
    Ok(Json(counts))
}
