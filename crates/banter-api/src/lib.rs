//! REST surface over the hub: history, chat list, bulk reads and badges.

pub mod auth;
pub mod conversations;
pub mod error;
pub mod rooms;
pub mod users;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::auth::{AppState, require_auth};

/// Every route here requires a bearer token.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/users", get(users::list_users))
        .route("/unread", get(users::unread_counts))
        .route("/rooms/{room_id}/messages", get(rooms::get_messages))
        .route("/rooms/{room_id}/read", post(rooms::mark_read))
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/{user_id}/messages", get(conversations::get_messages))
        .route("/conversations/{user_id}/read", post(conversations::mark_read))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}
