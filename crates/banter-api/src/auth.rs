use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::debug;

use banter_hub::Hub;
use banter_types::api::{AuthenticatedSession, Claims};

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub hub: Hub,
    pub jwt_secret: String,
}

/// Validate an HS256 token and build the session it stands for.
pub fn decode_session(jwt_secret: &str, token: &str) -> Option<AuthenticatedSession> {
    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => Some(AuthenticatedSession::from(data.claims)),
        Err(e) => {
            debug!("Rejected token: {}", e);
            None
        }
    }
}

/// Resolve the bearer token once and hand the session to the handler.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let TypedHeader(auth) = bearer.ok_or(ApiError::Unauthorized)?;
    let session = decode_session(&state.jwt_secret, auth.token()).ok_or(ApiError::Unauthorized)?;

    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}
