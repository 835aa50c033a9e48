use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use banter_api::auth::{AppState, AppStateInner, decode_session};
use banter_api::error::ApiError;
use banter_hub::connection::handle_connection;
use banter_hub::{Hub, HubConfig};

/// Secrets that ship in docs and examples. Refused at startup.
const PLACEHOLDER_SECRETS: &[&str] = &["", "secret", "changeme", "change-me", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub hub: HubConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = lookup("BANTER_JWT_SECRET").unwrap_or_default();
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.trim()) {
            bail!("BANTER_JWT_SECRET must be set to a real secret");
        }

        let defaults = HubConfig::default();
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(raw) => {
                    let ms: u64 = raw.parse().with_context(|| format!("{} is not a number: '{}'", key, raw))?;
                    Ok(Duration::from_millis(ms))
                }
                None => Ok(default),
            }
        };

        let hub = HubConfig {
            default_room: lookup("BANTER_DEFAULT_ROOM").unwrap_or(defaults.default_room),
            typing_timeout: millis("BANTER_TYPING_TIMEOUT_MS", defaults.typing_timeout)?,
            typing_sweep_interval: millis("BANTER_TYPING_SWEEP_MS", defaults.typing_sweep_interval)?,
            heartbeat_interval: match lookup("BANTER_HEARTBEAT_SECS") {
                Some(raw) => Duration::from_secs(
                    raw.parse()
                        .with_context(|| format!("BANTER_HEARTBEAT_SECS is not a number: '{}'", raw))?,
                ),
                None => defaults.heartbeat_interval,
            },
            ..defaults
        };

        let port = lookup("BANTER_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("BANTER_PORT is not a valid port")?;

        Ok(Self {
            jwt_secret,
            db_path: PathBuf::from(lookup("BANTER_DB_PATH").unwrap_or_else(|| "banter.db".into())),
            host: lookup("BANTER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            hub,
        })
    }
}

/// Full HTTP surface: health, REST and the hub socket.
pub fn app(hub: Hub, jwt_secret: String) -> Router {
    let state: AppState = Arc::new(AppStateInner { hub, jwt_secret });

    let ws_route = Router::new()
        .route("/hub", get(hub_upgrade))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .merge(banter_api::routes(state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct HubQuery {
    access_token: Option<String>,
}

/// Browsers cannot set headers on a socket, so the token may also come
/// in the `access_token` query parameter.
async fn hub_upgrade(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Query(query): Query<HubQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer
        .map(|TypedHeader(auth)| auth.token().to_string())
        .or(query.access_token);

    let Some(session) = token
        .as_deref()
        .and_then(|token| decode_session(&state.jwt_secret, token))
    else {
        return ApiError::Unauthorized.into_response();
    };

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, hub, session))
}
