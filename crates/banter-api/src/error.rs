use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use banter_hub::HubError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Hub(HubError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            Self::Hub(HubError::UnknownRecipient(_)) => StatusCode::NOT_FOUND,
            Self::Hub(HubError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Hub(e) => e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        // Storage details stay in the log
        let message = match &self {
            Self::Hub(HubError::Storage(_)) => "internal error".to_string(),
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message, "code": self.code() }))).into_response()
    }
}
