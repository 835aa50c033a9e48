use thiserror::Error;
use uuid::Uuid;

use banter_types::events::HubEvent;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown recipient {0}")]
    UnknownRecipient(Uuid),

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type HubResult<T> = Result<T, HubError>;

impl From<tokio::task::JoinError> for HubError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Storage(anyhow::anyhow!("storage task failed: {}", e))
    }
}

impl HubError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::UnknownRecipient(_) => "unknown_recipient",
            Self::Storage(_) => "storage",
        }
    }

    /// Only storage failures may succeed when the same call is repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    pub fn to_event(&self) -> HubEvent {
        HubEvent::Error {
            code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}
