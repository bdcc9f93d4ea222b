use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid replay window: {0}")]
    InvalidWindow(String),
    #[error("push connection is not open")]
    NotConnected,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json error: {0}")]
    SimdJson(#[from] simd_json::Error),
}

/// Coarse classification used to decide how an error is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Recovered locally by reconnect/backoff.
    Transport,
    /// Shown to the user as a transient notification.
    Request,
    /// Rejected before any network call.
    Validation,
    Storage,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::InvalidWindow(_) => ErrorKind::Validation,
            Self::NotConnected | Self::WebSocket(_) | Self::SimdJson(_) => ErrorKind::Transport,
            Self::Rejected(_) | Self::MalformedResponse(_) | Self::Reqwest(_) => ErrorKind::Request,
            Self::Sqlx(_) | Self::Migration(_) | Self::Io(_) => ErrorKind::Storage,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
