use tally_types::error::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed server message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("server rejected the request ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("no transport is connected")]
    NotConnected,

    #[error("channel closed: {0}")]
    Closed(String),
}

impl ClientError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Rejected { code, .. } => *code,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Decode(_) => ErrorCode::InvalidAction,
            Self::Http(_) | Self::WebSocket(_) | Self::NotConnected | Self::Closed(_) => {
                ErrorCode::ConnectionLost
            }
        }
    }
}
