use tally_types::error::ErrorCode;
use tally_types::models::{SessionId, UserId};
use thiserror::Error;

/// Failures reported by a storage backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Transient; the store retries these.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record for session {id}: {reason}")]
    Corrupt { id: SessionId, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("user {0} is not part of this session")]
    UserNotFound(UserId),

    #[error("session {0} already exists")]
    AlreadyExists(SessionId),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("session store unavailable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) | Self::UserNotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::InvalidAction(_) => ErrorCode::InvalidAction,
            Self::Unavailable { .. } => ErrorCode::StoreUnavailable,
        }
    }

    /// Expected outcomes of user input, as opposed to system failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::UserNotFound(_)
                | Self::AlreadyExists(_)
                | Self::PermissionDenied(_)
                | Self::InvalidAction(_)
        )
    }
}
