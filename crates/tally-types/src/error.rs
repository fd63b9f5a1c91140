use std::fmt;

use serde::{Deserialize, Serialize};

/// Wire form of the failure taxonomy shared by every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    InvalidAction,
    StoreUnavailable,
    PoolFull,
    ConnectionLost,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidAction => "invalid_action",
            Self::StoreUnavailable => "store_unavailable",
            Self::PoolFull => "pool_full",
            Self::ConnectionLost => "connection_lost",
            Self::Timeout => "timeout",
        }
    }

    /// Whether a caller may retry the same request later and expect a different outcome.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable | Self::PoolFull | Self::Timeout | Self::ConnectionLost
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
