use tally_store::error::StoreError;
use tally_types::error::ErrorCode;
use tally_types::models::SessionId;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("session {session_id} already has {limit} open connections")]
    PoolFull { session_id: SessionId, limit: usize },
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Store(e) => e.code(),
            Self::Registry(RegistryError::PoolFull { .. }) => ErrorCode::PoolFull,
        }
    }
}
