use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use tally_gateway::error::GatewayError;
use tally_store::error::StoreError;
use tally_types::api::ErrorBody;
use tally_types::error::ErrorCode;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("{0}")]
    BadRequest(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Gateway(e.into())
    }
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Gateway(e) => e.code(),
            Self::BadRequest(_) => ErrorCode::InvalidAction,
        }
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyExists => StatusCode::CONFLICT,
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::InvalidAction => StatusCode::BAD_REQUEST,
        ErrorCode::StoreUnavailable | ErrorCode::PoolFull => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::ConnectionLost => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.code();
        let body = ErrorBody {
            code,
            message: self.to_string(),
        };
        (status_for(code), Json(body)).into_response()
    }
}
