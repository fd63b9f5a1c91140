use std::convert::Infallible;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::response::sse::{KeepAlive, Sse};
use futures_util::StreamExt;

use tally_gateway::{connection, sse};
use tally_types::api::ViewerQuery;

use crate::error::ApiError;
use crate::state::AppState;

fn require_user(query: ViewerQuery) -> Result<String, ApiError> {
    query
        .user_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("userId is required".into()))
}

/// Membership is checked inside the socket so refusals arrive as an
/// `error` event the client can read.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ViewerQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user(query)?;
    let service = state.service.clone();
    let config = state.gateway.clone();
    Ok(ws.on_upgrade(move |socket| {
        connection::handle_socket(socket, service, config, session_id, user_id)
    }))
}

pub async fn sse_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ViewerQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user(query)?;
    let events = sse::open_stream(&state.service, &state.gateway, &session_id, &user_id).await?;
    let framed = events.map(|event| Ok::<_, Infallible>(sse::to_sse_event(&event)));
    Ok(Sse::new(framed).keep_alive(KeepAlive::default()))
}
