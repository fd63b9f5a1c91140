use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::debug;

use tally_types::api::{
    ActionResponse, CreateSessionRequest, CreateSessionResponse, JoinSessionRequest,
    JoinSessionResponse, ViewerQuery,
};
use tally_types::events::{ActionPayload, ClientAction};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (session, user_id) = state
        .service
        .create_session(req.session_id, &req.name, req.template)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id.clone(),
            session: session.view_for(Some(&user_id)),
            user_id,
        }),
    ))
}

pub async fn join_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<JoinSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (session, user_id) = state.service.join(&session_id, &req.name, req.role).await?;
    Ok(Json(JoinSessionResponse {
        session: session.view_for(Some(&user_id)),
        user_id,
    }))
}

/// The polling read: current snapshot as `userId` may see it.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ViewerQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .service
        .snapshot(&session_id, query.user_id.as_deref())
        .await?;
    Ok(Json(view))
}

/// Action intake for SSE and polling clients.
pub async fn post_action(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(action): Json<ClientAction>,
) -> Result<impl IntoResponse, ApiError> {
    if action.session_id != session_id {
        return Err(ApiError::BadRequest(format!(
            "action targets session {} but was posted to {}",
            action.session_id, session_id
        )));
    }

    let session = state.service.apply(&action).await?;
    Ok(Json(ActionResponse {
        session: session.map(|s| s.view_for(Some(&action.user_id))),
    }))
}

pub async fn leave_session(
    State(state): State<AppState>,
    Path((session_id, user_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    debug!("{} leaving session {} over HTTP", user_id, session_id);
    state
        .service
        .apply(&ClientAction::new(session_id, user_id, ActionPayload::Leave))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.stats().await)
}
