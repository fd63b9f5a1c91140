pub mod error;
pub mod realtime;
pub mod sessions;
pub mod state;

use axum::Router;
use axum::routing::{delete, get, post};

use crate::state::AppState;

/// Every HTTP route. Cross-cutting layers are added by the binary.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(sessions::create_session))
        .route("/sessions/{session_id}", get(sessions::get_session))
        .route("/sessions/{session_id}/join", post(sessions::join_session))
        .route("/sessions/{session_id}/actions", post(sessions::post_action))
        .route("/sessions/{session_id}/users/{user_id}", delete(sessions::leave_session))
        .route("/sessions/{session_id}/ws", get(realtime::ws_upgrade))
        .route("/sessions/{session_id}/events", get(realtime::sse_stream))
        .route("/stats", get(sessions::stats))
        .with_state(state)
}
