use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use tally_api::router;
use tally_api::state::AppStateInner;
use tally_gateway::config::GatewayConfig;
use tally_gateway::registry::Registry;
use tally_gateway::service::SessionService;
use tally_store::SessionStore;
use tally_store::config::{PresenceConfig, StoreConfig};
use tally_store::memory::MemoryBackend;
use tally_store::presence::PresenceTracker;
use tally_store::rules::OpaqueTemplates;

fn app() -> Router {
    let store = SessionStore::new(
        Arc::new(MemoryBackend::new()),
        PresenceTracker::new(PresenceConfig::default()),
        StoreConfig::default(),
    );
    let service = SessionService::new(Arc::new(store), Registry::new(50, 64), Arc::new(OpaqueTemplates));
    router(AppStateInner::new(service, GatewayConfig::default()))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn round_over_http() {
    let app = app();

    let (status, created) = call(&app, Method::POST, "/sessions", Some(json!({ "sessionId": "S", "name": "Hana" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let host = created["userId"].as_str().unwrap().to_string();
    assert_eq!(created["session"]["hostId"], host);
    assert_eq!(created["session"]["template"]["type"], "fibonacci");

    let (status, joined) = call(
        &app,
        Method::POST,
        "/sessions/S/join",
        Some(json!({ "name": "Ari", "role": "attendance" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let attendee = joined["userId"].as_str().unwrap().to_string();

    let (status, voted) = call(
        &app,
        Method::POST,
        "/sessions/S/actions",
        Some(json!({ "type": "vote", "sessionId": "S", "userId": attendee, "data": { "value": "5" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(voted["session"]["votes"][&attendee], "5");

    // The host cannot see the value before the reveal
    let (_, hidden) = call(&app, Method::GET, &format!("/sessions/S?userId={host}"), None).await;
    assert!(hidden["votes"].as_object().unwrap().is_empty());

    let (status, _) = call(
        &app,
        Method::POST,
        "/sessions/S/actions",
        Some(json!({ "type": "reveal", "sessionId": "S", "userId": host })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, shown) = call(&app, Method::GET, "/sessions/S", None).await;
    assert_eq!(shown["revealed"], true);
    assert_eq!(shown["votes"][&attendee], "5");
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let app = app();

    let (status, body) = call(&app, Method::GET, "/sessions/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    call(&app, Method::POST, "/sessions", Some(json!({ "sessionId": "S", "name": "Hana" }))).await;
    let (status, body) = call(&app, Method::POST, "/sessions", Some(json!({ "sessionId": "S", "name": "Ola" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "already_exists");

    let (_, joined) = call(&app, Method::POST, "/sessions/S/join", Some(json!({ "name": "Gus", "role": "guest" }))).await;
    let guest = joined["userId"].as_str().unwrap().to_string();
    let (status, body) = call(
        &app,
        Method::POST,
        "/sessions/S/actions",
        Some(json!({ "type": "vote", "sessionId": "S", "userId": guest, "data": { "value": "3" } })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "permission_denied");

    let (status, _) = call(
        &app,
        Method::POST,
        "/sessions/other/actions",
        Some(json!({ "type": "heartbeat", "sessionId": "S", "userId": guest })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn leaving_last_user_removes_session() {
    let app = app();
    let (_, created) = call(&app, Method::POST, "/sessions", Some(json!({ "sessionId": "S", "name": "Hana" }))).await;
    let host = created["userId"].as_str().unwrap().to_string();

    let (status, _) = call(&app, Method::DELETE, &format!("/sessions/S/users/{host}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(&app, Method::GET, "/sessions/S", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, stats) = call(&app, Method::GET, "/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["sessions"], 0);
}

#[tokio::test]
async fn event_stream_requires_a_member() {
    let app = app();
    call(&app, Method::POST, "/sessions", Some(json!({ "sessionId": "S", "name": "Hana" }))).await;

    let (status, _) = call(&app, Method::GET, "/sessions/S/events", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, Method::GET, "/sessions/S/events?userId=nobody", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn event_stream_opens_with_connected_frame() {
    use futures_util::StreamExt;

    let app = app();
    let (_, created) = call(&app, Method::POST, "/sessions", Some(json!({ "sessionId": "S", "name": "Hana" }))).await;
    let host = created["userId"].as_str().unwrap().to_string();

    let request = Request::builder()
        .uri(format!("/sessions/S/events?userId={}", host))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let mut body = response.into_body().into_data_stream();
    let chunk = body.next().await.unwrap().unwrap();
    let text = String::from_utf8(chunk.to_vec()).unwrap();
    assert!(text.starts_with("event: connected\n"), "unexpected frame: {}", text);
    assert!(text.contains("\"hostId\":"));
}
