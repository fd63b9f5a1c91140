use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use tally_api::router;
use tally_api::state::AppStateInner;
use tally_client::{
    ConnectionState, Endpoint, HttpTransports, NegotiatorConfig, NegotiatorEvent, NegotiatorHandle,
    TransportKind,
};
use tally_gateway::config::GatewayConfig;
use tally_gateway::registry::Registry;
use tally_gateway::service::SessionService;
use tally_store::SessionStore;
use tally_store::config::{PresenceConfig, StoreConfig};
use tally_store::memory::MemoryBackend;
use tally_store::presence::PresenceTracker;
use tally_store::rules::OpaqueTemplates;
use tally_types::events::{ActionPayload, ServerEvent};
use tally_types::models::SessionView;

async fn serve(gateway: GatewayConfig) -> String {
    let store = SessionStore::new(
        Arc::new(MemoryBackend::new()),
        PresenceTracker::new(PresenceConfig::default()),
        StoreConfig::default(),
    );
    let registry = Registry::new(gateway.max_connections_per_session, gateway.channel_capacity);
    let service = SessionService::new(Arc::new(store), registry, Arc::new(OpaqueTemplates));
    let app = router(AppStateInner::new(service, gateway));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn post(url: String, body: Value) -> Value {
    reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

/// Returns (host id, attendee id) for a fresh session `S`.
async fn seed(base: &str) -> (String, String) {
    let created = post(format!("{base}/sessions"), json!({ "sessionId": "S", "name": "Hana" })).await;
    let joined = post(
        format!("{base}/sessions/S/join"),
        json!({ "name": "Ari", "role": "attendance" }),
    )
    .await;
    (
        created["userId"].as_str().unwrap().to_string(),
        joined["userId"].as_str().unwrap().to_string(),
    )
}

fn negotiator(base: &str, user: &str, kinds: Vec<TransportKind>) -> (NegotiatorHandle, mpsc::Receiver<NegotiatorEvent>) {
    let factory = HttpTransports::new(Endpoint::new(base, "S", user)).with_poll_interval(Duration::from_millis(200));
    let config = NegotiatorConfig::default()
        .with_transports(kinds)
        .with_connect_timeout(Duration::from_secs(3));
    NegotiatorHandle::start("S", user, config, Arc::new(factory))
}

async fn connected(handle: &NegotiatorHandle, kind: TransportKind) {
    let mut state = handle.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected(kind)),
    )
    .await
    .expect("connect in time")
    .unwrap();
}

/// Next snapshot matching `predicate`, skipping anything else.
async fn snapshot_where(
    events: &mut mpsc::Receiver<NegotiatorEvent>,
    predicate: impl Fn(&SessionView) -> bool,
) -> SessionView {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(NegotiatorEvent::Message(event)) = events.recv().await {
                if let Some(view) = event.session() {
                    if predicate(view) {
                        return view.clone();
                    }
                }
            }
        }
    })
    .await
    .expect("snapshot in time")
}

#[tokio::test]
async fn websocket_round_trip() {
    let base = serve(GatewayConfig::default()).await;
    let (host, attendee) = seed(&base).await;

    let (host_handle, mut host_events) = negotiator(&base, &host, vec![TransportKind::WebSocket]);
    let (attendee_handle, _attendee_events) = negotiator(&base, &attendee, vec![TransportKind::WebSocket]);
    connected(&host_handle, TransportKind::WebSocket).await;
    connected(&attendee_handle, TransportKind::WebSocket).await;

    attendee_handle
        .send(ActionPayload::Vote { value: "5".into() })
        .await
        .unwrap();
    let voted = snapshot_where(&mut host_events, |v| v.users.iter().any(|u| u.has_voted)).await;
    // Hidden from the host until the reveal
    assert!(voted.votes.is_empty());

    host_handle.send(ActionPayload::Reveal).await.unwrap();
    let revealed = snapshot_where(&mut host_events, |v| v.revealed).await;
    assert_eq!(revealed.votes.get(&attendee).map(String::as_str), Some("5"));

    attendee_handle.shutdown().await;
    host_handle.shutdown().await;
}

#[tokio::test]
async fn sse_reopens_after_server_lifetime() {
    let base = serve(GatewayConfig::default().with_sse_lifetime(Duration::from_millis(300))).await;
    let (host, attendee) = seed(&base).await;

    let (host_handle, mut host_events) = negotiator(&base, &host, vec![TransportKind::Sse]);
    connected(&host_handle, TransportKind::Sse).await;

    // Outlive a few server-side stream lifetimes
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(host_handle.state(), ConnectionState::Connected(TransportKind::Sse));

    let (attendee_handle, _) = negotiator(&base, &attendee, vec![TransportKind::Polling]);
    connected(&attendee_handle, TransportKind::Polling).await;
    attendee_handle
        .send(ActionPayload::Vote { value: "3".into() })
        .await
        .unwrap();

    let voted = snapshot_where(&mut host_events, |v| v.users.iter().any(|u| u.id == attendee && u.has_voted)).await;
    assert!(!voted.revealed);
    assert_eq!(host_handle.stability().disconnects, 0);

    attendee_handle.shutdown().await;
    host_handle.shutdown().await;
}

#[tokio::test]
async fn polling_sees_its_own_actions_and_others() {
    let base = serve(GatewayConfig::default()).await;
    let (host, attendee) = seed(&base).await;

    let (host_handle, mut host_events) = negotiator(&base, &host, vec![TransportKind::Polling]);
    connected(&host_handle, TransportKind::Polling).await;

    post(
        format!("{base}/sessions/S/actions"),
        json!({ "type": "vote", "sessionId": "S", "userId": attendee, "data": { "value": "8" } }),
    )
    .await;
    snapshot_where(&mut host_events, |v| v.users.iter().any(|u| u.has_voted)).await;

    host_handle.send(ActionPayload::Reveal).await.unwrap();
    let revealed = snapshot_where(&mut host_events, |v| v.revealed).await;
    assert_eq!(revealed.votes.get(&attendee).map(String::as_str), Some("8"));

    host_handle.shutdown().await;
}

#[tokio::test]
async fn refused_websocket_falls_back_to_polling_and_session_end_closes() {
    let base = serve(GatewayConfig::default().with_max_connections(1)).await;
    let (host, attendee) = seed(&base).await;

    // Take the only push slot
    let (host_handle, _host_events) = negotiator(&base, &host, vec![TransportKind::WebSocket]);
    connected(&host_handle, TransportKind::WebSocket).await;

    let (attendee_handle, mut attendee_events) = negotiator(
        &base,
        &attendee,
        vec![TransportKind::WebSocket, TransportKind::Sse, TransportKind::Polling],
    );
    connected(&attendee_handle, TransportKind::Polling).await;

    host_handle.send(ActionPayload::Leave).await.unwrap();
    attendee_handle.send(ActionPayload::Leave).await.unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match attendee_events.recv().await {
                Some(NegotiatorEvent::Message(ServerEvent::SessionExpired { .. })) | None => break,
                Some(_) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    host_handle.shutdown().await;
    attendee_handle.shutdown().await;
}
