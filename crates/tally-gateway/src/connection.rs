use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, trace, warn};

use tally_types::error::ErrorCode;
use tally_types::events::{ActionPayload, ClientAction, ServerEvent};
use tally_types::models::{SessionId, UserId};

use crate::config::GatewayConfig;
use crate::registry::{ChannelKind, ConnectionId, Registration};
use crate::service::SessionService;

type Sink = SplitSink<WebSocket, Message>;

/// Serve one upgraded WebSocket for `user_id` in `session_id`.
///
/// Membership is checked before registration; a non-member or a full session
/// gets a single `error` event and the socket is closed.
pub async fn handle_socket(
    socket: WebSocket,
    service: SessionService,
    config: GatewayConfig,
    session_id: SessionId,
    user_id: UserId,
) {
    let (mut sender, receiver) = socket.split();

    let (registration, view) = match service
        .attach(&session_id, &user_id, ChannelKind::WebSocket)
        .await
    {
        Ok(attached) => attached,
        Err(e) => {
            debug!("WebSocket for {} in session {} refused: {}", user_id, session_id, e);
            let event = ServerEvent::error(e.code(), e.to_string());
            let _ = send_event(&mut sender, &event, &config).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let connected = ServerEvent::Connected {
        connection_id: registration.connection_id,
        session: view,
    };
    if !send_event(&mut sender, &connected, &config).await {
        service
            .registry()
            .unregister(&session_id, registration.connection_id)
            .await;
        return;
    }

    info!(
        "{} connected to session {} over WebSocket ({})",
        user_id, session_id, registration.connection_id
    );
    run_connection_loop(sender, receiver, service, config, session_id, user_id, registration).await;
}

async fn run_connection_loop(
    mut sender: Sink,
    mut receiver: SplitStream<WebSocket>,
    service: SessionService,
    config: GatewayConfig,
    session_id: SessionId,
    user_id: UserId,
    registration: Registration,
) {
    let Registration {
        connection_id,
        mut rx,
    } = registration;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let send_service = service.clone();
    let send_config = config.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(send_config.heartbeat_interval);
        heartbeat.tick().await;
        let mut missed_pongs: u8 = 0;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    // Registry dropped us: swept, session closed, or replaced
                    let Some(event) = event else { break };
                    let expired = matches!(event, ServerEvent::SessionExpired { .. });
                    if !send_event(&mut sender, &event, &send_config).await || expired {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_pongs = 0;
                    } else {
                        missed_pongs += 1;
                        if missed_pongs >= send_config.max_missed_pongs {
                            warn!("Connection {}: missed {} pongs, dropping", connection_id, missed_pongs);
                            break;
                        }
                    }
                    send_service.registry().record_ping(connection_id).await;
                    let ping = tokio::time::timeout(
                        send_config.send_timeout,
                        sender.send(Message::Ping(Default::default())),
                    );
                    if !matches!(ping.await, Ok(Ok(()))) {
                        break;
                    }
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let recv_service = service.clone();
    let recv_session = session_id.clone();
    let recv_user = user_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            recv_service.registry().touch(connection_id).await;
            match msg {
                Message::Text(text) => {
                    let keep_open = handle_text(
                        &recv_service,
                        connection_id,
                        &recv_session,
                        &recv_user,
                        text.as_str(),
                    )
                    .await;
                    if !keep_open {
                        break;
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                    recv_service.registry().record_pong(connection_id).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    service.registry().unregister(&session_id, connection_id).await;
    info!("{} disconnected from session {} ({})", user_id, session_id, connection_id);
}

/// Handle one inbound frame. Returns false once the socket should close.
async fn handle_text(
    service: &SessionService,
    connection_id: ConnectionId,
    session_id: &str,
    user_id: &str,
    text: &str,
) -> bool {
    let registry = service.registry();

    let mut action = match serde_json::from_str::<ClientAction>(text) {
        Ok(action) => action,
        Err(e) => {
            warn!(
                "{} in session {} sent a bad frame: {} -- raw: {}",
                user_id,
                session_id,
                e,
                text.chars().take(200).collect::<String>()
            );
            registry
                .send_to(
                    connection_id,
                    ServerEvent::error(ErrorCode::InvalidAction, format!("malformed action: {e}")),
                )
                .await;
            return true;
        }
    };

    // A socket may only act as the user it was opened for
    if action.session_id != session_id || action.user_id != user_id {
        registry
            .send_to(
                connection_id,
                ServerEvent::error(
                    ErrorCode::PermissionDenied,
                    "action does not match this connection's session and user",
                ),
            )
            .await;
        return true;
    }
    action.connection_id = Some(connection_id);

    match service.apply(&action).await {
        Ok(_) => match action.payload {
            ActionPayload::Heartbeat => {
                trace!("Heartbeat ack to {}", connection_id);
                registry
                    .send_to(connection_id, ServerEvent::HeartbeatAck { timestamp: Utc::now() })
                    .await;
                true
            }
            ActionPayload::Leave => false,
            _ => true,
        },
        Err(e) => {
            registry
                .send_to(connection_id, ServerEvent::error(e.code(), e.to_string()))
                .await;
            true
        }
    }
}

async fn send_event(sender: &mut Sink, event: &ServerEvent, config: &GatewayConfig) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode {} event: {}", event.kind(), e);
            return true;
        }
    };
    matches!(
        tokio::time::timeout(config.send_timeout, sender.send(Message::Text(text.into()))).await,
        Ok(Ok(()))
    )
}
