use axum::response::sse::Event;
use futures_util::Stream;
use tracing::{debug, info, warn};

use tally_types::events::ServerEvent;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::registry::{ChannelKind, ConnectionId, Registration, Registry};
use crate::service::SessionService;

/// Unregisters the SSE connection when the response stream is dropped,
/// whether it ended on its own or the client went away.
struct SseGuard {
    registry: Registry,
    session_id: String,
    connection_id: ConnectionId,
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("SSE connection {} dropped outside a runtime", self.connection_id);
            return;
        };
        let registry = self.registry.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let connection_id = self.connection_id;
        handle.spawn(async move {
            registry.unregister(&session_id, connection_id).await;
        });
    }
}

/// Register an SSE channel and return its event stream.
///
/// The first item is always `connected`. The stream ends after
/// `sse_lifetime`, after `session_expired`, or when the registry drops the
/// connection. Clients reopen it; each response is a fresh registration.
pub async fn open_stream(
    service: &SessionService,
    config: &GatewayConfig,
    session_id: &str,
    user_id: &str,
) -> Result<impl Stream<Item = ServerEvent> + Send + use<>, GatewayError> {
    let (registration, view) = service.attach(session_id, user_id, ChannelKind::Sse).await?;
    let Registration {
        connection_id,
        mut rx,
    } = registration;

    let guard = SseGuard {
        registry: service.registry().clone(),
        session_id: session_id.to_string(),
        connection_id,
    };
    let lifetime = config.sse_lifetime;
    info!("{} connected to session {} over SSE ({})", user_id, session_id, connection_id);

    Ok(async_stream::stream! {
        let _guard = guard;
        yield ServerEvent::Connected { connection_id, session: view };

        let deadline = tokio::time::sleep(lifetime);
        tokio::pin!(deadline);

        loop {
            let next = tokio::select! {
                event = rx.recv() => event,
                _ = &mut deadline => {
                    debug!("SSE connection {} reached its lifetime", connection_id);
                    None
                }
            };
            let Some(event) = next else { break };
            let expired = matches!(event, ServerEvent::SessionExpired { .. });
            yield event;
            if expired {
                break;
            }
        }
    })
}

/// Frame an event for the wire: the SSE event name is the event type and
/// the data line carries the same JSON a WebSocket client would get.
pub fn to_sse_event(event: &ServerEvent) -> Event {
    match Event::default().event(event.kind()).json_data(event) {
        Ok(framed) => framed,
        Err(e) => {
            warn!("Failed to encode {} event for SSE: {}", event.kind(), e);
            Event::default().event(event.kind())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::StreamExt;
    use tally_store::SessionStore;
    use tally_store::config::{PresenceConfig, StoreConfig};
    use tally_store::memory::MemoryBackend;
    use tally_store::presence::PresenceTracker;
    use tally_store::rules::OpaqueTemplates;
    use tally_types::events::{ActionPayload, ClientAction};
    use tally_types::models::Role;

    use super::*;

    fn service() -> SessionService {
        let store = SessionStore::new(
            Arc::new(MemoryBackend::new()),
            PresenceTracker::new(PresenceConfig::default()),
            StoreConfig::default(),
        );
        SessionService::new(Arc::new(store), Registry::new(10, 16), Arc::new(OpaqueTemplates))
    }

    #[tokio::test(start_paused = true)]
    async fn stream_starts_connected_and_ends_at_lifetime() {
        let service = service();
        let (session, host) = service.create_session(Some("s".into()), "Hana", None).await.unwrap();
        let config = GatewayConfig::default().with_sse_lifetime(Duration::from_secs(10));

        let mut stream = Box::pin(open_stream(&service, &config, &session.id, &host).await.unwrap());

        let first = stream.next().await.unwrap();
        let ServerEvent::Connected { connection_id, session } = first else {
            panic!("first event must be connected");
        };
        assert_eq!(session.id, "s");
        assert_eq!(service.registry().connections("s").await.len(), 1);

        let mut action = ClientAction::new("s", host.clone(), ActionPayload::Vote { value: "3".into() });
        action.connection_id = Some(connection_id);
        service.apply(&action).await.unwrap();

        let update = stream.next().await.unwrap();
        assert_eq!(update.session().unwrap().votes.get(&host).map(String::as_str), Some("3"));

        // Lifetime elapses with nothing queued
        assert!(stream.next().await.is_none());
        drop(stream);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(service.registry().connections("s").await.is_empty());
    }

    #[tokio::test]
    async fn non_members_are_refused() {
        let service = service();
        service.create_session(Some("s".into()), "Hana", None).await.unwrap();
        let err = open_stream(&service, &GatewayConfig::default(), "s", "stranger")
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), tally_types::error::ErrorCode::NotFound);

        let (_, guest) = service.join("s", "Gus", Role::Guest).await.unwrap();
        assert!(open_stream(&service, &GatewayConfig::default(), "s", &guest).await.is_ok());
    }
}
