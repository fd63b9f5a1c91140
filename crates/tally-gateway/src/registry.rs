use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tally_types::events::ServerEvent;
use tally_types::models::{Session, SessionId, UserId};

use crate::error::RegistryError;

pub type ConnectionId = Uuid;

/// RTT at or above this counts as the worst possible latency.
const WORST_RTT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    WebSocket,
    Sse,
}

/// Bookkeeping for one open socket. Never persisted.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub connection_id: ConnectionId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub kind: ChannelKind,
    pub connected_at: DateTime<Utc>,
    /// Last transport-level sign of life.
    pub last_heartbeat: Instant,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub last_ping_at: Option<Instant>,
    pub last_rtt: Option<Duration>,
}

impl ConnectionMeta {
    /// 0..=1 score from ping answer ratio and round-trip latency.
    pub fn quality(&self) -> f64 {
        let ack_ratio = if self.pings_sent == 0 {
            1.0
        } else {
            (self.pongs_received as f64 / self.pings_sent as f64).min(1.0)
        };
        let latency = match self.last_rtt {
            Some(rtt) => 1.0 - (rtt.as_secs_f64() / WORST_RTT.as_secs_f64()).min(1.0),
            None => 1.0,
        };
        0.7 * ack_ratio + 0.3 * latency
    }
}

/// Outcome of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub connections: usize,
    pub sessions_with_connections: usize,
    pub disconnects_total: u64,
    pub broadcast_failures_total: u64,
    pub average_quality: f64,
}

/// A freshly registered socket: its id and the queue it must drain.
pub struct Registration {
    pub connection_id: ConnectionId,
    pub rx: mpsc::Receiver<ServerEvent>,
}

struct Entry {
    meta: ConnectionMeta,
    tx: mpsc::Sender<ServerEvent>,
}

#[derive(Default)]
struct RegistryState {
    /// session_id -> (connection_id -> entry)
    sessions: HashMap<SessionId, HashMap<ConnectionId, Entry>>,
    /// user_id -> most recent connection
    users: HashMap<UserId, (ConnectionId, SessionId)>,
}

impl RegistryState {
    fn remove(&mut self, session_id: &str, connection_id: ConnectionId) -> Option<ConnectionMeta> {
        let sockets = self.sessions.get_mut(session_id)?;
        let entry = sockets.remove(&connection_id)?;
        if sockets.is_empty() {
            self.sessions.remove(session_id);
        }
        // Only drop the user mapping if it still points at this socket
        if self
            .users
            .get(&entry.meta.user_id)
            .is_some_and(|(cid, _)| *cid == connection_id)
        {
            self.users.remove(&entry.meta.user_id);
        }
        Some(entry.meta)
    }

    fn entry_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Entry> {
        self.sessions
            .values_mut()
            .find_map(|sockets| sockets.get_mut(&connection_id))
    }
}

/// Which sockets belong to which session and user. Owns transport
/// bookkeeping only; session lifetime belongs to the store.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    state: RwLock<RegistryState>,
    max_per_session: usize,
    channel_capacity: usize,
    disconnects: AtomicU64,
    broadcast_failures: AtomicU64,
}

impl Registry {
    pub fn new(max_per_session: usize, channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState::default()),
                max_per_session,
                channel_capacity: channel_capacity.max(1),
                disconnects: AtomicU64::new(0),
                broadcast_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Add a socket to its session and make it the user's current connection.
    pub async fn register(
        &self,
        session_id: &str,
        user_id: &str,
        kind: ChannelKind,
    ) -> Result<Registration, RegistryError> {
        let mut state = self.inner.state.write().await;

        let sockets = state.sessions.entry(session_id.to_string()).or_default();
        if sockets.len() >= self.inner.max_per_session {
            if sockets.is_empty() {
                state.sessions.remove(session_id);
            }
            return Err(RegistryError::PoolFull {
                session_id: session_id.to_string(),
                limit: self.inner.max_per_session,
            });
        }

        let connection_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.channel_capacity);
        sockets.insert(
            connection_id,
            Entry {
                meta: ConnectionMeta {
                    connection_id,
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    kind,
                    connected_at: Utc::now(),
                    last_heartbeat: Instant::now(),
                    pings_sent: 0,
                    pongs_received: 0,
                    last_ping_at: None,
                    last_rtt: None,
                },
                tx,
            },
        );
        state
            .users
            .insert(user_id.to_string(), (connection_id, session_id.to_string()));

        debug!(
            "Registered {:?} connection {} for {} in session {}",
            kind, connection_id, user_id, session_id
        );
        Ok(Registration { connection_id, rx })
    }

    /// Remove a socket. Returns its metadata if it was still registered.
    pub async fn unregister(&self, session_id: &str, connection_id: ConnectionId) -> Option<ConnectionMeta> {
        let removed = self.inner.state.write().await.remove(session_id, connection_id);
        if let Some(meta) = &removed {
            self.inner.disconnects.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Unregistered connection {} ({}) after {}s",
                connection_id,
                meta.user_id,
                (Utc::now() - meta.connected_at).num_seconds()
            );
        }
        removed
    }

    /// Best-effort send to every socket of a session.
    pub async fn broadcast(&self, session_id: &str, event: ServerEvent) -> BroadcastReport {
        self.fan_out(session_id, |_| event.clone()).await
    }

    /// Send each socket the snapshot its own user is allowed to see.
    pub async fn broadcast_session(&self, session: &Session) -> BroadcastReport {
        self.fan_out(&session.id, |meta| ServerEvent::SessionUpdate {
            session: session.view_for(Some(&meta.user_id)),
        })
        .await
    }

    async fn fan_out<F>(&self, session_id: &str, render: F) -> BroadcastReport
    where
        F: Fn(&ConnectionMeta) -> ServerEvent,
    {
        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();

        {
            let state = self.inner.state.read().await;
            let Some(sockets) = state.sessions.get(session_id) else {
                return report;
            };
            for (connection_id, entry) in sockets {
                match entry.tx.try_send(render(&entry.meta)) {
                    Ok(()) => report.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            "Connection {} ({}) is not draining, dropped an update",
                            connection_id, entry.meta.user_id
                        );
                        report.failed += 1;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        report.failed += 1;
                        dead.push(*connection_id);
                    }
                }
            }
        }

        if report.failed > 0 {
            self.inner
                .broadcast_failures
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        for connection_id in dead {
            self.unregister(session_id, connection_id).await;
        }
        report
    }

    /// Best-effort send to a user's most recent connection.
    pub async fn unicast(&self, user_id: &str, event: ServerEvent) -> bool {
        let state = self.inner.state.read().await;
        let Some((connection_id, session_id)) = state.users.get(user_id) else {
            return false;
        };
        state
            .sessions
            .get(session_id)
            .and_then(|sockets| sockets.get(connection_id))
            .is_some_and(|entry| entry.tx.try_send(event).is_ok())
    }

    /// Send to one specific socket.
    pub async fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let state = self.inner.state.read().await;
        state
            .sessions
            .values()
            .find_map(|sockets| sockets.get(&connection_id))
            .is_some_and(|entry| entry.tx.try_send(event).is_ok())
    }

    /// Record a transport-level sign of life.
    pub async fn touch(&self, connection_id: ConnectionId) {
        if let Some(entry) = self.inner.state.write().await.entry_mut(connection_id) {
            entry.meta.last_heartbeat = Instant::now();
        }
    }

    /// [`Self::touch`] for a connection id a client supplied: only counts if
    /// the socket belongs to that user in that session.
    pub async fn touch_owned(&self, connection_id: ConnectionId, session_id: &str, user_id: &str) -> bool {
        let mut state = self.inner.state.write().await;
        match state.entry_mut(connection_id) {
            Some(entry) if entry.meta.session_id == session_id && entry.meta.user_id == user_id => {
                entry.meta.last_heartbeat = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub async fn record_ping(&self, connection_id: ConnectionId) {
        if let Some(entry) = self.inner.state.write().await.entry_mut(connection_id) {
            entry.meta.pings_sent += 1;
            entry.meta.last_ping_at = Some(Instant::now());
        }
    }

    pub async fn record_pong(&self, connection_id: ConnectionId) {
        if let Some(entry) = self.inner.state.write().await.entry_mut(connection_id) {
            let now = Instant::now();
            entry.meta.pongs_received += 1;
            entry.meta.last_heartbeat = now;
            entry.meta.last_rtt = entry.meta.last_ping_at.map(|sent| now - sent);
        }
    }

    /// Close and drop every socket silent for longer than `timeout`.
    /// Dropping the sender ends the socket's outbound loop.
    pub async fn sweep(&self, timeout: Duration) -> Vec<ConnectionMeta> {
        let now = Instant::now();
        let mut state = self.inner.state.write().await;

        let stale: Vec<(SessionId, ConnectionId)> = state
            .sessions
            .iter()
            .flat_map(|(session_id, sockets)| {
                sockets
                    .values()
                    .filter(|entry| now.duration_since(entry.meta.last_heartbeat) > timeout)
                    .map(|entry| (session_id.clone(), entry.meta.connection_id))
            })
            .collect();

        let removed: Vec<ConnectionMeta> = stale
            .into_iter()
            .filter_map(|(session_id, connection_id)| state.remove(&session_id, connection_id))
            .collect();

        if !removed.is_empty() {
            self.inner
                .disconnects
                .fetch_add(removed.len() as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every socket of a session, e.g. after it expired.
    pub async fn close_session(&self, session_id: &str) -> usize {
        let mut state = self.inner.state.write().await;
        let Some(sockets) = state.sessions.remove(session_id) else {
            return 0;
        };
        state.users.retain(|_, (_, sid)| sid.as_str() != session_id);
        self.inner
            .disconnects
            .fetch_add(sockets.len() as u64, Ordering::Relaxed);
        info!("Closed {} connections of session {}", sockets.len(), session_id);
        sockets.len()
    }

    pub async fn connections(&self, session_id: &str) -> Vec<ConnectionMeta> {
        self.inner
            .state
            .read()
            .await
            .sessions
            .get(session_id)
            .map(|sockets| sockets.values().map(|e| e.meta.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> RegistryStats {
        let state = self.inner.state.read().await;
        let metas: Vec<&ConnectionMeta> = state
            .sessions
            .values()
            .flat_map(|sockets| sockets.values().map(|e| &e.meta))
            .collect();

        let average_quality = if metas.is_empty() {
            1.0
        } else {
            metas.iter().map(|m| m.quality()).sum::<f64>() / metas.len() as f64
        };

        RegistryStats {
            connections: metas.len(),
            sessions_with_connections: state.sessions.len(),
            disconnects_total: self.inner.disconnects.load(Ordering::Relaxed),
            broadcast_failures_total: self.inner.broadcast_failures.load(Ordering::Relaxed),
            average_quality,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_types::error::ErrorCode;
    use tally_types::models::{Role, Template, User};

    fn error_event() -> ServerEvent {
        ServerEvent::error(ErrorCode::Timeout, "test")
    }

    #[tokio::test]
    async fn rejects_registration_past_the_ceiling() {
        let registry = Registry::new(2, 8);
        registry.register("s", "a", ChannelKind::WebSocket).await.unwrap();
        registry.register("s", "b", ChannelKind::Sse).await.unwrap();

        let err = registry.register("s", "c", ChannelKind::WebSocket).await.err().unwrap();
        assert!(matches!(err, RegistryError::PoolFull { limit: 2, .. }));

        // Other sessions are unaffected
        assert!(registry.register("t", "c", ChannelKind::WebSocket).await.is_ok());
    }

    #[tokio::test]
    async fn empty_session_entry_is_dropped() {
        let registry = Registry::new(10, 8);
        let reg = registry.register("s", "a", ChannelKind::WebSocket).await.unwrap();
        assert_eq!(registry.stats().await.sessions_with_connections, 1);

        assert!(registry.unregister("s", reg.connection_id).await.is_some());
        let stats = registry.stats().await;
        assert_eq!(stats.sessions_with_connections, 0);
        assert_eq!(stats.disconnects_total, 1);
    }

    #[tokio::test]
    async fn broadcast_survives_dead_sockets() {
        let registry = Registry::new(10, 8);
        let mut alive = registry.register("s", "a", ChannelKind::WebSocket).await.unwrap();
        let dead = registry.register("s", "b", ChannelKind::WebSocket).await.unwrap();
        drop(dead.rx);

        let report = registry.broadcast("s", error_event()).await;

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert!(alive.rx.try_recv().is_ok());
        assert_eq!(registry.connections("s").await.len(), 1);
    }

    #[tokio::test]
    async fn session_broadcast_masks_votes_per_socket() {
        let registry = Registry::new(10, 8);
        let mut host = registry.register("s", "h", ChannelKind::WebSocket).await.unwrap();
        let mut voter = registry.register("s", "a", ChannelKind::Sse).await.unwrap();

        let now = Utc::now();
        let mut session = Session::new("s", User::new("h", "Host", Role::Host, now), Template::default(), now);
        session.add_user(User::new("a", "Alice", Role::Attendance, now));
        session.record_vote("a", "5".into());

        registry.broadcast_session(&session).await;

        let host_view = host.rx.try_recv().unwrap();
        let voter_view = voter.rx.try_recv().unwrap();
        assert!(host_view.session().unwrap().votes.is_empty());
        assert_eq!(voter_view.session().unwrap().votes.get("a").map(String::as_str), Some("5"));
    }

    #[tokio::test]
    async fn unicast_follows_the_newest_connection() {
        let registry = Registry::new(10, 8);
        let old = registry.register("s", "a", ChannelKind::WebSocket).await.unwrap();
        let mut new = registry.register("s", "a", ChannelKind::WebSocket).await.unwrap();

        assert!(registry.unicast("a", error_event()).await);
        assert!(new.rx.try_recv().is_ok());

        // Tearing down the old socket must not orphan the new one
        registry.unregister("s", old.connection_id).await;
        assert!(registry.unicast("a", error_event()).await);
        assert!(!registry.unicast("nobody", error_event()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_closes_only_silent_sockets() {
        let registry = Registry::new(10, 8);
        let mut quiet = registry.register("s", "a", ChannelKind::WebSocket).await.unwrap();
        let chatty = registry.register("s", "b", ChannelKind::Sse).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        registry.touch(chatty.connection_id).await;
        tokio::time::advance(Duration::from_secs(20)).await;

        let removed = registry.sweep(Duration::from_secs(45)).await;

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].user_id, "a");
        // Sender dropped: the socket's outbound loop sees the channel close
        assert!(quiet.rx.recv().await.is_none());
        assert_eq!(registry.connections("s").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_touch_does_not_keep_a_socket_alive() {
        let registry = Registry::new(10, 8);
        let victim = registry.register("s", "a", ChannelKind::WebSocket).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!registry.touch_owned(victim.connection_id, "s", "b").await);
        assert!(!registry.touch_owned(victim.connection_id, "t", "a").await);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(registry.sweep(Duration::from_secs(45)).await.len(), 1);

        let own = registry.register("s", "a", ChannelKind::WebSocket).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(registry.touch_owned(own.connection_id, "s", "a").await);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(registry.sweep(Duration::from_secs(45)).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn quality_reflects_missed_pongs_and_latency() {
        let registry = Registry::new(10, 8);
        let reg = registry.register("s", "a", ChannelKind::WebSocket).await.unwrap();

        registry.record_ping(reg.connection_id).await;
        tokio::time::advance(Duration::from_millis(500)).await;
        registry.record_pong(reg.connection_id).await;
        registry.record_ping(reg.connection_id).await;

        let meta = registry.connections("s").await.remove(0);
        assert_eq!(meta.last_rtt, Some(Duration::from_millis(500)));
        // 0.7 * 0.5 + 0.3 * 0.5
        assert!((meta.quality() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn close_session_drops_all_sockets() {
        let registry = Registry::new(10, 8);
        registry.register("s", "a", ChannelKind::WebSocket).await.unwrap();
        registry.register("s", "b", ChannelKind::Sse).await.unwrap();

        assert_eq!(registry.close_session("s").await, 2);
        assert!(!registry.unicast("a", error_event()).await);
        assert_eq!(registry.stats().await.connections, 0);
    }
}
