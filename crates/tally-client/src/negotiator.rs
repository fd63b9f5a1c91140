use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use tally_types::events::{ActionPayload, ClientAction, ServerEvent};
use tally_types::models::{SessionId, UserId};

use crate::backoff::BackoffConfig;
use crate::error::ClientError;
use crate::monitor::{MonitorConfig, StabilityMonitor, StabilitySnapshot};
use crate::transport::{Transport, TransportEvent, TransportFactory, TransportKind};

const EVENT_BUFFER: usize = 64;
const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Fallback chain, most preferred first.
    pub transports: Vec<TransportKind>,
    /// Bound on opening one transport.
    pub connect_timeout: Duration,
    /// While polling, how often to try a push channel again.
    pub promotion_interval: Duration,
    pub max_promotion_attempts: u32,
    /// Heartbeat cadence when the connection is stable.
    pub heartbeat_interval: Duration,
    pub backoff: BackoffConfig,
    pub monitor: MonitorConfig,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            transports: vec![TransportKind::WebSocket, TransportKind::Sse, TransportKind::Polling],
            connect_timeout: Duration::from_secs(8),
            promotion_interval: Duration::from_secs(5),
            max_promotion_attempts: 6,
            heartbeat_interval: Duration::from_secs(20),
            backoff: BackoffConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl NegotiatorConfig {
    #[must_use]
    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = transports;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_promotion(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.promotion_interval = interval;
        self.max_promotion_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting(TransportKind),
    Connected(TransportKind),
    Reconnecting { attempt: u32 },
    /// Reconnect budget spent. Nothing is scheduled until `reconnect`.
    ConnectionLost,
    /// Torn down; terminal.
    Closed,
}

#[derive(Debug, Clone)]
pub enum NegotiatorEvent {
    /// A server event, in order, with stale snapshots already dropped.
    Message(ServerEvent),
    TransportError { kind: TransportKind, message: String },
}

enum Command {
    Send {
        payload: ActionPayload,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Reconnect,
}

/// Client handle to a running negotiator. Dropping it tears everything down.
pub struct NegotiatorHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    monitor: Arc<StabilityMonitor>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NegotiatorHandle {
    /// Spawn the negotiator and begin connecting right away.
    pub fn start(
        session_id: impl Into<SessionId>,
        user_id: impl Into<UserId>,
        config: NegotiatorConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::Receiver<NegotiatorEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let monitor = Arc::new(StabilityMonitor::new(config.monitor.clone()));
        let cancel = CancellationToken::new();

        let actor = Actor {
            session_id: session_id.into(),
            user_id: user_id.into(),
            config,
            factory,
            monitor: monitor.clone(),
            state: Arc::new(state_tx),
            events: event_tx,
            commands: command_rx,
            cancel: cancel.clone(),
            active: None,
            pending: None,
            retry_at: None,
            next_heartbeat: None,
            next_promotion: None,
            reconnect_attempt: 0,
            promotion_attempts: 0,
            last_snapshot: None,
            finished: false,
        };
        let task = tokio::spawn(actor.run());

        (
            Self {
                commands: command_tx,
                state: state_rx,
                monitor,
                cancel,
                task: Some(task),
            },
            event_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Send an action over whichever transport is active.
    pub async fn send(&self, payload: ActionPayload) -> Result<(), ClientError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send { payload, reply })
            .await
            .map_err(|_| ClientError::Closed("negotiator stopped".into()))?;
        response
            .await
            .map_err(|_| ClientError::Closed("negotiator stopped".into()))?
    }

    /// Start over with a fresh reconnect budget, e.g. after `ConnectionLost`.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::Reconnect)
            .await
            .map_err(|_| ClientError::Closed("negotiator stopped".into()))
    }

    pub fn stability(&self) -> StabilitySnapshot {
        self.monitor.snapshot()
    }

    /// Close the active transport and wait until nothing is left running.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for NegotiatorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Active {
    kind: TransportKind,
    transport: Box<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    since: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Establish,
    Promote,
}

type ChainFuture = Pin<Box<dyn Future<Output = Option<Active>> + Send>>;

struct Pending {
    purpose: Purpose,
    attempt: ChainFuture,
}

/// Try each kind in order; the first that opens within `timeout` wins.
async fn run_chain(
    kinds: Vec<TransportKind>,
    factory: Arc<dyn TransportFactory>,
    timeout: Duration,
    monitor: Arc<StabilityMonitor>,
    state: Option<Arc<watch::Sender<ConnectionState>>>,
) -> Option<Active> {
    for kind in kinds {
        if let Some(state) = &state {
            state.send_replace(ConnectionState::Connecting(kind));
        }
        let mut transport = factory.create(kind);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let result = match tokio::time::timeout(timeout, transport.connect(tx)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(format!("{kind} connect"))),
        };
        match result {
            Ok(()) => {
                monitor.record_attempt(kind, true);
                return Some(Active {
                    kind,
                    transport,
                    events: rx,
                    since: Instant::now(),
                });
            }
            Err(e) => {
                monitor.record_attempt(kind, false);
                warn!("{} transport failed to open: {}", kind, e);
                transport.close().await;
            }
        }
    }
    None
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_event(active: &mut Option<Active>) -> Option<TransportEvent> {
    match active {
        Some(active) => active.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn finish_pending(pending: &mut Option<Pending>) -> (Purpose, Option<Active>) {
    match pending {
        Some(pending) => {
            let outcome = (&mut pending.attempt).await;
            (pending.purpose, outcome)
        }
        None => std::future::pending().await,
    }
}

struct Actor {
    session_id: SessionId,
    user_id: UserId,
    config: NegotiatorConfig,
    factory: Arc<dyn TransportFactory>,
    monitor: Arc<StabilityMonitor>,
    state: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::Sender<NegotiatorEvent>,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,

    active: Option<Active>,
    pending: Option<Pending>,
    retry_at: Option<Instant>,
    next_heartbeat: Option<Instant>,
    next_promotion: Option<Instant>,
    reconnect_attempt: u32,
    promotion_attempts: u32,
    last_snapshot: Option<DateTime<Utc>>,
    finished: bool,
}

impl Actor {
    async fn run(mut self) {
        self.begin_establish();

        while !self.finished {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Send { payload, reply }) => {
                        let result = self.send(payload).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Reconnect) => self.restart(),
                    None => break,
                },
                event = next_event(&mut self.active) => self.on_transport_event(event).await,
                (purpose, outcome) = finish_pending(&mut self.pending) => {
                    self.pending = None;
                    self.on_attempt_finished(purpose, outcome).await;
                }
                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.begin_establish();
                }
                _ = sleep_until_opt(self.next_heartbeat) => self.heartbeat().await,
                _ = sleep_until_opt(self.next_promotion) => self.begin_promotion(),
            }
        }

        self.teardown().await;
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("Negotiator for {} -> {:?}", self.user_id, state);
        self.state.send_replace(state);
    }

    fn emit(&self, event: NegotiatorEvent) {
        if self.events.try_send(event).is_err() {
            warn!("Negotiator event dropped: receiver is full or gone");
        }
    }

    fn begin_establish(&mut self) {
        let kinds = self.monitor.preferred_order(&self.config.transports);
        if kinds.is_empty() {
            error!("No transports configured");
            self.set_state(ConnectionState::ConnectionLost);
            return;
        }
        self.pending = Some(Pending {
            purpose: Purpose::Establish,
            attempt: Box::pin(run_chain(
                kinds,
                self.factory.clone(),
                self.config.connect_timeout,
                self.monitor.clone(),
                Some(self.state.clone()),
            )),
        });
    }

    fn begin_promotion(&mut self) {
        self.next_promotion = None;
        if self.pending.is_some() {
            return;
        }
        let kinds: Vec<TransportKind> = self
            .monitor
            .preferred_order(&self.config.transports)
            .into_iter()
            .filter(|k| k.is_push())
            .collect();
        trace!("Promotion attempt {} over {:?}", self.promotion_attempts + 1, kinds);
        self.pending = Some(Pending {
            purpose: Purpose::Promote,
            attempt: Box::pin(run_chain(
                kinds,
                self.factory.clone(),
                self.config.connect_timeout,
                self.monitor.clone(),
                None,
            )),
        });
    }

    /// Fresh budget after the caller asks to try again.
    fn restart(&mut self) {
        if self.active.is_some() || self.pending.is_some() {
            return;
        }
        info!("Reconnect requested for {}", self.user_id);
        self.reconnect_attempt = 0;
        self.retry_at = None;
        self.begin_establish();
    }

    async fn on_attempt_finished(&mut self, purpose: Purpose, outcome: Option<Active>) {
        match (purpose, outcome) {
            (Purpose::Establish, Some(active)) => {
                if self.reconnect_attempt > 0 {
                    info!("Reconnected over {} after {} attempts", active.kind, self.reconnect_attempt);
                }
                self.reconnect_attempt = 0;
                self.install(active);
            }
            (Purpose::Establish, None) => {
                warn!("Every transport failed to open");
                self.schedule_reconnect();
            }
            (Purpose::Promote, Some(active)) => {
                info!("Promoted to {}", active.kind);
                if let Some(mut old) = self.active.take() {
                    old.transport.close().await;
                }
                self.install(active);
            }
            (Purpose::Promote, None) => {
                self.promotion_attempts += 1;
                if self.promotion_attempts < self.config.max_promotion_attempts && self.active.is_some() {
                    self.next_promotion = Some(Instant::now() + self.config.promotion_interval);
                } else {
                    debug!("Staying on polling after {} promotion attempts", self.promotion_attempts);
                }
            }
        }
    }

    fn install(&mut self, active: Active) {
        let kind = active.kind;
        self.active = Some(active);
        self.set_state(ConnectionState::Connected(kind));
        self.next_heartbeat = Some(Instant::now() + self.heartbeat_interval());

        let can_promote = kind == TransportKind::Polling && self.config.transports.iter().any(|k| k.is_push());
        if can_promote && self.config.max_promotion_attempts > 0 {
            self.promotion_attempts = 0;
            self.next_promotion = Some(Instant::now() + self.config.promotion_interval);
        } else {
            self.next_promotion = None;
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        self.monitor.recommended_heartbeat(self.config.heartbeat_interval)
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_attempt += 1;
        if self.reconnect_attempt > self.config.backoff.max_attempts {
            error!(
                "Connection lost: {} reconnect attempts exhausted",
                self.config.backoff.max_attempts
            );
            self.retry_at = None;
            self.set_state(ConnectionState::ConnectionLost);
            return;
        }
        let delay = self.config.backoff.delay(self.reconnect_attempt - 1);
        debug!("Reconnect attempt {} in {:?}", self.reconnect_attempt, delay);
        self.set_state(ConnectionState::Reconnecting {
            attempt: self.reconnect_attempt,
        });
        self.retry_at = Some(Instant::now() + delay);
    }

    async fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        let kind = self.active.as_ref().map(|a| a.kind);
        match event {
            Some(TransportEvent::Connected) => trace!("{:?} reports connected", kind),
            Some(TransportEvent::Message(event)) => self.deliver(event),
            Some(TransportEvent::Error(message)) => {
                if let Some(kind) = kind {
                    warn!("{} transport error: {}", kind, message);
                    self.emit(NegotiatorEvent::TransportError { kind, message });
                }
            }
            Some(TransportEvent::Disconnected { reason }) => self.on_dropped(reason).await,
            None => self.on_dropped("transport stopped reporting".into()).await,
        }
    }

    fn deliver(&mut self, event: ServerEvent) {
        if let Some(view) = event.session() {
            let repeat = matches!(event, ServerEvent::SessionUpdate { .. });
            let stale = self
                .last_snapshot
                .is_some_and(|seen| view.last_updated < seen || (repeat && view.last_updated == seen));
            if stale {
                trace!("Dropping snapshot from {} (already saw newer)", view.last_updated);
                return;
            }
            self.last_snapshot = Some(view.last_updated);
        }

        let expired = matches!(event, ServerEvent::SessionExpired { .. });
        self.emit(NegotiatorEvent::Message(event));
        if expired {
            info!("Session {} expired, closing", self.session_id);
            self.finished = true;
        }
    }

    async fn on_dropped(&mut self, reason: String) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let connected_for = active.since.elapsed();
        warn!("{} transport dropped after {:?}: {}", active.kind, connected_for, reason);
        self.monitor.record_disconnect(active.kind, &reason, connected_for);
        active.transport.close().await;

        self.next_heartbeat = None;
        self.next_promotion = None;
        if self.pending.as_ref().is_some_and(|p| p.purpose == Purpose::Promote) {
            self.pending = None;
        }
        if self.finished {
            return;
        }
        self.schedule_reconnect();
    }

    async fn send(&mut self, payload: ActionPayload) -> Result<(), ClientError> {
        let active = self.active.as_mut().ok_or(ClientError::NotConnected)?;
        let action = ClientAction::new(self.session_id.clone(), self.user_id.clone(), payload);
        active.transport.send(action).await
    }

    async fn heartbeat(&mut self) {
        self.next_heartbeat = None;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let kind = active.kind;
        let action = ClientAction::new(self.session_id.clone(), self.user_id.clone(), ActionPayload::Heartbeat);
        trace!("Heartbeat over {}", kind);
        if let Err(e) = active.transport.send(action).await {
            warn!("Heartbeat over {} failed: {}", kind, e);
        }
        self.next_heartbeat = Some(Instant::now() + self.heartbeat_interval());
    }

    async fn teardown(&mut self) {
        self.pending = None;
        self.retry_at = None;
        self.next_heartbeat = None;
        self.next_promotion = None;
        if let Some(mut active) = self.active.take() {
            active.transport.close().await;
        }
        self.set_state(ConnectionState::Closed);
        debug!("Negotiator for {} in session {} stopped", self.user_id, self.session_id);
    }
}
