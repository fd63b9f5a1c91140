use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tally_store::SessionStore;
use tally_store::error::StoreError;
use tally_store::rules::{self, Applied, TemplateValidator};
use tally_types::api::StatsResponse;
use tally_types::events::{ActionPayload, ClientAction, ServerEvent};
use tally_types::models::{Role, Session, SessionId, SessionView, Template, User, UserId};

use crate::error::GatewayError;
use crate::registry::{ChannelKind, Registration, Registry};

/// Longest display name accepted on create/join.
pub const MAX_NAME_LEN: usize = 64;

/// Validate, apply through the store, then fan the result out.
///
/// Store write and broadcast form one logical step for callers, but a failed
/// broadcast never rolls back the write: the store is the source of truth.
#[derive(Clone)]
pub struct SessionService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    store: Arc<SessionStore>,
    registry: Registry,
    templates: Arc<dyn TemplateValidator>,
}

impl SessionService {
    pub fn new(store: Arc<SessionStore>, registry: Registry, templates: Arc<dyn TemplateValidator>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                store,
                registry,
                templates,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    /// Start a session with `name` as its host.
    pub async fn create_session(
        &self,
        session_id: Option<SessionId>,
        name: &str,
        template: Option<Template>,
    ) -> Result<(Session, UserId), StoreError> {
        let name = validate_name(name)?;
        let template = template.unwrap_or_default();
        self.inner
            .templates
            .validate_template(&template)
            .map_err(StoreError::InvalidAction)?;

        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let user_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let session = Session::new(
            session_id,
            User::new(user_id.clone(), name, Role::Host, now),
            template,
            now,
        );

        let session = self.inner.store.create(session).await?;
        info!("Session {} created by {} ({})", session.id, name, user_id);
        Ok((session, user_id))
    }

    pub async fn join(&self, session_id: &str, name: &str, role: Role) -> Result<(Session, UserId), StoreError> {
        let name = validate_name(name)?.to_string();
        let user_id = Uuid::new_v4().to_string();

        let updated = self
            .inner
            .store
            .update(session_id, |session| {
                session.add_user(User::new(user_id.clone(), name.clone(), role, Utc::now()));
                Ok(())
            })
            .await?;

        info!("{} ({}) joined session {} as {:?}", name, user_id, session_id, role);
        self.publish(&updated.session, updated.deleted, true).await;
        Ok((updated.session, user_id))
    }

    /// Idempotent read for polling clients. Members keep the record alive by reading it.
    pub async fn snapshot(&self, session_id: &str, viewer: Option<&str>) -> Result<SessionView, StoreError> {
        let session = self.inner.store.get(session_id).await?;
        if viewer.is_some_and(|v| session.user(v).is_some()) {
            if let Err(e) = self.inner.store.touch(session_id).await {
                debug!("Session {}: touch after read failed: {}", session_id, e);
            }
        }
        Ok(session.view_for(viewer))
    }

    /// Verify membership and register a push socket for `user_id`.
    pub async fn attach(
        &self,
        session_id: &str,
        user_id: &str,
        kind: ChannelKind,
    ) -> Result<(Registration, SessionView), GatewayError> {
        let session = self.inner.store.get(session_id).await?;
        if session.user(user_id).is_none() {
            return Err(StoreError::UserNotFound(user_id.to_string()).into());
        }

        let registration = self.inner.registry.register(session_id, user_id, kind).await?;
        if let Err(e) = self.inner.store.touch(session_id).await {
            debug!("Session {}: touch on attach failed: {}", session_id, e);
        }
        Ok((registration, session.view_for(Some(user_id))))
    }

    /// Apply one inbound action. Returns the new state, or `None` if the
    /// session ended as a result.
    pub async fn apply(&self, action: &ClientAction) -> Result<Option<Session>, StoreError> {
        let templates = self.inner.templates.clone();
        let result = self
            .inner
            .store
            .update(&action.session_id, |session| {
                rules::apply_action(
                    session,
                    &action.user_id,
                    &action.payload,
                    templates.as_ref(),
                    Utc::now(),
                )
            })
            .await;

        let updated = match result {
            Ok(updated) => updated,
            Err(e) if e.is_rejection() => {
                debug!(
                    "{} from {} in session {} rejected: {}",
                    action.payload.kind(),
                    action.user_id,
                    action.session_id,
                    e
                );
                return Err(e);
            }
            Err(e) => {
                error!(
                    "{} from {} in session {} failed: {}",
                    action.payload.kind(),
                    action.user_id,
                    action.session_id,
                    e
                );
                return Err(e);
            }
        };

        if let Some(connection_id) = action.connection_id {
            let registry = &self.inner.registry;
            if !registry.touch_owned(connection_id, &action.session_id, &action.user_id).await {
                debug!("Ignoring connection {} not held by {}", connection_id, action.user_id);
            }
        }

        if matches!(action.payload, ActionPayload::Heartbeat) {
            tracing::trace!("Heartbeat from {} in session {}", action.user_id, action.session_id);
        } else {
            debug!(
                "{} from {} applied to session {}",
                action.payload.kind(),
                action.user_id,
                action.session_id
            );
        }
        if updated.value == Applied::Left {
            info!("{} left session {}", action.user_id, action.session_id);
        }

        if let Some(host) = &updated.new_host {
            info!("Host seat in session {} moved to {}", action.session_id, host);
        }
        let visible_change =
            updated.value != Applied::PresenceOnly || !updated.reaped.is_empty() || updated.new_host.is_some();
        self.publish(&updated.session, updated.deleted, visible_change).await;

        Ok((!updated.deleted).then_some(updated.session))
    }

    async fn publish(&self, session: &Session, deleted: bool, changed: bool) {
        let registry = &self.inner.registry;
        if deleted {
            registry
                .broadcast(
                    &session.id,
                    ServerEvent::SessionExpired {
                        session_id: session.id.clone(),
                    },
                )
                .await;
            registry.close_session(&session.id).await;
            return;
        }
        if !changed {
            return;
        }
        let report = registry.broadcast_session(session).await;
        if report.failed > 0 {
            warn!(
                "Session {}: update reached {} sockets, {} failed",
                session.id, report.delivered, report.failed
            );
        }
    }

    pub async fn stats(&self) -> StatsResponse {
        let sessions = match self.inner.store.count().await {
            Ok(count) => count,
            Err(e) => {
                warn!("Stats: session count unavailable: {}", e);
                0
            }
        };
        let registry = self.inner.registry.stats().await;
        StatsResponse {
            sessions,
            connections: registry.connections,
            sessions_with_connections: registry.sessions_with_connections,
            disconnects_total: registry.disconnects_total,
            broadcast_failures_total: registry.broadcast_failures_total,
            average_quality: registry.average_quality,
        }
    }
}

fn validate_name(name: &str) -> Result<&str, StoreError> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(StoreError::InvalidAction(format!(
            "name must be 1..={} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name)
}
