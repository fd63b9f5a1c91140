use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::Rng;
use tally_types::models::{Session, User};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

use crate::backend::{CasOutcome, SessionBackend};
use crate::config::StoreConfig;
use crate::error::{BackendError, StoreError};
use crate::presence::PresenceTracker;

/// Result of a successful [`SessionStore::update`].
#[derive(Debug, Clone)]
pub struct Updated<T> {
    /// State as persisted (or as it was when deleted).
    pub session: Session,
    /// Whatever the mutator returned.
    pub value: T,
    /// Users removed by the presence pass that ran inside this update.
    pub reaped: Vec<User>,
    /// Set when that pass moved the seat away from a silent host.
    pub new_host: Option<String>,
    /// The roster emptied and the record was removed.
    pub deleted: bool,
}

/// Single source of truth for session state.
///
/// Updates to one session are serialized by a per-session lock and, across
/// processes, by the backend's version check. Unrelated sessions never wait
/// on each other.
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    presence: PresenceTracker,
    config: StoreConfig,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, presence: PresenceTracker, config: StoreConfig) -> Self {
        Self {
            backend,
            presence,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub async fn create(&self, session: Session) -> Result<Session, StoreError> {
        let id = session.id.clone();
        self.serialized(&id, async {
            match self
                .retrying("create", || self.backend.put(&session, None, self.config.ttl))
                .await?
            {
                CasOutcome::Applied(_) => {
                    debug!("Session {} created", id);
                    Ok(session.clone())
                }
                CasOutcome::Conflict => Err(StoreError::AlreadyExists(id.clone())),
            }
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Session, StoreError> {
        self.retrying("load", || self.backend.load(id))
            .await?
            .map(|stored| stored.session)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Apply `mutator` to the current snapshot and persist the result.
    ///
    /// The mutator may run more than once if another writer got in first; it
    /// always sees the latest state. A mutator error aborts without writing.
    /// Presence reaping runs after the mutator, in the same write.
    pub async fn update<F, T>(&self, id: &str, mut mutator: F) -> Result<Updated<T>, StoreError>
    where
        F: FnMut(&mut Session) -> Result<T, StoreError> + Send,
        T: Send,
    {
        self.serialized(id, async {
            let mut conflicts = 0;
            loop {
                let stored = self
                    .retrying("load", || self.backend.load(id))
                    .await?
                    .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

                let mut session = stored.session;
                let value = mutator(&mut session)?;

                let now = Utc::now();
                let reaped = self.presence.reap(&mut session, now);
                let new_host = self.presence.hand_over_stale_host(&mut session, now);
                session.bump(now);

                let outcome = if session.users.is_empty() {
                    self.remove_at(id, stored.version).await?
                } else {
                    self.commit(&session, stored.version).await?
                };

                match outcome {
                    CasOutcome::Applied(_) => {
                        let deleted = session.users.is_empty();
                        if deleted {
                            debug!("Session {} emptied and removed", id);
                        }
                        return Ok(Updated {
                            session,
                            value,
                            reaped,
                            new_host,
                            deleted,
                        });
                    }
                    CasOutcome::Conflict => {
                        conflicts += 1;
                        if conflicts > self.config.max_conflicts {
                            error!("Session {}: gave up after {} write conflicts", id, conflicts);
                            return Err(StoreError::Unavailable {
                                attempts: conflicts,
                                reason: "persistent write conflicts".into(),
                            });
                        }
                        debug!("Session {}: write conflict #{}, re-reading", id, conflicts);
                    }
                }
            }
        })
        .await
    }

    /// Extend expiry without changing content.
    pub async fn touch(&self, id: &str) -> Result<(), StoreError> {
        if self
            .retrying("touch", || self.backend.touch(id, self.config.ttl))
            .await?
        {
            Ok(())
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.serialized(id, async {
            self.retrying("delete", || self.backend.delete(id)).await
        })
        .await
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.retrying("count", || self.backend.count()).await
    }

    /// Versioned write of `session` over `expected`.
    ///
    /// A failed or timed-out attempt may still have landed. Before each retry
    /// the record is re-read; finding exactly our write one version up means
    /// the earlier attempt committed, so the mutator must not run again.
    async fn commit(&self, session: &Session, expected: u64) -> Result<CasOutcome, StoreError> {
        let retried = &AtomicBool::new(false);
        self.retrying("put", move || async move {
            if retried.swap(true, Ordering::SeqCst) {
                if let Some(current) = self.backend.load(&session.id).await? {
                    if current.version == expected + 1 && current.session == *session {
                        debug!("Session {}: earlier write landed at version {}", session.id, current.version);
                        return Ok(CasOutcome::Applied(current.version));
                    }
                }
            }
            self.backend.put(session, Some(expected), self.config.ttl).await
        })
        .await
    }

    /// Conditional delete with the same landed-write check as [`Self::commit`].
    async fn remove_at(&self, id: &str, expected: u64) -> Result<CasOutcome, StoreError> {
        let retried = &AtomicBool::new(false);
        self.retrying("delete", move || async move {
            if retried.swap(true, Ordering::SeqCst) && self.backend.load(id).await?.is_none() {
                debug!("Session {}: earlier delete landed", id);
                return Ok(CasOutcome::Applied(expected));
            }
            self.backend.delete_if(id, expected).await
        })
        .await
    }

    /// Run `op` while holding this session's lock.
    async fn serialized<Fut, T>(&self, id: &str, op: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(id.to_string()).or_default().clone()
        };

        let result = {
            let _guard = lock.lock().await;
            op.await
        };
        drop(lock);

        // Drop the lock entry once nobody else is holding or waiting on it
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
        result
    }

    /// Bounded retry with `base * attempt + jitter` backoff for transient
    /// backend failures and per-call timeouts.
    async fn retrying<F, Fut, T>(&self, what: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(BackendError::Corrupt { id, reason })) => {
                    error!("Store {}: corrupt record for {}: {}", what, id, reason);
                    return Err(StoreError::Unavailable {
                        attempts: attempt,
                        reason: format!("corrupt record: {}", reason),
                    });
                }
                Ok(Err(BackendError::Unavailable(reason))) => last_error = reason,
                Err(_) => last_error = format!("{} timed out after {:?}", what, self.config.call_timeout),
            }

            if attempt < attempts {
                let delay = self.retry_delay(attempt);
                warn!(
                    "Store {} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, attempts, last_error, delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        error!("Store {} failed after {} attempts: {}", what, attempts, last_error);
        Err(StoreError::Unavailable {
            attempts,
            reason: last_error,
        })
    }

    fn retry_delay(&self, attempt: u32) -> std::time::Duration {
        let base = self.config.retry_base;
        let jitter_ms = base.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..jitter_ms)
        };
        base * attempt + std::time::Duration::from_millis(jitter)
    }
}
