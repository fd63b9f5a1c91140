use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tally_types::models::Session;
use tokio::time::Instant;

use crate::backend::{CasOutcome, SessionBackend, Versioned};
use crate::error::BackendError;

struct Entry {
    session: Session,
    version: u64,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local backend. Expired entries are evicted lazily on access.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<F, T>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&mut HashMap<String, Entry>, Instant) -> T,
    {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| BackendError::Unavailable(format!("memory backend lock poisoned: {}", e)))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(f(&mut entries, now))
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn load(&self, id: &str) -> Result<Option<Versioned>, BackendError> {
        self.with_entries(|entries, _| {
            entries.get(id).map(|entry| Versioned {
                session: entry.session.clone(),
                version: entry.version,
            })
        })
    }

    async fn put(
        &self,
        session: &Session,
        expected: Option<u64>,
        ttl: Duration,
    ) -> Result<CasOutcome, BackendError> {
        self.with_entries(|entries, now| {
            let current = entries.get(&session.id).map(|e| e.version);
            if current != expected {
                return CasOutcome::Conflict;
            }
            let version = current.unwrap_or(0) + 1;
            entries.insert(
                session.id.clone(),
                Entry {
                    session: session.clone(),
                    version,
                    expires_at: now + ttl,
                },
            );
            CasOutcome::Applied(version)
        })
    }

    async fn touch(&self, id: &str, ttl: Duration) -> Result<bool, BackendError> {
        self.with_entries(|entries, now| match entries.get_mut(id) {
            Some(entry) => {
                entry.expires_at = now + ttl;
                true
            }
            None => false,
        })
    }

    async fn delete_if(&self, id: &str, version: u64) -> Result<CasOutcome, BackendError> {
        self.with_entries(|entries, _| match entries.get(id) {
            Some(entry) if entry.version == version => {
                entries.remove(id);
                CasOutcome::Applied(version)
            }
            _ => CasOutcome::Conflict,
        })
    }

    async fn delete(&self, id: &str) -> Result<bool, BackendError> {
        self.with_entries(|entries, _| entries.remove(id).is_some())
    }

    async fn count(&self) -> Result<usize, BackendError> {
        self.with_entries(|entries, _| entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_types::models::{Role, Template, User};

    fn session(id: &str) -> Session {
        let now = Utc::now();
        Session::new(id, User::new("h", "Host", Role::Host, now), Template::default(), now)
    }

    #[tokio::test]
    async fn create_only_put_conflicts_on_existing_record() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(backend.put(&session("s"), None, ttl).await.unwrap(), CasOutcome::Applied(1));
        assert_eq!(backend.put(&session("s"), None, ttl).await.unwrap(), CasOutcome::Conflict);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        backend.put(&session("s"), None, ttl).await.unwrap();
        assert_eq!(backend.put(&session("s"), Some(1), ttl).await.unwrap(), CasOutcome::Applied(2));
        assert_eq!(backend.put(&session("s"), Some(1), ttl).await.unwrap(), CasOutcome::Conflict);
        assert_eq!(backend.delete_if("s", 1).await.unwrap(), CasOutcome::Conflict);
        assert_eq!(backend.delete_if("s", 2).await.unwrap(), CasOutcome::Applied(2));
    }

    #[tokio::test(start_paused = true)]
    async fn records_expire_without_sweeper() {
        let backend = MemoryBackend::new();
        backend.put(&session("s"), None, Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(backend.touch("s", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(backend.load("s").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(backend.load("s").await.unwrap().is_none());
        assert_eq!(backend.count().await.unwrap(), 0);
    }
}
