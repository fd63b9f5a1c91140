use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use tally_types::models::Session;
use tracing::info;

use crate::backend::{CasOutcome, SessionBackend, Versioned};
use crate::error::BackendError;

/// SQLite-backed session records. Several processes may share one file;
/// the version column keeps their writes from clobbering each other.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent readers across processes
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(2))?;

        migrate(&conn)?;

        info!("Session database opened at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection off the async runtime.
    async fn with_conn<F, T>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&Connection, i64) -> Result<T, BackendError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| BackendError::Unavailable(format!("DB lock poisoned: {}", e)))?;
            f(&conn, now_millis())
        })
        .await
        .map_err(|e| BackendError::Unavailable(format!("spawn_blocking join error: {}", e)))?
    }
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sessions (
            id          TEXT PRIMARY KEY,
            data        TEXT NOT NULL,
            version     INTEGER NOT NULL,
            expires_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_expiry
            ON sessions(expires_at);
        ",
    )?;
    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn db_err(e: rusqlite::Error) -> BackendError {
    BackendError::Unavailable(e.to_string())
}

#[async_trait]
impl SessionBackend for SqliteBackend {
    async fn load(&self, id: &str) -> Result<Option<Versioned>, BackendError> {
        let id = id.to_string();
        self.with_conn(move |conn, now| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT data, version FROM sessions WHERE id = ?1 AND expires_at > ?2",
                    rusqlite::params![id, now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;

            let Some((data, version)) = row else {
                return Ok(None);
            };
            let session = serde_json::from_str::<Session>(&data).map_err(|e| BackendError::Corrupt {
                id: id.clone(),
                reason: e.to_string(),
            })?;
            Ok(Some(Versioned {
                session,
                version: version as u64,
            }))
        })
        .await
    }

    async fn put(
        &self,
        session: &Session,
        expected: Option<u64>,
        ttl: Duration,
    ) -> Result<CasOutcome, BackendError> {
        let id = session.id.clone();
        let data = serde_json::to_string(session).map_err(|e| BackendError::Corrupt {
            id: id.clone(),
            reason: e.to_string(),
        })?;

        self.with_conn(move |conn, now| {
            // Opportunistic purge keeps the table bounded without a sweeper
            conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", [now])
                .map_err(db_err)?;

            let expires_at = expiry(now, ttl);
            let outcome = match expected {
                None => {
                    let changed = conn
                        .execute(
                            "INSERT OR IGNORE INTO sessions (id, data, version, expires_at)
                             VALUES (?1, ?2, 1, ?3)",
                            rusqlite::params![id, data, expires_at],
                        )
                        .map_err(db_err)?;
                    if changed == 1 { CasOutcome::Applied(1) } else { CasOutcome::Conflict }
                }
                Some(version) => {
                    let changed = conn
                        .execute(
                            "UPDATE sessions SET data = ?1, version = version + 1, expires_at = ?2
                             WHERE id = ?3 AND version = ?4",
                            rusqlite::params![data, expires_at, id, version as i64],
                        )
                        .map_err(db_err)?;
                    if changed == 1 {
                        CasOutcome::Applied(version + 1)
                    } else {
                        CasOutcome::Conflict
                    }
                }
            };
            Ok(outcome)
        })
        .await
    }

    async fn touch(&self, id: &str, ttl: Duration) -> Result<bool, BackendError> {
        let id = id.to_string();
        self.with_conn(move |conn, now| {
            let changed = conn
                .execute(
                    "UPDATE sessions SET expires_at = ?1 WHERE id = ?2 AND expires_at > ?3",
                    rusqlite::params![expiry(now, ttl), id, now],
                )
                .map_err(db_err)?;
            Ok(changed == 1)
        })
        .await
    }

    async fn delete_if(&self, id: &str, version: u64) -> Result<CasOutcome, BackendError> {
        let id = id.to_string();
        self.with_conn(move |conn, _| {
            let changed = conn
                .execute(
                    "DELETE FROM sessions WHERE id = ?1 AND version = ?2",
                    rusqlite::params![id, version as i64],
                )
                .map_err(db_err)?;
            Ok(if changed == 1 { CasOutcome::Applied(version) } else { CasOutcome::Conflict })
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool, BackendError> {
        let id = id.to_string();
        self.with_conn(move |conn, now| {
            let changed = conn
                .execute(
                    "DELETE FROM sessions WHERE id = ?1 AND expires_at > ?2",
                    rusqlite::params![id, now],
                )
                .map_err(db_err)?;
            Ok(changed == 1)
        })
        .await
    }

    async fn count(&self) -> Result<usize, BackendError> {
        self.with_conn(|conn, now| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sessions WHERE expires_at > ?1",
                    [now],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(count as usize)
        })
        .await
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
    async fn round_trips_and_versions() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let ttl = Duration::from_secs(60);

        assert_eq!(backend.put(&session("s"), None, ttl).await.unwrap(), CasOutcome::Applied(1));
        assert_eq!(backend.put(&session("s"), None, ttl).await.unwrap(), CasOutcome::Conflict);

        let mut stored = backend.load("s").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        stored.session.revealed = true;

        assert_eq!(
            backend.put(&stored.session, Some(1), ttl).await.unwrap(),
            CasOutcome::Applied(2)
        );
        assert_eq!(
            backend.put(&stored.session, Some(1), ttl).await.unwrap(),
            CasOutcome::Conflict
        );
        assert!(backend.load("s").await.unwrap().unwrap().session.revealed);
        assert_eq!(backend.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_records_are_invisible_and_replaceable() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.put(&session("s"), None, Duration::ZERO).await.unwrap();

        assert!(backend.load("s").await.unwrap().is_none());
        assert!(!backend.touch("s", Duration::from_secs(60)).await.unwrap());
        assert_eq!(
            backend.put(&session("s"), None, Duration::from_secs(60)).await.unwrap(),
            CasOutcome::Applied(1)
        );
    }

    #[tokio::test]
    async fn conditional_delete_respects_version() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let ttl = Duration::from_secs(60);
        backend.put(&session("s"), None, ttl).await.unwrap();

        assert_eq!(backend.delete_if("s", 7).await.unwrap(), CasOutcome::Conflict);
        assert_eq!(backend.delete_if("s", 1).await.unwrap(), CasOutcome::Applied(1));
        assert!(!backend.delete("s").await.unwrap());
    }
}
