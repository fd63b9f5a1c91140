use std::time::Duration;

use async_trait::async_trait;
use tally_types::models::Session;

use crate::error::BackendError;

/// A stored session and the version it was written at.
#[derive(Debug, Clone)]
pub struct Versioned {
    pub session: Session,
    pub version: u64,
}

/// Result of a compare-and-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Written; carries the new version.
    Applied(u64),
    /// Someone else wrote first (or the record vanished).
    Conflict,
}

/// TTL-backed key-value storage for session records.
///
/// Expired records must behave as absent on every call; the backend reclaims
/// them itself, nothing sweeps on its behalf.
#[async_trait]
pub trait SessionBackend: Send + Sync + 'static {
    async fn load(&self, id: &str) -> Result<Option<Versioned>, BackendError>;

    /// Write `session`. `expected = None` only succeeds if no live record
    /// exists; `Some(v)` only if the live record is still at version `v`.
    async fn put(
        &self,
        session: &Session,
        expected: Option<u64>,
        ttl: Duration,
    ) -> Result<CasOutcome, BackendError>;

    /// Extend expiry without touching content. False if absent.
    async fn touch(&self, id: &str, ttl: Duration) -> Result<bool, BackendError>;

    /// Remove if still at `version`.
    async fn delete_if(&self, id: &str, version: u64) -> Result<CasOutcome, BackendError>;

    /// Unconditional removal. False if absent.
    async fn delete(&self, id: &str) -> Result<bool, BackendError>;

    /// Live record count.
    async fn count(&self) -> Result<usize, BackendError>;
}
