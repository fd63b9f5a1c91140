use chrono::{DateTime, Utc};
use tally_types::models::{Session, User};
use tracing::{debug, warn};

use crate::config::PresenceConfig;

/// Decides which roster members have gone quiet for good.
///
/// Liveness comes from `User::last_seen`, fed by heartbeats and by every
/// accepted action. Reaping runs inside a store update, never on its own.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    config: PresenceConfig,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn is_stale(&self, user: &User, now: DateTime<Utc>) -> bool {
        let silent = now.signed_duration_since(user.last_seen);
        silent
            .to_std()
            .map(|silent| silent > self.config.timeout)
            .unwrap_or(false)
    }

    /// Most users one pass may remove from a roster of `present`.
    pub fn reap_limit(&self, present: usize) -> usize {
        (present as f64 * self.config.guard_fraction).floor() as usize
    }

    /// Remove stale users, longest-silent first, bounded by the guard fraction.
    /// A store read taken during a network blip can make everyone look stale;
    /// the bound keeps that from emptying the session.
    ///
    /// The bound is a strict floor, so rosters smaller than `1 / guard_fraction`
    /// (under 5 at the default 0.2) never lose anyone here. A silent host in
    /// such a roster is handled by [`Self::hand_over_stale_host`] instead.
    pub fn reap(&self, session: &mut Session, now: DateTime<Utc>) -> Vec<User> {
        let mut stale: Vec<(DateTime<Utc>, String)> = session
            .users
            .iter()
            .filter(|u| self.is_stale(u, now))
            .map(|u| (u.last_seen, u.id.clone()))
            .collect();

        if stale.is_empty() {
            return Vec::new();
        }

        let limit = self.reap_limit(session.users.len());
        if stale.len() > limit {
            warn!(
                "Session {}: {} stale users, reap guard allows {}",
                session.id,
                stale.len(),
                limit
            );
        }

        stale.sort();
        stale
            .into_iter()
            .take(limit)
            .filter_map(|(_, user_id)| {
                let removed = session.remove_user(&user_id);
                if let Some(user) = &removed {
                    debug!("Session {}: reaped {} ({})", session.id, user.name, user.id);
                }
                removed
            })
            .collect()
    }

    /// Give the host seat to the oldest live voter when the host has gone
    /// silent but was not reaped. The old host stays on the roster as
    /// attendance. Returns the new host, if the seat moved.
    pub fn hand_over_stale_host(&self, session: &mut Session, now: DateTime<Utc>) -> Option<String> {
        let host = session.host_id.as_deref().and_then(|id| session.user(id))?;
        if !self.is_stale(host, now) {
            return None;
        }
        let next = session
            .users
            .iter()
            .find(|u| u.role.can_vote() && !session.is_host(&u.id) && !self.is_stale(u, now))?
            .id
            .clone();
        session.transfer_host(&next);
        debug!("Session {}: host silent, seat handed to {}", session.id, next);
        Some(next)
    }
}
