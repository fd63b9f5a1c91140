use std::time::Duration;

/// Session record persistence and retry tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Expiry applied on every successful write.
    pub ttl: Duration,
    /// Upper bound on a single backend call.
    pub call_timeout: Duration,
    /// Attempts per backend call before surfacing `Unavailable`.
    pub retry_attempts: u32,
    /// Backoff is `retry_base * attempt + jitter(0..retry_base)`.
    pub retry_base: Duration,
    /// Version conflicts tolerated within one `update` before giving up.
    pub max_conflicts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            call_timeout: Duration::from_secs(5),
            retry_attempts: 3,
            retry_base: Duration::from_secs(1),
            max_conflicts: 8,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, attempts: u32, base: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_base = base;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Application-level liveness of roster members.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How often clients are expected to heartbeat.
    pub heartbeat_interval: Duration,
    /// Silence after which a user counts as departed.
    pub timeout: Duration,
    /// Largest share of present users one reap pass may remove.
    pub guard_fraction: f64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            timeout: Duration::from_secs(60),
            guard_fraction: 0.2,
        }
    }
}

/// Minimum timeout-to-interval ratio. Anything tighter reaps users on ordinary jitter.
pub const MIN_TIMEOUT_RATIO: u32 = 2;

impl PresenceConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval.is_zero() {
            return Err("presence heartbeat interval must be non-zero".into());
        }
        if self.timeout < self.heartbeat_interval * MIN_TIMEOUT_RATIO {
            return Err(format!(
                "presence timeout {:?} must be at least {}x the heartbeat interval {:?}",
                self.timeout, MIN_TIMEOUT_RATIO, self.heartbeat_interval
            ));
        }
        if !(0.0..=1.0).contains(&self.guard_fraction) {
            return Err(format!(
                "reap guard fraction {} must be within 0..=1",
                self.guard_fraction
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_presence_config_is_valid() {
        assert!(PresenceConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_timeout_too_close_to_interval() {
        let config = PresenceConfig {
            heartbeat_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(35),
            guard_fraction: 0.2,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_guard_fraction_out_of_range() {
        let config = PresenceConfig {
            guard_fraction: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
