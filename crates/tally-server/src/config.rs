use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use tally_gateway::config::GatewayConfig;
use tally_store::config::{PresenceConfig, StoreConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Sqlite,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => bail!("unknown store {other:?}, expected memory or sqlite"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreKind,
    pub db_path: PathBuf,
    pub store_config: StoreConfig,
    pub presence: PresenceConfig,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: u64| -> anyhow::Result<Duration> {
            match lookup(key) {
                Some(raw) => Ok(Duration::from_secs(
                    raw.parse().with_context(|| format!("{key} must be whole seconds"))?,
                )),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let presence = PresenceConfig {
            heartbeat_interval: secs("TALLY_HEARTBEAT_INTERVAL_SECS", 20)?,
            timeout: secs("TALLY_PRESENCE_TIMEOUT_SECS", 60)?,
            guard_fraction: var("TALLY_REAP_GUARD_FRACTION", "0.2")
                .parse()
                .context("TALLY_REAP_GUARD_FRACTION must be a number")?,
        };

        let mut gateway = GatewayConfig::default()
            .with_max_connections(
                var("TALLY_MAX_CONNECTIONS_PER_SESSION", "50")
                    .parse()
                    .context("TALLY_MAX_CONNECTIONS_PER_SESSION must be a number")?,
            )
            .with_sse_lifetime(secs("TALLY_SSE_LIFETIME_SECS", 55)?);
        gateway.heartbeat_interval = presence.heartbeat_interval;
        gateway.socket_timeout = secs("TALLY_SOCKET_TIMEOUT_SECS", 45)?;
        gateway.sweep_interval = secs("TALLY_SWEEP_INTERVAL_SECS", 20)?;

        let config = Self {
            host: var("TALLY_HOST", "0.0.0.0"),
            port: var("TALLY_PORT", "3000")
                .parse()
                .context("TALLY_PORT must be a port number")?,
            store: var("TALLY_STORE", "memory").parse()?,
            db_path: PathBuf::from(var("TALLY_DB_PATH", "tally.db")),
            store_config: StoreConfig::default().with_ttl(secs("TALLY_SESSION_TTL_SECS", 3600)?),
            presence,
            gateway,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.presence.validate().map_err(anyhow::Error::msg)?;
        self.gateway
            .validate(self.presence.timeout)
            .map_err(anyhow::Error::msg)?;
        if self.store_config.ttl <= self.presence.timeout {
            bail!(
                "session TTL {:?} must outlast the presence timeout {:?}",
                self.store_config.ttl,
                self.presence.timeout
            );
        }
        Ok(())
    }
}
