use std::time::Duration;

/// Transport-side tuning. The socket timeout is a transport fact and is kept
/// tighter than the presence timeout, which is an application fact.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Server ping cadence on WebSocket connections.
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered pings before a WebSocket is dropped.
    pub max_missed_pongs: u8,
    /// Silence after which the health sweep closes a socket.
    pub socket_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_connections_per_session: usize,
    /// Per-connection outbound queue depth.
    pub channel_capacity: usize,
    /// Bound on a single outbound socket write.
    pub send_timeout: Duration,
    /// Server-side lifetime of one SSE response.
    pub sse_lifetime: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            max_missed_pongs: 2,
            socket_timeout: Duration::from_secs(45),
            sweep_interval: Duration::from_secs(20),
            max_connections_per_session: 50,
            channel_capacity: 64,
            send_timeout: Duration::from_secs(5),
            sse_lifetime: Duration::from_secs(55),
        }
    }
}

impl GatewayConfig {
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections_per_session = max;
        self
    }

    #[must_use]
    pub fn with_sse_lifetime(mut self, lifetime: Duration) -> Self {
        self.sse_lifetime = lifetime;
        self
    }

    /// `presence_timeout` is the roster timeout the socket timeout must undercut.
    pub fn validate(&self, presence_timeout: Duration) -> Result<(), String> {
        if self.socket_timeout <= self.heartbeat_interval {
            return Err(format!(
                "socket timeout {:?} must exceed the ping interval {:?}",
                self.socket_timeout, self.heartbeat_interval
            ));
        }
        if self.socket_timeout >= presence_timeout {
            return Err(format!(
                "socket timeout {:?} must be tighter than the presence timeout {:?}",
                self.socket_timeout, presence_timeout
            ));
        }
        if self.max_connections_per_session == 0 || self.channel_capacity == 0 {
            return Err("connection ceiling and channel capacity must be non-zero".into());
        }
        Ok(())
    }
}
