mod polling;
mod sse;
mod websocket;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tally_types::api::ErrorBody;
use tally_types::events::{ClientAction, ServerEvent};
use tally_types::models::{SessionId, UserId};

use crate::error::ClientError;

pub use polling::PollingTransport;
pub use sse::{SseReader, SseTransport};
pub use websocket::WebSocketTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    Sse,
    Polling,
}

impl TransportKind {
    /// Push channels are the ones worth promoting back to.
    pub fn is_push(self) -> bool {
        !matches!(self, Self::Polling)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
            Self::Polling => "polling",
        })
    }
}

/// What every transport reports, whatever it is underneath.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Message(ServerEvent),
    Error(String),
}

/// One concrete way of reaching the server.
///
/// `connect` resolves once the server has acknowledged the channel; after
/// that, everything arrives on `events`. Dropping a transport stops all of
/// its background work.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    async fn connect(&mut self, events: mpsc::Sender<TransportEvent>) -> Result<(), ClientError>;

    async fn send(&mut self, action: ClientAction) -> Result<(), ClientError>;

    async fn close(&mut self);
}

pub trait TransportFactory: Send + Sync + 'static {
    fn create(&self, kind: TransportKind) -> Box<dyn Transport>;
}

/// Where a client's session lives on the server.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub base_url: String,
    pub session_id: SessionId,
    pub user_id: UserId,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, session_id: impl Into<SessionId>, user_id: impl Into<UserId>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: session_id.into(),
            user_id: user_id.into(),
        }
    }

    fn session_url(&self) -> String {
        format!("{}/sessions/{}", self.base_url, self.session_id)
    }

    pub fn websocket_url(&self) -> String {
        let http = format!("{}/ws?userId={}", self.session_url(), self.user_id);
        if let Some(rest) = http.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = http.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            http
        }
    }

    pub fn events_url(&self) -> String {
        format!("{}/events?userId={}", self.session_url(), self.user_id)
    }

    pub fn snapshot_url(&self) -> String {
        format!("{}?userId={}", self.session_url(), self.user_id)
    }

    pub fn actions_url(&self) -> String {
        format!("{}/actions", self.session_url())
    }
}

/// Builds the real network transports for one endpoint.
pub struct HttpTransports {
    endpoint: Endpoint,
    client: reqwest::Client,
    poll_interval: Duration,
    request_timeout: Duration,
}

impl HttpTransports {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            poll_interval: Duration::from_secs(4),
            request_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl TransportFactory for HttpTransports {
    fn create(&self, kind: TransportKind) -> Box<dyn Transport> {
        match kind {
            TransportKind::WebSocket => Box::new(WebSocketTransport::new(self.endpoint.websocket_url())),
            TransportKind::Sse => Box::new(SseTransport::new(
                self.client.clone(),
                &self.endpoint,
                self.request_timeout,
            )),
            TransportKind::Polling => Box::new(PollingTransport::new(
                self.client.clone(),
                &self.endpoint,
                self.poll_interval,
                self.request_timeout,
            )),
        }
    }
}

/// Turn a non-success HTTP response into the server's own error, if it sent one.
pub(crate) async fn rejection(response: reqwest::Response) -> ClientError {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => ClientError::Rejected {
            code: body.code,
            message: body.message,
        },
        Err(_) => ClientError::Closed(format!("server answered {status}")),
    }
}

/// POST an action and return the acting user's view of the result.
pub(crate) async fn post_action(
    client: &reqwest::Client,
    url: &str,
    action: &ClientAction,
    timeout: Duration,
) -> Result<tally_types::api::ActionResponse, ClientError> {
    let response = client.post(url).json(action).timeout(timeout).send().await?;
    if !response.status().is_success() {
        return Err(rejection(response).await);
    }
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls() {
        let endpoint = Endpoint::new("http://localhost:3000/", "s1", "u1");
        assert_eq!(endpoint.websocket_url(), "ws://localhost:3000/sessions/s1/ws?userId=u1");
        assert_eq!(endpoint.events_url(), "http://localhost:3000/sessions/s1/events?userId=u1");
        assert_eq!(endpoint.snapshot_url(), "http://localhost:3000/sessions/s1?userId=u1");
        assert_eq!(endpoint.actions_url(), "http://localhost:3000/sessions/s1/actions");

        let secure = Endpoint::new("https://tally.example", "s1", "u1");
        assert!(secure.websocket_url().starts_with("wss://tally.example/"));
    }
}
