use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use tally_types::error::ErrorCode;
use tally_types::events::{ClientAction, ServerEvent};
use tally_types::models::SessionView;

use super::{Endpoint, Transport, TransportEvent, TransportKind, post_action, rejection};
use crate::error::ClientError;

/// Fixed-interval snapshot reads. Never "fails" once running: read errors
/// are reported as `error` events and the next tick tries again.
pub struct PollingTransport {
    client: reqwest::Client,
    snapshot_url: String,
    actions_url: String,
    interval: Duration,
    request_timeout: Duration,
    events: Option<mpsc::Sender<TransportEvent>>,
    task: Option<JoinHandle<()>>,
}

impl PollingTransport {
    pub fn new(client: reqwest::Client, endpoint: &Endpoint, interval: Duration, request_timeout: Duration) -> Self {
        Self {
            client,
            snapshot_url: endpoint.snapshot_url(),
            actions_url: endpoint.actions_url(),
            interval,
            request_timeout,
            events: None,
            task: None,
        }
    }
}

async fn fetch(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<SessionView, ClientError> {
    let response = client.get(url).timeout(timeout).send().await?;
    if !response.status().is_success() {
        return Err(rejection(response).await);
    }
    Ok(response.json().await?)
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    /// Connected means the first read succeeded.
    async fn connect(&mut self, events: mpsc::Sender<TransportEvent>) -> Result<(), ClientError> {
        let first = fetch(&self.client, &self.snapshot_url, self.request_timeout).await?;
        let session_id = first.id.clone();
        let mut seen: DateTime<Utc> = first.last_updated;

        let _ = events.send(TransportEvent::Connected).await;
        let _ = events
            .send(TransportEvent::Message(ServerEvent::SessionUpdate { session: first }))
            .await;

        let client = self.client.clone();
        let url = self.snapshot_url.clone();
        let interval = self.interval;
        let timeout = self.request_timeout;
        let tick_events = events.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                trace!("Polling {}", url);
                match fetch(&client, &url, timeout).await {
                    Ok(session) => {
                        if session.last_updated <= seen {
                            continue;
                        }
                        seen = session.last_updated;
                        if tick_events
                            .send(TransportEvent::Message(ServerEvent::SessionUpdate { session }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(ClientError::Rejected {
                        code: ErrorCode::NotFound,
                        ..
                    }) => {
                        debug!("Session {} is gone, polling stops", session_id);
                        let _ = tick_events
                            .send(TransportEvent::Message(ServerEvent::SessionExpired {
                                session_id: session_id.clone(),
                            }))
                            .await;
                        let _ = tick_events
                            .send(TransportEvent::Disconnected {
                                reason: "session expired".into(),
                            })
                            .await;
                        return;
                    }
                    Err(e) => {
                        if tick_events.send(TransportEvent::Error(e.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }));
        self.events = Some(events);
        Ok(())
    }

    /// POSTs the action; the response carries the new state, so it is
    /// surfaced right away instead of waiting for the next tick.
    async fn send(&mut self, action: ClientAction) -> Result<(), ClientError> {
        let events = self.events.as_ref().ok_or(ClientError::NotConnected)?;
        let response = post_action(&self.client, &self.actions_url, &action, self.request_timeout).await?;
        if let Some(session) = response.session {
            let _ = events
                .send(TransportEvent::Message(ServerEvent::SessionUpdate { session }))
                .await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events = None;
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
