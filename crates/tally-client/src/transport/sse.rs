use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use tally_types::events::{ClientAction, ServerEvent};

use super::{Endpoint, Transport, TransportEvent, TransportKind, post_action, rejection};
use crate::error::ClientError;

/// Incremental `text/event-stream` decoder yielding parsed server events.
/// Comment lines (keep-alives) and event names are skipped; the JSON body
/// already carries the event type.
///
/// Bytes are buffered raw and only complete blocks are decoded, so a
/// character split across network chunks arrives intact.
pub struct SseReader<S> {
    stream: S,
    buffer: Vec<u8>,
}

impl<S, B, E> SseReader<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    /// Next complete event. `None` once the server ends the response.
    pub async fn next_event(&mut self) -> Option<Result<ServerEvent, ClientError>> {
        loop {
            if let Some(block) = self.take_block() {
                let data = block
                    .split(|&b| b == b'\n')
                    .filter_map(|line| line.strip_prefix(b"data:"))
                    .map(|d| d.strip_prefix(b" ").unwrap_or(d))
                    .collect::<Vec<_>>()
                    .join(&b'\n');
                if data.is_empty() {
                    continue;
                }
                return Some(serde_json::from_slice(&data).map_err(ClientError::from));
            }

            match self.stream.next().await? {
                Ok(chunk) => self
                    .buffer
                    .extend(chunk.as_ref().iter().copied().filter(|&b| b != b'\r')),
                Err(e) => return Some(Err(ClientError::Closed(format!("event stream failed: {e}")))),
            }
        }
    }

    fn take_block(&mut self) -> Option<Vec<u8>> {
        let end = self.buffer.windows(2).position(|w| w == b"\n\n")?;
        let mut block: Vec<u8> = self.buffer.drain(..end + 2).collect();
        block.truncate(end);
        Some(block)
    }
}

/// Short-lived push channel. The server ends each response after a fixed
/// lifetime; this adapter reopens it without reporting a disconnect.
pub struct SseTransport {
    client: reqwest::Client,
    events_url: String,
    actions_url: String,
    request_timeout: Duration,
    connection_id: Arc<Mutex<Option<Uuid>>>,
    task: Option<JoinHandle<()>>,
}

impl SseTransport {
    pub fn new(client: reqwest::Client, endpoint: &Endpoint, request_timeout: Duration) -> Self {
        Self {
            client,
            events_url: endpoint.events_url(),
            actions_url: endpoint.actions_url(),
            request_timeout,
            connection_id: Arc::new(Mutex::new(None)),
            task: None,
        }
    }
}

async fn open(client: &reqwest::Client, url: &str) -> Result<reqwest::Response, ClientError> {
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(rejection(response).await);
    }
    Ok(response)
}

/// Read up to the `connected` event that opens every response.
async fn acknowledge<S, B, E>(reader: &mut SseReader<S>) -> Result<(Uuid, ServerEvent), ClientError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    match reader.next_event().await {
        Some(Ok(ServerEvent::Error { code, message })) => Err(ClientError::Rejected { code, message }),
        Some(Ok(event)) => match &event {
            ServerEvent::Connected { connection_id, .. } => {
                let connection_id = *connection_id;
                Ok((connection_id, event))
            }
            other => Err(ClientError::Closed(format!(
                "expected connected, got {}",
                other.kind()
            ))),
        },
        Some(Err(e)) => Err(e),
        None => Err(ClientError::Closed("event stream ended before acknowledging".into())),
    }
}

fn set_connection(slot: &Mutex<Option<Uuid>>, id: Option<Uuid>) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = id;
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn connect(&mut self, events: mpsc::Sender<TransportEvent>) -> Result<(), ClientError> {
        debug!("Opening event stream {}", self.events_url);
        let response = open(&self.client, &self.events_url).await?;
        let mut reader = SseReader::new(Box::pin(response.bytes_stream()));
        let (connection_id, first) = acknowledge(&mut reader).await?;
        set_connection(&self.connection_id, Some(connection_id));

        let _ = events.send(TransportEvent::Connected).await;
        let _ = events.send(TransportEvent::Message(first)).await;

        let client = self.client.clone();
        let url = self.events_url.clone();
        let slot = self.connection_id.clone();
        self.task = Some(tokio::spawn(async move {
            let reason = loop {
                match reader.next_event().await {
                    Some(Ok(event)) => {
                        let expired = matches!(event, ServerEvent::SessionExpired { .. });
                        if events.send(TransportEvent::Message(event)).await.is_err() {
                            return;
                        }
                        if expired {
                            break "session expired".to_string();
                        }
                    }
                    Some(Err(ClientError::Decode(e))) => {
                        warn!("Unreadable SSE event: {}", e);
                        let _ = events.send(TransportEvent::Error(e.to_string())).await;
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => {
                        // Lifetime reached server-side; reopen in place
                        trace!("Event stream ended, reopening");
                        set_connection(&slot, None);
                        let reopened = match open(&client, &url).await {
                            Ok(response) => response,
                            Err(e) => break e.to_string(),
                        };
                        reader = SseReader::new(Box::pin(reopened.bytes_stream()));
                        match acknowledge(&mut reader).await {
                            Ok((connection_id, event)) => {
                                set_connection(&slot, Some(connection_id));
                                if events.send(TransportEvent::Message(event)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => break e.to_string(),
                        }
                    }
                }
            };
            set_connection(&slot, None);
            let _ = events.send(TransportEvent::Disconnected { reason }).await;
        }));
        Ok(())
    }

    async fn send(&mut self, mut action: ClientAction) -> Result<(), ClientError> {
        if self.task.is_none() {
            return Err(ClientError::NotConnected);
        }
        action.connection_id = *self.connection_id.lock().unwrap_or_else(|e| e.into_inner());
        post_action(&self.client, &self.actions_url, &action, self.request_timeout).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        set_connection(&self.connection_id, None);
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, String>> + Unpin {
        stream::iter(parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn decodes_events_split_across_chunks() {
        let mut reader = SseReader::new(chunks(&[
            ": keep-alive\n\n",
            "event: heartbeat_ack\ndata: {\"type\":\"heartbeat_",
            "ack\",\"data\":{\"timestamp\":\"2026-01-01T00:00:00Z\"}}\n\n",
            "event: session_expired\r\ndata: {\"type\":\"session_expired\",\"data\":{\"sessionId\":\"s\"}}\r\n\r\n",
        ]));

        let first = reader.next_event().await.unwrap().unwrap();
        assert_eq!(first.kind(), "heartbeat_ack");
        let second = reader.next_event().await.unwrap().unwrap();
        assert!(matches!(second, ServerEvent::SessionExpired { session_id } if session_id == "s"));
        assert!(reader.next_event().await.is_none());
    }

    #[tokio::test]
    async fn multibyte_text_split_mid_character_survives() {
        let frame = "data: {\"type\":\"session_expired\",\"data\":{\"sessionId\":\"Zoë\"}}\n\n".as_bytes();
        let split = frame.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let parts: Vec<Result<Vec<u8>, String>> = vec![Ok(frame[..split].to_vec()), Ok(frame[split..].to_vec())];
        let mut reader = SseReader::new(stream::iter(parts));

        let event = reader.next_event().await.unwrap().unwrap();
        assert!(matches!(event, ServerEvent::SessionExpired { session_id } if session_id == "Zoë"));
    }

    #[tokio::test]
    async fn bad_json_is_an_error_not_the_end() {
        let mut reader = SseReader::new(chunks(&[
            "data: not json\n\n",
            "data: {\"type\":\"session_expired\",\"data\":{\"sessionId\":\"s\"}}\n\n",
        ]));
        assert!(matches!(reader.next_event().await, Some(Err(ClientError::Decode(_)))));
        assert!(matches!(reader.next_event().await, Some(Ok(ServerEvent::SessionExpired { .. }))));
    }
}
