use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use tally_types::events::{ClientAction, ServerEvent};

use super::{Transport, TransportEvent, TransportKind};
use crate::error::ClientError;

const OUTBOUND_BUFFER: usize = 32;

/// Persistent bidirectional socket. Lowest latency; the first choice.
pub struct WebSocketTransport {
    url: String,
    outbound: Option<mpsc::Sender<Message>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new(url: String) -> Self {
        Self {
            url,
            outbound: None,
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn connect(&mut self, events: mpsc::Sender<TransportEvent>) -> Result<(), ClientError> {
        debug!("Opening WebSocket to {}", self.url);
        let (stream, _) = connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = stream.split();

        // The server speaks first: `connected`, or an `error` before closing
        let first = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => break serde_json::from_str::<ServerEvent>(text.as_str())?,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ClientError::Closed("socket closed before acknowledging".into()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };
        if let ServerEvent::Error { code, message } = first {
            return Err(ClientError::Rejected { code, message });
        }

        let _ = events.send(TransportEvent::Connected).await;
        let _ = events.send(TransportEvent::Message(first)).await;

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let reader_events = events;
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(event) => {
                            if reader_events.send(TransportEvent::Message(event)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("Unreadable WebSocket frame: {}", e);
                            let _ = reader_events.send(TransportEvent::Error(e.to_string())).await;
                        }
                    },
                    Some(Ok(Message::Ping(_))) => trace!("WebSocket ping"),
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(|| "closed by server".to_string(), |f| f.reason.as_str().to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = reader_events.send(TransportEvent::Disconnected { reason }).await;
        });

        self.outbound = Some(outbound_tx);
        self.tasks = vec![writer, reader];
        Ok(())
    }

    async fn send(&mut self, action: ClientAction) -> Result<(), ClientError> {
        let outbound = self.outbound.as_ref().ok_or(ClientError::NotConnected)?;
        let text = serde_json::to_string(&action)?;
        outbound
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| ClientError::Closed("websocket writer stopped".into()))
    }

    async fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.try_send(Message::Close(None));
        }
        // Give the writer a moment to flush the close frame
        if let Some(writer) = self.tasks.first_mut() {
            let _ = tokio::time::timeout(std::time::Duration::from_millis(250), writer).await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
