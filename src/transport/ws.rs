use anyhow::Result;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use std::sync::Arc;

use super::messages::{InboundEvent, OutboundMessage};
use super::Transport;
use crate::error::SessionError;
use crate::session::SessionConfig;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Websocket transport to the model endpoint.
///
/// Outbound messages are serialized behind a single writer lock, so send
/// order matches call order. A reader task parses each text frame into an
/// [`InboundEvent`] and forwards it in arrival order; frames that do not
/// match the schema are logged and dropped rather than ending the session.
pub struct WsTransport {
    url: String,
    writer: Option<Arc<Mutex<WsSink>>>,
    reader_task: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            writer: None,
            reader_task: None,
        }
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn open(
        &mut self,
        config: &SessionConfig,
    ) -> Result<mpsc::Receiver<InboundEvent>, SessionError> {
        info!("Connecting to model endpoint at {}", self.url);

        let (socket, _response) = connect_async(&self.url)
            .await
            .map_err(|e| SessionError::TransportOpenFailed(e.to_string()))?;

        let (mut write, read) = socket.split();

        let setup = OutboundMessage::Setup {
            voice: config.voice.as_str().to_string(),
            system_instruction: config.system_instruction.clone(),
            transcribe_input: config.transcribe_input,
            transcribe_output: config.transcribe_output,
        };
        let setup_json = serde_json::to_string(&setup)
            .map_err(|e| SessionError::TransportOpenFailed(e.to_string()))?;
        write
            .send(Message::Text(setup_json))
            .await
            .map_err(|e| SessionError::TransportOpenFailed(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel::<InboundEvent>(64);

        let reader_task = tokio::spawn(async move {
            let mut read = read;
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<InboundEvent>(&text) {
                            Ok(event) => {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Dropping malformed inbound event: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        let _ = event_tx.send(InboundEvent::Closed).await;
                        break;
                    }
                    Ok(_) => {
                        // Ping/pong handled by tungstenite; binary frames are
                        // not part of the schema.
                    }
                    Err(e) => {
                        let _ = event_tx
                            .send(InboundEvent::Error {
                                message: e.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
            info!("Transport reader task stopped");
        });

        self.writer = Some(Arc::new(Mutex::new(write)));
        self.reader_task = Some(reader_task);

        info!("Transport session open");
        Ok(event_rx)
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), SessionError> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| SessionError::TransportSendFailed("transport not open".to_string()))?;

        let json = serde_json::to_string(&message)
            .map_err(|e| SessionError::TransportSendFailed(e.to_string()))?;

        writer
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| SessionError::TransportSendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            // Best effort; resource release must not depend on the peer.
            if let Err(e) = writer.lock().await.send(Message::Close(None)).await {
                warn!("Websocket close handshake failed: {}", e);
            }
        }

        if let Some(task) = self.reader_task.take() {
            task.abort();
        }

        Ok(())
    }
}
