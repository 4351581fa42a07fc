//! WebSocket link used by the chat and research transports.
//!
//! A link is two spawned tasks around a split socket: a writer draining an
//! outgoing channel and a reader forwarding text frames in arrival order.
//! The job behind a research link lives on the server, so dropping the link
//! only drops the connection.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// Something that happened on an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text frame, in the order the server sent it.
    Frame(String),
    /// The socket ended. `error` is set for abnormal closes.
    Closed { error: Option<String> },
}

/// Sending half of an open WebSocket.
#[derive(Debug, Clone)]
pub struct WsLink {
    outgoing: mpsc::UnboundedSender<String>,
}

impl WsLink {
    /// Queue a text frame. Returns false once the socket is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outgoing.send(text.into()).is_ok()
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }
}

/// Open a WebSocket within `timeout` and start its pump tasks.
pub async fn connect(url: &str, timeout: Duration) -> Result<(WsLink, mpsc::Receiver<LinkEvent>)> {
    debug!(url, "opening websocket");
    let (ws, _) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| SyncError::ConnectTimeout(timeout))??;

    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (event_tx, event_rx) = mpsc::channel::<LinkEvent>(256);

    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::text(text)).await {
                debug!(error = %e, "websocket write failed");
                return;
            }
        }
        let _ = sink.close().await;
    });

    let url = url.to_string();
    tokio::spawn(async move {
        let mut error = None;
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if event_tx
                        .send(LinkEvent::Frame(text.as_str().to_owned()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(url = %url, error = %e, "websocket read failed");
                    error = Some(e.to_string());
                    break;
                }
            }
        }
        let _ = event_tx.send(LinkEvent::Closed { error }).await;
    });

    Ok((WsLink { outgoing: out_tx }, event_rx))
}
