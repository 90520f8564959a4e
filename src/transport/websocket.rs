//! WebSocket transport and event loop.
//!
//! Bridges a realm to a native host process. Every [`Frame`] travels as one
//! JSON text message; binary, ping and pong messages are ignored.
//!
//! # Event Loop
//!
//! The transport spawns a tokio task that handles:
//!
//! - Incoming text messages, decoded and forwarded to the [`Endpoint`]
//! - Outgoing frames queued by the endpoint
//! - Graceful close on shutdown
//!
//! When the socket ends, the endpoint's inbound channel ends with it and
//! pending requests fail with [`Error::ConnectionClosed`].

// ============================================================================
// Imports
// ============================================================================

use futures_util::{SinkExt, StreamExt};
use serde_json::{from_str, to_string};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{Frame, SenderDescriptor};

use super::endpoint::{Endpoint, FrameSink};

// ============================================================================
// SocketCommand
// ============================================================================

/// Internal commands for the event loop.
enum SocketCommand {
    /// Write one frame.
    Send(Frame),
    /// Close the socket.
    Shutdown,
}

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Transport over a WebSocket stream.
///
/// # Example
///
/// ```ignore
/// let transport = WebSocketTransport::connect("ws://127.0.0.1:9222").await?;
/// let client = Client::new(realm, Arc::new(transport));
/// ```
#[derive(Clone)]
pub struct WebSocketTransport {
    endpoint: Endpoint,
}

impl WebSocketTransport {
    /// Wraps an established stream. `peer` describes the remote realm to
    /// local handlers.
    pub fn new<S>(ws_stream: WebSocketStream<S>, peer: SenderDescriptor) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_event_loop(ws_stream, command_rx, inbound_tx, peer));

        Self {
            endpoint: Endpoint::spawn("websocket", SocketSink { command_tx }, inbound_rx),
        }
    }

    /// Connects to a WebSocket server at `url`.
    ///
    /// The server side is described as the background realm.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`] if the handshake fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        info!(url, "WebSocket connected");
        Ok(Self::new(ws_stream, SenderDescriptor::background()))
    }

    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Closes the socket gracefully.
    pub fn shutdown(&self) {
        self.endpoint.close();
    }
}

super::delegate_to_endpoint!(WebSocketTransport, "websocket");

// ============================================================================
// SocketSink
// ============================================================================

struct SocketSink {
    command_tx: mpsc::UnboundedSender<SocketCommand>,
}

impl FrameSink for SocketSink {
    fn post(&self, frame: Frame) -> Result<()> {
        self.command_tx
            .send(SocketCommand::Send(frame))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn close(&self) {
        let _ = self.command_tx.send(SocketCommand::Shutdown);
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Pumps frames between the socket and the endpoint until either side ends.
async fn run_event_loop<S>(
    ws_stream: WebSocketStream<S>,
    mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
    inbound_tx: mpsc::UnboundedSender<(Frame, SenderDescriptor)>,
    peer: SenderDescriptor,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            // Incoming frames from the peer
            message = ws_read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match from_str::<Frame>(&text) {
                            Ok(frame) => {
                                if inbound_tx.send((frame, peer.clone())).is_err() {
                                    debug!("Endpoint dropped, stopping socket loop");
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, text = %text.as_str(), "Failed to parse incoming frame"),
                        }
                    }

                    Some(Ok(Message::Close(_))) => {
                        debug!("WebSocket closed by remote");
                        break;
                    }

                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket error");
                        break;
                    }

                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }

                    // Ignore Binary, Ping, Pong
                    _ => {}
                }
            }

            // Frames from the endpoint
            command = command_rx.recv() => {
                match command {
                    Some(SocketCommand::Send(frame)) => {
                        let json = match to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "Failed to serialize frame");
                                continue;
                            }
                        };
                        if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                            warn!(frame = frame.kind(), error = %e, "Failed to write frame");
                        } else {
                            trace!(frame = frame.kind(), "Frame written");
                        }
                    }

                    Some(SocketCommand::Shutdown) => {
                        debug!("Shutdown command received");
                        let _ = ws_write.close().await;
                        break;
                    }

                    None => {
                        debug!("Command channel closed");
                        break;
                    }
                }
            }
        }
    }

    debug!("WebSocket event loop terminated");
}

// ============================================================================
// Tests
// ============================================================================
