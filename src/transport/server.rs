//! WebSocket listener for native hosts.
//!
//! # Connection Flow
//!
//! 1. The host binds to `localhost:0` (random port)
//! 2. The URL from [`PendingServer::ws_url`] is handed to the extension
//! 3. The extension connects with [`WebSocketTransport::connect`]
//! 4. [`PendingServer::accept`] upgrades the socket and returns a transport
//!
//! A listener may accept any number of peers, one per call.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::SenderDescriptor;

use super::WebSocketTransport;

// ============================================================================
// Constants
// ============================================================================

/// Timeout for waiting for a peer to connect.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// PendingServer
// ============================================================================

/// A bound WebSocket listener.
///
/// # Example
///
/// ```ignore
/// use std::net::{IpAddr, Ipv4Addr};
/// use realmbus::transport::PendingServer;
///
/// let server = PendingServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
/// println!("{}", server.ws_url());
/// let transport = server.accept().await?;
/// ```
pub struct PendingServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl PendingServer {
    /// Binds to `ip:port`. Port 0 lets the OS pick.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(ip: IpAddr, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let addr = listener.local_addr()?;

        debug!(%addr, "WebSocket listener bound");
        Ok(Self { listener, addr })
    }

    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Returns `ws://{ip}:{port}`.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepts one peer and upgrades it to a WebSocket transport.
    ///
    /// The peer is described to local handlers as the background realm.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if nobody connects within 30s
    /// - [`Error::Transport`] if the WebSocket upgrade fails
    pub async fn accept(&self) -> Result<WebSocketTransport> {
        self.accept_as(SenderDescriptor::background()).await
    }

    /// Like [`accept`](Self::accept) with an explicit peer descriptor.
    ///
    /// # Errors
    ///
    /// See [`accept`](Self::accept).
    pub async fn accept_as(&self, peer: SenderDescriptor) -> Result<WebSocketTransport> {
        let (stream, addr) = timeout(ACCEPT_TIMEOUT, self.listener.accept())
            .await
            .map_err(|_| Error::connection_timeout(ACCEPT_TIMEOUT.as_millis() as u64))??;

        debug!(%addr, "TCP connection accepted");

        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| Error::transport(format!("WebSocket upgrade failed: {e}")))?;

        info!(port = self.port(), %addr, "WebSocket peer connected");
        Ok(WebSocketTransport::new(ws_stream, peer))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use serde_json::json;

    use crate::config::RequestOptions;
    use crate::protocol::{Envelope, Response};
    use crate::transport::Transport;

    async fn bind() -> PendingServer {
        PendingServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("bind should succeed")
    }

    #[tokio::test]
    async fn test_bind_random_port() {
        let server = bind().await;
        assert!(server.port() > 0);
        assert_eq!(server.ws_url(), format!("ws://127.0.0.1:{}", server.port()));
        assert_eq!(server.local_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_loopback_request() {
        let server = bind().await;
        let url = server.ws_url();

        let dial = tokio::spawn(async move { WebSocketTransport::connect(&url).await });
        let host = server.accept().await.expect("accept");
        let extension = dial.await.expect("join").expect("connect");

        host.on_message(Arc::new(|envelope, _sender, responder| {
            responder.respond(Response::ok(json!(envelope.action)));
        }));

        let response = extension
            .send_message(Envelope::new("native/version", json!(null)), RequestOptions::new())
            .await
            .expect("response");
        assert_eq!(response.data, Some(json!("native/version")));
    }
}
