//! Transport layer.
//!
//! One [`Transport`] per physical channel. Every transport offers the same
//! four capabilities: request/response [`send_message`](Transport::send_message),
//! fire-and-forget [`post_message`](Transport::post_message), persistent
//! [`connect`](Transport::connect), and the matching `on_message` /
//! `on_connect` listener registration.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   Frame {type, messageId, data}   ┌──────────────┐
//! │  Endpoint    │◄─────────────────────────────────►│  Endpoint    │
//! │  (realm A)   │   event / postMessage / worker /  │  (realm B)   │
//! │              │   websocket / memory              │              │
//! └──────────────┘                                   └──────────────┘
//! ```
//!
//! Frame-based transports share one [`Endpoint`] multiplexer that owns the
//! correlation table, the connection table and the inbound loop. The
//! runtime transport uses native ports instead.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `endpoint` | Frame multiplexer shared by most transports |
//! | `memory` | In-memory pair for tests |
//! | `event` | Same-document custom events |
//! | `window` | Cross-document `postMessage` |
//! | `worker` | Service worker and its client documents |
//! | `runtime` | Extension runtime messaging and ports |
//! | `websocket` | JSON frames over WebSocket |
//! | `server` | WebSocket listener for native hosts |

// ============================================================================
// Submodules
// ============================================================================

/// Frame multiplexer shared by most transports.
pub mod endpoint;

/// Same-document custom event transport.
pub mod event;

/// In-memory transport pair.
pub mod memory;

/// Extension runtime transport.
pub mod runtime;

/// WebSocket listener.
pub mod server;

/// WebSocket transport.
pub mod websocket;

/// Cross-document window transport.
pub mod window;

/// Service worker transport.
pub mod worker;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::config::RequestOptions;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, Response, Sender};

// ============================================================================
// Re-exports
// ============================================================================

pub use endpoint::{Endpoint, FrameSink, Inbound};
pub use event::{Document, EventFlag, EventRole, EventTransport};
pub use memory::MemoryTransport;
pub use runtime::{Runtime, RuntimeTransport, Target};
pub use server::PendingServer;
pub use websocket::WebSocketTransport;
pub use window::{Window, WindowId, WindowTransport};
pub use worker::{ClientInfo, WorkerClient, WorkerScope, WorkerTransport};

// ============================================================================
// Types
// ============================================================================

/// Listener for routed messages.
///
/// Called once per incoming message; answer through the [`Responder`].
/// Listeners must not block: spawn a task for async work.
pub type MessageHandler = Arc<dyn Fn(Envelope, Sender, Responder) + Send + Sync>;

/// Listener for incoming connections.
///
/// The [`Sender`] carries the new [`Connection`].
pub type ConnectHandler = Arc<dyn Fn(Envelope, Sender) + Send + Sync>;

// ============================================================================
// Transport
// ============================================================================

/// A physical channel between two realms.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn kind(&self) -> &'static str;

    /// Sends a request and waits for its single response.
    ///
    /// Without a timeout the future stays pending until a response
    /// arrives; see [`ErrorPolicy`](crate::ErrorPolicy) for native errors.
    async fn send_message(&self, envelope: Envelope, options: RequestOptions) -> Result<Response>;

    /// Sends a message that expects no response.
    fn post_message(&self, envelope: Envelope) -> Result<()>;

    /// Opens a virtual connection.
    ///
    /// Resolves once the open request is sent, before the remote handler
    /// has necessarily run.
    async fn connect(&self, envelope: Envelope) -> Result<Connection>;

    /// Registers a message listener.
    fn on_message(&self, handler: MessageHandler);

    /// Registers a connection listener.
    fn on_connect(&self, handler: ConnectHandler);
}

// ============================================================================
// Responder
// ============================================================================

type ReplyFn = Box<dyn FnOnce(Response) + Send>;

/// One-shot reply channel handed to message listeners.
///
/// Clones share the slot: the first [`respond`](Self::respond) wins and
/// every later call is a no-op.
#[derive(Clone)]
pub struct Responder {
    slot: Arc<Mutex<Option<ReplyFn>>>,
}

impl Responder {
    /// Creates a responder that runs `reply` on first use.
    pub(crate) fn new<F>(reply: F) -> Self
    where
        F: FnOnce(Response) + Send + 'static,
    {
        Self {
            slot: Arc::new(Mutex::new(Some(Box::new(reply)))),
        }
    }

    /// Creates a responder for messages that expect no answer.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Sends the response. Returns `false` if a response was already sent
    /// or none is expected.
    pub fn respond(&self, response: Response) -> bool {
        let reply = self.slot.lock().take();
        match reply {
            Some(reply) => {
                reply(response);
                true
            }
            None => false,
        }
    }

    /// Returns `true` while a response is still expected.
    #[must_use]
    pub fn expects_response(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("expects_response", &self.expects_response())
            .finish()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Waits for a one-shot reply with an optional timeout.
///
/// Returns `Ok(None)` if the reply side was dropped without answering.
pub(crate) async fn await_reply<T>(
    rx: oneshot::Receiver<T>,
    limit: Option<Duration>,
    action: &str,
) -> Result<Option<T>> {
    let outcome = match limit {
        Some(limit) => timeout(limit, rx)
            .await
            .map_err(|_| Error::request_timeout(action, limit.as_millis() as u64))?,
        None => rx.await,
    };
    Ok(outcome.ok())
}

/// Never resolves unless a timeout is set, in which case it fails with
/// [`Error::RequestTimeout`] once the timeout elapses.
pub(crate) async fn stay_pending<T>(limit: Option<Duration>, action: &str) -> Result<T> {
    match limit {
        Some(limit) => {
            tokio::time::sleep(limit).await;
            Err(Error::request_timeout(action, limit.as_millis() as u64))
        }
        None => std::future::pending().await,
    }
}

// ============================================================================
// Delegation
// ============================================================================

/// Implements [`Transport`] for a struct with an `endpoint: Endpoint` field.
macro_rules! delegate_to_endpoint {
    ($ty:ty, $kind:literal) => {
        #[async_trait::async_trait]
        impl $crate::transport::Transport for $ty {
            fn kind(&self) -> &'static str {
                $kind
            }

            async fn send_message(
                &self,
                envelope: $crate::protocol::Envelope,
                options: $crate::config::RequestOptions,
            ) -> $crate::error::Result<$crate::protocol::Response> {
                self.endpoint.send_message(envelope, options).await
            }

            fn post_message(
                &self,
                envelope: $crate::protocol::Envelope,
            ) -> $crate::error::Result<()> {
                self.endpoint.post_message(envelope)
            }

            async fn connect(
                &self,
                envelope: $crate::protocol::Envelope,
            ) -> $crate::error::Result<$crate::connection::Connection> {
                self.endpoint.connect(envelope)
            }

            fn on_message(&self, handler: $crate::transport::MessageHandler) {
                self.endpoint.on_message(handler);
            }

            fn on_connect(&self, handler: $crate::transport::ConnectHandler) {
                self.endpoint.on_connect(handler);
            }
        }
    };
}

pub(crate) use delegate_to_endpoint;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_responder_at_most_once() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let responder = Responder::new(move |response| {
            let _ = tx.send(response);
        });
        let clone = responder.clone();

        assert!(responder.expects_response());
        assert!(responder.respond(Response::ok(json!(1))));
        assert!(!clone.respond(Response::ok(json!(2))));
        assert!(!clone.expects_response());

        assert_eq!(rx.try_recv().expect("first").data, Some(json!(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_noop_responder() {
        let responder = Responder::noop();
        assert!(!responder.expects_response());
        assert!(!responder.respond(Response::ok(json!(null))));
    }

    #[tokio::test]
    async fn test_await_reply_timeout() {
        let (_tx, rx) = oneshot::channel::<u32>();
        let err = await_reply(rx, Some(Duration::from_millis(10)), "slow")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_await_reply_dropped_sender() {
        let (tx, rx) = oneshot::channel::<u32>();
        drop(tx);
        let outcome = await_reply(rx, None, "gone").await.expect("no timeout");
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn test_stay_pending_times_out() {
        let err = stay_pending::<()>(Some(Duration::from_millis(5)), "x")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
