//! Virtual connections.
//!
//! A [`Connection`] is one bidirectional stream multiplexed over a
//! physical transport and identified by a [`MessageId`].
//!
//! # Lifecycle
//!
//! 1. Opener calls [`Client::connect`](crate::Client::connect); the
//!    connection resolves immediately.
//! 2. Acceptor's connect handler receives its end with the same id.
//! 3. Either end calls [`Connection::send_message`] any number of times.
//! 4. Either end calls [`Connection::disconnect`]; the other end's
//!    [`Connection::on_disconnect`] callbacks fire and both ends drop all
//!    listeners.
//!
//! Messages that arrive before the first `on_message` callback is
//! registered are buffered and delivered to it in order.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::Result;
use crate::identifiers::MessageId;

// ============================================================================
// Types
// ============================================================================

/// Callback for connection payloads.
pub type MessageCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback fired when the remote end disconnects.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// ConnectionLink
// ============================================================================

/// The physical side of a connection, implemented by each transport.
pub trait ConnectionLink: Send + Sync {
    /// Sends a payload to the remote end.
    fn post(&self, id: MessageId, data: Value) -> Result<()>;

    /// Tells the remote end the connection is closed and forgets it locally.
    fn close(&self, id: MessageId);
}

// ============================================================================
// Connection
// ============================================================================

/// One end of a virtual connection.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: MessageId,
    link: Arc<dyn ConnectionLink>,
    state: Mutex<ConnectionState>,
    inbox_tx: mpsc::UnboundedSender<Value>,
    /// Taken by the first `on_message` call, which starts the pump.
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
}

#[derive(Default)]
struct ConnectionState {
    message_handlers: Vec<MessageCallback>,
    disconnect_handlers: Vec<DisconnectCallback>,
    disconnected: bool,
}

impl Connection {
    /// Creates a connection end bound to `link`.
    pub(crate) fn new(id: MessageId, link: Arc<dyn ConnectionLink>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                link,
                state: Mutex::new(ConnectionState::default()),
                inbox_tx,
                inbox_rx: Mutex::new(Some(inbox_rx)),
            }),
        }
    }

    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.inner.id
    }

    /// Returns `true` once either end has disconnected.
    #[inline]
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.inner.state.lock().disconnected
    }

    /// Sends a payload to the other end.
    ///
    /// A no-op after disconnect.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the physical send fails.
    pub fn send_message(&self, data: Value) -> Result<()> {
        if self.is_disconnected() {
            trace!(id = %self.inner.id, "Send on disconnected connection ignored");
            return Ok(());
        }
        self.inner.link.post(self.inner.id, data)
    }

    /// Serializes and sends a payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn send<T: Serialize>(&self, data: &T) -> Result<()> {
        self.send_message(serde_json::to_value(data)?)
    }

    /// Registers a payload callback.
    ///
    /// The first registration flushes buffered payloads to it, in order.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if state.disconnected {
                return;
            }
            state.message_handlers.push(Arc::new(callback));
        }

        if let Some(inbox) = self.inner.inbox_rx.lock().take() {
            tokio::spawn(pump(Arc::downgrade(&self.inner), inbox));
        }
    }

    /// Registers a callback fired when the remote end disconnects.
    ///
    /// Never fires for a local [`disconnect`](Self::disconnect).
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        if !state.disconnected {
            state.disconnect_handlers.push(Arc::new(callback));
        }
    }

    /// Closes the connection and notifies the remote end.
    ///
    /// Idempotent.
    pub fn disconnect(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            state.message_handlers.clear();
            state.disconnect_handlers.clear();
        }

        debug!(id = %self.inner.id, "Connection disconnected locally");
        self.inner.link.close(self.inner.id);
    }

    /// Queues a payload received from the remote end.
    pub(crate) fn deliver(&self, data: Value) {
        if self.is_disconnected() {
            trace!(id = %self.inner.id, "Payload after disconnect dropped");
            return;
        }
        let _ = self.inner.inbox_tx.send(data);
    }

    /// Handles a disconnect initiated by the remote end.
    ///
    /// The owning transport has already forgotten the connection.
    pub(crate) fn remote_disconnect(&self) {
        let handlers = {
            let mut state = self.inner.state.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            state.message_handlers.clear();
            std::mem::take(&mut state.disconnect_handlers)
        };

        debug!(id = %self.inner.id, "Connection disconnected by remote");
        for handler in handlers {
            handler();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

/// Delivers queued payloads to the current callbacks, one at a time.
async fn pump(inner: Weak<ConnectionInner>, mut inbox: mpsc::UnboundedReceiver<Value>) {
    while let Some(data) = inbox.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let handlers = {
            let state = inner.state.lock();
            if state.disconnected {
                break;
            }
            state.message_handlers.clone()
        };

        for handler in handlers {
            handler(data.clone());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;

    #[derive(Default)]
    struct RecordingLink {
        posted: Mutex<Vec<Value>>,
        closed: Mutex<Vec<MessageId>>,
    }

    impl ConnectionLink for RecordingLink {
        fn post(&self, _id: MessageId, data: Value) -> Result<()> {
            self.posted.lock().push(data);
            Ok(())
        }

        fn close(&self, id: MessageId) {
            self.closed.lock().push(id);
        }
    }

    fn connection() -> (Connection, Arc<RecordingLink>) {
        let link = Arc::new(RecordingLink::default());
        let connection = Connection::new(MessageId::generate(), link.clone());
        (connection, link)
    }

    #[tokio::test]
    async fn test_send_posts_to_link() {
        let (connection, link) = connection();
        connection.send_message(json!(1)).expect("send");
        connection.send(&"two").expect("send");
        assert_eq!(*link.posted.lock(), vec![json!(1), json!("two")]);
    }

    #[tokio::test]
    async fn test_buffered_messages_flushed_in_order() {
        let (connection, _link) = connection();
        connection.deliver(json!(1));
        connection.deliver(json!(2));

        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.on_message(move |data| {
            let _ = tx.send(data);
        });
        connection.deliver(json!(3));

        for expected in 1..=3 {
            assert_eq!(rx.recv().await, Some(json!(expected)));
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (connection, link) = connection();
        connection.disconnect();
        connection.disconnect();

        assert!(connection.is_disconnected());
        assert_eq!(link.closed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_send_after_disconnect_is_noop() {
        let (connection, link) = connection();
        connection.disconnect();
        connection.send_message(json!("late")).expect("no-op");
        assert!(link.posted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remote_disconnect_fires_callbacks_once() {
        let (connection, link) = connection();
        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.on_disconnect(move || {
            let _ = tx.send(());
        });

        connection.remote_disconnect();
        connection.remote_disconnect();
        connection.disconnect();

        assert_eq!(rx.recv().await, Some(()));
        assert!(rx.try_recv().is_err());
        assert!(link.closed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_no_delivery_after_disconnect() {
        let (connection, _link) = connection();
        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.on_message(move |data| {
            let _ = tx.send(data);
        });

        connection.remote_disconnect();
        connection.deliver(json!("late"));

        let got = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(matches!(got, Err(_) | Ok(None)));
    }
}
