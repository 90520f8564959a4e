//! Extension runtime transport.
//!
//! Models the browser's extension messaging: a [`Runtime`] hub that every
//! extension realm registers with, one-shot messages answered through a
//! reply slot, and native ports for long-lived connections.
//!
//! Unlike the frame-based transports there is no correlation table: the
//! runtime hands each message its own reply slot, and the first recipient
//! to answer wins. A message nobody answers fails with [`PORT_CLOSED`].
//!
//! Each [`connect`](Transport::connect) opens one native port. The first
//! value written to the port is the connect frame carrying the envelope;
//! everything after it is connection payload. Closing either end of the
//! port disconnects both.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::{ErrorPolicy, RequestOptions};
use crate::connection::{Connection, ConnectionLink};
use crate::error::{Error, Result};
use crate::identifiers::MessageId;
use crate::protocol::{Envelope, Frame, Response, Sender, SenderDescriptor};

use super::{ConnectHandler, MessageHandler, Responder, Transport, await_reply, stay_pending};

// ============================================================================
// Constants
// ============================================================================

/// Native error when no realm is listening at the target.
pub const NO_RECEIVER: &str = "Could not establish connection. Receiving end does not exist.";

/// Native error when every recipient dropped a message without answering.
pub const PORT_CLOSED: &str = "The message port closed before a response was received.";

// ============================================================================
// Target
// ============================================================================

/// Where runtime messages go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    /// Every extension page: background, offscreen, popup.
    #[default]
    Runtime,
    /// Content scripts in one tab, optionally one frame.
    Tab {
        /// Tab id.
        tab_id: i64,
        /// Frame id, `None` for every frame.
        frame_id: Option<i64>,
    },
}

impl Target {
    fn matches(self, descriptor: &SenderDescriptor) -> bool {
        match self {
            Self::Runtime => descriptor.is_background(),
            Self::Tab { tab_id, frame_id } => {
                descriptor.tab_id == tab_id
                    && frame_id.is_none_or(|frame_id| descriptor.frame_id == Some(frame_id))
            }
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Shared one-shot reply slot. The first recipient to answer takes it.
type ReplySlot = Arc<Mutex<Option<oneshot::Sender<Value>>>>;

/// One side of a native port.
struct NativePort {
    tx: mpsc::UnboundedSender<Value>,
    rx: mpsc::UnboundedReceiver<Value>,
}

fn port_pair() -> (NativePort, NativePort) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        NativePort { tx: a_tx, rx: b_rx },
        NativePort { tx: b_tx, rx: a_rx },
    )
}

enum RuntimeEvent {
    Message {
        data: Value,
        sender: SenderDescriptor,
        reply: Option<ReplySlot>,
    },
    Connect {
        port: NativePort,
        sender: SenderDescriptor,
    },
}

struct Listener {
    id: u64,
    descriptor: SenderDescriptor,
    events: mpsc::UnboundedSender<RuntimeEvent>,
}

/// The extension runtime shared by every realm of one extension.
#[derive(Clone, Default)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

#[derive(Default)]
struct RuntimeInner {
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
}

impl Runtime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of registered realms.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    fn register(&self, descriptor: SenderDescriptor) -> (u64, mpsc::UnboundedReceiver<RuntimeEvent>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (events, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().push(Listener {
            id,
            descriptor,
            events,
        });
        (id, rx)
    }

    fn unregister(&self, id: u64) {
        self.inner.listeners.lock().retain(|listener| listener.id != id);
    }

    /// Delivers `data` to every realm matching `target` except the sender.
    ///
    /// Returns the reply receiver when `expects_reply` is set.
    fn native_send(
        &self,
        from: u64,
        sender: &SenderDescriptor,
        target: Target,
        data: &Value,
        expects_reply: bool,
    ) -> Result<Option<oneshot::Receiver<Value>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let slot: Option<ReplySlot> = expects_reply.then(|| Arc::new(Mutex::new(Some(reply_tx))));

        let mut delivered = 0;
        let mut listeners = self.inner.listeners.lock();
        listeners.retain(|listener| {
            if listener.id == from || !target.matches(&listener.descriptor) {
                return true;
            }
            let event = RuntimeEvent::Message {
                data: data.clone(),
                sender: sender.clone(),
                reply: slot.clone(),
            };
            let alive = listener.events.send(event).is_ok();
            delivered += usize::from(alive);
            alive
        });

        if delivered == 0 {
            return Err(Error::transport(NO_RECEIVER));
        }
        Ok(expects_reply.then_some(reply_rx))
    }

    /// Opens a port to the first realm matching `target`.
    fn native_connect(&self, from: u64, sender: &SenderDescriptor, target: Target) -> Result<NativePort> {
        let listeners = self.inner.listeners.lock();
        let listener = listeners
            .iter()
            .find(|listener| listener.id != from && target.matches(&listener.descriptor))
            .ok_or_else(|| Error::transport(NO_RECEIVER))?;

        let (local, remote) = port_pair();
        listener
            .events
            .send(RuntimeEvent::Connect {
                port: remote,
                sender: sender.clone(),
            })
            .map_err(|_| Error::transport(NO_RECEIVER))?;
        Ok(local)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

// ============================================================================
// RuntimeTransport
// ============================================================================

/// Transport over the extension runtime.
///
/// Clones share the realm's listener registration; use
/// [`with_target`](Self::with_target) to address a different target.
#[derive(Clone)]
pub struct RuntimeTransport {
    inner: Arc<RuntimeTransportInner>,
    target: Target,
}

struct RuntimeTransportInner {
    runtime: Runtime,
    listener_id: u64,
    descriptor: SenderDescriptor,
    message_handlers: RwLock<Vec<MessageHandler>>,
    connect_handlers: RwLock<Vec<ConnectHandler>>,
}

impl RuntimeTransport {
    /// Registers a realm described by `descriptor` and addresses `target`.
    #[must_use]
    pub fn new(runtime: &Runtime, descriptor: SenderDescriptor, target: Target) -> Self {
        let (listener_id, events) = runtime.register(descriptor.clone());
        let inner = Arc::new(RuntimeTransportInner {
            runtime: runtime.clone(),
            listener_id,
            descriptor,
            message_handlers: RwLock::new(Vec::new()),
            connect_handlers: RwLock::new(Vec::new()),
        });

        tokio::spawn(run_listen_loop(Arc::downgrade(&inner), events));
        debug!(listener_id, ?target, "Runtime transport registered");

        Self { inner, target }
    }

    /// Same realm, different target.
    #[must_use]
    pub fn with_target(&self, target: Target) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            target,
        }
    }

    /// Same realm, addressing one tab.
    #[must_use]
    pub fn to_tab(&self, tab_id: i64, frame_id: Option<i64>) -> Self {
        self.with_target(Target::Tab { tab_id, frame_id })
    }

    #[inline]
    #[must_use]
    pub fn target(&self) -> Target {
        self.target
    }

    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> &SenderDescriptor {
        &self.inner.descriptor
    }

    fn native_send(&self, data: &Value, expects_reply: bool) -> Result<Option<oneshot::Receiver<Value>>> {
        self.inner.runtime.native_send(
            self.inner.listener_id,
            &self.inner.descriptor,
            self.target,
            data,
            expects_reply,
        )
    }

    /// Sends with `policy` applied to native failures.
    ///
    /// Returns `Ok(None)` when the failure was logged and swallowed.
    fn send_with_policy(&self, data: &Value, policy: ErrorPolicy) -> Result<Option<oneshot::Receiver<Value>>> {
        let e = match self.native_send(data, true) {
            Ok(rx) => return Ok(rx),
            Err(e) => e,
        };

        match policy {
            ErrorPolicy::Log => {
                warn!(error = %e, target = ?self.target, "Runtime send failed, request left pending");
                Ok(None)
            }
            ErrorPolicy::RetryOnce => {
                debug!(error = %e, "Runtime send failed, retrying once");
                self.native_send(data, true)
            }
            ErrorPolicy::Surface => Err(e),
        }
    }
}

#[async_trait]
impl Transport for RuntimeTransport {
    fn kind(&self) -> &'static str {
        "runtime"
    }

    async fn send_message(&self, envelope: Envelope, options: RequestOptions) -> Result<Response> {
        let action = envelope.action.clone();
        let data = serde_json::to_value(&envelope)?;
        let policy = options.policy();

        let Some(rx) = self.send_with_policy(&data, policy)? else {
            return stay_pending(options.timeout, &action).await;
        };

        match await_reply(rx, options.timeout, &action).await? {
            Some(reply) => Ok(serde_json::from_value(reply)?),
            None if policy == ErrorPolicy::Log => {
                warn!(action = %action, error = PORT_CLOSED, "Runtime reply lost, request left pending");
                stay_pending(options.timeout, &action).await
            }
            None => Err(Error::transport(PORT_CLOSED)),
        }
    }

    fn post_message(&self, envelope: Envelope) -> Result<()> {
        let data = serde_json::to_value(&envelope)?;
        match self.native_send(&data, false) {
            Err(Error::Transport { message }) if message == NO_RECEIVER => {
                debug!(action = %envelope.action, "Posted message had no receiver");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn connect(&self, envelope: Envelope) -> Result<Connection> {
        let port = self.inner.runtime.native_connect(
            self.inner.listener_id,
            &self.inner.descriptor,
            self.target,
        )?;

        let message_id = MessageId::generate();
        let open = serde_json::to_value(Frame::Connect {
            message_id,
            data: envelope,
        })?;
        port.tx
            .send(open)
            .map_err(|_| Error::transport(NO_RECEIVER))?;

        debug!(%message_id, target = ?self.target, "Runtime port opened");
        Ok(attach_port(message_id, port))
    }

    fn on_message(&self, handler: MessageHandler) {
        self.inner.message_handlers.write().push(handler);
    }

    fn on_connect(&self, handler: ConnectHandler) {
        self.inner.connect_handlers.write().push(handler);
    }
}

impl Drop for RuntimeTransportInner {
    fn drop(&mut self) {
        self.runtime.unregister(self.listener_id);
        trace!(listener_id = self.listener_id, "Runtime transport unregistered");
    }
}

// ============================================================================
// Listen Loop
// ============================================================================

async fn run_listen_loop(
    inner: Weak<RuntimeTransportInner>,
    mut events: mpsc::UnboundedReceiver<RuntimeEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            RuntimeEvent::Message {
                data,
                sender,
                reply,
            } => {
                let envelope = match serde_json::from_value::<Envelope>(data) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        trace!(error = %e, "Ignoring non-envelope runtime message");
                        continue;
                    }
                };

                let responder = match reply {
                    Some(slot) => Responder::new(move |response: Response| {
                        let Some(tx) = slot.lock().take() else {
                            return;
                        };
                        match serde_json::to_value(&response) {
                            Ok(value) => {
                                let _ = tx.send(value);
                            }
                            Err(e) => warn!(error = %e, "Failed to encode runtime reply"),
                        }
                    }),
                    None => Responder::noop(),
                };

                let handlers = inner.message_handlers.read().clone();
                for handler in handlers {
                    handler(envelope.clone(), Sender::new(sender.clone()), responder.clone());
                }
            }

            RuntimeEvent::Connect { port, sender } => {
                let handlers = inner.connect_handlers.read().clone();
                tokio::spawn(accept_port(port, sender, handlers));
            }
        }
    }

    trace!("Runtime listen loop terminated");
}

/// Reads the open frame from an incoming port and hands the connection to
/// the connect listeners.
async fn accept_port(mut port: NativePort, sender: SenderDescriptor, handlers: Vec<ConnectHandler>) {
    let Some(first) = port.rx.recv().await else {
        trace!("Port closed before its open frame");
        return;
    };

    let (message_id, envelope) = match serde_json::from_value::<Frame>(first) {
        Ok(Frame::Connect { message_id, data }) => (message_id, data),
        Ok(other) => {
            warn!(frame = other.kind(), "Unexpected first frame on runtime port");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Malformed open frame on runtime port");
            return;
        }
    };

    let connection = attach_port(message_id, port);
    if handlers.is_empty() {
        debug!(action = %envelope.action, "No connect listener");
    }
    for handler in handlers {
        handler(
            envelope.clone(),
            Sender::with_connection(sender.clone(), connection.clone()),
        );
    }
}

/// Wraps a native port in a [`Connection`] and starts its reader.
fn attach_port(message_id: MessageId, port: NativePort) -> Connection {
    let NativePort { tx, mut rx } = port;
    let link = Arc::new(PortLink {
        tx: Mutex::new(Some(tx)),
    });
    let connection = Connection::new(message_id, link.clone());

    let reader = connection.clone();
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            reader.deliver(data);
        }
        // The remote dropped its end; release ours so the remote reader ends too
        link.tx.lock().take();
        reader.remote_disconnect();
    });

    connection
}

// ============================================================================
// PortLink
// ============================================================================

struct PortLink {
    tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl ConnectionLink for PortLink {
    fn post(&self, id: MessageId, data: Value) -> Result<()> {
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or_else(|| Error::disconnected(id))?;
        tx.send(data).map_err(|_| Error::disconnected(id))
    }

    fn close(&self, id: MessageId) {
        if self.tx.lock().take().is_some() {
            trace!(%id, "Runtime port closed locally");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
