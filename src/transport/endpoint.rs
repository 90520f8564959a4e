//! Frame multiplexer.
//!
//! An [`Endpoint`] turns any channel that can carry [`Frame`]s into a full
//! [`Transport`]: request/response correlation by [`MessageId`], virtual
//! connections, and listener fan-out.
//!
//! # Event Loop
//!
//! Each endpoint spawns one tokio task that handles:
//!
//! - Incoming frames from the physical channel, in arrival order
//! - Request/response correlation by id
//! - Connection payload and disconnect routing
//! - Listener callbacks for requests and connection opens
//!
//! When the inbound channel ends, pending requests fail with
//! [`Error::ConnectionClosed`] and open connections are disconnected.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
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
// Types
// ============================================================================

/// Map of request ids to response channels.
type CorrelationMap = FxHashMap<MessageId, oneshot::Sender<Response>>;

/// Map of connection ids to local connection ends.
type ConnectionMap = FxHashMap<MessageId, Connection>;

/// Inbound frames, tagged with who sent them.
pub type Inbound = mpsc::UnboundedReceiver<(Frame, SenderDescriptor)>;

// ============================================================================
// FrameSink
// ============================================================================

/// Outgoing half of a physical channel.
pub trait FrameSink: Send + Sync {
    /// Writes one frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the native channel rejects it.
    fn post(&self, frame: Frame) -> Result<()>;

    /// Releases the native channel. Called once when the endpoint closes.
    fn close(&self) {}
}

// ============================================================================
// Endpoint
// ============================================================================

/// Multiplexed transport over a frame channel.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<EndpointShared>,
}

struct EndpointShared {
    kind: &'static str,
    sink: Box<dyn FrameSink>,
    correlation: Mutex<CorrelationMap>,
    connections: Mutex<ConnectionMap>,
    message_handlers: RwLock<Vec<MessageHandler>>,
    connect_handlers: RwLock<Vec<ConnectHandler>>,
    closed: AtomicBool,
}

impl Endpoint {
    /// Creates an endpoint and spawns its inbound loop.
    pub fn spawn<S>(kind: &'static str, sink: S, inbound: Inbound) -> Self
    where
        S: FrameSink + 'static,
    {
        let shared = Arc::new(EndpointShared {
            kind,
            sink: Box::new(sink),
            correlation: Mutex::new(CorrelationMap::default()),
            connections: Mutex::new(ConnectionMap::default()),
            message_handlers: RwLock::new(Vec::new()),
            connect_handlers: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(run_inbound_loop(Arc::downgrade(&shared), inbound));
        debug!(kind, "Endpoint started");

        Self { shared }
    }

    /// Returns the transport kind this endpoint serves.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.shared.kind
    }

    /// Returns the number of requests awaiting a response.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.correlation.lock().len()
    }

    /// Returns the number of open connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Returns `true` once the endpoint is closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Closes the endpoint.
    ///
    /// Pending requests fail with [`Error::ConnectionClosed`], open
    /// connections are disconnected locally, and the native channel is
    /// released.
    pub fn close(&self) {
        self.shared.shutdown();
    }

    /// Sends a request and waits for the correlated response.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the endpoint is or becomes closed
    /// - [`Error::RequestTimeout`] if `options.timeout` elapses
    /// - [`Error::Transport`] if the native send fails under
    ///   [`ErrorPolicy::Surface`] or [`ErrorPolicy::RetryOnce`]
    pub async fn send_message(&self, envelope: Envelope, options: RequestOptions) -> Result<Response> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let message_id = MessageId::generate();
        let action = envelope.action.clone();
        let (response_tx, response_rx) = oneshot::channel();

        // Store correlation before sending
        self.shared.correlation.lock().insert(message_id, response_tx);

        let frame = Frame::SendMessage {
            message_id: Some(message_id),
            data: envelope,
        };

        match self.shared.post_with_policy(frame, options.policy()) {
            Ok(true) => {}
            Ok(false) => {
                // Logged and swallowed: nothing will answer this request.
                self.shared.correlation.lock().remove(&message_id);
                return stay_pending(options.timeout, &action).await;
            }
            Err(e) => {
                self.shared.correlation.lock().remove(&message_id);
                return Err(e);
            }
        }

        trace!(kind = self.shared.kind, %message_id, action = %action, "Request sent");

        match await_reply(response_rx, options.timeout, &action).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(Error::ConnectionClosed),
            Err(e) => {
                self.shared.correlation.lock().remove(&message_id);
                debug!(%message_id, action = %action, "Removed timed-out correlation");
                Err(e)
            }
        }
    }

    /// Sends a message that expects no response.
    ///
    /// # Errors
    ///
    /// Returns the native error if the frame cannot be written.
    pub fn post_message(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.shared.sink.post(Frame::SendMessage {
            message_id: None,
            data: envelope,
        })
    }

    /// Opens a virtual connection.
    ///
    /// # Errors
    ///
    /// Returns the native error if the open frame cannot be written.
    pub fn connect(&self, envelope: Envelope) -> Result<Connection> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let message_id = MessageId::generate();
        let connection = self.shared.new_connection(message_id);
        self.shared
            .connections
            .lock()
            .insert(message_id, connection.clone());

        let action = envelope.action.clone();
        if let Err(e) = self.shared.sink.post(Frame::Connect {
            message_id,
            data: envelope,
        }) {
            self.shared.connections.lock().remove(&message_id);
            return Err(e);
        }

        debug!(kind = self.shared.kind, %message_id, action = %action, "Connection opened");
        Ok(connection)
    }

    /// Registers a message listener.
    pub fn on_message(&self, handler: MessageHandler) {
        self.shared.message_handlers.write().push(handler);
    }

    /// Registers a connection listener.
    pub fn on_connect(&self, handler: ConnectHandler) {
        self.shared.connect_handlers.write().push(handler);
    }
}

#[async_trait]
impl Transport for Endpoint {
    fn kind(&self) -> &'static str {
        self.shared.kind
    }

    async fn send_message(&self, envelope: Envelope, options: RequestOptions) -> Result<Response> {
        Endpoint::send_message(self, envelope, options).await
    }

    fn post_message(&self, envelope: Envelope) -> Result<()> {
        Endpoint::post_message(self, envelope)
    }

    async fn connect(&self, envelope: Envelope) -> Result<Connection> {
        Endpoint::connect(self, envelope)
    }

    fn on_message(&self, handler: MessageHandler) {
        Endpoint::on_message(self, handler);
    }

    fn on_connect(&self, handler: ConnectHandler) {
        Endpoint::on_connect(self, handler);
    }
}

// ============================================================================
// EndpointShared
// ============================================================================

impl EndpointShared {
    /// Posts a frame, applying `policy` on native failure.
    ///
    /// Returns `Ok(false)` when the failure was logged and swallowed.
    fn post_with_policy(&self, frame: Frame, policy: ErrorPolicy) -> Result<bool> {
        let retry = (policy == ErrorPolicy::RetryOnce).then(|| frame.clone());

        let Err(e) = self.sink.post(frame) else {
            return Ok(true);
        };

        match (policy, retry) {
            (ErrorPolicy::Log, _) => {
                warn!(kind = self.kind, error = %e, "Native send failed, request left pending");
                Ok(false)
            }
            (ErrorPolicy::RetryOnce, Some(frame)) => {
                debug!(kind = self.kind, error = %e, "Native send failed, retrying once");
                self.sink.post(frame).map(|()| true)
            }
            _ => Err(e),
        }
    }

    fn new_connection(self: &Arc<Self>, message_id: MessageId) -> Connection {
        let link = Arc::new(EndpointLink {
            shared: Arc::downgrade(self),
        });
        Connection::new(message_id, link)
    }

    /// Routes one inbound frame.
    fn dispatch(self: &Arc<Self>, frame: Frame, descriptor: SenderDescriptor) {
        trace!(kind = self.kind, frame = frame.kind(), "Frame received");

        match frame {
            Frame::SendMessage { message_id, data } => {
                let responder = match message_id {
                    Some(message_id) => self.responder(message_id),
                    None => Responder::noop(),
                };

                let handlers = self.message_handlers.read().clone();
                if handlers.is_empty() {
                    trace!(kind = self.kind, action = %data.action, "No message listener");
                }
                for handler in handlers {
                    handler(data.clone(), Sender::new(descriptor.clone()), responder.clone());
                }
            }

            Frame::RespMessage { message_id, data } => {
                let tx = self.correlation.lock().remove(&message_id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(data);
                    }
                    None => trace!(%message_id, "Response for unknown request"),
                }
            }

            Frame::Connect { message_id, data } => {
                let connection = self.new_connection(message_id);
                self.connections.lock().insert(message_id, connection.clone());

                let handlers = self.connect_handlers.read().clone();
                if handlers.is_empty() {
                    debug!(kind = self.kind, action = %data.action, "No connect listener");
                }
                for handler in handlers {
                    handler(
                        data.clone(),
                        Sender::with_connection(descriptor.clone(), connection.clone()),
                    );
                }
            }

            Frame::ConnectMessage { message_id, data } => {
                let connection = self.connections.lock().get(&message_id).cloned();
                match connection {
                    Some(connection) => connection.deliver(data),
                    None => trace!(%message_id, "Payload for unknown connection"),
                }
            }

            Frame::Disconnect { message_id } => {
                let connection = self.connections.lock().remove(&message_id);
                if let Some(connection) = connection {
                    connection.remote_disconnect();
                }
            }
        }
    }

    /// Builds the reply path for a request carrying `message_id`.
    fn responder(self: &Arc<Self>, message_id: MessageId) -> Responder {
        let shared = Arc::downgrade(self);
        Responder::new(move |response| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if let Err(e) = shared.sink.post(Frame::RespMessage {
                message_id,
                data: response,
            }) {
                warn!(kind = shared.kind, %message_id, error = %e, "Failed to send response");
            }
        })
    }

    /// Fails pending requests and disconnects open connections. Idempotent.
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropping the senders fails every waiter with ConnectionClosed
        let pending: Vec<_> = self.correlation.lock().drain().collect();
        let connections: Vec<_> = self.connections.lock().drain().map(|(_, c)| c).collect();

        if !pending.is_empty() {
            debug!(kind = self.kind, count = pending.len(), "Failed pending requests on shutdown");
        }
        drop(pending);

        for connection in connections {
            connection.remote_disconnect();
        }

        self.sink.close();
        debug!(kind = self.kind, "Endpoint closed");
    }
}

/// Reads inbound frames until the physical channel ends.
async fn run_inbound_loop(shared: Weak<EndpointShared>, mut inbound: Inbound) {
    while let Some((frame, descriptor)) = inbound.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        shared.dispatch(frame, descriptor);
    }

    if let Some(shared) = shared.upgrade() {
        shared.shutdown();
    }
    trace!("Endpoint inbound loop terminated");
}

// ============================================================================
// EndpointLink
// ============================================================================

/// Connection link posting `connectMessage` / `disconnect` frames.
struct EndpointLink {
    shared: Weak<EndpointShared>,
}

impl ConnectionLink for EndpointLink {
    fn post(&self, id: MessageId, data: Value) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(Error::ConnectionClosed)?;
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::disconnected(id));
        }
        shared.sink.post(Frame::ConnectMessage {
            message_id: id,
            data,
        })
    }

    fn close(&self, id: MessageId) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.connections.lock().remove(&id);
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = shared.sink.post(Frame::Disconnect { message_id: id }) {
            warn!(kind = shared.kind, %id, error = %e, "Failed to send disconnect");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
