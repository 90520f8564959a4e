//! Service worker transport.
//!
//! A service worker has no persistent reference to the documents it serves.
//! The worker side therefore resolves its target client lazily, by URL
//! prefix, on the first frame it sends, and caches it weakly so a closed
//! document is replaced by the next match. The client side simply posts to
//! the worker scope.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{Frame, SenderDescriptor};

use super::endpoint::{Endpoint, FrameSink};

// ============================================================================
// Types
// ============================================================================

/// What the worker can learn about one of its clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client id.
    pub id: String,
    /// Document URL.
    pub url: String,
}

type ScopeListener = mpsc::UnboundedSender<(ClientInfo, Value)>;

// ============================================================================
// WorkerScope
// ============================================================================

/// The service worker global scope.
#[derive(Clone, Default)]
pub struct WorkerScope {
    inner: Arc<ScopeInner>,
}

#[derive(Default)]
struct ScopeInner {
    clients: Mutex<Vec<Weak<ClientInner>>>,
    listeners: Mutex<Vec<ScopeListener>>,
}

impl WorkerScope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a controlled document at `url`.
    ///
    /// The client stays visible to [`match_all`](Self::match_all) until the
    /// last handle to it is dropped.
    pub fn register_client(&self, url: impl Into<String>) -> WorkerClient {
        let inner = Arc::new(ClientInner {
            info: ClientInfo {
                id: Uuid::new_v4().to_string(),
                url: url.into(),
            },
            scope: self.clone(),
            listeners: Mutex::new(Vec::new()),
        });
        self.inner.clients.lock().push(Arc::downgrade(&inner));
        debug!(id = %inner.info.id, url = %inner.info.url, "Worker client registered");
        WorkerClient { inner }
    }

    /// Lists live clients in registration order.
    #[must_use]
    pub fn match_all(&self) -> Vec<ClientInfo> {
        self.live_clients()
            .into_iter()
            .map(|client| client.info().clone())
            .collect()
    }

    /// Subscribes to messages clients post to the worker.
    pub fn add_message_listener(&self) -> mpsc::UnboundedReceiver<(ClientInfo, Value)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().push(tx);
        rx
    }

    fn live_clients(&self) -> Vec<WorkerClient> {
        let mut clients = self.inner.clients.lock();
        clients.retain(|client| client.strong_count() > 0);
        clients
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| WorkerClient { inner })
            .collect()
    }

    fn find_client(&self, url_prefix: &str) -> Option<WorkerClient> {
        self.live_clients()
            .into_iter()
            .find(|client| client.info().url.starts_with(url_prefix))
    }

    fn deliver(&self, from: &ClientInfo, data: Value) -> usize {
        let mut listeners = self.inner.listeners.lock();
        listeners.retain(|tx| tx.send((from.clone(), data.clone())).is_ok());
        listeners.len()
    }
}

impl fmt::Debug for WorkerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerScope")
            .field("clients", &self.inner.clients.lock().len())
            .finish()
    }
}

// ============================================================================
// WorkerClient
// ============================================================================

/// A document controlled by a [`WorkerScope`].
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    info: ClientInfo,
    scope: WorkerScope,
    listeners: Mutex<Vec<mpsc::UnboundedSender<Value>>>,
}

impl WorkerClient {
    #[inline]
    #[must_use]
    pub fn info(&self) -> &ClientInfo {
        &self.inner.info
    }

    /// Posts `data` from the worker to this client.
    pub fn post_message(&self, data: Value) -> usize {
        let mut listeners = self.inner.listeners.lock();
        listeners.retain(|tx| tx.send(data.clone()).is_ok());
        listeners.len()
    }

    /// Posts `data` from this client to the worker.
    pub fn post_to_worker(&self, data: Value) -> usize {
        self.inner.scope.deliver(&self.inner.info, data)
    }

    /// Subscribes to messages the worker posts to this client.
    pub fn add_message_listener(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().push(tx);
        rx
    }
}

impl fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerClient")
            .field("info", &self.inner.info)
            .finish()
    }
}

// ============================================================================
// WorkerTransport
// ============================================================================

/// Transport between a service worker and one of its documents.
#[derive(Clone)]
pub struct WorkerTransport {
    endpoint: Endpoint,
}

impl WorkerTransport {
    /// Worker side, talking to the first client whose URL starts with
    /// `url_prefix`.
    ///
    /// The client is resolved when the first frame is sent, so the
    /// transport can be created before the document exists.
    #[must_use]
    pub fn for_worker(scope: &WorkerScope, url_prefix: impl Into<String>) -> Self {
        let url_prefix = url_prefix.into();
        let mut events = scope.add_message_listener();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let filter = url_prefix.clone();
        tokio::spawn(async move {
            while let Some((client, data)) = events.recv().await {
                if !client.url.starts_with(&filter) {
                    continue;
                }
                match serde_json::from_value::<Frame>(data) {
                    Ok(frame) => {
                        let descriptor = SenderDescriptor::document(client.id);
                        if inbound_tx.send((frame, descriptor)).is_err() {
                            break;
                        }
                    }
                    Err(e) => trace!(error = %e, "Ignoring non-frame client message"),
                }
            }
        });

        let sink = WorkerSink {
            scope: scope.clone(),
            url_prefix,
            resolved: Mutex::new(Weak::new()),
        };
        Self {
            endpoint: Endpoint::spawn("worker", sink, inbound_rx),
        }
    }

    /// Document side, talking to the controlling worker.
    #[must_use]
    pub fn for_client(client: &WorkerClient) -> Self {
        let mut events = client.add_message_listener();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(data) = events.recv().await {
                match serde_json::from_value::<Frame>(data) {
                    Ok(frame) => {
                        if inbound_tx
                            .send((frame, SenderDescriptor::background()))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => trace!(error = %e, "Ignoring non-frame worker message"),
                }
            }
        });

        Self {
            endpoint: Endpoint::spawn(
                "worker",
                ClientSink {
                    client: client.clone(),
                },
                inbound_rx,
            ),
        }
    }

    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

super::delegate_to_endpoint!(WorkerTransport, "worker");

// ============================================================================
// Sinks
// ============================================================================

struct WorkerSink {
    scope: WorkerScope,
    url_prefix: String,
    // Weak so a closed document leaves match_all and a later one can be found
    resolved: Mutex<Weak<ClientInner>>,
}

impl WorkerSink {
    fn target(&self) -> Result<WorkerClient> {
        let mut resolved = self.resolved.lock();
        if let Some(inner) = resolved.upgrade() {
            return Ok(WorkerClient { inner });
        }

        let client = self.scope.find_client(&self.url_prefix).ok_or_else(|| {
            Error::transport(format!("no client matches {}", self.url_prefix))
        })?;
        debug!(id = %client.info().id, url = %client.info().url, "Worker resolved client");
        *resolved = Arc::downgrade(&client.inner);
        Ok(client)
    }
}

impl FrameSink for WorkerSink {
    fn post(&self, frame: Frame) -> Result<()> {
        let client = self.target()?;
        if client.post_message(serde_json::to_value(&frame)?) == 0 {
            return Err(Error::transport("client has no message listener"));
        }
        Ok(())
    }
}

struct ClientSink {
    client: WorkerClient,
}

impl FrameSink for ClientSink {
    fn post(&self, frame: Frame) -> Result<()> {
        if self.client.post_to_worker(serde_json::to_value(&frame)?) == 0 {
            return Err(Error::transport("worker has no message listener"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
