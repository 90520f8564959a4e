//! Prefix-routed request dispatcher.
//!
//! A [`Server`] listens on one or more transports, keeps the actions whose
//! path starts with its prefix, and dispatches the remainder by exact
//! match to a handler registered through a [`Group`].
//!
//! # Dispatch
//!
//! | Outcome | Response |
//! |---------|----------|
//! | Handler returns `Ok(value)` | `{code: 0, data: value}` |
//! | Handler or middleware returns `Err(e)` | `{code: -1, message: e.message()}` |
//! | Handler panics | `{code: -1, message: <panic message>}` |
//! | No handler | `{code: -1, message: "no such api <action>"}` |
//! | Prefix does not match | no response |
//!
//! Every incoming request runs on its own task, so independent requests
//! interleave at await points.
//!
//! # Example
//!
//! ```ignore
//! let server = Server::new(realm, "api").with_transport(transport);
//! server.group("user").on_sync("info", |_req| Ok(json!("ok")));
//! server.start();
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Hierarchical namespaces with inherited middleware.
pub mod group;

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::config::Realm;
use crate::error::{Error, Result};
use crate::middleware::{Handler, Middleware};
use crate::protocol::{Envelope, Response, Sender};
use crate::transport::{Responder, Transport};

// ============================================================================
// Re-exports
// ============================================================================

pub use group::Group;

// ============================================================================
// Types
// ============================================================================

/// Context handed to handlers and middleware.
#[derive(Debug, Clone)]
pub struct Request {
    /// Action relative to the server prefix, group prefixes included.
    pub action: String,
    /// Request payload.
    pub params: Value,
    /// Who sent the request. Carries the [`Connection`](crate::Connection)
    /// for connect-style requests.
    pub sender: Sender,
}

/// Boxed action handler.
pub type ApiHandler = Handler<Request, Result<Value>>;

/// Boxed action middleware.
pub type ApiMiddleware = Middleware<Request, Result<Value>>;

// ============================================================================
// Server
// ============================================================================

/// Action registry wired to transports.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    realm: Realm,
    prefix: String,
    handlers: RwLock<FxHashMap<String, ApiHandler>>,
    transports: Mutex<Vec<Arc<dyn Transport>>>,
    started: AtomicBool,
}

impl Server {
    /// Creates a server for actions under `prefix`.
    ///
    /// A non-empty prefix `p` matches actions starting with `p/` and strips
    /// it. The empty prefix matches every action.
    #[must_use]
    pub fn new(realm: Realm, prefix: &str) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                realm,
                prefix: prefix.trim_end_matches('/').to_string(),
                handlers: RwLock::new(FxHashMap::default()),
                transports: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Adds a transport to listen on once started.
    #[must_use]
    pub fn with_transport(self, transport: Arc<dyn Transport>) -> Self {
        self.inner.transports.lock().push(transport);
        self
    }

    /// Adds several transports.
    #[must_use]
    pub fn with_transports<I>(self, transports: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Transport>>,
    {
        self.inner.transports.lock().extend(transports);
        self
    }

    #[inline]
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Returns the realm this server runs in, for handlers that need its
    /// kind or config.
    #[inline]
    #[must_use]
    pub fn realm(&self) -> &Realm {
        &self.inner.realm
    }

    /// Returns `true` once [`start`](Self::start) has run.
    #[inline]
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Returns the registered actions, sorted.
    #[must_use]
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<_> = self.inner.handlers.read().keys().cloned().collect();
        actions.sort_unstable();
        actions
    }

    /// Returns a group rooted at `name`.
    #[must_use]
    pub fn group(&self, name: &str) -> Group {
        Group::root(self.clone(), name)
    }

    /// Returns a group rooted at `name` with one middleware.
    #[must_use]
    pub fn group_with(&self, name: &str, middleware: ApiMiddleware) -> Group {
        self.group("").group_with(name, middleware)
    }

    /// Registers a handler at the root, without middleware.
    pub fn on<F, Fut>(&self, action: &str, handler: F) -> &Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.group("").on(action, handler);
        self
    }

    /// Seals the registry and subscribes to every transport.
    ///
    /// Idempotent. Registrations after this point are logged and ignored.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let transports = self.inner.transports.lock().clone();
        for transport in &transports {
            let weak = Arc::downgrade(&self.inner);
            transport.on_message(Arc::new(move |envelope, sender, responder| {
                on_message(&weak, envelope, sender, responder);
            }));

            let weak = Arc::downgrade(&self.inner);
            transport.on_connect(Arc::new(move |envelope, sender| {
                on_connect(&weak, envelope, sender);
            }));
        }

        debug!(
            realm = ?self.inner.realm.kind(),
            prefix = %self.inner.prefix,
            actions = self.inner.handlers.read().len(),
            transports = transports.len(),
            "Server started"
        );
    }

    /// Dispatches an action relative to the prefix and returns the response.
    pub async fn dispatch(&self, action: &str, params: Value, sender: Sender) -> Response {
        self.inner.dispatch(action.to_string(), params, sender).await
    }

    /// Adds a handler under its full key.
    pub(crate) fn register(&self, key: String, handler: ApiHandler) -> Result<()> {
        if self.is_started() {
            return Err(Error::sealed(key));
        }

        let mut handlers = self.inner.handlers.write();
        if handlers.insert(key.clone(), handler).is_some() {
            warn!(action = %key, "Handler replaced");
        } else {
            trace!(action = %key, "Handler registered");
        }
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("prefix", &self.inner.prefix)
            .field("actions", &self.inner.handlers.read().len())
            .field("started", &self.is_started())
            .finish()
    }
}

// ============================================================================
// ServerInner
// ============================================================================

impl ServerInner {
    /// Strips the prefix, or returns `None` if the action is not ours.
    fn route<'a>(&self, action: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            return Some(action);
        }
        action
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }

    async fn dispatch(&self, action: String, params: Value, sender: Sender) -> Response {
        let handler = self.handlers.read().get(&action).cloned();
        let Some(handler) = handler else {
            debug!(action = %action, "No such api");
            return Response::error(format!("no such api {action}"));
        };

        let request = Request {
            action: action.clone(),
            params,
            sender,
        };

        // The handler is called inside the guarded future so synchronous
        // panics are caught too
        let outcome = AssertUnwindSafe(async move { handler(request).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    debug!(action = %action, error = %e, "Handler failed");
                }
                Response::from_result(result)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(realm = ?self.realm.kind(), action = %action, message = %message, "Handler panicked");
                Response::error(message)
            }
        }
    }
}

fn on_message(weak: &Weak<ServerInner>, envelope: Envelope, sender: Sender, responder: Responder) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let Some(action) = inner.route(&envelope.action).map(str::to_string) else {
        trace!(action = %envelope.action, prefix = %inner.prefix, "Action outside prefix ignored");
        return;
    };

    tokio::spawn(async move {
        let response = inner.dispatch(action, envelope.data, sender).await;
        responder.respond(response);
    });
}

fn on_connect(weak: &Weak<ServerInner>, envelope: Envelope, sender: Sender) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let Some(action) = inner.route(&envelope.action).map(str::to_string) else {
        trace!(action = %envelope.action, prefix = %inner.prefix, "Connect outside prefix ignored");
        return;
    };
    let Some(connection) = sender.connection().cloned() else {
        warn!(action = %action, "Connect request without a connection");
        return;
    };

    tokio::spawn(async move {
        let response = inner.dispatch(action, envelope.data, sender).await;

        // Handlers that keep the connection for pushes return null
        if response.is_success() && response.data.as_ref().is_none_or(Value::is_null) {
            return;
        }
        if let Err(e) = connection.send(&response) {
            warn!(id = %connection.id(), error = %e, "Failed to stream connect response");
        }
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
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
    use tokio::sync::mpsc;

    use crate::client::Client;
    use crate::config::{RealmKind, RequestOptions};
    use crate::middleware::{Next, middleware_fn};
    use crate::transport::MemoryTransport;

    fn realm() -> Realm {
        Realm::with_defaults(RealmKind::Background)
    }

    /// Starts `server` on one end of a memory pair and returns a client on
    /// the other.
    fn serve(server: Server) -> (Server, Client) {
        let (background, content) = MemoryTransport::pair();
        let server = server.with_transport(Arc::new(background));
        server.start();
        let client = Client::new(Realm::with_defaults(RealmKind::Content), Arc::new(content));
        (server, client)
    }

    #[tokio::test]
    async fn test_user_info_round_trip_and_missing_action() {
        let server = Server::new(realm(), "");
        server.group("user").on_sync("info", |_req| Ok(json!("ok")));
        let (_server, client) = serve(server);

        let info = client.call("user/info", Value::Null).await.expect("info");
        assert_eq!(info, json!("ok"));

        let err = client.call("user/missing", Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), "no such api user/missing");
    }

    #[tokio::test]
    async fn test_handler_error_round_trip() {
        let server = Server::new(realm(), "");
        server.on("explode", |_req| async { Err::<Value, _>(Error::handler("boom")) });
        let (_server, client) = serve(server);

        let err = client.call("explode", Value::Null).await.unwrap_err();
        assert!(err.is_remote());
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error_response() {
        let server = Server::new(realm(), "");
        server
            .group("")
            .on_sync("crash", |_req| -> Result<Value> { panic!("kaboom") });
        let (_server, client) = serve(server);

        let err = client.call("crash", Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), "kaboom");

        // The dispatcher survives
        let err = client.call("crash", Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), "kaboom");
    }

    #[tokio::test]
    async fn test_prefix_is_stripped() {
        let server = Server::new(realm(), "api");
        server.group("user").on_sync("info", |req| Ok(json!(req.action)));
        let (_server, client) = serve(server);

        let value = client
            .clone()
            .with_prefix("api")
            .call("user/info", Value::Null)
            .await
            .expect("routed");
        assert_eq!(value, json!("user/info"));

        let err = client
            .with_prefix("api")
            .call("user/missing", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no such api user/missing");
    }

    #[tokio::test]
    async fn test_unmatched_prefix_never_resolves() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = Server::new(realm(), "api");
        server.on("x", move |_req| {
            let _ = tx.send(());
            async { Ok::<_, Error>(Value::Null) }
        });
        let (_server, client) = serve(server);

        let mut call = tokio_test::task::spawn(client.call("other/x", Value::Null));
        tokio_test::assert_pending!(call.poll());
        tokio::time::sleep(Duration::from_millis(30)).await;
        tokio_test::assert_pending!(call.poll());
        assert!(rx.try_recv().is_err());

        let err = client
            .call_with(
                "other/x",
                Value::Null,
                RequestOptions::new().with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_group_name_normalization() {
        let server = Server::new(realm(), "");
        server.group("g").on_sync("test", |_req| Ok(json!("g")));
        server.group("g/").on_sync("other", |_req| Ok(json!("g/")));

        assert_eq!(server.actions(), vec!["g/other".to_string(), "g/test".to_string()]);

        let (_server, client) = serve(server);
        assert_eq!(client.call("g/test", Value::Null).await.expect("test"), json!("g"));
        assert_eq!(client.call("g/other", Value::Null).await.expect("other"), json!("g/"));
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> ApiMiddleware {
        let log = Arc::clone(log);
        middleware_fn(move |req: Request, next: Next<Request, Result<Value>>| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{name}-before"));
                let out = next.run(req).await;
                log.lock().push(format!("{name}-after"));
                out
            }
        })
    }

    #[tokio::test]
    async fn test_onion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let server = Server::new(realm(), "");
        let handler_log = Arc::clone(&log);
        server
            .group("")
            .use_middleware(recording(&log, "A"))
            .use_middleware(recording(&log, "B"))
            .on_sync("h", move |_req| {
                handler_log.lock().push("H".to_string());
                Ok(Value::Null)
            });

        let response = server.dispatch("h", Value::Null, Sender::default()).await;
        assert!(response.is_success());
        assert_eq!(
            *log.lock(),
            vec!["A-before", "B-before", "H", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn test_middleware_inheritance() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let server = Server::new(realm(), "");
        let parent = server.group_with("p", recording(&log, "P"));
        let child = parent.group_with("c", recording(&log, "C"));
        let handler_log = Arc::clone(&log);
        child.on_sync("h", move |_req| {
            handler_log.lock().push("H".to_string());
            Ok(Value::Null)
        });

        // Deriving the child leaves the parent untouched
        assert_eq!(parent.middleware_count(), 1);
        assert_eq!(child.middleware_count(), 2);

        server.dispatch("p/c/h", Value::Null, Sender::default()).await;
        assert_eq!(
            *log.lock(),
            vec!["P-before", "C-before", "H", "C-after", "P-after"]
        );
    }

    #[tokio::test]
    async fn test_middleware_can_intercept_errors() {
        let server = Server::new(realm(), "");
        server
            .group("")
            .use_middleware(middleware_fn(|req, next: Next<Request, Result<Value>>| async move {
                match next.run(req).await {
                    Err(e) => Ok(json!(format!("recovered: {}", e.message()))),
                    ok => ok,
                }
            }))
            .on("fails", |_req| async { Err::<Value, _>(Error::handler("inner")) });

        let response = server.dispatch("fails", Value::Null, Sender::default()).await;
        assert_eq!(response, Response::ok(json!("recovered: inner")));
    }

    #[tokio::test]
    async fn test_registration_after_start_is_ignored() {
        let server = Server::new(realm(), "");
        let root = server.group("");
        root.on_sync("early", |_req| Ok(Value::Null));
        server.start();
        root.on_sync("late", |_req| Ok(Value::Null));

        assert_eq!(server.actions(), vec!["early".to_string()]);
        let response = server.dispatch("late", Value::Null, Sender::default()).await;
        assert_eq!(response.message.as_deref(), Some("no such api late"));
    }

    #[test]
    fn test_realm_is_kept() {
        let server = Server::new(Realm::with_defaults(RealmKind::Sandbox), "api");
        assert_eq!(server.realm().kind(), &RealmKind::Sandbox);
    }

    #[tokio::test]
    async fn test_multiple_transports() {
        let (bg_a, content_a) = MemoryTransport::pair();
        let (bg_b, content_b) = MemoryTransport::pair();

        let server = Server::new(realm(), "")
            .with_transports([Arc::new(bg_a) as Arc<dyn Transport>, Arc::new(bg_b)]);
        server.on("ping", |_req| async { Ok::<_, Error>(json!("pong")) });
        server.start();

        for transport in [content_a, content_b] {
            let client = Client::new(realm(), Arc::new(transport));
            assert_eq!(client.call("ping", Value::Null).await.expect("pong"), json!("pong"));
        }
    }

    #[tokio::test]
    async fn test_connect_handler_keeps_connection() {
        let server = Server::new(realm(), "");
        server.group("stream").on("logs", |req| async move {
            if let Some(connection) = req.sender.connection() {
                connection.send_message(json!("line 1"))?;
                connection.send_message(json!("line 2"))?;
            }
            Ok(Value::Null)
        });
        let (_server, client) = serve(server);

        let connection = client.connect("stream/logs", Value::Null).await.expect("connect");
        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.on_message(move |data| {
            let _ = tx.send(data);
        });

        assert_eq!(rx.recv().await, Some(json!("line 1")));
        assert_eq!(rx.recv().await, Some(json!("line 2")));
    }

    #[tokio::test]
    async fn test_connect_to_missing_action_streams_error() {
        let (_server, client) = serve(Server::new(realm(), ""));

        let connection = client.connect("nothing", Value::Null).await.expect("connect");
        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.on_message(move |data| {
            let _ = tx.send(data);
        });

        let response: Response = serde_json::from_value(rx.recv().await.expect("error")).expect("response");
        assert_eq!(response.message.as_deref(), Some("no such api nothing"));
    }

    #[tokio::test]
    async fn test_disconnect_propagates_to_handler_side() {
        let (held_tx, mut held_rx) = mpsc::unbounded_channel();
        let server = Server::new(realm(), "");
        server.on("hold", move |req| {
            let held_tx = held_tx.clone();
            async move {
                if let Some(connection) = req.sender.connection() {
                    let _ = held_tx.send(connection.clone());
                }
                Ok(Value::Null)
            }
        });
        let (_server, client) = serve(server);

        let opener = client.connect("hold", Value::Null).await.expect("connect");
        let held = held_rx.recv().await.expect("held");

        let (gone_tx, mut gone_rx) = mpsc::unbounded_channel();
        held.on_disconnect(move || {
            let _ = gone_tx.send(());
        });

        opener.disconnect();
        assert_eq!(gone_rx.recv().await, Some(()));

        // Sends on either end are now no-ops
        held.send_message(json!("late")).expect("no-op");
        opener.send_message(json!("late")).expect("no-op");
        assert!(held.is_disconnected());
    }
}
