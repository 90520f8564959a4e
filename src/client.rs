//! Request/response client.
//!
//! A [`Client`] sends [`Envelope`]s over one [`Transport`], waits for the
//! correlated [`Response`](crate::Response) and turns `code != 0` into
//! [`Error::Remote`] whose message is the remote `message` field.
//!
//! # Example
//!
//! ```ignore
//! use realmbus::{Client, Realm, RealmKind};
//!
//! let client = Client::new(Realm::with_defaults(RealmKind::Content), transport)
//!     .with_prefix("api");
//!
//! // Sends {"action": "api/user/info", "data": null}
//! let info = client.call("user/info", Value::Null).await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{trace, warn};

use crate::config::{Realm, RequestOptions};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, is_falsy};
use crate::transport::Transport;

// ============================================================================
// Client
// ============================================================================

/// Typed RPC helper over a transport.
///
/// Cheap to clone; clones share the transport and the in-flight counter.
#[derive(Clone)]
pub struct Client {
    realm: Realm,
    transport: Arc<dyn Transport>,
    prefix: String,
    in_flight: Arc<AtomicUsize>,
}

impl Client {
    /// Creates a client with no action prefix.
    #[must_use]
    pub fn new(realm: Realm, transport: Arc<dyn Transport>) -> Self {
        Self {
            realm,
            transport,
            prefix: String::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Prefixes every action with `prefix + "/"`.
    ///
    /// An empty prefix sends actions unchanged.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim_end_matches('/').to_string();
        self
    }

    #[inline]
    #[must_use]
    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    #[inline]
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Returns the number of calls awaiting a response.
    #[inline]
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Builds the wire action for `action`.
    #[must_use]
    pub fn action(&self, action: &str) -> String {
        if self.prefix.is_empty() {
            action.to_string()
        } else {
            format!("{}/{action}", self.prefix)
        }
    }

    /// Calls `action` with realm default options.
    ///
    /// # Errors
    ///
    /// - [`Error::Remote`] if the server answers with `code != 0`
    /// - [`Error::RequestTimeout`] if the realm sets a timeout and it elapses
    /// - [`Error::TooManyPending`] if the realm's pending cap is reached
    /// - transport errors, depending on the [`ErrorPolicy`](crate::ErrorPolicy)
    pub async fn call(&self, action: &str, data: Value) -> Result<Value> {
        self.call_with(action, data, RequestOptions::new()).await
    }

    /// Calls `action` with per-call options.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_with(&self, action: &str, data: Value, options: RequestOptions) -> Result<Value> {
        let _slot = self.reserve()?;
        let options = options.resolve(self.realm.config());
        let envelope = Envelope::new(self.action(action), data);

        trace!(action = %envelope.action, transport = self.transport.kind(), "Calling");
        self.transport
            .send_message(envelope, options)
            .await?
            .into_result()
    }

    /// Like [`call`](Self::call), but also rejects falsy results
    /// (`null`, `false`, `0`, `""`).
    ///
    /// # Errors
    ///
    /// [`Error::EmptyResponse`] on a falsy result, plus everything
    /// [`call`](Self::call) returns.
    pub async fn call_throw(&self, action: &str, data: Value) -> Result<Value> {
        let value = self.call(action, data).await?;
        if is_falsy(&value) {
            return Err(Error::empty_response(self.action(action)));
        }
        Ok(value)
    }

    /// Serializes `params`, calls `action` and deserializes the result.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] if either conversion fails, plus everything
    /// [`call`](Self::call) returns.
    pub async fn call_typed<P, R>(&self, action: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let data = serde_json::to_value(params)?;
        let value = self.call(action, data).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Opens a connection to `action`.
    ///
    /// Resolves as soon as the open request is sent.
    ///
    /// # Errors
    ///
    /// Returns the transport's native error if the request cannot be sent.
    pub async fn connect(&self, action: &str, data: Value) -> Result<Connection> {
        self.transport
            .connect(Envelope::new(self.action(action), data))
            .await
    }

    /// Sends `action` without waiting for a response.
    ///
    /// # Errors
    ///
    /// Returns the transport's native error if the message cannot be sent.
    pub fn post(&self, action: &str, data: Value) -> Result<()> {
        self.transport
            .post_message(Envelope::new(self.action(action), data))
    }

    /// Takes an in-flight slot, enforcing the realm's pending cap.
    fn reserve(&self) -> Result<InFlight> {
        let pending = self.in_flight.fetch_add(1, Ordering::AcqRel);
        let slot = InFlight(Arc::clone(&self.in_flight));

        if let Some(max) = self.realm.config().max_pending
            && pending >= max
        {
            warn!(pending, max, "Too many pending requests");
            return Err(Error::TooManyPending { pending, max });
        }
        Ok(slot)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("realm", self.realm.kind())
            .field("transport", &self.transport.kind())
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Releases an in-flight slot on drop.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Free Functions
// ============================================================================

/// Sends one request over `transport` with default options.
///
/// # Errors
///
/// [`Error::Remote`] if the response code is non-zero.
pub async fn send_message(transport: &dyn Transport, action: &str, data: Value) -> Result<Value> {
    transport
        .send_message(Envelope::new(action, data), RequestOptions::new())
        .await?
        .into_result()
}

/// Opens a connection over `transport`.
///
/// # Errors
///
/// Returns the transport's native error if the request cannot be sent.
pub async fn connect(transport: &dyn Transport, action: &str, data: Value) -> Result<Connection> {
    transport.connect(Envelope::new(action, data)).await
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;

    use crate::config::{RealmConfig, RealmKind};
    use crate::protocol::Response;
    use crate::transport::MemoryTransport;

    /// Answers every request with a fixed response.
    fn answering(response: Response) -> (MemoryTransport, MemoryTransport) {
        let (server, client) = MemoryTransport::pair();
        server.on_message(Arc::new(move |_envelope, _sender, responder| {
            responder.respond(response.clone());
        }));
        (server, client)
    }

    fn client(transport: MemoryTransport) -> Client {
        Client::new(Realm::with_defaults(RealmKind::Content), Arc::new(transport))
    }

    #[tokio::test]
    async fn test_action_prefixing() {
        let (_server, transport) = MemoryTransport::pair();
        let plain = client(transport);
        assert_eq!(plain.action("user/info"), "user/info");

        let prefixed = plain.with_prefix("api/");
        assert_eq!(prefixed.prefix(), "api");
        assert_eq!(prefixed.action("user/info"), "api/user/info");
    }

    #[tokio::test]
    async fn test_error_code_becomes_remote_error() {
        let (_server, transport) = answering(Response::error("boom"));
        let err = client(transport)
            .call("anything", Value::Null)
            .await
            .unwrap_err();

        assert!(err.is_remote());
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_call_throw_rejects_falsy() {
        for falsy in [Value::Null, json!(false), json!(0), json!("")] {
            let (_server, transport) = answering(Response::ok(falsy));
            let err = client(transport)
                .call_throw("maybe", Value::Null)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::EmptyResponse { ref action } if action == "maybe"));
        }

        let (_server, transport) = answering(Response::ok(json!("value")));
        let value = client(transport)
            .call_throw("maybe", Value::Null)
            .await
            .expect("truthy");
        assert_eq!(value, json!("value"));
    }

    #[tokio::test]
    async fn test_call_typed() {
        #[derive(Serialize)]
        struct Query {
            id: u32,
        }

        #[derive(Debug, Deserialize, PartialEq)]
        struct Script {
            id: u32,
            name: String,
        }

        let (server, transport) = MemoryTransport::pair();
        server.on_message(Arc::new(|envelope, _sender, responder| {
            let id = envelope.data["id"].clone();
            responder.respond(Response::ok(json!({"id": id, "name": "demo"})));
        }));

        let script: Script = client(transport)
            .call_typed("script/get", &Query { id: 4 })
            .await
            .expect("typed");
        assert_eq!(
            script,
            Script {
                id: 4,
                name: "demo".into()
            }
        );
    }

    #[tokio::test]
    async fn test_realm_timeout_applies() {
        let (_server, transport) = MemoryTransport::pair();
        let realm = Realm::new(
            RealmKind::Content,
            RealmConfig::new().with_request_timeout(Duration::from_millis(20)),
        );
        let client = Client::new(realm, Arc::new(transport));

        let err = client.call("silent", Value::Null).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_pending_cap() {
        let (_server, transport) = MemoryTransport::pair();
        let realm = Realm::new(
            RealmKind::Content,
            RealmConfig::new()
                .with_max_pending(1)
                .with_request_timeout(Duration::from_millis(50)),
        );
        let client = Client::new(realm, Arc::new(transport));

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.call("slow", Value::Null).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = client.call("second", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::TooManyPending { pending: 1, max: 1 }));

        assert!(first.await.expect("join").unwrap_err().is_timeout());
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_free_send_message() {
        let (_server, transport) = answering(Response::ok(json!(42)));
        let value = send_message(&transport, "answer", Value::Null)
            .await
            .expect("value");
        assert_eq!(value, json!(42));
    }
}
