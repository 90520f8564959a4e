//! Same-document custom event transport.
//!
//! The page-injected sandbox and the content script share one document but
//! not one realm. They talk through custom events named after a random flag
//! so page scripts cannot collide with them:
//!
//! | Role | Sends on | Listens on |
//! |------|----------|------------|
//! | [`EventRole::Content`] | `"ct" + flag` | `"fd" + flag` |
//! | [`EventRole::Inject`] | `"fd" + flag` | `"ct" + flag` |
//!
//! Event details are structured data only. Live objects never cross: pass a
//! [`HandleId`](crate::HandleId) from a [`HandleRegistry`](crate::HandleRegistry)
//! instead.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{Frame, SenderDescriptor};

use super::endpoint::{Endpoint, FrameSink};

// ============================================================================
// Document
// ============================================================================

/// A custom event as seen by listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
    /// Event name.
    pub event_type: String,
    /// Structured payload.
    pub detail: Value,
}

/// A document's event target, shared by every realm living in it.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocumentInner>,
}

struct DocumentInner {
    id: String,
    listeners: RwLock<FxHashMap<String, Vec<mpsc::UnboundedSender<CustomEvent>>>>,
}

impl Document {
    /// Creates a document with a random id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Creates a document with a known id.
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DocumentInner {
                id: id.into(),
                listeners: RwLock::new(FxHashMap::default()),
            }),
        }
    }

    /// Returns the document id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Subscribes to events named `event_type`.
    pub fn add_event_listener(&self, event_type: &str) -> mpsc::UnboundedReceiver<CustomEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .listeners
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Dispatches an event and returns how many listeners received it.
    ///
    /// Listeners whose receiver was dropped are pruned.
    pub fn dispatch_event(&self, event: CustomEvent) -> usize {
        let mut listeners = self.inner.listeners.write();
        let Some(targets) = listeners.get_mut(&event.event_type) else {
            return 0;
        };

        targets.retain(|tx| tx.send(event.clone()).is_ok());
        targets.len()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document").field("id", &self.inner.id).finish()
    }
}

// ============================================================================
// EventFlag
// ============================================================================

/// Random string shared by the two realms of one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventFlag(String);

impl EventFlag {
    /// Generates a fresh flag.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wraps a flag received from the other realm.
    #[must_use]
    pub fn new(flag: impl Into<String>) -> Self {
        Self(flag.into())
    }

    /// Returns the flag text.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// EventRole
// ============================================================================

/// Which side of the document boundary a transport sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRole {
    /// Content script.
    Content,
    /// Page-injected sandbox.
    Inject,
}

impl EventRole {
    fn outgoing(self, flag: &EventFlag) -> String {
        match self {
            Self::Content => format!("ct{flag}"),
            Self::Inject => format!("fd{flag}"),
        }
    }

    fn incoming(self, flag: &EventFlag) -> String {
        match self {
            Self::Content => format!("fd{flag}"),
            Self::Inject => format!("ct{flag}"),
        }
    }
}

// ============================================================================
// EventTransport
// ============================================================================

/// Transport over directional custom events in one document.
#[derive(Clone)]
pub struct EventTransport {
    endpoint: Endpoint,
    role: EventRole,
}

impl EventTransport {
    /// Attaches a transport to `document` for the given role.
    #[must_use]
    pub fn new(document: &Document, flag: &EventFlag, role: EventRole) -> Self {
        let mut events = document.add_event_listener(&role.incoming(flag));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let descriptor = SenderDescriptor::document(document.id());

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match serde_json::from_value::<Frame>(event.detail) {
                    Ok(frame) => {
                        if inbound_tx.send((frame, descriptor.clone())).is_err() {
                            break;
                        }
                    }
                    Err(e) => trace!(error = %e, "Ignoring foreign custom event"),
                }
            }
        });

        let sink = EventSink {
            document: document.clone(),
            event_type: role.outgoing(flag),
        };

        debug!(?role, document = document.id(), "Custom event transport attached");
        Self {
            endpoint: Endpoint::spawn("event", sink, inbound_rx),
            role,
        }
    }

    /// Returns this transport's role.
    #[inline]
    #[must_use]
    pub fn role(&self) -> EventRole {
        self.role
    }

    /// Returns the underlying endpoint.
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

super::delegate_to_endpoint!(EventTransport, "event");

// ============================================================================
// EventSink
// ============================================================================

struct EventSink {
    document: Document,
    event_type: String,
}

impl FrameSink for EventSink {
    fn post(&self, frame: Frame) -> Result<()> {
        let detail = serde_json::to_value(&frame)?;
        let delivered = self.document.dispatch_event(CustomEvent {
            event_type: self.event_type.clone(),
            detail,
        });

        if delivered == 0 {
            return Err(Error::transport(format!(
                "no listener for {}",
                self.event_type
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::config::RequestOptions;
    use crate::protocol::{Envelope, Response};
    use crate::transport::Transport;

    #[test]
    fn test_event_names_are_directional() {
        let flag = EventFlag::new("abc");
        assert_eq!(EventRole::Content.outgoing(&flag), "ctabc");
        assert_eq!(EventRole::Content.incoming(&flag), "fdabc");
        assert_eq!(EventRole::Inject.outgoing(&flag), "fdabc");
        assert_eq!(EventRole::Inject.incoming(&flag), "ctabc");
    }

    #[test]
    fn test_generated_flags_differ() {
        assert_ne!(EventFlag::generate(), EventFlag::generate());
    }

    #[tokio::test]
    async fn test_dispatch_event_counts_listeners() {
        let document = Document::with_id("doc");
        let mut rx = document.add_event_listener("hello");

        let delivered = document.dispatch_event(CustomEvent {
            event_type: "hello".into(),
            detail: json!(1),
        });
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.expect("event").detail, json!(1));

        assert_eq!(
            document.dispatch_event(CustomEvent {
                event_type: "other".into(),
                detail: json!(1),
            }),
            0
        );
    }

    #[tokio::test]
    async fn test_inject_to_content_round_trip() {
        let document = Document::with_id("doc-7");
        let flag = EventFlag::generate();
        let content = EventTransport::new(&document, &flag, EventRole::Content);
        let inject = EventTransport::new(&document, &flag, EventRole::Inject);

        content.on_message(Arc::new(|envelope, sender, responder| {
            assert_eq!(sender.document_id(), Some("doc-7"));
            responder.respond(Response::ok(envelope.data));
        }));

        let response = inject
            .send_message(Envelope::new("echo", json!("hi")), RequestOptions::new())
            .await
            .expect("response");
        assert_eq!(response.data, Some(json!("hi")));
    }

    #[tokio::test]
    async fn test_different_flags_do_not_collide() {
        let document = Document::new();
        let content = EventTransport::new(&document, &EventFlag::new("one"), EventRole::Content);
        let inject = EventTransport::new(&document, &EventFlag::new("two"), EventRole::Inject);

        content.on_message(Arc::new(|_envelope, _sender, responder| {
            responder.respond(Response::ok(json!("wrong realm")));
        }));

        let err = inject
            .send_message(
                Envelope::new("echo", Value::Null),
                RequestOptions::new().with_error_policy(crate::ErrorPolicy::Surface),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }
}
