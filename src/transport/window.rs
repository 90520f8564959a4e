//! Cross-document window transport.
//!
//! Used between an extension page and a sandboxed or offscreen document it
//! embeds. Each side posts frames to the other window; inbound messages are
//! accepted only when their source is the expected peer.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{Frame, SenderDescriptor};

use super::endpoint::{Endpoint, FrameSink};

// ============================================================================
// Window
// ============================================================================

static NEXT_WINDOW_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a window, used as the message source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

/// A `message` event.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// Posted payload.
    pub data: Value,
    /// Window that posted it.
    pub source: WindowId,
}

/// A browsing context that can receive posted messages.
#[derive(Clone)]
pub struct Window {
    inner: Arc<WindowInner>,
}

struct WindowInner {
    id: WindowId,
    descriptor: SenderDescriptor,
    listeners: Mutex<Vec<mpsc::UnboundedSender<MessageEvent>>>,
}

impl Window {
    /// Creates a window described to its peers by `descriptor`.
    #[must_use]
    pub fn new(descriptor: SenderDescriptor) -> Self {
        Self {
            inner: Arc::new(WindowInner {
                id: WindowId(NEXT_WINDOW_ID.fetch_add(1, Ordering::Relaxed)),
                descriptor,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> WindowId {
        self.inner.id
    }

    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> &SenderDescriptor {
        &self.inner.descriptor
    }

    /// Posts `data` to this window on behalf of `source`.
    ///
    /// Returns how many listeners received it.
    pub fn post_message(&self, data: Value, source: &Window) -> usize {
        let event = MessageEvent {
            data,
            source: source.id(),
        };
        let mut listeners = self.inner.listeners.lock();
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
        listeners.len()
    }

    /// Subscribes to `message` events on this window.
    pub fn add_message_listener(&self) -> mpsc::UnboundedReceiver<MessageEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().push(tx);
        rx
    }
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("id", &self.inner.id)
            .field("descriptor", &self.inner.descriptor)
            .finish()
    }
}

// ============================================================================
// WindowTransport
// ============================================================================

/// Transport between two windows.
#[derive(Clone)]
pub struct WindowTransport {
    endpoint: Endpoint,
}

impl WindowTransport {
    /// Attaches `this` window to `target`.
    #[must_use]
    pub fn new(this: &Window, target: &Window) -> Self {
        let mut events = this.add_message_listener();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let expected = target.id();
        let descriptor = target.descriptor().clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event.source != expected {
                    trace!(source = %event.source, "Ignoring message from unexpected window");
                    continue;
                }
                match serde_json::from_value::<Frame>(event.data) {
                    Ok(frame) => {
                        if inbound_tx.send((frame, descriptor.clone())).is_err() {
                            break;
                        }
                    }
                    Err(e) => trace!(error = %e, "Ignoring non-frame window message"),
                }
            }
        });

        debug!(this = %this.id(), target = %target.id(), "Window transport attached");
        Self {
            endpoint: Endpoint::spawn(
                "window",
                WindowSink {
                    this: this.clone(),
                    target: target.clone(),
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

super::delegate_to_endpoint!(WindowTransport, "window");

struct WindowSink {
    this: Window,
    target: Window,
}

impl FrameSink for WindowSink {
    fn post(&self, frame: Frame) -> Result<()> {
        let data = serde_json::to_value(&frame)?;
        if self.target.post_message(data, &self.this) == 0 {
            return Err(Error::transport(format!(
                "{} has no message listener",
                self.target.id()
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

    use std::time::Duration;

    use serde_json::json;

    use crate::config::RequestOptions;
    use crate::protocol::{Envelope, Response};
    use crate::transport::Transport;

    #[test]
    fn test_window_ids_are_unique() {
        let a = Window::new(SenderDescriptor::background());
        let b = Window::new(SenderDescriptor::background());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_round_trip_between_windows() {
        let page = Window::new(SenderDescriptor::background());
        let sandbox = Window::new(SenderDescriptor::document("sandbox-doc"));

        let page_side = WindowTransport::new(&page, &sandbox);
        let sandbox_side = WindowTransport::new(&sandbox, &page);

        sandbox_side.on_message(Arc::new(|envelope, sender, responder| {
            assert!(sender.descriptor().is_background());
            responder.respond(Response::ok(json!(format!("ran {}", envelope.action))));
        }));

        let response = page_side
            .send_message(Envelope::new("eval", Value::Null), RequestOptions::new())
            .await
            .expect("response");
        assert_eq!(response.data, Some(json!("ran eval")));
    }

    #[tokio::test]
    async fn test_messages_from_other_sources_are_ignored() {
        let page = Window::new(SenderDescriptor::background());
        let sandbox = Window::new(SenderDescriptor::background());
        let intruder = Window::new(SenderDescriptor::background());

        let sandbox_side = WindowTransport::new(&sandbox, &page);
        let (tx, mut rx) = mpsc::unbounded_channel();
        sandbox_side.on_message(Arc::new(move |envelope, _sender, _responder| {
            let _ = tx.send(envelope.action);
        }));

        let frame = Frame::SendMessage {
            message_id: None,
            data: Envelope::new("spoof", Value::Null),
        };
        let data = serde_json::to_value(&frame).expect("frame");
        sandbox.post_message(data.clone(), &intruder);

        let got = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(got.is_err());

        sandbox.post_message(data, &page);
        assert_eq!(rx.recv().await.as_deref(), Some("spoof"));
    }
}
