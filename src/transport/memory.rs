//! In-memory transport pair.
//!
//! Two endpoints wired back to back through unbounded channels. Used as the
//! test double for every layer above the transport, and as a same-process
//! channel between two substrates.
//!
//! # Example
//!
//! ```ignore
//! let (background, content) = MemoryTransport::pair();
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::{Frame, SenderDescriptor};

use super::endpoint::{Endpoint, FrameSink};

// ============================================================================
// MemoryTransport
// ============================================================================

/// One end of an in-memory channel.
#[derive(Clone)]
pub struct MemoryTransport {
    endpoint: Endpoint,
    frames_sent: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Creates a connected pair.
    ///
    /// The first end presents itself as the background page, the second as
    /// the top frame of tab 1.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        Self::pair_with(SenderDescriptor::background(), SenderDescriptor::tab(1, 1, 0))
    }

    /// Creates a connected pair with explicit sender descriptors.
    ///
    /// `first` is what the second end sees as the sender, and vice versa.
    #[must_use]
    pub fn pair_with(first: SenderDescriptor, second: SenderDescriptor) -> (Self, Self) {
        let (to_first, first_inbound) = mpsc::unbounded_channel();
        let (to_second, second_inbound) = mpsc::unbounded_channel();

        let first_count = Arc::new(AtomicUsize::new(0));
        let second_count = Arc::new(AtomicUsize::new(0));

        let first_end = Self {
            endpoint: Endpoint::spawn(
                "memory",
                MemorySink {
                    peer: Mutex::new(Some(to_second)),
                    descriptor: first,
                    frames_sent: Arc::clone(&first_count),
                },
                first_inbound,
            ),
            frames_sent: first_count,
        };

        let second_end = Self {
            endpoint: Endpoint::spawn(
                "memory",
                MemorySink {
                    peer: Mutex::new(Some(to_first)),
                    descriptor: second,
                    frames_sent: Arc::clone(&second_count),
                },
                second_inbound,
            ),
            frames_sent: second_count,
        };

        (first_end, second_end)
    }

    /// Returns the number of frames this end has written.
    #[inline]
    #[must_use]
    pub fn frames_sent(&self) -> usize {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Returns the underlying endpoint.
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Closes this end. The peer observes the channel ending.
    pub fn close(&self) {
        self.endpoint.close();
    }
}

super::delegate_to_endpoint!(MemoryTransport, "memory");

// ============================================================================
// MemorySink
// ============================================================================

struct MemorySink {
    peer: Mutex<Option<mpsc::UnboundedSender<(Frame, SenderDescriptor)>>>,
    descriptor: SenderDescriptor,
    frames_sent: Arc<AtomicUsize>,
}

impl FrameSink for MemorySink {
    fn post(&self, frame: Frame) -> Result<()> {
        let peer = self.peer.lock();
        let peer = peer.as_ref().ok_or(Error::ConnectionClosed)?;

        trace!(frame = frame.kind(), "Memory frame");
        peer.send((frame, self.descriptor.clone()))
            .map_err(|_| Error::transport("peer endpoint is gone"))?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {
        self.peer.lock().take();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::{Value, json};

    use crate::config::RequestOptions;
    use crate::protocol::{Envelope, Response};
    use crate::transport::Transport;

    #[tokio::test]
    async fn test_round_trip_with_sender_descriptor() {
        let (background, content) = MemoryTransport::pair();

        background.on_message(Arc::new(|envelope, sender, responder| {
            let reply = json!({"action": envelope.action, "tab": sender.tab_id()});
            responder.respond(Response::ok(reply));
        }));

        let response = content
            .send_message(Envelope::new("whoami", Value::Null), RequestOptions::new())
            .await
            .expect("response");

        assert_eq!(response.data, Some(json!({"action": "whoami", "tab": 1})));
        assert_eq!(content.frames_sent(), 1);
        assert_eq!(background.frames_sent(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (server, client) = MemoryTransport::pair();

        server.on_message(Arc::new(|envelope, _sender, responder| {
            tokio::spawn(async move {
                let delay = envelope.data.as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                responder.respond(Response::ok(envelope.data));
            });
        }));

        let slow = client.send_message(Envelope::new("echo", json!(60)), RequestOptions::new());
        let fast = client.send_message(Envelope::new("echo", json!(5)), RequestOptions::new());
        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(slow.expect("slow").data, Some(json!(60)));
        assert_eq!(fast.expect("fast").data, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_close_fails_peer_requests() {
        let (server, client) = MemoryTransport::pair();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_message(Envelope::new("never", Value::Null), RequestOptions::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Closing the server end ends the client's inbound channel
        server.close();
        let err = pending.await.expect("join").unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_post_message_after_close_fails() {
        let (server, _client) = MemoryTransport::pair();
        server.close();
        let err = server
            .post_message(Envelope::new("x", Value::Null))
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
