//! Sender descriptors.
//!
//! Whatever the transport, handlers see who sent a message through the same
//! `{windowId, tabId, frameId, documentId}` shape. `-1` stands for the
//! background page or a worker.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::connection::Connection;

// ============================================================================
// Constants
// ============================================================================

/// Window/tab id used for background pages and workers.
pub const NO_TAB: i64 = -1;

// ============================================================================
// SenderDescriptor
// ============================================================================

/// Normalized view of a message origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderDescriptor {
    /// Browser window id, `-1` for background/worker.
    pub window_id: i64,

    /// Tab id, `-1` for background/worker.
    pub tab_id: i64,

    /// Frame id within the tab (0 = top frame).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<i64>,

    /// Document id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

impl SenderDescriptor {
    /// Descriptor for a background page or worker.
    #[inline]
    #[must_use]
    pub const fn background() -> Self {
        Self {
            window_id: NO_TAB,
            tab_id: NO_TAB,
            frame_id: None,
            document_id: None,
        }
    }

    /// Descriptor for a frame inside a tab.
    #[inline]
    #[must_use]
    pub const fn tab(window_id: i64, tab_id: i64, frame_id: i64) -> Self {
        Self {
            window_id,
            tab_id,
            frame_id: Some(frame_id),
            document_id: None,
        }
    }

    /// Descriptor known only by document id.
    #[inline]
    #[must_use]
    pub fn document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: Some(document_id.into()),
            ..Self::background()
        }
    }

    /// Sets the document id.
    #[inline]
    #[must_use]
    pub fn with_document_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    /// Returns `true` if the sender is not attached to a tab.
    #[inline]
    #[must_use]
    pub fn is_background(&self) -> bool {
        self.tab_id == NO_TAB
    }
}

impl Default for SenderDescriptor {
    fn default() -> Self {
        Self::background()
    }
}

// ============================================================================
// Sender
// ============================================================================

/// The origin of a request as seen by a handler.
///
/// For connect-style dispatch the sender also carries the open
/// [`Connection`], which the handler may keep for later pushes.
#[derive(Clone, Default)]
pub struct Sender {
    descriptor: SenderDescriptor,
    connection: Option<Connection>,
}

impl Sender {
    /// Creates a sender for a one-shot message.
    #[inline]
    #[must_use]
    pub fn new(descriptor: SenderDescriptor) -> Self {
        Self {
            descriptor,
            connection: None,
        }
    }

    /// Creates a sender for a connect-style request.
    #[inline]
    #[must_use]
    pub fn with_connection(descriptor: SenderDescriptor, connection: Connection) -> Self {
        Self {
            descriptor,
            connection: Some(connection),
        }
    }

    /// Returns the normalized descriptor.
    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> &SenderDescriptor {
        &self.descriptor
    }

    /// Returns the window id.
    #[inline]
    #[must_use]
    pub fn window_id(&self) -> i64 {
        self.descriptor.window_id
    }

    /// Returns the tab id.
    #[inline]
    #[must_use]
    pub fn tab_id(&self) -> i64 {
        self.descriptor.tab_id
    }

    /// Returns the frame id.
    #[inline]
    #[must_use]
    pub fn frame_id(&self) -> Option<i64> {
        self.descriptor.frame_id
    }

    /// Returns the document id.
    #[inline]
    #[must_use]
    pub fn document_id(&self) -> Option<&str> {
        self.descriptor.document_id.as_deref()
    }

    /// Returns the connection for connect-style requests.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Returns `true` if this request arrived over a connection.
    #[inline]
    #[must_use]
    pub fn is_connection(&self) -> bool {
        self.connection.is_some()
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("descriptor", &self.descriptor)
            .field("connection", &self.connection.as_ref().map(Connection::id))
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_background_descriptor() {
        let descriptor = SenderDescriptor::background();
        assert!(descriptor.is_background());
        assert_eq!(
            serde_json::to_value(&descriptor).expect("serialize"),
            json!({"windowId": -1, "tabId": -1})
        );
    }

    #[test]
    fn test_tab_descriptor_wire_shape() {
        let descriptor = SenderDescriptor::tab(3, 12, 0).with_document_id("doc-1");
        assert_eq!(
            serde_json::to_value(&descriptor).expect("serialize"),
            json!({"windowId": 3, "tabId": 12, "frameId": 0, "documentId": "doc-1"})
        );
    }

    #[test]
    fn test_sender_accessors() {
        let sender = Sender::new(SenderDescriptor::tab(1, 2, 5));
        assert_eq!(sender.window_id(), 1);
        assert_eq!(sender.tab_id(), 2);
        assert_eq!(sender.frame_id(), Some(5));
        assert_eq!(sender.document_id(), None);
        assert!(!sender.is_connection());
    }
}
