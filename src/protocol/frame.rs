//! Multiplexing frames.
//!
//! Every frame-based transport carries exactly one [`Frame`] per physical
//! message. The `type` tag selects the variant:
//!
//! | Type | Direction | Purpose |
//! |------|-----------|---------|
//! | `sendMessage` | caller → callee | Request (with id) or fire-and-forget (without) |
//! | `respMessage` | callee → caller | Response correlated by id |
//! | `connect` | opener → acceptor | Open a virtual connection |
//! | `connectMessage` | both | Payload on an open connection |
//! | `disconnect` | both | Close a virtual connection |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifiers::MessageId;

use super::{Envelope, Response};

// ============================================================================
// Frame
// ============================================================================

/// One physical message on a multiplexed channel.
///
/// # Format
///
/// ```json
/// {
///   "type": "sendMessage",
///   "messageId": "uuid",
///   "data": { "action": "user/info", "data": null }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Frame {
    /// Routed request. Without an id no response is expected.
    SendMessage {
        /// Correlation id, absent for fire-and-forget.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        /// The request.
        data: Envelope,
    },

    /// Response to a `sendMessage` with the same id.
    RespMessage {
        /// Correlation id of the request.
        message_id: MessageId,
        /// The response.
        data: Response,
    },

    /// Opens a virtual connection.
    Connect {
        /// Id naming the new connection.
        message_id: MessageId,
        /// The routed open request.
        data: Envelope,
    },

    /// Closes a virtual connection.
    Disconnect {
        /// Connection id.
        message_id: MessageId,
    },

    /// Payload on an open connection.
    ConnectMessage {
        /// Connection id.
        message_id: MessageId,
        /// Payload.
        #[serde(default)]
        data: Value,
    },
}

impl Frame {
    /// Returns the frame's correlation id, if any.
    #[must_use]
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::SendMessage { message_id, .. } => *message_id,
            Self::RespMessage { message_id, .. }
            | Self::Connect { message_id, .. }
            | Self::Disconnect { message_id }
            | Self::ConnectMessage { message_id, .. } => Some(*message_id),
        }
    }

    /// Returns the wire name of the frame type.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "sendMessage",
            Self::RespMessage { .. } => "respMessage",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::ConnectMessage { .. } => "connectMessage",
        }
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
    fn test_send_message_wire_shape() {
        let id = MessageId::generate();
        let frame = Frame::SendMessage {
            message_id: Some(id),
            data: Envelope::new("user/info", Value::Null),
        };

        let json = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(
            json,
            json!({
                "type": "sendMessage",
                "messageId": id.to_string(),
                "data": {"action": "user/info", "data": null}
            })
        );
    }

    #[test]
    fn test_fire_and_forget_omits_id() {
        let frame = Frame::SendMessage {
            message_id: None,
            data: Envelope::new("messageQueue", Value::Null),
        };

        let json = serde_json::to_value(&frame).expect("serialize");
        assert!(json.get("messageId").is_none());
        assert_eq!(frame.message_id(), None);
    }

    #[test]
    fn test_parse_disconnect() {
        let id = MessageId::generate();
        let text = format!(r#"{{"type": "disconnect", "messageId": "{id}"}}"#);
        let frame: Frame = serde_json::from_str(&text).expect("parse");
        assert_eq!(frame, Frame::Disconnect { message_id: id });
        assert_eq!(frame.kind(), "disconnect");
    }

    #[test]
    fn test_parse_connect_message_without_data() {
        let id = MessageId::generate();
        let text = format!(r#"{{"type": "connectMessage", "messageId": "{id}"}}"#);
        let frame: Frame = serde_json::from_str(&text).expect("parse");
        assert!(matches!(frame, Frame::ConnectMessage { data: Value::Null, .. }));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = serde_json::from_str::<Frame>(r#"{"type": "bogus"}"#);
        assert!(result.is_err());
    }
}
