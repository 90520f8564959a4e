//! Envelope and Response message types.
//!
//! Defines the request envelope carried by every transport and the
//! response envelope sent back by servers.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Response code for success.
pub const CODE_OK: i64 = 0;

/// Response code for handler errors and routing misses.
pub const CODE_ERROR: i64 = -1;

// ============================================================================
// Envelope
// ============================================================================

/// A routed message.
///
/// # Format
///
/// ```json
/// {
///   "action": "user/info",
///   "data": { ... }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// `/`-delimited routing path.
    pub action: String,

    /// Payload.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Creates a new envelope.
    #[inline]
    #[must_use]
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self {
            action: action.into(),
            data,
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// A response from a server.
///
/// # Format
///
/// Success:
/// ```json
/// { "code": 0, "data": { ... } }
/// ```
///
/// Error:
/// ```json
/// { "code": -1, "message": "no such api user/missing" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// `0` on success, anything else is an error.
    pub code: i64,

    /// Result data (if success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Error message (if error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    /// Creates a success response.
    #[inline]
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            code: CODE_OK,
            data: Some(data),
            message: None,
        }
    }

    /// Creates an error response with code `-1`.
    #[inline]
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: CODE_ERROR,
            data: None,
            message: Some(message.into()),
        }
    }

    /// Converts a handler outcome into a response.
    #[must_use]
    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::error(e.message()),
        }
    }

    /// Returns `true` if this is a success response.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == CODE_OK
    }

    /// Extracts the data, returning error if the code is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] carrying `message` if `code != 0`.
    pub fn into_result(self) -> Result<Value> {
        if self.is_success() {
            return Ok(self.data.unwrap_or(Value::Null));
        }

        let message = self
            .message
            .unwrap_or_else(|| format!("request failed with code {}", self.code));
        Err(Error::remote(self.code, message))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Returns `true` for values a script would treat as false.
#[must_use]
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f == 0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
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
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new("user/info", json!({"id": 1}));
        let json = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(json, json!({"action": "user/info", "data": {"id": 1}}));
    }

    #[test]
    fn test_envelope_missing_data_is_null() {
        let envelope: Envelope = serde_json::from_str(r#"{"action": "ping"}"#).expect("parse");
        assert_eq!(envelope.data, Value::Null);
    }

    #[test]
    fn test_success_response() {
        let response: Response =
            serde_json::from_str(r#"{"code": 0, "data": "ok"}"#).expect("parse");
        assert!(response.is_success());
        assert_eq!(response.into_result().expect("ok"), json!("ok"));
    }

    #[test]
    fn test_error_response() {
        let response: Response =
            serde_json::from_str(r#"{"code": -1, "message": "boom"}"#).expect("parse");
        assert!(!response.is_success());

        let err = response.into_result().unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(matches!(err, Error::Remote { code: -1, .. }));
    }

    #[test]
    fn test_error_response_omits_data() {
        let json = serde_json::to_value(Response::error("nope")).expect("serialize");
        assert_eq!(json, json!({"code": -1, "message": "nope"}));
    }

    #[test]
    fn test_from_result_uses_bare_message() {
        let response = Response::from_result(Err(Error::handler("boom")));
        assert_eq!(response.message.as_deref(), Some("boom"));
        assert_eq!(response.code, CODE_ERROR);
    }

    #[test]
    fn test_is_falsy() {
        assert!(is_falsy(&Value::Null));
        assert!(is_falsy(&json!(false)));
        assert!(is_falsy(&json!(0)));
        assert!(is_falsy(&json!(0.0)));
        assert!(is_falsy(&json!("")));
        assert!(!is_falsy(&json!("x")));
        assert!(!is_falsy(&json!(1)));
        assert!(!is_falsy(&json!([])));
        assert!(!is_falsy(&json!({})));
    }
}
