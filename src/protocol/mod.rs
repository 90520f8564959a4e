//! Wire message types.
//!
//! This module defines the shapes that cross realm boundaries.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Envelope` | caller → callee | Routed request `{action, data}` |
//! | `Response` | callee → caller | `{code, data?, message?}`, `code == 0` is success |
//! | `Frame` | both | Multiplexing wrapper with `type` and `messageId` |
//!
//! # Action Naming
//!
//! Actions and topics are `/`-delimited and case-sensitive, built by
//! concatenating group prefixes with a leaf name:
//!
//! - `user/info`
//! - `user/profile/get`
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `envelope` | Envelope and Response types |
//! | `frame` | Multiplexing frames |
//! | `sender` | Sender descriptors |

// ============================================================================
// Submodules
// ============================================================================

/// Envelope and Response message types.
pub mod envelope;

/// Multiplexing frames.
pub mod frame;

/// Sender descriptors.
pub mod sender;

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::{CODE_ERROR, CODE_OK, Envelope, Response, is_falsy};
pub use frame::Frame;
pub use sender::{NO_TAB, Sender, SenderDescriptor};
