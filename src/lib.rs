//! realmbus - Cross-realm messaging for browser-extension style runtimes.
//!
//! Isolated execution contexts (background worker, content script, page
//! script, offscreen document, sandbox, native host) cannot share memory.
//! This library gives them a uniform RPC and pub/sub layer over whatever
//! native channel joins two of them.
//!
//! # Architecture
//!
//! ```text
//! realm A                                                realm B
//! ┌──────────┐  {action, data}  ┌───────────┐  frame  ┌───────────┐  ┌──────────┐
//! │  Client  │─────────────────►│ Transport │────────►│ Transport │─►│  Server  │
//! │          │◄─────────────────│           │◄────────│           │◄─│  Group   │
//! └──────────┘ {code, message,  └───────────┘         └───────────┘  │  onion   │
//!                data}                                               └──────────┘
//! ```
//!
//! - A [`Transport`] adapts one native channel and correlates requests to
//!   responses by [`MessageId`]
//! - A [`Server`] strips its prefix and dispatches by exact action to
//!   handlers wrapped in group middleware
//! - A [`MessageQueue`] adds topic pub/sub with cross-realm fan-out
//! - A [`Connection`] is a long-lived bidirectional pipe opened by
//!   `connect`
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use realmbus::{Client, MemoryTransport, Realm, RealmKind, Result, Server};
//! use serde_json::{Value, json};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (background, content) = MemoryTransport::pair();
//!
//!     let server = Server::new(Realm::with_defaults(RealmKind::Background), "api")
//!         .with_transport(Arc::new(background));
//!     server.group("user").on_sync("info", |_req| Ok(json!({"name": "demo"})));
//!     server.start();
//!
//!     let client = Client::new(Realm::with_defaults(RealmKind::Content), Arc::new(content))
//!         .with_prefix("api");
//!     let info = client.call("user/info", Value::Null).await?;
//!     println!("{info}");
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Request/response [`Client`] |
//! | [`config`] | [`Realm`] context and [`RealmConfig`] |
//! | [`connection`] | Persistent [`Connection`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`handle`] | Handle registry for realm-local objects |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`middleware`] | Onion composition |
//! | [`mq`] | Topic pub/sub |
//! | [`protocol`] | Envelope, response and frame types |
//! | [`server`] | Action dispatch and groups |
//! | [`transport`] | Transport trait and concrete channels |

// ============================================================================
// Modules
// ============================================================================

/// Request/response client.
pub mod client;

/// Realm context and configuration.
pub mod config;

/// Persistent bidirectional connections.
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Handle registry for objects that never leave their realm.
pub mod handle;

/// Type-safe identifiers.
pub mod identifiers;

/// Onion middleware composition.
pub mod middleware;

/// Topic-based publish/subscribe.
pub mod mq;

/// Wire types.
pub mod protocol;

/// Action dispatch.
///
/// Handlers are registered on a [`Server`] or one of its [`Group`]s before
/// [`Server::start`].
pub mod server;

/// Transport layer.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Core types
pub use client::Client;
pub use config::{ErrorPolicy, Realm, RealmConfig, RealmKind, RequestOptions};
pub use connection::Connection;
pub use error::{Error, Result};
pub use server::{Group, Request, Server};

// Pub/sub
pub use mq::{MessageQueue, Subscription, TopicEvent, TopicGroup};

// Handles
pub use handle::{HandleObject, HandleRegistry, RemoteHandle};

// Wire types
pub use protocol::{Envelope, Frame, Response, Sender, SenderDescriptor};

// Identifier types
pub use identifiers::{HandleId, MessageId, SubscriptionId};

// Transports
pub use transport::{
    EventTransport, MemoryTransport, PendingServer, RuntimeTransport, Transport,
    WebSocketTransport, WindowTransport, WorkerTransport,
};
