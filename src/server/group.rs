//! Hierarchical namespaces with inherited middleware.
//!
//! A [`Group`] is a name prefix plus an ordered middleware list. Deriving a
//! child copies the parent's list and appends to the copy; the parent never
//! changes.
//!
//! ```text
//! server.group("user")                 "user/"    []
//!       .group_with("admin", auth)     "user/admin/" [auth]
//!       .use_middleware(audit)         "user/admin/" [auth, audit]
//!       .on("ban", handler)            registers "user/admin/ban"
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::error;

use crate::error::{Error, Result};
use crate::middleware::{GroupPath, compose, handler_fn};
use crate::protocol::Sender;

use super::{ApiHandler, ApiMiddleware, Request, Server};

// ============================================================================
// Group
// ============================================================================

/// A namespace on a [`Server`].
#[derive(Clone)]
pub struct Group {
    server: Server,
    path: GroupPath<ApiMiddleware>,
}

impl Group {
    pub(crate) fn root(server: Server, name: &str) -> Self {
        Self {
            server,
            path: GroupPath::root(name),
        }
    }

    /// Returns the normalized name, ending in `/` unless empty.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.name()
    }

    /// Returns the number of middleware layers this group applies.
    #[inline]
    #[must_use]
    pub fn middleware_count(&self) -> usize {
        self.path.middlewares().len()
    }

    /// Derives a child group named `self.name() + name`.
    #[must_use]
    pub fn group(&self, name: &str) -> Self {
        Self {
            server: self.server.clone(),
            path: self.path.child(name, None),
        }
    }

    /// Derives a child group with one extra middleware.
    #[must_use]
    pub fn group_with(&self, name: &str, middleware: ApiMiddleware) -> Self {
        Self {
            server: self.server.clone(),
            path: self.path.child(name, Some(middleware)),
        }
    }

    /// Same prefix, one extra middleware.
    #[must_use]
    pub fn use_middleware(&self, middleware: ApiMiddleware) -> Self {
        Self {
            server: self.server.clone(),
            path: self.path.with(middleware),
        }
    }

    /// Registers an async handler for `name` under this group.
    ///
    /// After [`Server::start`] the registration is logged and ignored.
    pub fn on<F, Fut>(&self, name: &str, handler: F) -> &Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, handler_fn(handler))
    }

    /// Registers a synchronous handler.
    pub fn on_sync<F>(&self, name: &str, handler: F) -> &Self
    where
        F: Fn(Request) -> Result<Value> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(
            name,
            handler_fn(move |request| {
                let handler = Arc::clone(&handler);
                async move { handler(request) }
            }),
        )
    }

    /// Registers a handler with typed params and result.
    ///
    /// Params that fail to deserialize become an error response.
    pub fn on_typed<P, R, F, Fut>(&self, name: &str, handler: F) -> &Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, Sender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(
            name,
            handler_fn(move |request: Request| {
                let handler = Arc::clone(&handler);
                async move {
                    let params: P = serde_json::from_value(request.params)?;
                    let result = handler(params, request.sender).await?;
                    Ok::<Value, Error>(serde_json::to_value(result)?)
                }
            }),
        )
    }

    fn register(&self, name: &str, handler: ApiHandler) -> &Self {
        let key = self.path.key(name);
        let handler = compose(self.path.middlewares(), handler);

        if let Err(e) = self.server.register(key, handler) {
            error!(error = %e, "Handler registration rejected");
        }
        self
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.path.name())
            .field("middlewares", &self.middleware_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
