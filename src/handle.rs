//! Opaque handles to realm-local objects.
//!
//! Objects never cross a realm boundary. The owning realm keeps them in a
//! [`HandleRegistry`] and sends only the [`HandleId`]; the other realm
//! holds a [`RemoteHandle`] whose calls travel back over RPC.
//!
//! ```text
//! realm A                               realm B
//! registry.insert(obj) -> 7  ──id──►    RemoteHandle { id: 7 }
//! "<group>/invoke" {id, method, args} ◄──  handle.invoke("click", ..)
//! "<group>/release" {id}              ◄──  handle.release()
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::identifiers::HandleId;
use crate::server::Group;

// ============================================================================
// Constants
// ============================================================================

/// Action that invokes a method on a handle.
pub const INVOKE_ACTION: &str = "invoke";

/// Action that drops a handle.
pub const RELEASE_ACTION: &str = "release";

// ============================================================================
// HandleObject
// ============================================================================

/// An object reachable through a handle.
#[async_trait]
pub trait HandleObject: Send + Sync {
    /// Runs `method` with `args`.
    async fn invoke(&self, method: &str, args: Value) -> Result<Value>;
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct InvokeParams {
    id: HandleId,
    method: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReleaseParams {
    id: HandleId,
}

// ============================================================================
// HandleRegistry
// ============================================================================

/// Realm-local table of handle objects.
#[derive(Clone, Default)]
pub struct HandleRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    objects: RwLock<FxHashMap<HandleId, Arc<dyn HandleObject>>>,
}

impl HandleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `object` and returns its id.
    pub fn insert(&self, object: Arc<dyn HandleObject>) -> HandleId {
        let id = HandleId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner.objects.write().insert(id, object);
        debug!(%id, "Handle inserted");
        id
    }

    #[must_use]
    pub fn get(&self, id: HandleId) -> Option<Arc<dyn HandleObject>> {
        self.inner.objects.read().get(&id).cloned()
    }

    /// Drops the object behind `id`. Returns `false` if it was unknown.
    pub fn release(&self, id: HandleId) -> bool {
        let released = self.inner.objects.write().remove(&id).is_some();
        if released {
            debug!(%id, "Handle released");
        }
        released
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.objects.read().len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.objects.read().is_empty()
    }

    /// Invokes `method` on the object behind `id`.
    ///
    /// # Errors
    ///
    /// [`Error::Handler`] if `id` is unknown, otherwise whatever the object
    /// returns.
    pub async fn invoke(&self, id: HandleId, method: &str, args: Value) -> Result<Value> {
        let object = self
            .get(id)
            .ok_or_else(|| Error::handler(format!("no such handle {id}")))?;
        object.invoke(method, args).await
    }

    /// Registers `invoke` and `release` on `group`.
    pub fn mount(&self, group: &Group) {
        let registry = self.clone();
        group.on_typed(INVOKE_ACTION, move |params: InvokeParams, _sender| {
            let registry = registry.clone();
            async move { registry.invoke(params.id, &params.method, params.args).await }
        });

        let registry = self.clone();
        group.on_typed(RELEASE_ACTION, move |params: ReleaseParams, _sender| {
            let released = registry.release(params.id);
            async move { Ok::<_, Error>(released) }
        });
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// RemoteHandle
// ============================================================================

/// Proxy for an object owned by another realm.
///
/// `client` must be prefixed with the group the registry is mounted on.
#[derive(Debug, Clone)]
pub struct RemoteHandle {
    id: HandleId,
    client: Client,
}

impl RemoteHandle {
    #[must_use]
    pub fn new(id: HandleId, client: Client) -> Self {
        Self { id, client }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Invokes `method` on the remote object.
    ///
    /// # Errors
    ///
    /// [`Error::Remote`] if the handle is gone or the method fails.
    pub async fn invoke(&self, method: &str, args: Value) -> Result<Value> {
        let params = InvokeParams {
            id: self.id,
            method: method.to_string(),
            args,
        };
        self.client.call_typed(INVOKE_ACTION, &params).await
    }

    /// Releases the remote object. Returns `false` if it was already gone.
    ///
    /// # Errors
    ///
    /// Transport and remote errors from the call.
    pub async fn release(self) -> Result<bool> {
        self.client
            .call_typed(RELEASE_ACTION, &ReleaseParams { id: self.id })
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================
