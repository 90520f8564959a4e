//! Topic namespaces.
//!
//! Same derivation rules as server groups: names are normalized to end in
//! `/`, children copy the parent's middleware and append to the copy.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::middleware::{GroupPath, compose, handler_fn};

use super::{MessageQueue, Subscription, TopicEvent, TopicMiddleware};

// ============================================================================
// TopicGroup
// ============================================================================

/// A topic prefix plus inherited subscriber middleware.
#[derive(Clone)]
pub struct TopicGroup {
    queue: MessageQueue,
    path: GroupPath<TopicMiddleware>,
}

impl TopicGroup {
    pub(crate) fn root(queue: MessageQueue, name: &str) -> Self {
        Self {
            queue,
            path: GroupPath::root(name),
        }
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.name()
    }

    #[inline]
    #[must_use]
    pub fn middleware_count(&self) -> usize {
        self.path.middlewares().len()
    }

    /// Returns the full topic key for `topic`.
    #[inline]
    #[must_use]
    pub fn topic(&self, topic: &str) -> String {
        self.path.key(topic)
    }

    #[must_use]
    pub fn group(&self, name: &str) -> Self {
        Self {
            queue: self.queue.clone(),
            path: self.path.child(name, None),
        }
    }

    #[must_use]
    pub fn group_with(&self, name: &str, middleware: TopicMiddleware) -> Self {
        Self {
            queue: self.queue.clone(),
            path: self.path.child(name, Some(middleware)),
        }
    }

    #[must_use]
    pub fn use_middleware(&self, middleware: TopicMiddleware) -> Self {
        Self {
            queue: self.queue.clone(),
            path: self.path.with(middleware),
        }
    }

    /// Subscribes `callback` to `self.name() + topic`, behind this group's
    /// middleware.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Subscription
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let handler = handler_fn(move |event: TopicEvent| {
            let callback = Arc::clone(&callback);
            async move { callback(event.message) }
        });

        self.queue.add_subscriber(
            self.topic(topic),
            compose(self.path.middlewares(), handler),
        )
    }

    /// Subscribes with messages decoded into `T`.
    pub fn subscribe_typed<T, F>(&self, topic: &str, callback: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let key = self.topic(topic);
        let label = key.clone();
        let callback = Arc::new(callback);
        let handler = handler_fn(move |event: TopicEvent| {
            let callback = Arc::clone(&callback);
            let label = label.clone();
            async move {
                match serde_json::from_value::<T>(event.message) {
                    Ok(message) => callback(message),
                    Err(e) => warn!(topic = %label, error = %e, "Dropping undecodable message"),
                }
            }
        });

        self.queue
            .add_subscriber(key, compose(self.path.middlewares(), handler))
    }

    /// Publishes under this group's prefix.
    ///
    /// # Errors
    ///
    /// See [`MessageQueue::publish`].
    pub async fn publish(&self, topic: &str, message: Value) -> Result<()> {
        self.queue.publish(&self.topic(topic), message).await
    }

    /// Emits locally under this group's prefix.
    pub async fn emit(&self, topic: &str, message: Value) {
        self.queue.emit(&self.topic(topic), message).await;
    }
}

impl fmt::Debug for TopicGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicGroup")
            .field("name", &self.path.name())
            .field("middlewares", &self.middleware_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
