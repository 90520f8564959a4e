//! Topic-based publish/subscribe.
//!
//! A [`MessageQueue`] is a realm-local emitter keyed by topic, plus a
//! transport for fan-out to the other realm:
//!
//! | Call | Local subscribers | Other realm |
//! |------|-------------------|-------------|
//! | [`emit`](MessageQueue::emit) | yes | no |
//! | [`publish`](MessageQueue::publish) | yes | yes, once |
//!
//! Remote delivery travels as a fire-and-forget `"messageQueue"` action
//! carrying a [`TopicEvent`]. The receiving queue emits it locally and
//! never re-publishes it.

// ============================================================================
// Submodules
// ============================================================================

/// Topic namespaces with inherited middleware.
pub mod group;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::Realm;
use crate::error::Result;
use crate::identifiers::SubscriptionId;
use crate::middleware::{Handler, Middleware};
use crate::protocol::Envelope;
use crate::transport::Transport;

// ============================================================================
// Re-exports
// ============================================================================

pub use group::TopicGroup;

// ============================================================================
// Constants
// ============================================================================

/// Action used for cross-realm topic delivery.
pub const MESSAGE_QUEUE_ACTION: &str = "messageQueue";

// ============================================================================
// Types
// ============================================================================

/// One published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicEvent {
    /// Full topic key, group prefixes included.
    pub topic: String,
    /// Payload.
    #[serde(default)]
    pub message: Value,
}

/// Boxed subscriber.
pub type TopicHandler = Handler<TopicEvent, ()>;

/// Boxed subscriber middleware.
pub type TopicMiddleware = Middleware<TopicEvent, ()>;

type SubscriberMap = FxHashMap<String, Vec<(SubscriptionId, TopicHandler)>>;

// ============================================================================
// MessageQueue
// ============================================================================

/// Pub/sub bus for one realm.
///
/// Cheap to clone; clones share subscribers.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<MqInner>,
}

struct MqInner {
    realm: Realm,
    transport: Option<Arc<dyn Transport>>,
    subscribers: RwLock<SubscriberMap>,
}

impl MessageQueue {
    /// Creates a queue that fans out over `transport` and emits what the
    /// other realm publishes.
    #[must_use]
    pub fn new(realm: Realm, transport: Arc<dyn Transport>) -> Self {
        let inner = Arc::new(MqInner {
            realm,
            transport: Some(Arc::clone(&transport)),
            subscribers: RwLock::new(SubscriberMap::default()),
        });

        // One pump per queue keeps remote events in arrival order
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(Arc::downgrade(&inner), remote_rx));

        transport.on_message(Arc::new(move |envelope: Envelope, _sender, _responder| {
            if envelope.action == MESSAGE_QUEUE_ACTION {
                on_remote_event(&remote_tx, envelope);
            }
        }));

        debug!(realm = ?inner.realm.kind(), transport = transport.kind(), "Message queue attached");
        Self { inner }
    }

    /// Creates a queue with no transport. `publish` behaves like `emit`.
    #[must_use]
    pub fn local(realm: Realm) -> Self {
        Self {
            inner: Arc::new(MqInner {
                realm,
                transport: None,
                subscribers: RwLock::new(SubscriberMap::default()),
            }),
        }
    }

    /// Returns the realm this queue belongs to, for subscribers that need
    /// its kind or config.
    #[inline]
    #[must_use]
    pub fn realm(&self) -> &Realm {
        &self.inner.realm
    }

    /// Returns the number of subscribers to `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Returns a topic group rooted at `name`.
    #[must_use]
    pub fn group(&self, name: &str) -> TopicGroup {
        TopicGroup::root(self.clone(), name)
    }

    /// Returns a topic group rooted at `name` with one middleware.
    #[must_use]
    pub fn group_with(&self, name: &str, middleware: TopicMiddleware) -> TopicGroup {
        TopicGroup::root(self.clone(), "").group_with(name, middleware)
    }

    /// Subscribes `callback` to `topic`.
    ///
    /// The subscription stays active until
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Subscription
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.group("").subscribe(topic, callback)
    }

    /// Subscribes with messages decoded into `T`.
    ///
    /// Messages that fail to decode are logged and skipped.
    pub fn subscribe_typed<T, F>(&self, topic: &str, callback: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.group("").subscribe_typed(topic, callback)
    }

    /// Delivers `message` to local subscribers of `topic` only.
    pub async fn emit(&self, topic: &str, message: Value) {
        self.inner
            .emit(TopicEvent {
                topic: topic.to_string(),
                message,
            })
            .await;
    }

    /// Delivers `message` locally and to the other realm.
    ///
    /// Local subscribers always run, even when the transport fails.
    ///
    /// # Errors
    ///
    /// Returns the transport's native error if the fan-out fails.
    pub async fn publish(&self, topic: &str, message: Value) -> Result<()> {
        let event = TopicEvent {
            topic: topic.to_string(),
            message,
        };

        let sent = match &self.inner.transport {
            Some(transport) => serde_json::to_value(&event)
                .map_err(Into::into)
                .and_then(|data| transport.post_message(Envelope::new(MESSAGE_QUEUE_ACTION, data))),
            None => Ok(()),
        };
        if let Err(e) = &sent {
            warn!(realm = ?self.inner.realm.kind(), topic = %event.topic, error = %e, "Topic fan-out failed");
        }

        self.inner.emit(event).await;
        sent
    }

    pub(crate) fn add_subscriber(&self, topic: String, handler: TopicHandler) -> Subscription {
        let id = SubscriptionId::next();
        self.inner
            .subscribers
            .write()
            .entry(topic.clone())
            .or_default()
            .push((id, handler));

        trace!(topic = %topic, %id, "Subscribed");
        Subscription {
            queue: Arc::downgrade(&self.inner),
            topic,
            id,
        }
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("topics", &self.inner.subscribers.read().len())
            .field("transport", &self.inner.transport.as_ref().map(|t| t.kind()))
            .finish()
    }
}

impl MqInner {
    /// Runs every subscriber of the event's topic, one after another.
    async fn emit(&self, event: TopicEvent) {
        let handlers: Vec<TopicHandler> = self
            .subscribers
            .read()
            .get(&event.topic)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            trace!(topic = %event.topic, "No subscribers");
            return;
        }
        for handler in handlers {
            handler(event.clone()).await;
        }
    }
}

fn on_remote_event(remote_tx: &mpsc::UnboundedSender<TopicEvent>, envelope: Envelope) {
    let event = match serde_json::from_value::<TopicEvent>(envelope.data) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Malformed topic event");
            return;
        }
    };

    debug!(topic = %event.topic, "Remote topic event");
    if remote_tx.send(event).is_err() {
        trace!("Topic pump gone, remote event dropped");
    }
}

/// Emits remote events one at a time until the queue or its transport goes
/// away.
async fn pump(inner: Weak<MqInner>, mut remote_rx: mpsc::UnboundedReceiver<TopicEvent>) {
    while let Some(event) = remote_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.emit(event).await;
    }
    trace!("Topic pump terminated");
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle to one subscriber.
#[derive(Debug)]
pub struct Subscription {
    queue: Weak<MqInner>,
    topic: String,
    id: SubscriptionId,
}

impl Subscription {
    #[inline]
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Removes the subscriber.
    pub fn unsubscribe(self) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let mut subscribers = queue.subscribers.write();
        if let Some(subs) = subscribers.get_mut(&self.topic) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                subscribers.remove(&self.topic);
            }
        }
        trace!(topic = %self.topic, id = %self.id, "Unsubscribed");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use crate::config::{ErrorPolicy, RealmConfig, RealmKind};
    use crate::transport::MemoryTransport;

    fn realm(kind: RealmKind) -> Realm {
        Realm::with_defaults(kind)
    }

    fn pair() -> (MessageQueue, MessageQueue, MemoryTransport) {
        let (background, content) = MemoryTransport::pair();
        let sender = content.clone();
        (
            MessageQueue::new(realm(RealmKind::Background), Arc::new(background)),
            MessageQueue::new(realm(RealmKind::Content), Arc::new(content)),
            sender,
        )
    }

    fn collect(queue: &MessageQueue, topic: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        queue.subscribe(topic, move |message| {
            let _ = tx.send(message);
        });
        rx
    }

    async fn quiet(rx: &mut mpsc::UnboundedReceiver<Value>) -> bool {
        tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_emit_is_local_only() {
        let (background, content, content_transport) = pair();
        let mut remote = collect(&background, "script/updated");
        let mut local = collect(&content, "script/updated");

        content.emit("script/updated", json!(1)).await;

        assert_eq!(local.recv().await, Some(json!(1)));
        assert!(quiet(&mut remote).await);
        assert_eq!(content_transport.frames_sent(), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_both_realms() {
        let (background, content, content_transport) = pair();
        let mut remote = collect(&background, "script/updated");
        let mut local = collect(&content, "script/updated");

        content
            .publish("script/updated", json!({"id": 3}))
            .await
            .expect("publish");

        assert_eq!(local.recv().await, Some(json!({"id": 3})));
        assert_eq!(remote.recv().await, Some(json!({"id": 3})));
        assert_eq!(content_transport.frames_sent(), 1);

        // Delivered exactly once on each side
        assert!(quiet(&mut local).await);
        assert!(quiet(&mut remote).await);
    }

    #[tokio::test]
    async fn test_publish_emits_locally_when_fanout_fails() {
        let (_background, content) = MemoryTransport::pair();
        let queue = MessageQueue::new(realm(RealmKind::Content), Arc::new(content.clone()));
        let mut local = collect(&queue, "t");
        content.close();

        let err = queue.publish("t", json!("still here")).await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(local.recv().await, Some(json!("still here")));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let queue = MessageQueue::local(realm(RealmKind::Background));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = queue.subscribe("t", move |message| sink.lock().push(message));

        queue.publish("t", json!(1)).await.expect("local publish");
        assert_eq!(queue.subscriber_count("t"), 1);

        subscription.unsubscribe();
        assert_eq!(queue.subscriber_count("t"), 0);

        queue.publish("t", json!(2)).await.expect("local publish");
        assert_eq!(*seen.lock(), vec![json!(1)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remote_events_keep_publish_order() {
        const COUNT: u64 = 2000;

        let (background, content, _content_transport) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        background.subscribe("t", move |message| {
            let _ = tx.send(message);
        });

        for n in 0..COUNT {
            content.publish("t", json!(n)).await.expect("publish");
        }

        let mut received = Vec::new();
        while received.len() < COUNT as usize {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event in time")
                .expect("subscriber alive");
            received.push(message.as_u64().expect("number"));
        }
        assert_eq!(received, (0..COUNT).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_subscribe_typed_skips_malformed() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Tick {
            n: u32,
        }

        let queue = MessageQueue::local(realm(RealmKind::Background));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        queue.subscribe_typed("tick", move |tick: Tick| sink.lock().push(tick.n));

        queue.emit("tick", json!({"n": 1})).await;
        queue.emit("tick", json!("garbage")).await;
        queue.emit("tick", json!({"n": 2})).await;

        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_realm_config_is_kept() {
        let config = RealmConfig::new().with_error_policy(ErrorPolicy::Surface);
        let queue = MessageQueue::local(Realm::new(RealmKind::Offscreen, config.clone()));
        assert_eq!(queue.realm().config(), &config);
    }
}
