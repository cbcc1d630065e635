//! Pub/sub message channel multiplexed over one subscriber connection.
//!
//! Many `MessageQueue` instances (across topics and primitives) share the
//! single subscriber connection managed by [`PubSubRegistry`]. A publish
//! issued before the store confirms the subscription is buffered per
//! instance and flushed in FIFO order on confirmation, so no message is lost
//! to the subscription handshake.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use alder_store::CoordinationStore;

use crate::error::CoordinationError;
use crate::registry::Listener;
use crate::registry::MqShared;
use crate::registry::PubSubRegistry;

/// Handle identifying a registered listener, for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A message channel bound to one topic.
pub struct MessageQueue<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    registry: Arc<PubSubRegistry<S>>,
    shared: Arc<MqShared>,
    instance_id: u64,
    next_listener: AtomicU64,
}

impl<S: CoordinationStore + ?Sized + 'static> MessageQueue<S> {
    /// Bind a new instance to `topic`, subscribing if this is the first
    /// instance for that topic on this connection.
    pub(crate) async fn new(
        store: Arc<S>,
        registry: Arc<PubSubRegistry<S>>,
        topic: String,
    ) -> Result<Self, CoordinationError> {
        let shared = MqShared::new(topic);
        let instance_id = registry.register(&shared).await?;
        Ok(Self {
            store,
            registry,
            shared,
            instance_id,
            next_listener: AtomicU64::new(0),
        })
    }

    /// The topic this instance is bound to.
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    /// Register a listener for inbound messages on this topic.
    pub fn add_listener(&self, listener: impl Fn(&str) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(listener) as Listener));
        ListenerId(id)
    }

    /// Remove a listener. Returns true iff it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(i, _)| *i != id.0);
        listeners.len() < before
    }

    /// Publish a message on this topic.
    ///
    /// Returns true when the message was sent to the store, false when it
    /// was buffered locally because the subscription is not confirmed yet;
    /// buffered messages are flushed automatically on confirmation.
    pub async fn publish(&self, message: &str) -> Result<bool, CoordinationError> {
        if self.shared.ready.load(Ordering::SeqCst) {
            self.store.publish(&self.shared.topic, message).await?;
            Ok(true)
        } else {
            self.shared
                .pending
                .lock()
                .unwrap()
                .push_back(message.to_string());
            Ok(false)
        }
    }

    /// Unregister this instance; the last instance of a topic releases the
    /// topic's subscription.
    pub async fn close(self) -> Result<(), CoordinationError> {
        self.registry
            .unregister(&self.shared.topic, self.instance_id)
            .await
    }

    /// Whether the store reports at least one subscriber on `topic`.
    pub async fn has(store: &S, topic: &str) -> Result<bool, CoordinationError> {
        Ok(store.subscriber_count(topic).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use alder_store::MemoryStore;

    use super::*;

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let store = MemoryStore::new();
        let registry = Arc::new(PubSubRegistry::new(store.clone()));
        let mq = MessageQueue::new(store.clone(), registry, "greetings".to_string())
            .await
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&received);
        mq.add_listener(move |msg| sink.lock().unwrap().push(msg.to_string()));

        // The ack is processed asynchronously by the reader; either path
        // (buffered or direct) must deliver.
        mq.publish("Hello, World!").await.unwrap();

        wait_for(|| !received.lock().unwrap().is_empty()).await;
        assert_eq!(received.lock().unwrap().as_slice(), ["Hello, World!"]);
        assert!(MessageQueue::has(&*store, "greetings").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_before_ready_is_buffered_then_flushed() {
        let store = MemoryStore::new();
        store.hold_subscribe_acks();

        let registry = Arc::new(PubSubRegistry::new(store.clone()));
        let mq = MessageQueue::new(store.clone(), registry, "slow".to_string())
            .await
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&received);
        mq.add_listener(move |msg| sink.lock().unwrap().push(msg.to_string()));

        // Subscription unconfirmed: both messages buffer locally.
        assert!(!mq.publish("first").await.unwrap());
        assert!(!mq.publish("second").await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(received.lock().unwrap().is_empty());

        store.release_subscribe_acks();
        wait_for(|| received.lock().unwrap().len() == 2).await;
        assert_eq!(received.lock().unwrap().as_slice(), ["first", "second"]);
    }

    #[tokio::test]
    async fn test_faulty_listener_does_not_block_others() {
        let store = MemoryStore::new();
        let registry = Arc::new(PubSubRegistry::new(store.clone()));
        let mq = MessageQueue::new(store.clone(), registry, "mixed".to_string())
            .await
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&received);
        mq.add_listener(|_msg| panic!("bad listener"));
        mq.add_listener(move |msg| sink.lock().unwrap().push(msg.to_string()));

        mq.publish("survives").await.unwrap();
        wait_for(|| !received.lock().unwrap().is_empty()).await;
        assert_eq!(received.lock().unwrap().as_slice(), ["survives"]);
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let store = MemoryStore::new();
        let registry = Arc::new(PubSubRegistry::new(store.clone()));
        let mq = MessageQueue::new(store.clone(), registry, "t".to_string())
            .await
            .unwrap();

        let id = mq.add_listener(|_| {});
        assert!(mq.remove_listener(id));
        assert!(!mq.remove_listener(id));
    }

    #[tokio::test]
    async fn test_closing_last_instance_releases_topic() {
        let store = MemoryStore::new();
        let registry = Arc::new(PubSubRegistry::new(store.clone()));
        let mq = MessageQueue::new(store.clone(), Arc::clone(&registry), "gone".to_string())
            .await
            .unwrap();

        for _ in 0..200 {
            if store.subscriber_count("gone").await.unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(MessageQueue::has(&*store, "gone").await.unwrap());

        mq.close().await.unwrap();
        assert!(!MessageQueue::has(&*store, "gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_instance_releases_topic_on_traffic() {
        let store = MemoryStore::new();
        let registry = Arc::new(PubSubRegistry::new(store.clone()));
        let mq = MessageQueue::new(store.clone(), Arc::clone(&registry), "leaky".to_string())
            .await
            .unwrap();

        for _ in 0..200 {
            if store.subscriber_count("leaky").await.unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(MessageQueue::has(&*store, "leaky").await.unwrap());

        // Dropped without close(): the next delivery on the topic prunes the
        // dead registration and releases the subscription.
        drop(mq);
        store.publish("leaky", "ping").await.unwrap();

        for _ in 0..200 {
            if store.subscriber_count("leaky").await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!MessageQueue::has(&*store, "leaky").await.unwrap());
    }
}
