//! Entry point tying one store connection to its coordination primitives.

use std::sync::Arc;

use alder_store::CoordinationStore;

use crate::error::CoordinationError;
use crate::lock::Lock;
use crate::message_queue::MessageQueue;
use crate::queue::Queue;
use crate::queue::QueueRuntime;
use crate::registry::PubSubRegistry;
use crate::throttle::Throttle;
use crate::throttle_queue::ThrottleQueue;
use crate::throttle_queue::ThrottleQueueConfig;
use crate::types::TokenSource;

/// One backing connection plus the per-connection state every primitive
/// shares: the pub/sub registry, the queue runtime and the fencing token
/// source.
///
/// Cheap to share behind an `Arc`; build each primitive on demand.
pub struct Coordinator<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    registry: Arc<PubSubRegistry<S>>,
    queues: Arc<QueueRuntime<S>>,
    tokens: Arc<TokenSource>,
}

impl<S: CoordinationStore + ?Sized + 'static> Coordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        let registry = Arc::new(PubSubRegistry::new(Arc::clone(&store)));
        let tokens = Arc::new(TokenSource::new());
        let queues = QueueRuntime::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&tokens),
        );
        Self {
            store,
            registry,
            queues,
            tokens,
        }
    }

    /// The backing store connection.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// A mutual-exclusion lock on `key`.
    pub fn lock(&self, key: &str) -> Lock<S> {
        Lock::new(Arc::clone(&self.store), key, Arc::clone(&self.tokens))
    }

    /// A broadcast channel on `topic`.
    pub async fn message_queue(&self, topic: &str) -> Result<MessageQueue<S>, CoordinationError> {
        MessageQueue::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            topic.to_string(),
        )
        .await
    }

    /// A serialized task queue on `key`.
    pub fn queue(&self, key: &str) -> Queue<S> {
        Queue::new(Arc::clone(&self.queues), key.to_string())
    }

    /// A single-flight throttle on `key`.
    pub async fn throttle(&self, key: &str) -> Result<Throttle<S>, CoordinationError> {
        Throttle::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.tokens),
            key,
        )
        .await
    }

    /// A deduplicated scheduler on `key` with default tuning.
    pub fn throttle_queue(&self, key: &str) -> ThrottleQueue<S> {
        self.throttle_queue_with(key, ThrottleQueueConfig::default())
    }

    /// A deduplicated scheduler on `key` with explicit tuning.
    pub fn throttle_queue_with(&self, key: &str, config: ThrottleQueueConfig) -> ThrottleQueue<S> {
        ThrottleQueue::new(Arc::clone(&self.store), Arc::clone(&self.tokens), key, config)
    }

    /// Tear down: stop the subscriber side first so no event arrives on a
    /// closing connection, then close the backing connection.
    pub async fn quit(&self) -> Result<(), CoordinationError> {
        self.registry.shutdown().await;
        self.store.quit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alder_store::MemoryStore;
    use alder_store::StoreError;

    use super::*;

    #[tokio::test]
    async fn test_primitives_share_one_connection() {
        let store = MemoryStore::new();
        let coordinator = Coordinator::new(store);

        let lock = coordinator.lock("resource");
        assert!(lock.acquire(10).await.unwrap());
        assert!(!coordinator.lock("resource").acquire(10).await.unwrap());

        let mq = coordinator.message_queue("events").await.unwrap();
        assert_eq!(mq.topic(), "events");
        mq.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_quit_closes_store_after_subscriber() {
        let store = MemoryStore::new();
        let coordinator = Coordinator::new(Arc::clone(&store));
        let _mq = coordinator.message_queue("events").await.unwrap();

        coordinator.quit().await.unwrap();
        assert!(matches!(
            store.get("anything").await,
            Err(StoreError::Closed)
        ));
    }
}
