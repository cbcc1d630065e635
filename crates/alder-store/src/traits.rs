//! Store traits consumed by the coordination primitives.
//!
//! [`CoordinationStore`] is the key-scoped command surface: conditional sets,
//! sorted sets, hash maps, atomic batches and publish. [`SubscriberConnection`]
//! is a second connection dedicated to subscriptions, obtained through
//! [`CoordinationStore::duplicate`]; inbound traffic (subscription
//! confirmations and published messages) arrives on its event stream.

use std::sync::Arc;

use async_trait::async_trait;

use crate::command::StoreCommand;
use crate::command::StoreReply;
use crate::error::StoreError;

/// Inbound event on a subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    /// The store confirmed a subscription; messages for `topic` will now be
    /// delivered to this connection.
    Subscribed {
        /// The confirmed topic.
        topic: String,
    },
    /// A message published to a subscribed topic.
    Message {
        /// The topic the message was published on.
        topic: String,
        /// The message payload.
        payload: String,
    },
}

/// Network-accessible key-value store with the primitive atomic operations
/// the coordination layer is built on.
///
/// All TTLs and scores are second-granularity. Implementations must be
/// linearizable per key; `batch` must apply all commands as one atomic unit.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Set a key, optionally with a TTL in seconds.
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<(), StoreError>;

    /// Atomically create a key if absent. Returns true iff this call created it.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, StoreError>;

    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete a key. Returns true iff the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically delete a key only if its current value equals `expected`.
    ///
    /// Returns true iff the key was deleted. This is the fencing-token
    /// release primitive: a holder proves it still owns a lock before
    /// removing it.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Set a TTL on an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, StoreError>;

    /// Add a member to a sorted set. Returns true iff the member was new.
    ///
    /// With `only_if_absent`, an existing member keeps its current score.
    async fn sorted_set_add(
        &self,
        set: &str,
        score: u64,
        member: &str,
        only_if_absent: bool,
    ) -> Result<bool, StoreError>;

    /// Members with `min_exclusive < score <= max_inclusive`, ordered by
    /// score. `min_exclusive = None` means unbounded below.
    async fn sorted_set_range_by_score(
        &self,
        set: &str,
        min_exclusive: Option<u64>,
        max_inclusive: u64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError>;

    /// Remove members from a sorted set. Returns the number removed.
    async fn sorted_set_remove(&self, set: &str, members: &[String]) -> Result<u64, StoreError>;

    /// Read a hash map field.
    async fn hash_get(&self, map: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Set a hash map field. Returns true iff the field was new.
    async fn hash_set(&self, map: &str, field: &str, value: &str) -> Result<bool, StoreError>;

    /// Delete a hash map field. Returns true iff the field existed.
    async fn hash_delete(&self, map: &str, field: &str) -> Result<bool, StoreError>;

    /// Execute multiple commands as one atomic unit, replies positionally
    /// matched to the commands.
    async fn batch(&self, commands: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError>;

    /// Publish a message to a topic. Returns the number of receivers.
    async fn publish(&self, topic: &str, message: &str) -> Result<u64, StoreError>;

    /// Number of connections currently subscribed to a topic.
    async fn subscriber_count(&self, topic: &str) -> Result<u64, StoreError>;

    /// Open a second connection dedicated to subscriptions.
    async fn duplicate(&self) -> Result<Arc<dyn SubscriberConnection>, StoreError>;

    /// Close the connection. Further commands fail with [`StoreError::Closed`].
    async fn quit(&self) -> Result<(), StoreError>;
}

/// A connection dedicated to pub/sub subscriptions.
#[async_trait]
pub trait SubscriberConnection: Send + Sync {
    /// Ask the store to subscribe this connection to a topic.
    ///
    /// The subscription is only effective once the matching
    /// [`SubscriberEvent::Subscribed`] arrives on the event stream.
    async fn subscribe(&self, topic: &str) -> Result<(), StoreError>;

    /// Drop a subscription.
    async fn unsubscribe(&self, topic: &str) -> Result<(), StoreError>;

    /// Next inbound event, or `None` once the connection is closed.
    async fn next_event(&self) -> Option<SubscriberEvent>;

    /// Close the connection, ending the event stream.
    async fn close(&self);
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: CoordinationStore + ?Sized> CoordinationStore for Arc<T> {
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<(), StoreError> {
        (**self).set(key, value, ttl_seconds).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, StoreError> {
        (**self).set_if_absent(key, value, ttl_seconds).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        (**self).compare_and_delete(key, expected).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        (**self).exists(key).await
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, StoreError> {
        (**self).expire(key, ttl_seconds).await
    }

    async fn sorted_set_add(
        &self,
        set: &str,
        score: u64,
        member: &str,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        (**self).sorted_set_add(set, score, member, only_if_absent).await
    }

    async fn sorted_set_range_by_score(
        &self,
        set: &str,
        min_exclusive: Option<u64>,
        max_inclusive: u64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        (**self)
            .sorted_set_range_by_score(set, min_exclusive, max_inclusive, limit)
            .await
    }

    async fn sorted_set_remove(&self, set: &str, members: &[String]) -> Result<u64, StoreError> {
        (**self).sorted_set_remove(set, members).await
    }

    async fn hash_get(&self, map: &str, field: &str) -> Result<Option<String>, StoreError> {
        (**self).hash_get(map, field).await
    }

    async fn hash_set(&self, map: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        (**self).hash_set(map, field, value).await
    }

    async fn hash_delete(&self, map: &str, field: &str) -> Result<bool, StoreError> {
        (**self).hash_delete(map, field).await
    }

    async fn batch(&self, commands: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError> {
        (**self).batch(commands).await
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<u64, StoreError> {
        (**self).publish(topic, message).await
    }

    async fn subscriber_count(&self, topic: &str) -> Result<u64, StoreError> {
        (**self).subscriber_count(topic).await
    }

    async fn duplicate(&self) -> Result<Arc<dyn SubscriberConnection>, StoreError> {
        (**self).duplicate().await
    }

    async fn quit(&self) -> Result<(), StoreError> {
        (**self).quit().await
    }
}
