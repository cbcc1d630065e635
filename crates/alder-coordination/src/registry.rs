//! Per-connection pub/sub registry.
//!
//! One subscriber connection is duplicated lazily per backing connection and
//! shared by every [`MessageQueue`](crate::MessageQueue) on that connection;
//! a single reader task drains its event stream and multiplexes topics to
//! the registered instances. The registry is an explicit object owned by the
//! [`Coordinator`](crate::Coordinator), never an ambient singleton.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use alder_store::CoordinationStore;
use alder_store::SubscriberConnection;
use alder_store::SubscriberEvent;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::CoordinationError;

/// A message listener. Each call is isolated with `catch_unwind` so one
/// faulty listener cannot block delivery to the others.
pub(crate) type Listener = Arc<dyn Fn(&str) + Send + Sync>;

/// State shared between a `MessageQueue` instance and the registry's reader.
pub(crate) struct MqShared {
    pub(crate) topic: String,
    /// False until the store confirms the topic's subscription.
    pub(crate) ready: AtomicBool,
    /// Messages published before the subscription was confirmed, flushed in
    /// FIFO order once `ready` flips true.
    pub(crate) pending: Mutex<VecDeque<String>>,
    pub(crate) listeners: Mutex<Vec<(u64, Listener)>>,
}

impl MqShared {
    pub(crate) fn new(topic: String) -> Arc<Self> {
        Arc::new(Self {
            topic,
            ready: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }
}

/// Registration state of one topic.
struct Channel {
    ready: bool,
    instances: Vec<(u64, Weak<MqShared>)>,
}

/// Registry of channel registrations for one backing connection.
pub struct PubSubRegistry<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    subscriber: tokio::sync::OnceCell<Arc<dyn SubscriberConnection>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    channels: Arc<Mutex<HashMap<String, Channel>>>,
    next_instance: AtomicU64,
}

impl<S: CoordinationStore + ?Sized + 'static> PubSubRegistry<S> {
    pub(crate) fn new(store: Arc<S>) -> Self {
        Self {
            store,
            subscriber: tokio::sync::OnceCell::new(),
            reader: Mutex::new(None),
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_instance: AtomicU64::new(0),
        }
    }

    /// Lazily duplicate the subscriber connection and start its reader.
    async fn subscriber(&self) -> Result<&Arc<dyn SubscriberConnection>, CoordinationError> {
        let conn = self
            .subscriber
            .get_or_try_init(|| async {
                let conn = self.store.duplicate().await?;
                let handle = tokio::spawn(reader_loop(
                    Arc::clone(&conn),
                    Arc::clone(&self.channels),
                    Arc::clone(&self.store),
                ));
                *self.reader.lock().unwrap() = Some(handle);
                Ok::<_, CoordinationError>(conn)
            })
            .await?;
        Ok(conn)
    }

    /// Register an instance for a topic, subscribing on first registration.
    ///
    /// Returns the instance id used for unregistration. When the topic is
    /// already confirmed, the instance is marked ready immediately.
    pub(crate) async fn register(
        &self,
        shared: &Arc<MqShared>,
    ) -> Result<u64, CoordinationError> {
        let subscriber = self.subscriber().await?;
        let id = self.next_instance.fetch_add(1, Ordering::Relaxed);

        let needs_subscribe = {
            let mut channels = self.channels.lock().unwrap();
            match channels.get_mut(&shared.topic) {
                Some(channel) => {
                    channel.instances.push((id, Arc::downgrade(shared)));
                    if channel.ready {
                        shared.ready.store(true, Ordering::SeqCst);
                    }
                    false
                }
                None => {
                    channels.insert(shared.topic.clone(), Channel {
                        ready: false,
                        instances: vec![(id, Arc::downgrade(shared))],
                    });
                    true
                }
            }
        };

        if needs_subscribe {
            subscriber.subscribe(&shared.topic).await?;
        }
        Ok(id)
    }

    /// Drop an instance; unregistering the last one for a topic releases the
    /// topic registration.
    pub(crate) async fn unregister(&self, topic: &str, id: u64) -> Result<(), CoordinationError> {
        let topic_released = {
            let mut channels = self.channels.lock().unwrap();
            match channels.get_mut(topic) {
                Some(channel) => {
                    channel.instances.retain(|(i, _)| *i != id);
                    if channel.instances.is_empty() {
                        channels.remove(topic);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if topic_released
            && let Some(subscriber) = self.subscriber.get()
        {
            subscriber.unsubscribe(topic).await?;
        }
        Ok(())
    }

    /// Stop the reader and close the subscriber connection. Must run before
    /// the primary connection quits, so in-flight subscription commands are
    /// not rejected.
    pub(crate) async fn shutdown(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(subscriber) = self.subscriber.get() {
            subscriber.close().await;
        }
        let mut channels = self.channels.lock().unwrap();
        for channel in channels.values() {
            for (_, weak) in &channel.instances {
                if let Some(shared) = weak.upgrade() {
                    shared.ready.store(false, Ordering::SeqCst);
                }
            }
        }
        channels.clear();
    }
}

/// Drain the subscriber connection: confirmations flip channels ready and
/// flush buffered messages; inbound messages fan out to every listener of
/// every instance bound to the topic.
async fn reader_loop<S: CoordinationStore + ?Sized>(
    conn: Arc<dyn SubscriberConnection>,
    channels: Arc<Mutex<HashMap<String, Channel>>>,
    store: Arc<S>,
) {
    while let Some(event) = conn.next_event().await {
        match event {
            SubscriberEvent::Subscribed { topic } => {
                let (instances, released) = mark_ready(&channels, &topic);
                if released {
                    if let Err(error) = conn.unsubscribe(&topic).await {
                        warn!(%topic, %error, "failed to release dead topic");
                    }
                    continue;
                }
                for shared in instances {
                    let queued: Vec<String> = {
                        let mut pending = shared.pending.lock().unwrap();
                        pending.drain(..).collect()
                    };
                    for message in queued {
                        if let Err(error) = store.publish(&topic, &message).await {
                            warn!(%topic, %error, "failed to flush buffered message");
                        }
                    }
                }
            }
            SubscriberEvent::Message { topic, payload } => {
                let (listeners, released) = collect_listeners(&channels, &topic);
                if released
                    && let Err(error) = conn.unsubscribe(&topic).await
                {
                    warn!(%topic, %error, "failed to release dead topic");
                }
                for listener in listeners {
                    // Isolate each listener; a panicking one must not block
                    // delivery to the rest.
                    let _ = catch_unwind(AssertUnwindSafe(|| listener(&payload)));
                }
            }
        }
    }
}

/// Flip a topic ready. Dropped instances are pruned on the way; when none
/// survive, the channel is removed and the returned flag asks the caller to
/// unsubscribe the topic.
fn mark_ready(
    channels: &Mutex<HashMap<String, Channel>>,
    topic: &str,
) -> (Vec<Arc<MqShared>>, bool) {
    let mut channels = channels.lock().unwrap();
    let Some(channel) = channels.get_mut(topic) else {
        return (Vec::new(), false);
    };
    channel.instances.retain(|(_, weak)| weak.strong_count() > 0);
    if channel.instances.is_empty() {
        channels.remove(topic);
        return (Vec::new(), true);
    }
    channel.ready = true;
    let instances = channel
        .instances
        .iter()
        .filter_map(|(_, weak)| weak.upgrade())
        .inspect(|shared| shared.ready.store(true, Ordering::SeqCst))
        .collect();
    (instances, false)
}

/// Snapshot a topic's listeners, pruning instances whose `MessageQueue` was
/// dropped without `close()`. Same release contract as [`mark_ready`].
fn collect_listeners(
    channels: &Mutex<HashMap<String, Channel>>,
    topic: &str,
) -> (Vec<Listener>, bool) {
    let mut channels = channels.lock().unwrap();
    let Some(channel) = channels.get_mut(topic) else {
        return (Vec::new(), false);
    };
    channel.instances.retain(|(_, weak)| weak.strong_count() > 0);
    if channel.instances.is_empty() {
        channels.remove(topic);
        return (Vec::new(), true);
    }
    let listeners = channel
        .instances
        .iter()
        .filter_map(|(_, weak)| weak.upgrade())
        .flat_map(|shared| {
            let listeners = shared.listeners.lock().unwrap();
            listeners.iter().map(|(_, l)| Arc::clone(l)).collect::<Vec<_>>()
        })
        .collect();
    (listeners, false)
}
