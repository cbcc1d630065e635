//! Serialized task execution per logical key.
//!
//! The store only ever holds the serialization lock; task payloads, order
//! and resolvers are ordinary per-process state. A wake-up message (payload:
//! the logical key) is published after every submission and completion so
//! all processes holding pending work on that key race for the lock; the
//! winner runs exactly one task and re-signals.
//!
//! Tasks submitted by one process start in submission order. Cross-process
//! order is lock-race-determined: no fairness guarantee.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use alder_store::CoordinationStore;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::CoordinationError;
use crate::keys;
use crate::lock::FencedLock;
use crate::message_queue::MessageQueue;
use crate::registry::PubSubRegistry;
use crate::types::TokenSource;

/// Default task TTL in seconds: how long the serialization lock may be held
/// before a waiting process is allowed to reclaim it.
pub const DEFAULT_TASK_TTL_SECS: u64 = 30;

/// Runs after the lock is released and delivers the outcome to the caller.
type QueueResolver = Box<dyn FnOnce() + Send>;

/// Type-erased queued task: executes the caller's future and hands back the
/// resolver for its typed oneshot.
type QueueJob = Box<dyn FnOnce() -> BoxFuture<'static, QueueResolver> + Send>;

struct QueueEntry {
    ttl: u64,
    job: QueueJob,
}

/// Per-connection queue state, shared by every [`Queue`] facade built from
/// one [`Coordinator`](crate::Coordinator).
pub(crate) struct QueueRuntime<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    registry: Arc<PubSubRegistry<S>>,
    tokens: Arc<TokenSource>,
    /// Pending tasks per logical key. Local state only, never stored.
    tasks: Mutex<HashMap<String, VecDeque<QueueEntry>>>,
    wake: tokio::sync::OnceCell<MessageQueue<S>>,
    /// Wake-up listeners run on the registry reader task and must stay
    /// synchronous, so they hand the signalled key to the drain task.
    advance_tx: mpsc::UnboundedSender<String>,
    advance_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl<S: CoordinationStore + ?Sized + 'static> QueueRuntime<S> {
    pub(crate) fn new(
        store: Arc<S>,
        registry: Arc<PubSubRegistry<S>>,
        tokens: Arc<TokenSource>,
    ) -> Arc<Self> {
        let (advance_tx, advance_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            registry,
            tokens,
            tasks: Mutex::new(HashMap::new()),
            wake: tokio::sync::OnceCell::new(),
            advance_tx,
            advance_rx: Mutex::new(Some(advance_rx)),
        })
    }

    /// Lazily bind the shared wake-up channel and start the drain task that
    /// advances each signalled key.
    async fn wake(self: &Arc<Self>) -> Result<&MessageQueue<S>, CoordinationError> {
        self.wake
            .get_or_try_init(|| async {
                let mq = MessageQueue::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.registry),
                    keys::QUEUE_WAKE_TOPIC.to_string(),
                )
                .await?;
                let tx = self.advance_tx.clone();
                mq.add_listener(move |key| {
                    let _ = tx.send(key.to_string());
                });
                if let Some(mut rx) = self.advance_rx.lock().unwrap().take() {
                    let weak = Arc::downgrade(self);
                    tokio::spawn(async move {
                        while let Some(key) = rx.recv().await {
                            let Some(runtime) = Weak::upgrade(&weak) else {
                                break;
                            };
                            runtime.try_advance(&key).await;
                        }
                    });
                }
                Ok::<_, CoordinationError>(mq)
            })
            .await
    }

    /// Publish a wake-up for `key` so every process with pending work on it
    /// attempts to advance.
    pub(crate) async fn signal(self: &Arc<Self>, key: &str) -> Result<(), CoordinationError> {
        let wake = self.wake().await?;
        wake.publish(key).await?;
        Ok(())
    }

    async fn try_advance(&self, key: &str) {
        if let Err(error) = self.advance_once(key).await {
            warn!(%key, %error, "queue advance failed");
        }
    }

    /// Attempt to run the head task for `key` under the serialization lock.
    ///
    /// Losing the lock race is not an error: the process currently holding
    /// it re-signals after it finishes.
    async fn advance_once(&self, key: &str) -> Result<(), CoordinationError> {
        let Some(ttl) = ({
            let tasks = self.tasks.lock().unwrap();
            tasks.get(key).and_then(|queue| queue.front()).map(|e| e.ttl)
        }) else {
            return Ok(());
        };

        let mut lock = FencedLock::new(Arc::clone(&self.store), keys::queue_lock_key(key));
        if !lock.acquire(&self.tokens, Some(ttl)).await? {
            return Ok(());
        }

        let entry = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.get_mut(key).and_then(|queue| queue.pop_front())
        };
        let Some(entry) = entry else {
            // Another signal drained this key first; give the lock back.
            let _ = lock.release_if_held().await;
            return Ok(());
        };

        let resolver = (entry.job)().await;

        // Release only while the stored token still matches: if this task
        // overran its ttl, a waiting process has force-reclaimed the lock
        // and deleting it would steal that holder's critical section.
        if let Err(error) = lock.release_if_held().await {
            warn!(%key, %error, "queue lock release failed");
        }

        resolver();

        {
            let mut tasks = self.tasks.lock().unwrap();
            if tasks.get(key).is_some_and(|queue| queue.is_empty()) {
                tasks.remove(key);
            }
        }

        // More tasks may be queued here or in another process. Signals only
        // flow once the wake channel exists, so it is already bound here.
        if let Some(wake) = self.wake.get() {
            wake.publish(key).await?;
        }
        Ok(())
    }

    fn push(&self, key: &str, entry: QueueEntry) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.entry(key.to_string()).or_default().push_back(entry);
    }

    fn has_pending(&self, key: &str) -> bool {
        self.tasks.lock().unwrap().contains_key(key)
    }
}

/// Serialized task queue bound to one logical key.
pub struct Queue<S: CoordinationStore + ?Sized> {
    runtime: Arc<QueueRuntime<S>>,
    key: String,
}

impl<S: CoordinationStore + ?Sized + 'static> Queue<S> {
    pub(crate) fn new(runtime: Arc<QueueRuntime<S>>, key: String) -> Self {
        Self { runtime, key }
    }

    /// Run `task` once the key's serialization lock is ours, with the
    /// default TTL of [`DEFAULT_TASK_TTL_SECS`].
    pub async fn run<T, F, Fut>(&self, task: F) -> Result<T, CoordinationError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
    {
        self.run_with_ttl(DEFAULT_TASK_TTL_SECS, task).await
    }

    /// Run `task` with an explicit lock TTL in seconds.
    ///
    /// The returned future resolves with the task's outcome once it has
    /// executed; a task error rejects only this caller and never blocks
    /// subsequent tasks.
    pub async fn run_with_ttl<T, F, Fut>(&self, ttl: u64, task: F) -> Result<T, CoordinationError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
    {
        if ttl < 1 {
            return Err(CoordinationError::InvalidTtl { ttl });
        }

        let (tx, rx) = oneshot::channel::<Result<T, CoordinationError>>();
        let job: QueueJob = Box::new(move || {
            async move {
                let outcome = task()
                    .await
                    .map_err(|error| CoordinationError::Task {
                        message: format!("{error:#}"),
                    });
                let resolver: QueueResolver = Box::new(move || {
                    let _ = tx.send(outcome);
                });
                resolver
            }
            .boxed()
        });

        self.runtime.push(&self.key, QueueEntry { ttl, job });
        self.runtime.signal(&self.key).await?;

        rx.await.map_err(|_| CoordinationError::ShutDown)?
    }

    /// Whether this connection is wired for wake-ups and holds pending
    /// tasks for this key.
    pub async fn has(&self) -> Result<bool, CoordinationError> {
        Ok(MessageQueue::has(&*self.runtime.store, keys::QUEUE_WAKE_TOPIC).await?
            && self.runtime.has_pending(&self.key))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alder_store::MemoryStore;

    use super::*;

    fn runtime(store: &Arc<MemoryStore>) -> Arc<QueueRuntime<MemoryStore>> {
        let registry = Arc::new(PubSubRegistry::new(Arc::clone(store)));
        QueueRuntime::new(Arc::clone(store), registry, Arc::new(TokenSource::new()))
    }

    #[tokio::test]
    async fn test_tasks_run_in_submission_order() {
        let store = MemoryStore::new();
        let queue = Queue::new(runtime(&store), "test".to_string());
        let order = Arc::new(Mutex::new(Vec::<u32>::new()));

        let first = {
            let order = Arc::clone(&order);
            queue.run(move || async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                order.lock().unwrap().push(1);
                Ok(1u32)
            })
        };
        let second = {
            let order = Arc::clone(&order);
            queue.run(move || async move {
                // Only starts after the task above completes.
                order.lock().unwrap().push(2);
                Ok(2u32)
            })
        };

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
        assert_eq!(order.lock().unwrap().as_slice(), [1, 2]);
    }

    #[tokio::test]
    async fn test_task_error_rejects_only_its_caller() {
        let store = MemoryStore::new();
        let queue = Queue::new(runtime(&store), "test".to_string());

        let failing = queue.run(|| async { Err::<u32, _>(anyhow::anyhow!("boom")) });
        let ok = queue.run(|| async { Ok(7u32) });

        let (failed, succeeded) = tokio::join!(failing, ok);
        match failed {
            Err(CoordinationError::Task { message }) => assert!(message.contains("boom")),
            other => panic!("expected task error, got {other:?}"),
        }
        assert_eq!(succeeded.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_invalid_ttl_rejected_synchronously() {
        let store = MemoryStore::new();
        let queue = Queue::new(runtime(&store), "test".to_string());
        let result = queue.run_with_ttl(0, || async { Ok(()) }).await;
        assert!(matches!(result, Err(CoordinationError::InvalidTtl { ttl: 0 })));
    }

    #[tokio::test]
    async fn test_two_facades_share_one_serialization() {
        let store = MemoryStore::new();
        let rt = runtime(&store);
        let queue_a = Queue::new(Arc::clone(&rt), "shared".to_string());
        let queue_b = Queue::new(rt, "shared".to_string());
        let order = Arc::new(Mutex::new(Vec::<u32>::new()));

        let first = {
            let order = Arc::clone(&order);
            queue_a.run(move || async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                order.lock().unwrap().push(1);
                Ok(())
            })
        };
        let second = {
            let order = Arc::clone(&order);
            queue_b.run(move || async move {
                order.lock().unwrap().push(2);
                Ok(())
            })
        };

        let (a, b) = tokio::join!(first, second);
        a.unwrap();
        b.unwrap();
        assert_eq!(order.lock().unwrap().as_slice(), [1, 2]);
    }

    #[tokio::test]
    async fn test_independent_keys_both_complete() {
        let store = MemoryStore::new();
        let rt = runtime(&store);
        let queue_a = Queue::new(Arc::clone(&rt), "alpha".to_string());
        let queue_b = Queue::new(rt, "beta".to_string());

        let first = queue_a.run(|| async { Ok("a") });
        let second = queue_b.run(|| async { Ok("b") });

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
        assert!(!queue_a.has().await.unwrap());
        assert!(!queue_b.has().await.unwrap());
    }

    #[tokio::test]
    async fn test_has_reports_empty_after_completion() {
        let store = MemoryStore::new();
        let queue = Queue::new(runtime(&store), "test".to_string());
        queue.run(|| async { Ok(()) }).await.unwrap();
        assert!(!queue.has().await.unwrap());
    }
}
