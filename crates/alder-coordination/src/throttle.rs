//! Single-flight execution with a cooldown window.
//!
//! At most one process runs the task per window. The leader is the process
//! that both observes an elapsed window and wins the leadership lock in one
//! atomic batch; everyone else replays the leader's cached outcome, waiting
//! on a broadcast if the leader has not finished yet.
//!
//! Three keys per logical key: the window timestamp (when the leader last
//! started), the leadership lock (fencing token, expires with the window)
//! and the outcome cache. Window and cache carry the window length plus a
//! small epsilon so modest clock skew between processes cannot surface an
//! expired cache inside a live window.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use alder_store::CoordinationStore;
use alder_store::StoreCommand;
use alder_store::StoreReply;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::error::CoordinationError;
use crate::keys;
use crate::message_queue::MessageQueue;
use crate::registry::PubSubRegistry;
use crate::types::CLOCK_SKEW_EPSILON_SECS;
use crate::types::TokenSource;
use crate::types::now_unix_secs;

/// Default window length in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 1;

/// Cached outcome of one leader execution, broadcast verbatim to followers.
#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    value: serde_json::Value,
    error: Option<String>,
}

/// Single-flight throttle bound to one logical key.
pub struct Throttle<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    tokens: Arc<TokenSource>,
    window_key: String,
    lock_key: String,
    cache_key: String,
    mq: MessageQueue<S>,
    waiters: Arc<Mutex<Vec<(u64, oneshot::Sender<String>)>>>,
    next_waiter: AtomicU64,
}

impl<S: CoordinationStore + ?Sized + 'static> Throttle<S> {
    pub(crate) async fn new(
        store: Arc<S>,
        registry: Arc<PubSubRegistry<S>>,
        tokens: Arc<TokenSource>,
        logical_key: &str,
    ) -> Result<Self, CoordinationError> {
        let mq = MessageQueue::new(
            Arc::clone(&store),
            registry,
            keys::throttle_topic(logical_key),
        )
        .await?;
        let waiters = Arc::new(Mutex::new(Vec::<(u64, oneshot::Sender<String>)>::new()));
        {
            let waiters = Arc::clone(&waiters);
            mq.add_listener(move |payload| {
                let pending = std::mem::take(&mut *waiters.lock().unwrap());
                for (_, tx) in pending {
                    let _ = tx.send(payload.to_string());
                }
            });
        }
        Ok(Self {
            store,
            tokens,
            window_key: keys::throttle_window_key(logical_key),
            lock_key: keys::throttle_lock_key(logical_key),
            cache_key: keys::throttle_cache_key(logical_key),
            mq,
            waiters,
            next_waiter: AtomicU64::new(0),
        })
    }

    /// Run `task` at most once per default window of
    /// [`DEFAULT_WINDOW_SECS`]; see [`run_with_ttl`](Self::run_with_ttl).
    pub async fn run<T, F, Fut>(&self, task: F) -> Result<T, CoordinationError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        self.run_with_ttl(DEFAULT_WINDOW_SECS, task).await
    }

    /// Run `task` if the window has elapsed and leadership is won, otherwise
    /// replay the current window's cached outcome.
    ///
    /// `ttl` is the window length in seconds. A leader error is cached and
    /// replayed to followers the same as a value.
    pub async fn run_with_ttl<T, F, Fut>(&self, ttl: u64, task: F) -> Result<T, CoordinationError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        if ttl < 1 {
            return Err(CoordinationError::InvalidTtl { ttl });
        }

        let token = self.tokens.next_token();
        let replies = self
            .store
            .batch(vec![
                StoreCommand::Get {
                    key: self.window_key.clone(),
                },
                StoreCommand::SetIfAbsent {
                    key: self.lock_key.clone(),
                    value: token.clone(),
                    ttl_seconds: Some(ttl),
                },
            ])
            .await?;
        let last: u64 = replies
            .first()
            .and_then(StoreReply::as_value)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let acquired = replies.get(1).is_some_and(StoreReply::as_bool);
        let now = now_unix_secs();

        if acquired && now.saturating_sub(last) >= ttl {
            self.lead(now, ttl, task).await
        } else {
            if acquired {
                // The window is still live; the lock was only free because
                // the previous leader's lock expired ahead of it. Hand the
                // token back rather than lead inside a live window.
                let _ = self.store.compare_and_delete(&self.lock_key, &token).await;
            }
            self.follow().await
        }
    }

    async fn lead<T, F, Fut>(&self, now: u64, ttl: u64, task: F) -> Result<T, CoordinationError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        // Open the window and drop the previous outcome before running, so
        // followers arriving during execution wait on the broadcast instead
        // of replaying a stale cache.
        self.store
            .batch(vec![
                StoreCommand::Set {
                    key: self.window_key.clone(),
                    value: now.to_string(),
                    ttl_seconds: Some(ttl + CLOCK_SKEW_EPSILON_SECS),
                },
                StoreCommand::Delete {
                    key: self.cache_key.clone(),
                },
            ])
            .await?;

        let outcome = task().await;
        let record = match &outcome {
            Ok(value) => CacheRecord {
                value: serde_json::to_value(value)?,
                error: None,
            },
            Err(error) => CacheRecord {
                value: serde_json::Value::Null,
                error: Some(format!("{error:#}")),
            },
        };
        let payload = serde_json::to_string(&record)?;
        self.store
            .set(&self.cache_key, &payload, Some(ttl + CLOCK_SKEW_EPSILON_SECS))
            .await?;
        self.mq.publish(&payload).await?;

        outcome.map_err(|error| CoordinationError::Task {
            message: format!("{error:#}"),
        })
    }

    async fn follow<T: DeserializeOwned>(&self) -> Result<T, CoordinationError> {
        // Register before the cache read so a broadcast landing between the
        // two cannot be missed.
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        self.waiters.lock().unwrap().push((id, tx));

        if let Some(payload) = self.store.get(&self.cache_key).await? {
            // Served from the cache; withdraw from the broadcast wait-set.
            self.waiters.lock().unwrap().retain(|(wid, _)| *wid != id);
            return Self::replay(&payload);
        }
        let payload = rx.await.map_err(|_| CoordinationError::ShutDown)?;
        Self::replay(&payload)
    }

    fn replay<T: DeserializeOwned>(payload: &str) -> Result<T, CoordinationError> {
        let record: CacheRecord = serde_json::from_str(payload)?;
        match record.error {
            Some(message) => Err(CoordinationError::Task { message }),
            None => Ok(serde_json::from_value(record.value)?),
        }
    }

    /// Reset the window so the next caller leads immediately.
    pub async fn clear(&self) -> Result<(), CoordinationError> {
        self.store
            .batch(vec![
                StoreCommand::Delete {
                    key: self.window_key.clone(),
                },
                StoreCommand::Delete {
                    key: self.cache_key.clone(),
                },
                StoreCommand::Delete {
                    key: self.lock_key.clone(),
                },
            ])
            .await?;
        Ok(())
    }

    /// Whether a window is currently open for `logical_key`.
    pub async fn has(store: &S, logical_key: &str) -> Result<bool, CoordinationError> {
        Ok(store.exists(&keys::throttle_window_key(logical_key)).await?)
    }

    /// Release the broadcast subscription.
    pub async fn close(self) -> Result<(), CoordinationError> {
        self.mq.close().await
    }
}
