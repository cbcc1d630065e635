//! Deduplicated, time-ordered task scheduling.
//!
//! Tasks live in two structures per logical key: a sorted set mapping a
//! content signature to its next-due time, and a hash map holding the
//! payload record. The signature is a hash of the canonicalized payload, so
//! the same payload submitted twice collapses into one scheduled entry
//! whatever process it came from.
//!
//! Pulling is guarded by a short-lived global lock so concurrent pollers
//! never double-deliver; all index mutations from one pull, including the
//! lock release, apply as a single atomic batch.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use alder_store::CoordinationStore;
use alder_store::StoreCommand;
use serde::Deserialize;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::error::CoordinationError;
use crate::keys;
use crate::types::TokenSource;
use crate::types::now_unix_secs;

/// TTL in seconds on the push and pull guard locks. Long enough to cover a
/// store round-trip, short enough that a crashed holder is quickly forgotten.
const GUARD_LOCK_TTL_SECS: u64 = 5;

/// How far back in time a pull searches for due tasks, in seconds (one
/// week). Entries older than this are treated as abandoned and purged.
pub const DEFAULT_LOOKBACK_SECS: u64 = 604_800;

/// Tuning knobs for a [`ThrottleQueue`].
#[derive(Debug, Clone)]
pub struct ThrottleQueueConfig {
    /// Lookback window for due tasks, in seconds.
    pub lookback_secs: u64,
}

impl Default for ThrottleQueueConfig {
    fn default() -> Self {
        Self {
            lookback_secs: DEFAULT_LOOKBACK_SECS,
        }
    }
}

/// Scheduling options for [`ThrottleQueue::add`].
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Unix time the task first becomes due. Defaults to now.
    pub start: Option<u64>,
    /// Unix time after which the task is no longer valid. `None` never
    /// expires.
    pub end: Option<u64>,
    /// Reschedule interval in seconds. `None` or zero runs the task once.
    pub repeat: Option<u64>,
}

/// Stored payload record, kept alongside the index entry.
#[derive(Debug, Serialize, Deserialize)]
struct TaskRecord {
    data: serde_json::Value,
    end: Option<u64>,
    repeat: Option<u64>,
}

impl TaskRecord {
    /// A task is valid while its end is unset or still in the future.
    fn is_valid(&self, now: u64) -> bool {
        self.end.is_none_or(|end| end > now)
    }
}

/// A task handed to the consumer by [`ThrottleQueue::pull`].
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    /// Content signature, usable with [`ThrottleQueue::cancel`].
    pub signature: String,
    /// The payload as submitted.
    pub data: serde_json::Value,
}

struct TqShared<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    tokens: Arc<TokenSource>,
    logical_key: String,
    index_key: String,
    tasks_key: String,
    pull_lock_key: String,
    lookback_secs: u64,
}

/// Deduplicated scheduler bound to one logical key.
pub struct ThrottleQueue<S: CoordinationStore + ?Sized> {
    shared: Arc<TqShared<S>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: CoordinationStore + ?Sized + 'static> ThrottleQueue<S> {
    pub(crate) fn new(
        store: Arc<S>,
        tokens: Arc<TokenSource>,
        logical_key: &str,
        config: ThrottleQueueConfig,
    ) -> Self {
        Self {
            shared: Arc::new(TqShared {
                store,
                tokens,
                logical_key: logical_key.to_string(),
                index_key: keys::tq_index_key(logical_key),
                tasks_key: keys::tq_tasks_key(logical_key),
                pull_lock_key: keys::tq_pull_lock_key(logical_key),
                lookback_secs: config.lookback_secs,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Schedule a task, deduplicated on its payload.
    ///
    /// Returns the task's signature when the call scheduled something new or
    /// extended an existing entry's end time, `None` when an identical task
    /// was already scheduled (or another process is pushing it right now).
    pub async fn add<T: Serialize>(
        &self,
        data: &T,
        opts: TaskOptions,
    ) -> Result<Option<String>, CoordinationError> {
        let data = serde_json::to_value(data)?;
        let signature = signature_of(&data)?;
        let push_lock = keys::tq_push_lock_key(&self.shared.logical_key, &signature);

        // Short guard so two processes pushing the same payload at once
        // cannot interleave between the index and payload writes.
        if !self
            .shared
            .store
            .set_if_absent(&push_lock, "1", Some(GUARD_LOCK_TTL_SECS))
            .await?
        {
            return Ok(None);
        }

        let score = opts.start.unwrap_or_else(now_unix_secs);
        // An explicit start overrides a duplicate's scheduled time; a
        // defaulted start keeps the earlier entry in place.
        let added = self
            .shared
            .store
            .sorted_set_add(&self.shared.index_key, score, &signature, opts.start.is_none())
            .await?;

        if added {
            let record = TaskRecord {
                data,
                end: opts.end,
                repeat: opts.repeat,
            };
            self.shared
                .store
                .batch(vec![
                    StoreCommand::HashSet {
                        map: self.shared.tasks_key.clone(),
                        field: signature.clone(),
                        value: serde_json::to_string(&record)?,
                    },
                    StoreCommand::Delete { key: push_lock },
                ])
                .await?;
            return Ok(Some(signature));
        }

        // Already scheduled. The only duplicate that changes anything is one
        // that pushes the end time further out.
        let stored = self
            .shared
            .store
            .hash_get(&self.shared.tasks_key, &signature)
            .await?
            .map(|raw| serde_json::from_str::<TaskRecord>(&raw))
            .transpose()?;
        let extends = stored.as_ref().is_some_and(|record| match (record.end, opts.end) {
            (Some(_), None) => true,
            (Some(current), Some(new)) => new > current,
            (None, _) => false,
        });

        if let (true, Some(mut record)) = (extends, stored) {
            record.end = opts.end;
            self.shared
                .store
                .batch(vec![
                    StoreCommand::HashSet {
                        map: self.shared.tasks_key.clone(),
                        field: signature.clone(),
                        value: serde_json::to_string(&record)?,
                    },
                    StoreCommand::Delete { key: push_lock },
                ])
                .await?;
            Ok(Some(signature))
        } else {
            self.shared.store.delete(&push_lock).await?;
            Ok(None)
        }
    }

    /// Like [`add`](Self::add), discarding the signature.
    pub async fn push<T: Serialize>(
        &self,
        data: &T,
        opts: TaskOptions,
    ) -> Result<bool, CoordinationError> {
        Ok(self.add(data, opts).await?.is_some())
    }

    /// Remove a scheduled task by its signature. Returns true iff an entry
    /// existed.
    pub async fn cancel(&self, signature: &str) -> Result<bool, CoordinationError> {
        let replies = self
            .shared
            .store
            .batch(vec![
                StoreCommand::SortedSetRemove {
                    set: self.shared.index_key.clone(),
                    members: vec![signature.to_string()],
                },
                StoreCommand::HashDelete {
                    map: self.shared.tasks_key.clone(),
                    field: signature.to_string(),
                },
            ])
            .await?;
        Ok(replies.first().is_some_and(|reply| reply.as_bool()))
    }

    /// Pull at most `count` due tasks.
    ///
    /// Exactly one concurrent caller across all processes gets tasks; the
    /// rest see an empty pull. One-shot tasks are consumed, repeating tasks
    /// are rescheduled, expired and abandoned entries are purged.
    pub async fn pull(&self, count: usize) -> Result<Vec<ScheduledTask>, CoordinationError> {
        if count < 1 {
            return Err(CoordinationError::InvalidCount { count });
        }
        self.shared.pull(count).await
    }

    /// Start a background worker that pulls every `interval_secs` seconds
    /// and dispatches up to `concurrency` tasks per tick, spread evenly
    /// across the interval.
    ///
    /// Handler errors are logged and never stop the worker. A second call
    /// replaces the previous worker.
    pub fn start<F, Fut>(&self, handler: F, concurrency: usize, interval_secs: u64)
    where
        F: Fn(ScheduledTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.spawn_worker(handler, None, concurrency, interval_secs);
    }

    /// Like [`start`](Self::start), but handler errors go to `on_error`
    /// instead of the log.
    pub fn start_with_on_error<F, Fut, E>(
        &self,
        handler: F,
        on_error: E,
        concurrency: usize,
        interval_secs: u64,
    ) where
        F: Fn(ScheduledTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
        E: Fn(anyhow::Error) + Send + Sync + 'static,
    {
        self.spawn_worker(handler, Some(Arc::new(on_error)), concurrency, interval_secs);
    }

    fn spawn_worker<F, Fut>(
        &self,
        handler: F,
        on_error: Option<Arc<dyn Fn(anyhow::Error) + Send + Sync>>,
        concurrency: usize,
        interval_secs: u64,
    ) where
        F: Fn(ScheduledTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let handler = Arc::new(handler);
        let concurrency = concurrency.max(1);
        let interval_secs = interval_secs.max(1);

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                ticks.tick().await;
                let tasks = match shared.pull(concurrency).await {
                    Ok(tasks) => tasks,
                    Err(error) => {
                        warn!(key = %shared.logical_key, %error, "scheduled pull failed");
                        continue;
                    }
                };
                for (i, task) in tasks.into_iter().enumerate() {
                    let handler = Arc::clone(&handler);
                    let on_error = on_error.clone();
                    let key = shared.logical_key.clone();
                    // Stagger dispatch so one tick's tasks do not all fire
                    // at the same instant.
                    let offset =
                        Duration::from_millis(i as u64 * interval_secs * 1000 / concurrency as u64);
                    tokio::spawn(async move {
                        tokio::time::sleep(offset).await;
                        debug!(%key, signature = %task.signature, "dispatching scheduled task");
                        if let Err(error) = handler(task).await {
                            match &on_error {
                                Some(callback) => callback(error),
                                None => warn!(%key, %error, "scheduled task handler failed"),
                            }
                        }
                    });
                }
            }
        });

        if let Some(previous) = self.worker.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the background worker, if any. Scheduled entries stay in the
    /// store; a pull in flight may leave its guard lock to expire on its own.
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }

    /// Whether any task is scheduled under `logical_key`.
    pub async fn has(store: &S, logical_key: &str) -> Result<bool, CoordinationError> {
        Ok(store.exists(&keys::tq_index_key(logical_key)).await?)
    }
}

impl<S: CoordinationStore + ?Sized> Drop for ThrottleQueue<S> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }
}

impl<S: CoordinationStore + ?Sized + 'static> TqShared<S> {
    async fn pull(&self, count: usize) -> Result<Vec<ScheduledTask>, CoordinationError> {
        let token = self.tokens.next_token();
        if !self
            .store
            .set_if_absent(&self.pull_lock_key, &token, Some(GUARD_LOCK_TTL_SECS))
            .await?
        {
            return Ok(Vec::new());
        }

        let now = now_unix_secs();
        let floor = now.saturating_sub(self.lookback_secs);
        let stale = self
            .store
            .sorted_set_range_by_score(&self.index_key, None, floor, None)
            .await?;
        let due = self
            .store
            .sorted_set_range_by_score(&self.index_key, Some(floor), now, None)
            .await?;

        let mut commands = Vec::new();
        if !stale.is_empty() {
            debug!(key = %self.logical_key, purged = stale.len(), "purging abandoned tasks");
            for signature in &stale {
                commands.push(StoreCommand::HashDelete {
                    map: self.tasks_key.clone(),
                    field: signature.clone(),
                });
            }
            commands.push(StoreCommand::SortedSetRemove {
                set: self.index_key.clone(),
                members: stale,
            });
        }

        let mut pulled = Vec::new();
        for signature in due {
            if pulled.len() == count {
                break;
            }
            let record = self
                .store
                .hash_get(&self.tasks_key, &signature)
                .await?
                .and_then(|raw| serde_json::from_str::<TaskRecord>(&raw).ok());
            // An index entry without a readable payload is an orphan.
            let Some(record) = record else {
                commands.push(StoreCommand::SortedSetRemove {
                    set: self.index_key.clone(),
                    members: vec![signature],
                });
                continue;
            };

            let valid = record.is_valid(now);
            if valid {
                pulled.push(ScheduledTask {
                    signature: signature.clone(),
                    data: record.data,
                });
            }
            match record.repeat {
                Some(repeat) if repeat > 0 && valid => {
                    commands.push(StoreCommand::SortedSetAdd {
                        set: self.index_key.clone(),
                        score: now + repeat,
                        member: signature,
                        only_if_absent: false,
                    });
                }
                _ => {
                    commands.push(StoreCommand::HashDelete {
                        map: self.tasks_key.clone(),
                        field: signature.clone(),
                    });
                    commands.push(StoreCommand::SortedSetRemove {
                        set: self.index_key.clone(),
                        members: vec![signature],
                    });
                }
            }
        }

        // Release with the fencing token so a pull that overran the guard
        // TTL cannot delete a newer holder's lock.
        commands.push(StoreCommand::CompareAndDelete {
            key: self.pull_lock_key.clone(),
            expected: token,
        });
        self.store.batch(commands).await?;
        Ok(pulled)
    }
}

/// Content signature: hash of the payload's canonical JSON rendering.
///
/// `serde_json` maps are ordered, so serialization is deterministic and the
/// same payload always hashes identically, whichever process produced it.
fn signature_of(data: &serde_json::Value) -> Result<String, CoordinationError> {
    let canonical = serde_json::to_string(data)?;
    Ok(blake3::hash(canonical.as_bytes()).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use alder_store::MemoryStore;
    use serde_json::json;

    use super::*;

    fn queue(store: &Arc<MemoryStore>) -> ThrottleQueue<MemoryStore> {
        ThrottleQueue::new(
            Arc::clone(store),
            Arc::new(TokenSource::new()),
            "test",
            ThrottleQueueConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_add_deduplicates_on_payload() {
        let store = MemoryStore::new();
        let tq = queue(&store);

        let first = tq.add(&json!({"job": 1}), TaskOptions::default()).await.unwrap();
        let dup = tq.add(&json!({"job": 1}), TaskOptions::default()).await.unwrap();
        let other = tq.add(&json!({"job": 2}), TaskOptions::default()).await.unwrap();

        assert!(first.is_some());
        assert_eq!(dup, None);
        assert!(other.is_some());
        assert_ne!(first, other);
        assert!(!tq.push(&json!({"job": 1}), TaskOptions::default()).await.unwrap());

        let pulled = tq.pull(10).await.unwrap();
        assert_eq!(pulled.len(), 2);
    }

    #[tokio::test]
    async fn test_one_shot_task_is_consumed() {
        let store = MemoryStore::new();
        let tq = queue(&store);
        tq.add(&json!({"job": "once"}), TaskOptions::default()).await.unwrap();

        let pulled = tq.pull(10).await.unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].data, json!({"job": "once"}));

        assert!(tq.pull(10).await.unwrap().is_empty());
        assert!(!ThrottleQueue::has(&*store, "test").await.unwrap());
    }

    #[tokio::test]
    async fn test_future_start_is_not_due() {
        let store = MemoryStore::new();
        let tq = queue(&store);
        let opts = TaskOptions {
            start: Some(now_unix_secs() + 3600),
            ..TaskOptions::default()
        };
        tq.add(&json!({"job": "later"}), opts).await.unwrap();

        assert!(tq.pull(10).await.unwrap().is_empty());
        assert!(ThrottleQueue::has(&*store, "test").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_end_is_purged_without_delivery() {
        let store = MemoryStore::new();
        let tq = queue(&store);
        let now = now_unix_secs();
        let opts = TaskOptions {
            start: Some(now.saturating_sub(10)),
            end: Some(now),
            ..TaskOptions::default()
        };
        tq.add(&json!({"job": "expired"}), opts).await.unwrap();

        assert!(tq.pull(10).await.unwrap().is_empty());
        assert!(!ThrottleQueue::has(&*store, "test").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_extending_end_updates_entry() {
        let store = MemoryStore::new();
        let tq = queue(&store);
        let now = now_unix_secs();

        let first = tq
            .add(
                &json!({"job": "renewable"}),
                TaskOptions {
                    end: Some(now + 60),
                    ..TaskOptions::default()
                },
            )
            .await
            .unwrap();
        let shorter = tq
            .add(
                &json!({"job": "renewable"}),
                TaskOptions {
                    end: Some(now + 30),
                    ..TaskOptions::default()
                },
            )
            .await
            .unwrap();
        let longer = tq
            .add(
                &json!({"job": "renewable"}),
                TaskOptions {
                    end: Some(now + 120),
                    ..TaskOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(first.is_some());
        assert_eq!(shorter, None);
        assert_eq!(longer, first);
    }

    #[tokio::test]
    async fn test_repeating_task_is_rescheduled() {
        let store = MemoryStore::new();
        let tq = queue(&store);
        tq.add(
            &json!({"job": "cron"}),
            TaskOptions {
                repeat: Some(30),
                ..TaskOptions::default()
            },
        )
        .await
        .unwrap();

        let pulled = tq.pull(10).await.unwrap();
        assert_eq!(pulled.len(), 1);
        // Rescheduled 30s out: still indexed, not yet due again.
        assert!(ThrottleQueue::has(&*store, "test").await.unwrap());
        assert!(tq.pull(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entries_past_lookback_are_purged() {
        let store = MemoryStore::new();
        let tq = ThrottleQueue::new(
            Arc::clone(&store),
            Arc::new(TokenSource::new()),
            "test",
            ThrottleQueueConfig { lookback_secs: 100 },
        );
        let opts = TaskOptions {
            start: Some(now_unix_secs().saturating_sub(200)),
            ..TaskOptions::default()
        };
        tq.add(&json!({"job": "ancient"}), opts).await.unwrap();

        assert!(tq.pull(10).await.unwrap().is_empty());
        assert!(!ThrottleQueue::has(&*store, "test").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_pull_is_exclusive() {
        let store = MemoryStore::new();
        let tq = queue(&store);
        tq.add(&json!({"job": 1}), TaskOptions::default()).await.unwrap();

        // Another process holds the pull guard.
        store
            .set_if_absent(&keys::tq_pull_lock_key("test"), "other", Some(5))
            .await
            .unwrap();
        assert!(tq.pull(10).await.unwrap().is_empty());
        assert!(ThrottleQueue::has(&*store, "test").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_removes_scheduled_task() {
        let store = MemoryStore::new();
        let tq = queue(&store);
        let signature = tq
            .add(&json!({"job": "doomed"}), TaskOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert!(tq.cancel(&signature).await.unwrap());
        assert!(!tq.cancel(&signature).await.unwrap());
        assert!(tq.pull(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_count_limits_delivery() {
        let store = MemoryStore::new();
        let tq = queue(&store);
        for i in 0..3 {
            tq.add(&json!({ "job": i }), TaskOptions::default()).await.unwrap();
        }

        assert_eq!(tq.pull(2).await.unwrap().len(), 2);
        assert_eq!(tq.pull(2).await.unwrap().len(), 1);
        assert!(matches!(
            tq.pull(0).await,
            Err(CoordinationError::InvalidCount { count: 0 })
        ));
    }

    #[tokio::test]
    async fn test_worker_dispatches_due_tasks() {
        let store = MemoryStore::new();
        let tq = queue(&store);
        tq.add(&json!({"job": "bg"}), TaskOptions::default()).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tq.start(
            move |task| {
                let tx = tx.clone();
                async move {
                    tx.send(task.data).ok();
                    Ok(())
                }
            },
            1,
            1,
        );

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("worker did not dispatch in time")
            .expect("channel closed");
        assert_eq!(received, json!({"job": "bg"}));
        tq.stop();
    }

    #[tokio::test]
    async fn test_worker_reports_handler_errors() {
        let store = MemoryStore::new();
        let tq = queue(&store);
        tq.add(&json!({"job": "bad"}), TaskOptions::default()).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tq.start_with_on_error(
            |_task| async { Err(anyhow::anyhow!("handler boom")) },
            move |error| {
                tx.send(error.to_string()).ok();
            },
            1,
            1,
        );

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("error not reported in time")
            .expect("channel closed");
        assert!(message.contains("handler boom"));
        tq.stop();
    }
}
