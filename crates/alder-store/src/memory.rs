//! Deterministic in-memory store for tests and development.
//!
//! Implements the full [`CoordinationStore`] surface with predictable
//! behavior: lazy TTL expiry, typed entries (string / sorted set / hash) and
//! a pub/sub hub shared between the primary handle and every duplicated
//! subscriber connection. Subscription confirmations flow through the
//! subscriber's event stream, like a real server acknowledgement, and can be
//! held back with [`MemoryStore::hold_subscribe_acks`] to exercise the
//! publish-before-ready paths deterministically.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::command::StoreCommand;
use crate::command::StoreReply;
use crate::error::StoreError;
use crate::traits::CoordinationStore;
use crate::traits::SubscriberConnection;
use crate::traits::SubscriberEvent;

/// A stored value, typed like the store's key kinds.
#[derive(Debug, Clone)]
enum Stored {
    Str(String),
    Zset(BTreeMap<String, u64>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    /// Absolute expiry deadline; `None` means the entry never expires.
    deadline: Option<Instant>,
}

/// State of one subscriber connection inside the hub.
struct SubState {
    tx: mpsc::UnboundedSender<SubscriberEvent>,
    /// Topics whose subscription has been confirmed.
    active: HashSet<String>,
    /// Topics subscribed but whose confirmation is being held back.
    pending: HashSet<String>,
}

/// Pub/sub hub shared by the primary handle and all duplicated subscribers.
#[derive(Default)]
struct Hub {
    subs: Mutex<HashMap<u64, SubState>>,
    next_id: AtomicU64,
    hold_acks: AtomicBool,
    held: Mutex<Vec<(u64, String)>>,
}

struct Shared {
    data: Mutex<HashMap<String, Entry>>,
    hub: Hub,
    closed: AtomicBool,
    /// Artificial clock skew in milliseconds, added to the perceived "now"
    /// for TTL expiry. See [`MemoryStore::advance`].
    skew_ms: AtomicU64,
}

impl Shared {
    fn now(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.skew_ms.load(Ordering::Relaxed))
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

/// Thread-safe in-memory implementation of [`CoordinationStore`].
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                data: Mutex::new(HashMap::new()),
                hub: Hub::default(),
                closed: AtomicBool::new(false),
                skew_ms: AtomicU64::new(0),
            }),
        }
    }
}

impl MemoryStore {
    /// Create a new store wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Advance the store's perceived time, expiring entries whose TTL has
    /// elapsed without waiting on the wall clock.
    pub fn advance(&self, duration: Duration) {
        self.shared
            .skew_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Hold back subscription confirmations until
    /// [`release_subscribe_acks`](Self::release_subscribe_acks) is called.
    ///
    /// While held, subscribed topics accept no messages and
    /// `subscriber_count` does not report them.
    pub fn hold_subscribe_acks(&self) {
        self.shared.hub.hold_acks.store(true, Ordering::SeqCst);
    }

    /// Deliver every held subscription confirmation, in subscribe order.
    pub fn release_subscribe_acks(&self) {
        self.shared.hub.hold_acks.store(false, Ordering::SeqCst);
        let held: Vec<(u64, String)> = {
            let mut held = self.shared.hub.held.lock().unwrap();
            held.drain(..).collect()
        };
        let mut subs = self.shared.hub.subs.lock().unwrap();
        for (id, topic) in held {
            if let Some(sub) = subs.get_mut(&id)
                && sub.pending.remove(&topic)
            {
                sub.active.insert(topic.clone());
                let _ = sub.tx.send(SubscriberEvent::Subscribed { topic });
            }
        }
    }

    /// Fetch a live entry, discarding it first when its TTL has elapsed.
    fn live<'a>(
        data: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        let expired = data
            .get(key)
            .is_some_and(|entry| entry.deadline.is_some_and(|d| now >= d));
        if expired {
            data.remove(key);
        }
        data.get_mut(key)
    }

    fn deadline(&self, ttl_seconds: Option<u64>) -> Option<Instant> {
        ttl_seconds.map(|ttl| self.shared.now() + Duration::from_secs(ttl))
    }

    /// Apply one command against the locked data map.
    ///
    /// Both the single-command trait methods and `batch` funnel through
    /// here, which is what makes batches atomic: the map stays locked for
    /// the whole batch.
    fn apply(
        &self,
        data: &mut HashMap<String, Entry>,
        now: Instant,
        command: &StoreCommand,
    ) -> Result<StoreReply, StoreError> {
        match command {
            StoreCommand::Set {
                key,
                value,
                ttl_seconds,
            } => {
                data.insert(key.clone(), Entry {
                    value: Stored::Str(value.clone()),
                    deadline: self.deadline(*ttl_seconds),
                });
                Ok(StoreReply::Unit)
            }
            StoreCommand::SetIfAbsent {
                key,
                value,
                ttl_seconds,
            } => {
                if Self::live(data, key, now).is_some() {
                    return Ok(StoreReply::Bool(false));
                }
                data.insert(key.clone(), Entry {
                    value: Stored::Str(value.clone()),
                    deadline: self.deadline(*ttl_seconds),
                });
                Ok(StoreReply::Bool(true))
            }
            StoreCommand::Get { key } => match Self::live(data, key, now) {
                None => Ok(StoreReply::Value(None)),
                Some(entry) => match &entry.value {
                    Stored::Str(s) => Ok(StoreReply::Value(Some(s.clone()))),
                    _ => Err(StoreError::WrongType { key: key.clone() }),
                },
            },
            StoreCommand::Delete { key } => {
                let existed = Self::live(data, key, now).is_some();
                if existed {
                    data.remove(key);
                }
                Ok(StoreReply::Bool(existed))
            }
            StoreCommand::CompareAndDelete { key, expected } => {
                let matches = match Self::live(data, key, now) {
                    Some(entry) => match &entry.value {
                        Stored::Str(s) => s == expected,
                        _ => return Err(StoreError::WrongType { key: key.clone() }),
                    },
                    None => false,
                };
                if matches {
                    data.remove(key);
                }
                Ok(StoreReply::Bool(matches))
            }
            StoreCommand::Expire { key, ttl_seconds } => {
                let deadline = self.deadline(Some(*ttl_seconds));
                match Self::live(data, key, now) {
                    Some(entry) => {
                        entry.deadline = deadline;
                        Ok(StoreReply::Bool(true))
                    }
                    None => Ok(StoreReply::Bool(false)),
                }
            }
            StoreCommand::SortedSetAdd {
                set,
                score,
                member,
                only_if_absent,
            } => {
                // Purge an expired entry so the set is recreated fresh.
                let _ = Self::live(data, set, now);
                let entry = data.entry(set.clone()).or_insert_with(|| Entry {
                    value: Stored::Zset(BTreeMap::new()),
                    deadline: None,
                });
                let Stored::Zset(members) = &mut entry.value else {
                    return Err(StoreError::WrongType { key: set.clone() });
                };
                if members.contains_key(member) {
                    if !only_if_absent {
                        members.insert(member.clone(), *score);
                    }
                    Ok(StoreReply::Bool(false))
                } else {
                    members.insert(member.clone(), *score);
                    Ok(StoreReply::Bool(true))
                }
            }
            StoreCommand::SortedSetRemove { set, members } => {
                let mut removed = 0u64;
                if let Some(entry) = Self::live(data, set, now) {
                    let Stored::Zset(existing) = &mut entry.value else {
                        return Err(StoreError::WrongType { key: set.clone() });
                    };
                    for member in members {
                        if existing.remove(member).is_some() {
                            removed += 1;
                        }
                    }
                    if existing.is_empty() {
                        data.remove(set);
                    }
                }
                Ok(StoreReply::Count(removed))
            }
            StoreCommand::HashSet { map, field, value } => {
                let _ = Self::live(data, map, now);
                let entry = data.entry(map.clone()).or_insert_with(|| Entry {
                    value: Stored::Hash(HashMap::new()),
                    deadline: None,
                });
                let Stored::Hash(fields) = &mut entry.value else {
                    return Err(StoreError::WrongType { key: map.clone() });
                };
                Ok(StoreReply::Bool(fields.insert(field.clone(), value.clone()).is_none()))
            }
            StoreCommand::HashDelete { map, field } => {
                let mut removed = false;
                if let Some(entry) = Self::live(data, map, now) {
                    let Stored::Hash(fields) = &mut entry.value else {
                        return Err(StoreError::WrongType { key: map.clone() });
                    };
                    removed = fields.remove(field).is_some();
                    if fields.is_empty() {
                        data.remove(map);
                    }
                }
                Ok(StoreReply::Bool(removed))
            }
        }
    }

    fn apply_one(&self, command: StoreCommand) -> Result<StoreReply, StoreError> {
        self.shared.check_open()?;
        let now = self.shared.now();
        let mut data = self.shared.data.lock().unwrap();
        self.apply(&mut data, now, &command)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<(), StoreError> {
        self.apply_one(StoreCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl_seconds,
        })
        .map(|_| ())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<bool, StoreError> {
        self.apply_one(StoreCommand::SetIfAbsent {
            key: key.to_string(),
            value: value.to_string(),
            ttl_seconds,
        })
        .map(|r| r.as_bool())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.apply_one(StoreCommand::Get { key: key.to_string() })
            .map(|r| r.as_value().map(str::to_string))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.apply_one(StoreCommand::Delete { key: key.to_string() })
            .map(|r| r.as_bool())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.apply_one(StoreCommand::CompareAndDelete {
            key: key.to_string(),
            expected: expected.to_string(),
        })
        .map(|r| r.as_bool())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.shared.check_open()?;
        let now = self.shared.now();
        let mut data = self.shared.data.lock().unwrap();
        Ok(Self::live(&mut data, key, now).is_some())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, StoreError> {
        self.apply_one(StoreCommand::Expire {
            key: key.to_string(),
            ttl_seconds,
        })
        .map(|r| r.as_bool())
    }

    async fn sorted_set_add(
        &self,
        set: &str,
        score: u64,
        member: &str,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        self.apply_one(StoreCommand::SortedSetAdd {
            set: set.to_string(),
            score,
            member: member.to_string(),
            only_if_absent,
        })
        .map(|r| r.as_bool())
    }

    async fn sorted_set_range_by_score(
        &self,
        set: &str,
        min_exclusive: Option<u64>,
        max_inclusive: u64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        self.shared.check_open()?;
        let now = self.shared.now();
        let mut data = self.shared.data.lock().unwrap();
        let Some(entry) = Self::live(&mut data, set, now) else {
            return Ok(Vec::new());
        };
        let Stored::Zset(members) = &entry.value else {
            return Err(StoreError::WrongType { key: set.to_string() });
        };
        let mut scored: Vec<(u64, &String)> = members
            .iter()
            .filter(|(_, score)| {
                **score <= max_inclusive && min_exclusive.is_none_or(|min| **score > min)
            })
            .map(|(member, score)| (*score, member))
            .collect();
        scored.sort();
        let limit = limit.unwrap_or(usize::MAX);
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn sorted_set_remove(&self, set: &str, members: &[String]) -> Result<u64, StoreError> {
        self.apply_one(StoreCommand::SortedSetRemove {
            set: set.to_string(),
            members: members.to_vec(),
        })
        .map(|r| match r {
            StoreReply::Count(n) => n,
            _ => 0,
        })
    }

    async fn hash_get(&self, map: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.shared.check_open()?;
        let now = self.shared.now();
        let mut data = self.shared.data.lock().unwrap();
        let Some(entry) = Self::live(&mut data, map, now) else {
            return Ok(None);
        };
        let Stored::Hash(fields) = &entry.value else {
            return Err(StoreError::WrongType { key: map.to_string() });
        };
        Ok(fields.get(field).cloned())
    }

    async fn hash_set(&self, map: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        self.apply_one(StoreCommand::HashSet {
            map: map.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        })
        .map(|r| r.as_bool())
    }

    async fn hash_delete(&self, map: &str, field: &str) -> Result<bool, StoreError> {
        self.apply_one(StoreCommand::HashDelete {
            map: map.to_string(),
            field: field.to_string(),
        })
        .map(|r| r.as_bool())
    }

    async fn batch(&self, commands: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError> {
        self.shared.check_open()?;
        let now = self.shared.now();
        let mut data = self.shared.data.lock().unwrap();
        let mut replies = Vec::with_capacity(commands.len());
        for command in &commands {
            replies.push(self.apply(&mut data, now, command)?);
        }
        Ok(replies)
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<u64, StoreError> {
        self.shared.check_open()?;
        let subs = self.shared.hub.subs.lock().unwrap();
        let mut receivers = 0u64;
        for sub in subs.values() {
            if sub.active.contains(topic) {
                let _ = sub.tx.send(SubscriberEvent::Message {
                    topic: topic.to_string(),
                    payload: message.to_string(),
                });
                receivers += 1;
            }
        }
        Ok(receivers)
    }

    async fn subscriber_count(&self, topic: &str) -> Result<u64, StoreError> {
        self.shared.check_open()?;
        let subs = self.shared.hub.subs.lock().unwrap();
        Ok(subs.values().filter(|s| s.active.contains(topic)).count() as u64)
    }

    async fn duplicate(&self) -> Result<Arc<dyn SubscriberConnection>, StoreError> {
        self.shared.check_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.hub.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.hub.subs.lock().unwrap().insert(id, SubState {
            tx,
            active: HashSet::new(),
            pending: HashSet::new(),
        });
        Ok(Arc::new(MemorySubscriber {
            id,
            shared: Arc::clone(&self.shared),
            rx: tokio::sync::Mutex::new(rx),
        }))
    }

    async fn quit(&self) -> Result<(), StoreError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Subscriber connection handed out by [`MemoryStore::duplicate`].
pub struct MemorySubscriber {
    id: u64,
    shared: Arc<Shared>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SubscriberEvent>>,
}

#[async_trait]
impl SubscriberConnection for MemorySubscriber {
    async fn subscribe(&self, topic: &str) -> Result<(), StoreError> {
        let hold = self.shared.hub.hold_acks.load(Ordering::SeqCst);
        let mut subs = self.shared.hub.subs.lock().unwrap();
        let Some(sub) = subs.get_mut(&self.id) else {
            return Err(StoreError::Closed);
        };
        if hold {
            sub.pending.insert(topic.to_string());
            self.shared
                .hub
                .held
                .lock()
                .unwrap()
                .push((self.id, topic.to_string()));
        } else {
            sub.active.insert(topic.to_string());
            let _ = sub.tx.send(SubscriberEvent::Subscribed {
                topic: topic.to_string(),
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), StoreError> {
        let mut subs = self.shared.hub.subs.lock().unwrap();
        if let Some(sub) = subs.get_mut(&self.id) {
            sub.active.remove(topic);
            sub.pending.remove(topic);
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<SubscriberEvent> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.shared.hub.subs.lock().unwrap().remove(&self.id);
    }
}
