//! Cross-process coordination primitives built on an atomic key-value store.
//!
//! Every primitive hangs off a [`Coordinator`], which owns one backing store
//! connection plus the per-connection pub/sub registry:
//!
//! - [`Lock`] - Mutual exclusion with fencing-token release
//! - [`MessageQueue`] - Topic broadcast with pre-subscription buffering
//! - [`Queue`] - Serialized task execution per logical key
//! - [`Throttle`] - Single-flight execution with cached replay
//! - [`ThrottleQueue`] - Deduplicated, time-ordered task scheduling
//!
//! All of them reduce to the [`alder_store::CoordinationStore`] trait's
//! atomic operations, so any linearizable store implementation works.
//!
//! ## Lock Example
//!
//! ```ignore
//! use alder_coordination::Coordinator;
//!
//! let coordinator = Coordinator::new(store);
//! let lock = coordinator.lock("report-builder");
//!
//! if lock.acquire(30).await? {
//!     // Critical section; the lock expires on its own after 30s if this
//!     // process dies without releasing it.
//!     lock.release().await?;
//! }
//! ```
//!
//! ## Throttle Example
//!
//! ```ignore
//! let throttle = coordinator.throttle("daily-digest").await?;
//!
//! // At most one process runs this per 60s window; the rest get the
//! // leader's cached outcome.
//! let digest: Digest = throttle.run_with_ttl(60, || build_digest()).await?;
//! ```

mod coordinator;
mod error;
mod keys;
mod lock;
mod message_queue;
mod queue;
mod registry;
mod throttle;
mod throttle_queue;
mod types;

pub use coordinator::Coordinator;
pub use error::CoordinationError;
pub use lock::FencedLock;
pub use lock::Lock;
pub use message_queue::ListenerId;
pub use message_queue::MessageQueue;
pub use queue::DEFAULT_TASK_TTL_SECS;
pub use queue::Queue;
pub use throttle::DEFAULT_WINDOW_SECS;
pub use throttle::Throttle;
pub use throttle_queue::DEFAULT_LOOKBACK_SECS;
pub use throttle_queue::ScheduledTask;
pub use throttle_queue::TaskOptions;
pub use throttle_queue::ThrottleQueue;
pub use throttle_queue::ThrottleQueueConfig;
