//! Store abstraction consumed by the alder coordination layer.
//!
//! The coordination primitives never talk to a concrete server; they are
//! written against [`CoordinationStore`], a small surface of primitive atomic
//! operations: conditional set with expiry, sorted sets with score-range
//! queries, hash maps, atomic multi-command batches and publish/subscribe.
//!
//! [`MemoryStore`] is a deterministic in-memory implementation used by tests
//! and local development. A networked backend only needs to map each trait
//! method onto the equivalent server command.

mod command;
mod error;
mod memory;
mod traits;

pub use command::StoreCommand;
pub use command::StoreReply;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use memory::MemorySubscriber;
pub use traits::CoordinationStore;
pub use traits::SubscriberConnection;
pub use traits::SubscriberEvent;
