//! Command and reply types for atomic multi-command execution.

use serde::Deserialize;
use serde::Serialize;

/// A single command inside a [`batch`](crate::CoordinationStore::batch).
///
/// The whole batch executes as one atomic unit: no other client observes an
/// intermediate state between the first and the last command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreCommand {
    /// Set a key, optionally with a TTL in seconds.
    Set {
        key: String,
        value: String,
        ttl_seconds: Option<u64>,
    },
    /// Set a key only if it does not exist, optionally with a TTL.
    SetIfAbsent {
        key: String,
        value: String,
        ttl_seconds: Option<u64>,
    },
    /// Read a key.
    Get { key: String },
    /// Delete a key.
    Delete { key: String },
    /// Delete a key only if its current value equals `expected`.
    CompareAndDelete { key: String, expected: String },
    /// Set a TTL on an existing key.
    Expire { key: String, ttl_seconds: u64 },
    /// Add a member to a sorted set with the given score.
    ///
    /// With `only_if_absent`, an existing member keeps its current score.
    SortedSetAdd {
        set: String,
        score: u64,
        member: String,
        only_if_absent: bool,
    },
    /// Remove members from a sorted set.
    SortedSetRemove { set: String, members: Vec<String> },
    /// Set a field in a hash map.
    HashSet {
        map: String,
        field: String,
        value: String,
    },
    /// Delete a field from a hash map.
    HashDelete { map: String, field: String },
}

/// Reply to a single command in a batch, positionally matched to the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreReply {
    /// Command completed with nothing to report (`Set`).
    Unit,
    /// Boolean outcome (`SetIfAbsent`, `Delete`, `CompareAndDelete`,
    /// `Expire`, `SortedSetAdd`, `HashSet`, `HashDelete`).
    Bool(bool),
    /// Value read by `Get`, `None` when the key is absent.
    Value(Option<String>),
    /// Number of affected members (`SortedSetRemove`).
    Count(u64),
}

impl StoreReply {
    /// Interpret this reply as a boolean, defaulting to `false`.
    pub fn as_bool(&self) -> bool {
        match self {
            StoreReply::Bool(b) => *b,
            StoreReply::Count(n) => *n > 0,
            _ => false,
        }
    }

    /// Interpret this reply as an optional value.
    pub fn as_value(&self) -> Option<&str> {
        match self {
            StoreReply::Value(v) => v.as_deref(),
            _ => None,
        }
    }
}
