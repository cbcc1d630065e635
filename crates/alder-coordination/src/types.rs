//! Shared types for coordination primitives.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Extra seconds added to cache/window TTLs so a process whose clock lags
/// slightly still observes the cache rather than recomputing.
pub const CLOCK_SKEW_EPSILON_SECS: u64 = 5;

/// Get the current Unix timestamp in seconds.
///
/// Returns 0 if system time is before the UNIX epoch (should never happen on
/// properly configured systems, but prevents panics).
#[inline]
pub fn now_unix_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Generator of source/call-unique fencing tokens.
///
/// A token is a random per-source prefix plus a monotonic counter, so two
/// sources (in the same process or different ones) never write the same lock
/// value. The holder later proves ownership by compare-and-delete against
/// the exact token it wrote.
#[derive(Debug)]
pub struct TokenSource {
    prefix: u64,
    counter: AtomicU64,
}

impl Default for TokenSource {
    fn default() -> Self {
        Self {
            prefix: rand::random(),
            counter: AtomicU64::new(0),
        }
    }
}

impl TokenSource {
    /// Create a new token source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next unique token.
    pub fn next_token(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}-{seq}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let source = TokenSource::new();
        let a = source.next_token();
        let b = source.next_token();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tokens_differ_across_sources() {
        // Two independent sources must never replay each other's token
        // sequence, or a stale holder could delete another holder's lock.
        let a = TokenSource::new();
        let b = TokenSource::new();
        assert_ne!(a.next_token(), b.next_token());
        assert_ne!(a.next_token(), b.next_token());
    }

    #[test]
    fn test_now_unix_secs_reasonable() {
        // 2020-01-01 as a floor.
        assert!(now_unix_secs() > 1_577_836_800);
    }
}
