//! Distributed mutual exclusion with timeout-based recovery.
//!
//! [`Lock`] is the caller-facing primitive: atomic create-if-absent with an
//! optional TTL so a crashed holder's lock recovers on its own. [`FencedLock`]
//! is the variant Queue and Throttle build on: it remembers the exact token
//! it wrote and releases only while that token is still stored, so a holder
//! that overran its TTL cannot delete a lock re-acquired by someone else.

use std::sync::Arc;

use alder_store::CoordinationStore;

use crate::error::CoordinationError;
use crate::keys;
use crate::types::TokenSource;

/// Distributed lock bound to one logical key.
///
/// No retry policy lives here: a failed acquire is a normal `false` and
/// store errors propagate; callers decide whether and when to try again.
pub struct Lock<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    key: String,
    tokens: Arc<TokenSource>,
}

impl<S: CoordinationStore + ?Sized> Lock<S> {
    pub(crate) fn new(store: Arc<S>, logical_key: &str, tokens: Arc<TokenSource>) -> Self {
        Self {
            store,
            key: keys::lock_key(logical_key),
            tokens,
        }
    }

    /// Try to acquire the lock. Returns true iff this call created it.
    ///
    /// With `ttl > 0` the lock auto-expires after `ttl` seconds, which is
    /// the sole recovery path from a crashed holder. `ttl = 0` means the
    /// lock lives until released.
    pub async fn acquire(&self, ttl: u64) -> Result<bool, CoordinationError> {
        let token = self.tokens.next_token();
        let ttl = (ttl > 0).then_some(ttl);
        Ok(self.store.set_if_absent(&self.key, &token, ttl).await?)
    }

    /// Release the lock unconditionally.
    ///
    /// Trusts that only the current holder calls this inside its own
    /// critical section; use [`FencedLock`] when that cannot be trusted.
    pub async fn release(&self) -> Result<(), CoordinationError> {
        self.store.delete(&self.key).await?;
        Ok(())
    }

    /// Whether a lock currently exists for `logical_key`.
    pub async fn held(store: &S, logical_key: &str) -> Result<bool, CoordinationError> {
        Ok(store.exists(&keys::lock_key(logical_key)).await?)
    }
}

/// Lock that releases only while it still owns the stored token.
pub struct FencedLock<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    key: String,
    token: Option<String>,
}

impl<S: CoordinationStore + ?Sized> FencedLock<S> {
    /// Create a fenced lock over an already-derived store key.
    pub fn new(store: Arc<S>, key: String) -> Self {
        Self {
            store,
            key,
            token: None,
        }
    }

    /// Try to acquire, writing a call-unique token. Returns true on success.
    pub async fn acquire(
        &mut self,
        tokens: &TokenSource,
        ttl: Option<u64>,
    ) -> Result<bool, CoordinationError> {
        let token = tokens.next_token();
        let acquired = self.store.set_if_absent(&self.key, &token, ttl).await?;
        if acquired {
            self.token = Some(token);
        }
        Ok(acquired)
    }

    /// Release only if the stored token still matches what this holder
    /// wrote. Returns true iff the lock was actually deleted; false means a
    /// later holder force-reclaimed it after this holder's TTL lapsed, and
    /// the release is skipped.
    pub async fn release_if_held(&mut self) -> Result<bool, CoordinationError> {
        let Some(token) = self.token.take() else {
            return Ok(false);
        };
        Ok(self.store.compare_and_delete(&self.key, &token).await?)
    }
}

#[cfg(test)]
mod tests {
    use alder_store::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn test_mutual_exclusion_and_release() {
        let store = MemoryStore::new();
        let tokens = Arc::new(TokenSource::new());
        let lock = Lock::new(store.clone(), "job", Arc::clone(&tokens));

        assert!(lock.acquire(0).await.unwrap());
        assert!(!lock.acquire(0).await.unwrap());
        assert!(Lock::held(&*store, "job").await.unwrap());

        lock.release().await.unwrap();
        assert!(!Lock::held(&*store, "job").await.unwrap());
        assert!(lock.acquire(0).await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_recovers_crashed_holder() {
        let store = MemoryStore::new();
        let tokens = Arc::new(TokenSource::new());
        let lock = Lock::new(store.clone(), "job", tokens);

        assert!(lock.acquire(1).await.unwrap());
        assert!(!lock.acquire(0).await.unwrap());

        // Holder never releases; TTL expiry is the recovery path.
        store.advance(std::time::Duration::from_secs(2));
        assert!(lock.acquire(0).await.unwrap());
    }

    #[tokio::test]
    async fn test_fenced_release_skips_later_holder() {
        let store = MemoryStore::new();
        let tokens = TokenSource::new();
        let key = keys::queue_lock_key("job");

        let mut first = FencedLock::new(store.clone(), key.clone());
        assert!(first.acquire(&tokens, Some(1)).await.unwrap());

        // First holder overruns its TTL; a second holder takes over.
        store.advance(std::time::Duration::from_secs(2));
        let mut second = FencedLock::new(store.clone(), key.clone());
        assert!(second.acquire(&tokens, Some(30)).await.unwrap());

        // The stale holder must not delete the new holder's lock.
        assert!(!first.release_if_held().await.unwrap());
        assert!(store.exists(&key).await.unwrap());

        assert!(second.release_if_held().await.unwrap());
        assert!(!store.exists(&key).await.unwrap());
    }
}
