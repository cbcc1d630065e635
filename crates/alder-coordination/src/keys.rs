//! Store key derivation.
//!
//! Each primitive namespaces its derived keys with a fixed prefix
//! concatenated with the logical key, so primitives sharing one logical key
//! never collide in the store.

/// Lock key for [`Lock`](crate::Lock).
pub fn lock_key(key: &str) -> String {
    format!("__lock:{key}")
}

/// Serialization lock for [`Queue`](crate::Queue).
pub fn queue_lock_key(key: &str) -> String {
    format!("__queue:lock:{key}")
}

/// Wake-up topic shared by every queue on one connection; the payload is the
/// logical key whose pending list should be advanced.
pub const QUEUE_WAKE_TOPIC: &str = "__queue:wake";

/// Throttle window key holding the last-active timestamp.
pub fn throttle_window_key(key: &str) -> String {
    format!("__throttle:win:{key}")
}

/// Throttle fencing-lock key deciding the window leader.
pub fn throttle_lock_key(key: &str) -> String {
    format!("__throttle:lock:{key}")
}

/// Throttle result-cache key.
pub fn throttle_cache_key(key: &str) -> String {
    format!("__throttle:cache:{key}")
}

/// Broadcast topic for a throttle's window results.
pub fn throttle_topic(key: &str) -> String {
    format!("__throttle:msg:{key}")
}

/// Time-ordered index (sorted set) of a throttle queue.
pub fn tq_index_key(key: &str) -> String {
    format!("__tq:index:{key}")
}

/// Payload map (hash) of a throttle queue, keyed by signature.
pub fn tq_tasks_key(key: &str) -> String {
    format!("__tq:tasks:{key}")
}

/// Global pull lock of a throttle queue.
pub fn tq_pull_lock_key(key: &str) -> String {
    format!("__tq:lock:{key}")
}

/// Per-signature push lock of a throttle queue.
pub fn tq_push_lock_key(key: &str, signature: &str) -> String {
    format!("__tq:lock:{key}:{signature}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes_do_not_collide() {
        let keys = [
            lock_key("k"),
            queue_lock_key("k"),
            throttle_window_key("k"),
            throttle_lock_key("k"),
            throttle_cache_key("k"),
            tq_index_key("k"),
            tq_tasks_key("k"),
            tq_pull_lock_key("k"),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
