//! Completion broadcast.
//!
//! When a job finishes, a timestamp is written under a shared key. The value
//! carries no information; sibling contexts only use the change as a cue to
//! re-fetch their own lists.

use crate::ports::{Clock, PersistenceAdapter};

pub const DEFAULT_COMPLETION_KEY: &str = "jobsync.last_completed_at";

/// Write the current time (epoch millis) under `key` and return it.
pub fn announce(storage: &dyn PersistenceAdapter, clock: &dyn Clock, key: &str) -> i64 {
    let at = clock.now().timestamp_millis();
    storage.set(key, &at.to_string());
    tracing::debug!(key, at, "completion broadcast");
    at
}
