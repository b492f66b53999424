//! PersistenceAdapter port - durable key/value storage scoped to the client.
//!
//! Two uses:
//! - remember the in-flight job id per feature key, so a reload can resume;
//! - broadcast a content-free completion timestamp so sibling contexts re-fetch.
//!
//! # 設計原則
//! - Last writer wins per key; no ordering across keys.
//! - "External" changes are those made by another execution context. A
//!   context never sees its own writes on its feed.

use std::fmt;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::domain::JobId;

/// Identity of one execution context (one tab, one process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Ulid);

impl ContextId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// A key changed; `value` is `None` when it was cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub value: Option<String>,
}

/// A change together with the context that made it.
#[derive(Debug, Clone)]
pub struct StorageEvent {
    pub origin: ContextId,
    pub change: StorageChange,
}

/// Stream of changes made by *other* contexts.
pub struct ChangeFeed {
    rx: broadcast::Receiver<StorageEvent>,
    own: ContextId,
}

impl ChangeFeed {
    pub fn new(rx: broadcast::Receiver<StorageEvent>, own: ContextId) -> Self {
        Self { rx, own }
    }

    /// Next external change, or `None` once the storage is gone.
    pub async fn recv(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin == self.own => continue,
                Ok(event) => return Some(event.change),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "storage change feed lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Durable key/value storage.
///
/// The tracker only reads and writes keys; it never owns the storage lifecycle.
pub trait PersistenceAdapter: Send + Sync {
    fn set(&self, key: &str, value: &str);

    fn get(&self, key: &str) -> Option<String>;

    fn clear(&self, key: &str);

    fn external_changes(&self) -> ChangeFeed;

    fn set_job(&self, key: &str, job_id: &JobId) {
        self.set(key, job_id.as_str());
    }

    fn get_job(&self, key: &str) -> Option<JobId> {
        self.get(key)
            .filter(|raw| !raw.trim().is_empty())
            .map(JobId::new)
    }
}

/// Stops delivering external changes when dropped.
pub struct WatchGuard {
    handle: JoinHandle<()>,
}

impl WatchGuard {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Invoke `callback` whenever another context changes `key`.
///
/// Must be called from within a tokio runtime.
pub fn on_external_change<F>(
    adapter: &dyn PersistenceAdapter,
    key: impl Into<String>,
    mut callback: F,
) -> WatchGuard
where
    F: FnMut(Option<String>) + Send + 'static,
{
    let key = key.into();
    let mut feed = adapter.external_changes();
    let handle = tokio::spawn(async move {
        while let Some(change) = feed.recv().await {
            if change.key == key {
                callback(change.value);
            }
        }
    });
    WatchGuard::new(handle)
}
