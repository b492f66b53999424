//! SharedStorage - in-process storage shared by several execution contexts.
//!
//! Models one browser profile with several tabs: every `ContextStorage` handed
//! out by `SharedStorage::context` sees the same values, and each one is told
//! about writes made through the others.
//!
//! # 実装詳細
//! - `Mutex<HashMap>` で値を保持
//! - `broadcast` で変更を全コンテキストへ通知（自分の書き込みは ChangeFeed 側で除外）

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::ports::{ChangeFeed, ContextId, PersistenceAdapter, StorageChange, StorageEvent};

const FEED_CAPACITY: usize = 64;

struct Shared {
    values: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<StorageEvent>,
}

/// Backing store; hand out one [`ContextStorage`] per context.
#[derive(Clone)]
pub struct SharedStorage {
    shared: Arc<Shared>,
}

impl SharedStorage {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                values: Mutex::new(HashMap::new()),
                changes,
            }),
        }
    }

    /// A new execution context over the same values.
    pub fn context(&self) -> ContextStorage {
        ContextStorage {
            shared: self.shared.clone(),
            origin: ContextId::generate(),
        }
    }
}

impl Default for SharedStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// One context's view of a [`SharedStorage`].
pub struct ContextStorage {
    shared: Arc<Shared>,
    origin: ContextId,
}

impl ContextStorage {
    pub fn origin(&self) -> ContextId {
        self.origin
    }

    fn publish(&self, key: &str, value: Option<String>) {
        let event = StorageEvent {
            origin: self.origin,
            change: StorageChange {
                key: key.to_string(),
                value,
            },
        };
        // No receivers is fine: nobody is listening yet.
        let _ = self.shared.changes.send(event);
    }
}

impl PersistenceAdapter for ContextStorage {
    fn set(&self, key: &str, value: &str) {
        {
            let mut values = self.shared.values.lock().unwrap_or_else(|e| e.into_inner());
            values.insert(key.to_string(), value.to_string());
        }
        tracing::trace!(context = %self.origin, key, "storage set");
        self.publish(key, Some(value.to_string()));
    }

    fn get(&self, key: &str) -> Option<String> {
        let values = self.shared.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn clear(&self, key: &str) {
        let removed = {
            let mut values = self.shared.values.lock().unwrap_or_else(|e| e.into_inner());
            values.remove(key).is_some()
        };
        if removed {
            tracing::trace!(context = %self.origin, key, "storage cleared");
            self.publish(key, None);
        }
    }

    fn external_changes(&self) -> ChangeFeed {
        ChangeFeed::new(self.shared.changes.subscribe(), self.origin)
    }
}
