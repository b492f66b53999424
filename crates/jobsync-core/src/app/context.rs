//! TrackingContext - 明示的なコンテキストオブジェクト
//!
//! Everything a tracker or coordinator needs from its surroundings, passed in
//! explicitly instead of read from module-level state.
//!
//! # Fail-fast 設計
//! - `build()` checks that every required collaborator was provided
//! - missing ones are reported together in one `BuildError`

use std::sync::Arc;

use super::completion::{self, DEFAULT_COMPLETION_KEY};
use super::session::SessionReader;
use super::subscription::SubscriptionRegistry;
use crate::ports::{Clock, EventSource, JobApi, PersistenceAdapter, SystemClock};

/// Shared collaborators. Cheap to clone; clones share the subscription registry.
#[derive(Clone)]
pub struct TrackingContext {
    api: Arc<dyn JobApi>,
    storage: Arc<dyn PersistenceAdapter>,
    registry: SubscriptionRegistry,
    clock: Arc<dyn Clock>,
    completion_key: String,
    session: SessionReader,
}

impl TrackingContext {
    pub fn builder() -> TrackingContextBuilder {
        TrackingContextBuilder::new()
    }

    pub fn api(&self) -> &dyn JobApi {
        self.api.as_ref()
    }

    pub fn storage(&self) -> &dyn PersistenceAdapter {
        self.storage.as_ref()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn completion_key(&self) -> &str {
        &self.completion_key
    }

    pub fn session(&self) -> &SessionReader {
        &self.session
    }

    /// Broadcast that a job finished. Returns the written timestamp.
    pub fn announce_completion(&self) -> i64 {
        completion::announce(self.storage(), self.clock(), &self.completion_key)
    }
}

/// BuildError はコンテキスト構築時のエラー
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("Missing collaborators: {0:?}. These must be provided before build().")]
    MissingCollaborators(Vec<&'static str>),

    #[error("completion key must not be empty")]
    EmptyCompletionKey,
}

/// # 使用例
/// ```ignore
/// let backend = Arc::new(InMemoryBackend::new());
/// let ctx = TrackingContext::builder()
///     .backend(backend)
///     .storage(Arc::new(SharedStorage::new().context()))
///     .build()?;
/// ```
#[derive(Default)]
pub struct TrackingContextBuilder {
    api: Option<Arc<dyn JobApi>>,
    events: Option<Arc<dyn EventSource>>,
    registry: Option<SubscriptionRegistry>,
    storage: Option<Arc<dyn PersistenceAdapter>>,
    clock: Option<Arc<dyn Clock>>,
    completion_key: Option<String>,
    session: Option<SessionReader>,
}

impl TrackingContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api(mut self, api: Arc<dyn JobApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn event_source(mut self, events: Arc<dyn EventSource>) -> Self {
        self.events = Some(events);
        self
    }

    /// Use one backend for both requests and push updates.
    pub fn backend<B>(self, backend: Arc<B>) -> Self
    where
        B: JobApi + EventSource + 'static,
    {
        self.api(backend.clone()).event_source(backend)
    }

    /// Share an existing registry. Takes precedence over `event_source`.
    pub fn registry(mut self, registry: SubscriptionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn PersistenceAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn completion_key(mut self, key: impl Into<String>) -> Self {
        self.completion_key = Some(key.into());
        self
    }

    pub fn session(mut self, session: SessionReader) -> Self {
        self.session = Some(session);
        self
    }

    pub fn build(self) -> Result<TrackingContext, BuildError> {
        let mut missing = Vec::new();
        if self.api.is_none() {
            missing.push("job api");
        }
        if self.storage.is_none() {
            missing.push("storage");
        }
        if self.registry.is_none() && self.events.is_none() {
            missing.push("event source");
        }

        let (Some(api), Some(storage), Some(registry)) = (
            self.api,
            self.storage,
            self.registry.or_else(|| self.events.map(SubscriptionRegistry::new)),
        ) else {
            return Err(BuildError::MissingCollaborators(missing));
        };

        let completion_key = self
            .completion_key
            .unwrap_or_else(|| DEFAULT_COMPLETION_KEY.to_string());
        if completion_key.trim().is_empty() {
            return Err(BuildError::EmptyCompletionKey);
        }

        Ok(TrackingContext {
            api,
            storage,
            registry,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            completion_key,
            session: self.session.unwrap_or_else(SessionReader::detached),
        })
    }
}
