//! Ports - 抽象化レイヤー
//!
//! Each trait is the seam to something outside the tracker: the job backend,
//! the push transport, client-side storage, time, and the UI.

pub mod clock;
pub mod event_source;
pub mod job_api;
pub mod observer;
pub mod persistence;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_source::{EventSource, EventStream, TransportEvent};
pub use self::job_api::JobApi;
pub use self::observer::{JobObserver, NoopObserver};
pub use self::persistence::{
    ChangeFeed, ContextId, PersistenceAdapter, StorageChange, StorageEvent, WatchGuard,
    on_external_change,
};
