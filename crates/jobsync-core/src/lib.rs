//! jobsync-core
//!
//! Client-side tracking of long-running backend jobs: start or resume a job,
//! follow it over a push stream, and tell "finished" apart from "broken".
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, state, frame, errors）
//! - **ports**: 抽象化レイヤー（JobApi, EventSource, PersistenceAdapter, Clock, JobObserver）
//! - **app**: アプリケーションロジック（subscription, tracker, coordinator, context）
//! - **impls**: 実装（InMemoryBackend, SharedStorage, FileStorage, HttpJobApi, SseEventSource）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{
    JobTracker, MultiJobCoordinator, ResumeOutcome, SubscriptionRegistry, TrackingContext,
};
pub use domain::{JobId, JobRecord, JobStatus, JobType, SessionRef, TrackerError};

#[cfg(test)]
pub(crate) mod testing {
    use std::future::Future;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use crate::app::TrackingContext;
    use crate::domain::{
        JobId, JobRecord, JobStatus, JobType, ProtocolAnomaly, SessionRef, TrackerError,
    };
    use crate::impls::{ContextStorage, InMemoryBackend};
    use crate::ports::{FixedClock, JobObserver};

    /// Fail the test instead of hanging.
    pub async fn within<F: Future>(future: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(2), future)
            .await
            .expect("timed out waiting")
    }

    pub fn record(id: u64, status: JobStatus, progress: u8) -> JobRecord {
        let mut record =
            JobRecord::pending(JobId::from(id), SessionRef::new("capture-1"), JobType::Transform);
        record.status = status;
        record.progress = progress;
        record
    }

    pub fn context(backend: &InMemoryBackend, storage: ContextStorage) -> TrackingContext {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        TrackingContext::builder()
            .backend(Arc::new(backend.clone()))
            .storage(Arc::new(storage))
            .clock(Arc::new(clock))
            .build()
            .unwrap()
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum Observed {
        Update(JobId, JobStatus, u8),
        Error(TrackerError),
        Success(JobId),
        Failure(JobId),
        Cancelled(JobId),
        Anomaly(ProtocolAnomaly),
    }

    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<Observed>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<Observed> {
            self.events.lock().unwrap().clone()
        }

        pub fn errors(&self) -> Vec<TrackerError> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    Observed::Error(err) => Some(err),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, wanted: impl Fn(&Observed) -> bool) -> usize {
            self.events().iter().filter(|event| wanted(event)).count()
        }

        fn push(&self, event: Observed) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl JobObserver for RecordingObserver {
        fn on_update(&self, job: &JobRecord) {
            self.push(Observed::Update(job.id.clone(), job.status, job.progress));
        }

        fn on_error(&self, error: &TrackerError) {
            self.push(Observed::Error(error.clone()));
        }

        fn on_success(&self, job: &JobRecord) {
            self.push(Observed::Success(job.id.clone()));
        }

        fn on_failure(&self, job: &JobRecord) {
            self.push(Observed::Failure(job.id.clone()));
        }

        fn on_cancelled(&self, job: &JobRecord) {
            self.push(Observed::Cancelled(job.id.clone()));
        }

        fn on_anomaly(&self, anomaly: &ProtocolAnomaly) {
            self.push(Observed::Anomaly(anomaly.clone()));
        }
    }
}
