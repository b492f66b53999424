//! JobTracker - 単一ジョブのライフサイクル管理
//!
//! Ties storage, the job api and a stream subscription into a resumable
//! lifecycle for one feature (one storage key).
//!
//! # 設計原則
//! - The persisted id is written only after a successful launch and cleared
//!   once the job is terminal, stale, or reset.
//! - `resume` pulls before it subscribes, so a job that finished while nobody was
//!   watching never gets a stream.
//! - Every snapshot (pull, push, or local) goes through `TrackedJob::apply`.
//! - Errors from a direct call are returned; errors discovered asynchronously go
//!   to the observer.
//!
//! Locks are never held across an await, and observer callbacks run after the
//! state lock is released.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::context::TrackingContext;
use super::follow::{self, Follow, FollowHost};
use super::guards::ensure_deletable;
use crate::domain::{
    ApiError, ConnectionState, JobId, JobRecord, JobStatus, JobType, StartRequest, TrackedJob,
    TrackerError,
};
use crate::ports::JobObserver;

/// What `resume` found under the storage key.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// Nothing was persisted.
    Idle,
    /// The job finished while nobody was watching. Storage was cleared.
    AlreadyFinished(JobRecord),
    /// The job is still live and is being followed again.
    Resumed(TrackedJob),
}

struct TrackerInner {
    key: String,
    ctx: TrackingContext,
    observer: Arc<dyn JobObserver>,
    state: Mutex<Option<Follow>>,
    snapshots: watch::Sender<Option<TrackedJob>>,
}

/// Tracks at most one job for one storage key.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<TrackerInner>,
}

impl JobTracker {
    pub fn new(ctx: TrackingContext, key: impl Into<String>, observer: Arc<dyn JobObserver>) -> Self {
        let (snapshots, _) = watch::channel(None);
        Self {
            inner: Arc::new(TrackerInner {
                key: key.into(),
                ctx,
                observer,
                state: Mutex::new(None),
                snapshots,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Launch a job with a caller-supplied launcher and follow it.
    ///
    /// Refused with `Busy` while the current job is still processing. Nothing is
    /// persisted if the launcher fails or reports a job that already finished.
    pub async fn start<F, Fut>(&self, launch: F) -> Result<TrackedJob, TrackerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<JobRecord, ApiError>>,
    {
        if let Some(active) = self.current().filter(TrackedJob::is_processing) {
            return Err(TrackerError::Busy(active.id().clone()));
        }

        let record = launch().await.map_err(|err| {
            warn!(key = %self.inner.key, error = %err, "job launch failed");
            TrackerError::Launch(err)
        })?;

        if record.is_terminal() {
            info!(key = %self.inner.key, job_id = %record.id, status = %record.status, "job finished at launch");
            let settled = self.inner.settle(record);
            self.inner.ctx.announce_completion();
            return Ok(settled);
        }

        info!(key = %self.inner.key, job_id = %record.id, job_type = %record.job_type, "job started");
        self.inner.ctx.storage().set_job(&self.inner.key, &record.id);
        Ok(self.inner.track(record))
    }

    /// `start` with the launcher bound to `JobApi::start_job`.
    pub async fn start_job(&self, request: StartRequest) -> Result<TrackedJob, TrackerError> {
        let api = self.inner.ctx.api();
        self.start(|| api.start_job(&request)).await
    }

    /// Start a job of `kind` on the currently selected session.
    pub async fn start_for_current_session(
        &self,
        kind: JobType,
        params: serde_json::Value,
    ) -> Result<TrackedJob, TrackerError> {
        let session = self
            .inner
            .ctx
            .session()
            .current()
            .ok_or(TrackerError::NoSession)?;
        self.start_job(StartRequest::new(kind, session).with_params(params))
            .await
    }

    /// Pick up the job persisted under this tracker's key, if any.
    pub async fn resume(&self) -> Result<ResumeOutcome, TrackerError> {
        let storage = self.inner.ctx.storage();
        let Some(job_id) = storage.get_job(&self.inner.key) else {
            debug!(key = %self.inner.key, "nothing to resume");
            return Ok(ResumeOutcome::Idle);
        };

        info!(key = %self.inner.key, job_id = %job_id, "resuming persisted job");
        match self.inner.ctx.api().get_job_details(&job_id).await {
            Ok(record) if record.is_terminal() => {
                storage.clear(&self.inner.key);
                info!(job_id = %job_id, status = %record.status, "persisted job already finished");
                self.inner.settle(record.clone());
                Ok(ResumeOutcome::AlreadyFinished(record))
            }
            Ok(record) => Ok(ResumeOutcome::Resumed(self.inner.track(record))),
            Err(ApiError::NotFound(_)) => {
                warn!(key = %self.inner.key, job_id = %job_id, "persisted job no longer exists");
                self.reset();
                Err(TrackerError::StaleReference { job_id })
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "resume pull failed; keeping persisted id");
                Err(TrackerError::Api(err))
            }
        }
    }

    /// Re-pull the current job and resubscribe if it is live without a stream.
    ///
    /// A pulled snapshot that was overtaken by a push while in flight is dropped
    /// unless it is terminal.
    pub async fn refresh(&self) -> Result<Option<TrackedJob>, TrackerError> {
        let Some(before) = self.current() else {
            return Ok(None);
        };
        let job_id = before.id().clone();

        let record = match self.inner.ctx.api().get_job_details(&job_id).await {
            Ok(record) => record,
            Err(ApiError::NotFound(_)) => {
                warn!(job_id = %job_id, "job disappeared during refresh");
                self.reset();
                return Err(TrackerError::StaleReference { job_id });
            }
            Err(err) => return Err(TrackerError::Api(err)),
        };

        let Some(now) = self.current().filter(|job| job.id() == &job_id) else {
            return Ok(self.current());
        };
        if now.revision() != before.revision() && !record.is_terminal() {
            debug!(job_id = %job_id, "refresh overtaken by a newer update; discarded");
        } else {
            follow::apply_update(&*self.inner, record);
        }

        self.inner.ensure_subscribed();
        Ok(self.current())
    }

    /// Ask the backend to cancel, then show `cancelling` right away.
    ///
    /// Returns `Ok(false)` without calling the backend unless the job is
    /// pending or running.
    pub async fn stop(&self) -> Result<bool, TrackerError> {
        let Some(current) = self.current() else {
            return Ok(false);
        };
        if !current.status().can_stop() {
            debug!(job_id = %current.id(), status = %current.status(), "stop ignored");
            return Ok(false);
        }

        self.inner
            .ctx
            .api()
            .stop_job(current.id())
            .await
            .map_err(TrackerError::Api)?;
        info!(job_id = %current.id(), "stop requested");

        let optimistic = self
            .current()
            .filter(|job| job.id() == current.id() && job.status().can_stop())
            .map(|job| job.record().with_status(JobStatus::Cancelling));
        if let Some(record) = optimistic {
            follow::apply_update(&*self.inner, record);
        }
        Ok(true)
    }

    /// Delete the finished job server-side and forget it.
    pub async fn delete(&self) -> Result<(), TrackerError> {
        let Some(current) = self.current() else {
            return Ok(());
        };
        ensure_deletable(current.record())?;

        match self.inner.ctx.api().delete_job(current.id()).await {
            Ok(()) | Err(ApiError::NotFound(_)) => {}
            Err(err) => return Err(TrackerError::Api(err)),
        }
        info!(job_id = %current.id(), "job deleted");
        self.reset();
        Ok(())
    }

    /// Drop the subscription, clear the persisted id and forget the job.
    pub fn reset(&self) {
        let previous = self.inner.replace(None);
        drop(previous);
        self.inner.ctx.storage().clear(&self.inner.key);
        debug!(key = %self.inner.key, "tracker reset");
    }

    pub fn current(&self) -> Option<TrackedJob> {
        self.inner.lock().as_ref().map(|follow| follow.job().clone())
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.current().map(|job| job.status())
    }

    pub fn is_processing(&self) -> bool {
        self.current().is_some_and(|job| job.is_processing())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.current()
            .map(|job| job.connection())
            .unwrap_or(ConnectionState::Idle)
    }

    /// Every change to the tracked job, `None` after a reset.
    pub fn watch(&self) -> watch::Receiver<Option<TrackedJob>> {
        self.inner.snapshots.subscribe()
    }
}

impl TrackerInner {
    fn lock(&self) -> MutexGuard<'_, Option<Follow>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Called with the state lock held so snapshots are published in order.
    fn publish(&self, state: &Option<Follow>) {
        self.snapshots
            .send_replace(state.as_ref().map(|follow| follow.job().clone()));
    }

    /// Swap in a new follow. The old one is returned so its lease is dropped
    /// after the lock.
    fn replace(&self, next: Option<Follow>) -> Option<Follow> {
        let mut state = self.lock();
        let previous = std::mem::replace(&mut *state, next);
        if let Some(current) = state.as_mut() {
            current.take_changed();
        }
        self.publish(&state);
        previous
    }

    /// Replace the tracked job with a live one and subscribe to it.
    fn track(self: &Arc<Self>, record: JobRecord) -> TrackedJob {
        let tracked = TrackedJob::new(record.clone(), ConnectionState::Idle);
        drop(self.replace(Some(Follow::new(record))));
        self.observer.on_update(tracked.record());

        self.ensure_subscribed();
        self.lock()
            .as_ref()
            .map(|follow| follow.job().clone())
            .unwrap_or(tracked)
    }

    /// Replace the tracked job with a terminal one found by pull. No subscription.
    fn settle(&self, record: JobRecord) -> TrackedJob {
        let tracked = TrackedJob::new(record.clone(), ConnectionState::Idle);
        drop(self.replace(Some(Follow::new(record))));
        self.observer.on_update(tracked.record());
        follow::notify_terminal(&*self.observer, tracked.record());
        tracked
    }

    fn ensure_subscribed(self: &Arc<Self>) {
        let job_id = {
            let mut state = self.lock();
            let Some(current) = state.as_mut() else {
                return;
            };
            if !current.job().is_processing() || !current.begin_subscribe() {
                return;
            }
            let id = current.id().clone();
            current.take_changed();
            self.publish(&state);
            id
        };
        follow::subscribe(self, &job_id);
    }
}

impl FollowHost for TrackerInner {
    fn context(&self) -> &TrackingContext {
        &self.ctx
    }

    fn observer(&self) -> &dyn JobObserver {
        &*self.observer
    }

    fn with_follow<R>(&self, id: &JobId, f: impl FnOnce(&mut Follow) -> R) -> Option<R> {
        let mut state = self.lock();
        let current = state.as_mut().filter(|follow| follow.id() == id)?;
        let out = f(current);
        if current.take_changed() {
            self.publish(&state);
        }
        Some(out)
    }

    /// Clears the persisted id, unless a newer job has replaced it.
    fn finished(&self, record: &JobRecord) {
        let storage = self.ctx.storage();
        if storage.get_job(&self.key).as_ref() == Some(&record.id) {
            storage.clear(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::completion::DEFAULT_COMPLETION_KEY;
    use crate::app::session::session_cell;
    use crate::domain::{ProtocolAnomaly, SessionRef};
    use crate::impls::{InMemoryBackend, SharedStorage};
    use crate::ports::PersistenceAdapter;
    use crate::testing::{Observed, RecordingObserver, context, record, within};

    const KEY: &str = "jobsync.active.transform";

    struct Harness {
        backend: InMemoryBackend,
        storage: SharedStorage,
        observer: Arc<RecordingObserver>,
        tracker: JobTracker,
    }

    impl Harness {
        fn new() -> Self {
            let backend = InMemoryBackend::new();
            let storage = SharedStorage::new();
            let observer = Arc::new(RecordingObserver::default());
            let tracker = JobTracker::new(
                context(&backend, storage.context()),
                KEY,
                observer.clone(),
            );
            Self {
                backend,
                storage,
                observer,
                tracker,
            }
        }

        fn persisted(&self) -> Option<JobId> {
            self.storage.context().get_job(KEY)
        }

        async fn wait_for(&self, wanted: impl FnMut(&Option<TrackedJob>) -> bool) -> Option<TrackedJob> {
            let mut rx = self.tracker.watch();
            let seen = within(rx.wait_for(wanted)).await.unwrap().clone();
            seen
        }

        async fn wait_live(&self) {
            self.wait_for(|job| {
                job.as_ref()
                    .is_some_and(|job| job.connection() == ConnectionState::Live)
            })
            .await;
        }

        async fn wait_closed(&self) -> TrackedJob {
            self.wait_for(|job| {
                job.as_ref()
                    .is_some_and(|job| job.connection() == ConnectionState::Closed)
            })
            .await
            .unwrap()
        }

        async fn start(&self) -> JobId {
            let request = StartRequest::new(JobType::Transform, SessionRef::new("capture-1"));
            let job = self.tracker.start_job(request).await.unwrap();
            self.wait_live().await;
            job.id().clone()
        }
    }

    #[tokio::test]
    async fn scenario_a_start_follow_complete() {
        let h = Harness::new();
        let id = h.start().await;
        assert_eq!(h.persisted(), Some(id.clone()));
        assert!(h.tracker.is_processing());

        h.backend.advance(&id, JobStatus::Running, 0);
        h.backend.advance(&id, JobStatus::Running, 30);
        h.backend.advance(&id, JobStatus::Running, 70);
        h.backend.advance(&id, JobStatus::Completed, 100);

        let done = h.wait_closed().await;
        assert_eq!(done.status(), JobStatus::Completed);
        assert!(!h.tracker.is_processing());
        assert_eq!(h.persisted(), None);
        assert_eq!(h.backend.close_count(&id), 1);
        assert_eq!(h.backend.connect_count(&id), 1);
        assert_eq!(h.observer.count(|e| matches!(e, Observed::Success(_))), 1);
        assert!(h.observer.errors().is_empty());
        assert!(h.storage.context().get(DEFAULT_COMPLETION_KEY).is_some());

        let progress: Vec<u8> = h
            .observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Update(_, JobStatus::Running, p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![0, 30, 70]);
    }

    #[tokio::test]
    async fn scenario_b_stale_reference_on_resume() {
        let h = Harness::new();
        h.storage.context().set_job(KEY, &JobId::from(404));

        let err = h.tracker.resume().await.unwrap_err();

        assert_eq!(
            err,
            TrackerError::StaleReference {
                job_id: JobId::from(404)
            }
        );
        assert_eq!(h.persisted(), None);
        assert_eq!(h.tracker.current(), None);
        assert_eq!(h.backend.connect_count(&JobId::from(404)), 0);
    }

    #[tokio::test]
    async fn scenario_c_abnormal_disconnect_keeps_state() {
        let h = Harness::new();
        let id = h.start().await;
        h.backend.advance(&id, JobStatus::Running, 45);

        h.backend.disconnect(&id, false);

        let job = h.wait_closed().await;
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(h.persisted(), Some(id.clone()));
        assert!(matches!(
            h.observer.errors().as_slice(),
            [TrackerError::TransientStream { job_id, .. }] if job_id == &id
        ));
    }

    #[tokio::test]
    async fn scenario_d_stop_is_optimistic() {
        let h = Harness::new();
        let id = h.start().await;
        h.backend.advance(&id, JobStatus::Running, 20);
        h.wait_for(|job| job.as_ref().is_some_and(|j| j.status() == JobStatus::Running))
            .await;

        assert!(h.tracker.stop().await.unwrap());

        assert_eq!(h.tracker.status(), Some(JobStatus::Cancelling));
        assert_eq!(h.backend.stop_requests(), vec![id.clone()]);
        // nothing was pushed by the backend yet
        assert_eq!(h.tracker.connection_state(), ConnectionState::Live);
    }

    #[tokio::test]
    async fn cancelled_frame_releases_the_stream() {
        let h = Harness::new();
        let id = h.start().await;
        h.tracker.stop().await.unwrap();

        h.backend.advance(&id, JobStatus::Cancelled, 0);

        let job = h.wait_closed().await;
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(h.persisted(), None);
        assert_eq!(h.observer.count(|e| matches!(e, Observed::Cancelled(_))), 1);
        assert!(h.observer.errors().is_empty());
        within(async {
            while h.backend.close_count(&id) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert_eq!(h.backend.close_count(&id), 1);
    }

    #[rstest::rstest]
    #[case::pending(JobStatus::Pending)]
    #[case::completed(JobStatus::Completed)]
    #[case::failed(JobStatus::Failed)]
    #[case::cancelling(JobStatus::Cancelling)]
    #[tokio::test]
    async fn stop_is_a_no_op_unless_pending_or_running(#[case] status: JobStatus) {
        let h = Harness::new();
        let job = record(3, status, 50);
        h.backend.insert(job.clone());
        h.storage.context().set_job(KEY, &job.id);
        h.tracker.resume().await.unwrap();

        let stopped = h.tracker.stop().await.unwrap();

        assert_eq!(stopped, status == JobStatus::Pending);
        assert_eq!(h.backend.stop_requests().is_empty(), !stopped);
    }

    #[tokio::test]
    async fn resume_of_finished_job_opens_no_stream() {
        let h = Harness::new();
        let job = record(8, JobStatus::Completed, 100);
        h.backend.insert(job.clone());
        h.storage.context().set_job(KEY, &job.id);

        let outcome = h.tracker.resume().await.unwrap();

        assert!(matches!(outcome, ResumeOutcome::AlreadyFinished(ref r) if r.id == job.id));
        assert_eq!(h.persisted(), None);
        assert_eq!(h.backend.connect_count(&job.id), 0);
        assert_eq!(h.tracker.connection_state(), ConnectionState::Idle);
        assert_eq!(h.observer.count(|e| matches!(e, Observed::Success(_))), 1);
    }

    #[tokio::test]
    async fn resume_of_live_job_subscribes() {
        let h = Harness::new();
        let job = record(9, JobStatus::Running, 35);
        h.backend.insert(job.clone());
        h.storage.context().set_job(KEY, &job.id);

        let outcome = h.tracker.resume().await.unwrap();
        assert!(matches!(outcome, ResumeOutcome::Resumed(_)));
        h.wait_live().await;

        assert_eq!(h.backend.connect_count(&job.id), 1);
        assert_eq!(h.persisted(), Some(job.id.clone()));
    }

    #[tokio::test]
    async fn resume_keeps_storage_when_pull_fails() {
        let h = Harness::new();
        h.storage.context().set_job(KEY, &JobId::from(5));
        h.backend
            .fail_next_get(ApiError::Transport("connection refused".into()));

        let err = h.tracker.resume().await.unwrap_err();

        assert!(matches!(err, TrackerError::Api(ApiError::Transport(_))));
        assert!(err.is_transient());
        assert_eq!(h.persisted(), Some(JobId::from(5)));
    }

    #[tokio::test]
    async fn resume_with_nothing_persisted_is_idle() {
        let h = Harness::new();
        assert_eq!(h.tracker.resume().await.unwrap(), ResumeOutcome::Idle);
    }

    #[tokio::test]
    async fn failed_launch_persists_nothing() {
        let h = Harness::new();
        h.backend.fail_next_start(ApiError::Rejected {
            status: 400,
            message: "Cannot transform an already transformed session.".into(),
        });

        let err = h
            .tracker
            .start_job(StartRequest::new(JobType::Transform, SessionRef::new("s")))
            .await
            .unwrap_err();

        assert!(matches!(err, TrackerError::Launch(ApiError::Rejected { status: 400, .. })));
        assert_eq!(h.persisted(), None);
        assert_eq!(h.tracker.current(), None);
    }

    #[tokio::test]
    async fn launch_of_an_already_finished_job_is_not_persisted() {
        let h = Harness::new();
        let done = record(12, JobStatus::Completed, 100);

        let job = h
            .tracker
            .start(|| async move { Ok(done) })
            .await
            .unwrap();

        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(h.persisted(), None);
        assert_eq!(h.tracker.connection_state(), ConnectionState::Idle);
        assert_eq!(h.backend.connect_count(job.id()), 0);
        assert_eq!(h.observer.count(|e| matches!(e, Observed::Success(_))), 1);
        assert!(h.storage.context().get(DEFAULT_COMPLETION_KEY).is_some());
        assert!(!h.tracker.is_processing());
    }

    #[tokio::test]
    async fn start_is_refused_while_busy() {
        let h = Harness::new();
        let id = h.start().await;

        let err = h
            .tracker
            .start_job(StartRequest::new(JobType::Transform, SessionRef::new("s")))
            .await
            .unwrap_err();

        assert_eq!(err, TrackerError::Busy(id));
    }

    #[tokio::test]
    async fn terminal_latch_ignores_late_running_frames() {
        let h = Harness::new();
        let id = h.start().await;
        let mut late = record(1, JobStatus::Running, 90);
        late.id = id.clone();

        h.backend.send_raw(&id, serde_json::to_string(&record_with(&id, JobStatus::Failed)).unwrap());
        h.backend.send_raw(&id, serde_json::to_string(&late).unwrap());
        h.backend.disconnect(&id, true);

        let job = h.wait_closed().await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(h.observer.count(|e| matches!(e, Observed::Failure(_))), 1);
        assert!(h.observer.errors().is_empty());
    }

    fn record_with(id: &JobId, status: JobStatus) -> JobRecord {
        let mut r = record(1, status, 10);
        r.id = id.clone();
        r
    }

    #[tokio::test]
    async fn progress_regression_is_reported_and_applied() {
        let h = Harness::new();
        let id = h.start().await;
        h.backend.advance(&id, JobStatus::Running, 60);
        h.backend.advance(&id, JobStatus::Running, 25);

        h.wait_for(|job| job.as_ref().is_some_and(|j| j.record().progress == 25))
            .await;
        assert_eq!(
            h.observer.count(|e| matches!(e, Observed::Anomaly(ProtocolAnomaly::ProgressRegressed { .. }))),
            1
        );
    }

    #[tokio::test]
    async fn refresh_resubscribes_after_interruption() {
        let h = Harness::new();
        let id = h.start().await;
        h.backend.disconnect(&id, false);
        h.wait_closed().await;

        h.backend.insert(record_with(&id, JobStatus::Running));
        let refreshed = h.tracker.refresh().await.unwrap().unwrap();
        assert_eq!(refreshed.status(), JobStatus::Running);
        h.wait_live().await;

        assert_eq!(h.backend.connect_count(&id), 2);
    }

    #[tokio::test]
    async fn refresh_applies_a_terminal_pull() {
        let h = Harness::new();
        let id = h.start().await;
        h.backend.insert(record_with(&id, JobStatus::Completed));

        let job = h.tracker.refresh().await.unwrap().unwrap();

        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(h.persisted(), None);
        assert_eq!(h.observer.count(|e| matches!(e, Observed::Success(_))), 1);
    }

    #[tokio::test]
    async fn delete_is_refused_until_terminal() {
        let h = Harness::new();
        let id = h.start().await;

        let err = h.tracker.delete().await.unwrap_err();
        assert!(matches!(err, TrackerError::DeleteRefused { status: JobStatus::Pending, .. }));

        h.backend.advance(&id, JobStatus::Completed, 100);
        h.wait_closed().await;
        h.tracker.delete().await.unwrap();

        assert_eq!(h.tracker.current(), None);
        assert!(h.backend.job(&id).is_none());
    }

    #[tokio::test]
    async fn reset_closes_the_stream_and_forgets() {
        let h = Harness::new();
        let id = h.start().await;

        h.tracker.reset();

        assert_eq!(h.tracker.current(), None);
        assert_eq!(h.persisted(), None);
        within(async {
            while h.backend.close_count(&id) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(h.observer.errors().is_empty());
    }

    #[tokio::test]
    async fn start_uses_the_selected_session() {
        let backend = InMemoryBackend::new();
        let (writer, reader) = session_cell(None);
        let ctx = TrackingContext::builder()
            .backend(Arc::new(backend.clone()))
            .storage(Arc::new(SharedStorage::new().context()))
            .session(reader)
            .build()
            .unwrap();
        let tracker = JobTracker::new(ctx, KEY, Arc::new(RecordingObserver::default()));

        let err = tracker
            .start_for_current_session(JobType::DicomExtract, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err, TrackerError::NoSession);

        writer.select(SessionRef::new("capture-9"));
        let job = tracker
            .start_for_current_session(JobType::DicomExtract, serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(job.record().session_ref, SessionRef::new("capture-9"));
        assert_eq!(job.record().job_type, JobType::DicomExtract);
    }
}
