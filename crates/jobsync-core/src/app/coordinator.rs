//! MultiJobCoordinator - 複数ジョブの購読管理
//!
//! Used by list views. Given the listed jobs, keeps a subscription open for
//! exactly those whose effective status is `pending` or `running`.
//!
//! # 設計原則
//! - Effective status is the live override if one exists, else the listed status.
//! - `sync` is idempotent: an unchanged desired set opens and closes nothing.
//! - Subscriptions go through the shared registry, so a tracker and a
//!   coordinator following the same job share one transport.
//! - Live updates use the same merge rule and error taxonomy as `JobTracker`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::context::TrackingContext;
use super::follow::{self, Follow, FollowHost};
use super::guards::ensure_deletable;
use super::status::JobCounts;
use crate::domain::{ApiError, JobId, JobRecord, JobStatus, TrackedJob, TrackerError};
use crate::ports::{JobObserver, WatchGuard};

/// Subscriptions opened and closed by one `sync`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub opened: Vec<JobId>,
    pub closed: Vec<JobId>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty()
    }
}

#[derive(Default)]
struct CoordinatorState {
    listed: Vec<JobRecord>,
    live: HashMap<JobId, Follow>,
}

impl CoordinatorState {
    fn effective(&self) -> Vec<JobRecord> {
        self.listed
            .iter()
            .map(|listed| {
                self.live
                    .get(&listed.id)
                    .map(|follow| follow.job().record().clone())
                    .unwrap_or_else(|| listed.clone())
            })
            .collect()
    }

    fn effective_record(&self, id: &JobId) -> Option<JobRecord> {
        self.live
            .get(id)
            .map(|follow| follow.job().record().clone())
            .or_else(|| self.listed.iter().find(|job| &job.id == id).cloned())
    }
}

struct CoordinatorInner {
    ctx: TrackingContext,
    observer: Arc<dyn JobObserver>,
    state: Mutex<CoordinatorState>,
    snapshots: watch::Sender<Vec<JobRecord>>,
}

#[derive(Clone)]
pub struct MultiJobCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl MultiJobCoordinator {
    pub fn new(ctx: TrackingContext, observer: Arc<dyn JobObserver>) -> Self {
        let (snapshots, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(CoordinatorInner {
                ctx,
                observer,
                state: Mutex::new(CoordinatorState::default()),
                snapshots,
            }),
        }
    }

    /// Reconcile subscriptions with a freshly listed set of jobs.
    pub fn sync(&self, jobs: Vec<JobRecord>) -> SyncReport {
        let inner = &self.inner;

        let (unlisted, finished) = {
            let mut state = inner.lock();
            let listed: BTreeSet<JobId> = jobs.iter().map(|job| job.id.clone()).collect();
            let gone: Vec<JobId> = state
                .live
                .keys()
                .filter(|id| !listed.contains(*id))
                .cloned()
                .collect();
            let unlisted: Vec<Follow> = gone
                .iter()
                .filter_map(|id| state.live.remove(id))
                .collect();
            // a listed terminal status beats a stale live one
            let finished: Vec<JobRecord> = jobs
                .iter()
                .filter(|job| {
                    job.is_terminal()
                        && state
                            .live
                            .get(&job.id)
                            .is_some_and(|follow| !follow.job().record().is_terminal())
                })
                .cloned()
                .collect();
            state.listed = jobs;
            (unlisted, finished)
        };
        let mut closed: Vec<JobId> = unlisted
            .iter()
            .filter(|follow| follow.has_lease())
            .map(|follow| follow.id().clone())
            .collect();
        drop(unlisted);
        for record in finished {
            follow::apply_update(&**inner, record);
        }

        let (released, to_open) = {
            let mut guard = inner.lock();
            let state = &mut *guard;
            let desired: BTreeMap<JobId, JobRecord> = state
                .effective()
                .into_iter()
                .filter(|job| job.status.wants_subscription())
                .map(|job| (job.id.clone(), job))
                .collect();

            let mut released = Vec::new();
            for (id, follow) in state.live.iter_mut() {
                if follow.has_lease() && !desired.contains_key(id) {
                    closed.push(id.clone());
                    released.extend(follow.release());
                }
            }

            let mut to_open = Vec::new();
            for (id, record) in desired {
                let follow = state
                    .live
                    .entry(id.clone())
                    .or_insert_with(|| Follow::new(record));
                if follow.begin_subscribe() {
                    to_open.push(id);
                }
            }
            for follow in state.live.values_mut() {
                follow.take_changed();
            }
            inner.publish(state);
            (released, to_open)
        };
        drop(released);

        for id in &to_open {
            follow::subscribe(inner, id);
        }

        closed.sort();
        let report = SyncReport {
            opened: to_open,
            closed,
        };
        if !report.is_empty() {
            debug!(opened = report.opened.len(), closed = report.closed.len(), "subscriptions synced");
        }
        report
    }

    /// List jobs from the backend and sync.
    pub async fn refresh(&self) -> Result<SyncReport, TrackerError> {
        let jobs = self
            .inner
            .ctx
            .api()
            .list_jobs()
            .await
            .map_err(TrackerError::Api)?;
        Ok(self.sync(jobs))
    }

    /// Request cancellation of one listed job and show `cancelling` right away.
    pub async fn stop(&self, id: &JobId) -> Result<bool, TrackerError> {
        let Some(current) = self.inner.lock().effective_record(id) else {
            return Err(TrackerError::Api(ApiError::NotFound(id.clone())));
        };
        if !current.status.can_stop() {
            debug!(job_id = %id, status = %current.status, "stop ignored");
            return Ok(false);
        }

        self.inner
            .ctx
            .api()
            .stop_job(id)
            .await
            .map_err(TrackerError::Api)?;
        info!(job_id = %id, "stop requested");

        let optimistic = {
            let mut state = self.inner.lock();
            match state.effective_record(id) {
                Some(latest) if latest.status.can_stop() => {
                    let cancelling = latest.with_status(JobStatus::Cancelling);
                    state
                        .live
                        .entry(id.clone())
                        .or_insert_with(|| Follow::new(latest));
                    Some(cancelling)
                }
                _ => None,
            }
        };
        if let Some(record) = optimistic {
            follow::apply_update(&*self.inner, record);
        }
        Ok(true)
    }

    /// Delete a finished job and drop it from the view.
    pub async fn delete(&self, id: &JobId) -> Result<(), TrackerError> {
        let Some(current) = self.inner.lock().effective_record(id) else {
            return Err(TrackerError::Api(ApiError::NotFound(id.clone())));
        };
        ensure_deletable(&current)?;

        match self.inner.ctx.api().delete_job(id).await {
            Ok(()) | Err(ApiError::NotFound(_)) => {}
            Err(err) => return Err(TrackerError::Api(err)),
        }
        info!(job_id = %id, "job deleted");

        let removed = {
            let mut state = self.inner.lock();
            state.listed.retain(|job| &job.id != id);
            let removed = state.live.remove(id);
            self.inner.publish(&state);
            removed
        };
        drop(removed);
        Ok(())
    }

    /// Listed jobs with live overrides applied, in list order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.inner.lock().effective()
    }

    pub fn tracked(&self, id: &JobId) -> Option<TrackedJob> {
        self.inner.lock().live.get(id).map(|follow| follow.job().clone())
    }

    pub fn counts(&self) -> JobCounts {
        JobCounts::tally(&self.jobs())
    }

    /// Ids this coordinator currently holds a subscription for.
    pub fn open_subscriptions(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .inner
            .lock()
            .live
            .values()
            .filter(|follow| follow.has_lease())
            .map(|follow| follow.id().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn watch(&self) -> watch::Receiver<Vec<JobRecord>> {
        self.inner.snapshots.subscribe()
    }

    /// Re-fetch whenever another context broadcasts a completion.
    ///
    /// Must be called from within a tokio runtime. Delivery stops when the
    /// returned guard is dropped.
    pub fn follow_external_completions(&self) -> WatchGuard {
        let weak = Arc::downgrade(&self.inner);
        let key = self.inner.ctx.completion_key().to_string();
        let mut feed = self.inner.ctx.storage().external_changes();

        let handle = tokio::spawn(async move {
            while let Some(change) = feed.recv().await {
                if change.key != key || change.value.is_none() {
                    continue;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                debug!(key = %key, "completion broadcast from another context");
                let coordinator = MultiJobCoordinator { inner };
                if let Err(err) = coordinator.refresh().await {
                    warn!(error = %err, "re-fetch after completion broadcast failed");
                }
            }
        });
        WatchGuard::new(handle)
    }

    /// Close every subscription this coordinator owns.
    pub fn teardown(&self) -> usize {
        let leases: Vec<_> = {
            let mut state = self.inner.lock();
            let leases = state
                .live
                .values_mut()
                .filter_map(|follow| {
                    let lease = follow.release();
                    follow.take_changed();
                    lease
                })
                .collect();
            self.inner.publish(&state);
            leases
        };
        let closed = leases.len();
        drop(leases);
        info!(closed, "coordinator torn down");
        closed
    }
}

impl CoordinatorInner {
    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &CoordinatorState) {
        self.snapshots.send_replace(state.effective());
    }
}

impl FollowHost for CoordinatorInner {
    fn context(&self) -> &TrackingContext {
        &self.ctx
    }

    fn observer(&self) -> &dyn JobObserver {
        &*self.observer
    }

    fn with_follow<R>(&self, id: &JobId, f: impl FnOnce(&mut Follow) -> R) -> Option<R> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let follow = state.live.get_mut(id)?;
        let out = f(follow);
        if follow.take_changed() {
            self.publish(state);
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::app::completion::DEFAULT_COMPLETION_KEY;
    use crate::app::tracker::JobTracker;
    use crate::domain::{ConnectionState, JobType, SessionRef, StartRequest};
    use crate::impls::{InMemoryBackend, SharedStorage};
    use crate::ports::PersistenceAdapter;
    use crate::testing::{Observed, RecordingObserver, context, record, within};

    struct Harness {
        backend: InMemoryBackend,
        storage: SharedStorage,
        observer: Arc<RecordingObserver>,
        coordinator: MultiJobCoordinator,
    }

    impl Harness {
        fn new() -> Self {
            let backend = InMemoryBackend::new();
            let storage = SharedStorage::new();
            let observer = Arc::new(RecordingObserver::default());
            let coordinator =
                MultiJobCoordinator::new(context(&backend, storage.context()), observer.clone());
            Self {
                backend,
                storage,
                observer,
                coordinator,
            }
        }

        /// Store the jobs in the backend and sync with them.
        fn list(&self, jobs: &[JobRecord]) -> SyncReport {
            for job in jobs {
                self.backend.insert(job.clone());
            }
            self.coordinator.sync(jobs.to_vec())
        }

        fn connection(&self, id: u64) -> Option<ConnectionState> {
            self.coordinator
                .tracked(&JobId::from(id))
                .map(|tracked| tracked.connection())
        }

        async fn wait_live(&self, id: u64) {
            eventually(|| self.connection(id) == Some(ConnectionState::Live)).await;
        }
    }

    async fn eventually(mut done: impl FnMut() -> bool) {
        within(async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
    }

    fn ids(raw: &[u64]) -> Vec<JobId> {
        raw.iter().copied().map(JobId::from).collect()
    }

    #[tokio::test]
    async fn sync_subscribes_only_to_active_jobs() {
        let h = Harness::new();
        let report = h.list(&[
            record(1, JobStatus::Running, 40),
            record(2, JobStatus::Pending, 0),
            record(3, JobStatus::Completed, 100),
            record(4, JobStatus::Cancelling, 10),
        ]);

        assert_eq!(report.opened, ids(&[1, 2]));
        assert!(report.closed.is_empty());
        h.wait_live(1).await;
        h.wait_live(2).await;
        assert_eq!(h.coordinator.open_subscriptions(), ids(&[1, 2]));
        assert_eq!(h.backend.connect_count(&JobId::from(3)), 0);
        assert_eq!(h.backend.connect_count(&JobId::from(4)), 0);
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let h = Harness::new();
        let jobs = [record(1, JobStatus::Running, 40), record(2, JobStatus::Pending, 0)];
        h.list(&jobs);
        h.wait_live(1).await;
        h.wait_live(2).await;

        let again = h.list(&jobs);

        assert!(again.is_empty());
        assert_eq!(h.backend.connect_count(&JobId::from(1)), 1);
        assert_eq!(h.backend.connect_count(&JobId::from(2)), 1);
    }

    #[tokio::test]
    async fn dropped_job_closes_its_subscription() {
        let h = Harness::new();
        h.list(&[record(1, JobStatus::Running, 40), record(2, JobStatus::Running, 10)]);
        h.wait_live(2).await;

        let report = h.list(&[record(1, JobStatus::Running, 40)]);

        assert_eq!(report.closed, ids(&[2]));
        assert_eq!(h.coordinator.open_subscriptions(), ids(&[1]));
        eventually(|| h.backend.close_count(&JobId::from(2)) == 1).await;
        assert_eq!(h.backend.open_streams(&JobId::from(2)), 0);
        assert!(h.coordinator.tracked(&JobId::from(2)).is_none());
    }

    #[tokio::test]
    async fn listed_terminal_status_overrides_live_view() {
        let h = Harness::new();
        h.list(&[record(1, JobStatus::Running, 40)]);
        h.wait_live(1).await;

        let report = h.list(&[record(1, JobStatus::Completed, 100)]);

        assert_eq!(report.closed, ids(&[1]));
        assert_eq!(h.coordinator.jobs()[0].status, JobStatus::Completed);
        assert_eq!(h.observer.count(|e| matches!(e, Observed::Success(_))), 1);
        assert!(h.coordinator.open_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn live_override_wins_over_stale_listing() {
        let h = Harness::new();
        h.list(&[record(1, JobStatus::Pending, 0)]);
        h.wait_live(1).await;
        h.backend.advance(&JobId::from(1), JobStatus::Running, 60);
        eventually(|| h.coordinator.jobs()[0].progress == 60).await;

        // a list fetched before the push arrived
        let report = h.coordinator.sync(vec![record(1, JobStatus::Pending, 0)]);

        assert!(report.is_empty());
        assert_eq!(h.coordinator.jobs()[0].status, JobStatus::Running);
        assert_eq!(h.coordinator.counts().running, 1);
    }

    #[tokio::test]
    async fn terminal_frame_releases_subscription() {
        let h = Harness::new();
        h.list(&[record(1, JobStatus::Running, 40)]);
        h.wait_live(1).await;

        h.backend.advance(&JobId::from(1), JobStatus::Failed, 40);

        eventually(|| h.connection(1) == Some(ConnectionState::Closed)).await;
        assert_eq!(h.coordinator.jobs()[0].status, JobStatus::Failed);
        assert!(h.coordinator.open_subscriptions().is_empty());
        assert_eq!(h.observer.count(|e| matches!(e, Observed::Failure(_))), 1);
        assert!(h.observer.errors().is_empty());
        assert!(h.storage.context().get(DEFAULT_COMPLETION_KEY).is_some());
    }

    #[tokio::test]
    async fn completed_frame_waits_for_the_server_to_close() {
        let h = Harness::new();
        let id = JobId::from(1);
        h.list(&[record(1, JobStatus::Running, 40)]);
        h.wait_live(1).await;

        let done = record(1, JobStatus::Completed, 100);
        h.backend.send_raw(&id, serde_json::to_string(&done).unwrap());

        eventually(|| h.coordinator.jobs()[0].status == JobStatus::Completed).await;
        assert_eq!(h.observer.count(|e| matches!(e, Observed::Success(_))), 1);
        assert_eq!(h.connection(1), Some(ConnectionState::Live));
        assert_eq!(h.coordinator.open_subscriptions(), vec![id.clone()]);
        assert_eq!(h.backend.close_count(&id), 0);
        assert_eq!(h.backend.open_streams(&id), 1);

        h.backend.disconnect(&id, true);

        eventually(|| h.connection(1) == Some(ConnectionState::Closed)).await;
        assert!(h.coordinator.open_subscriptions().is_empty());
        assert!(h.observer.errors().is_empty());
    }

    #[tokio::test]
    async fn interrupted_stream_is_reported_and_resync_reopens() {
        let h = Harness::new();
        let jobs = [record(1, JobStatus::Running, 40)];
        h.list(&jobs);
        h.wait_live(1).await;

        h.backend.disconnect(&JobId::from(1), false);

        eventually(|| h.connection(1) == Some(ConnectionState::Closed)).await;
        assert!(matches!(
            h.observer.errors().as_slice(),
            [TrackerError::TransientStream { job_id, .. }] if job_id == &JobId::from(1)
        ));
        assert!(h.coordinator.open_subscriptions().is_empty());

        let report = h.list(&jobs);
        assert_eq!(report.opened, ids(&[1]));
        h.wait_live(1).await;
        assert_eq!(h.backend.connect_count(&JobId::from(1)), 2);
    }

    #[tokio::test]
    async fn shares_one_stream_with_a_tracker() {
        let backend = InMemoryBackend::new();
        let storage = SharedStorage::new();
        let ctx = context(&backend, storage.context());
        let tracker_observer = Arc::new(RecordingObserver::default());
        let list_observer = Arc::new(RecordingObserver::default());
        let tracker = JobTracker::new(ctx.clone(), "jobsync.active.transform", tracker_observer.clone());
        let coordinator = MultiJobCoordinator::new(ctx, list_observer.clone());

        let job = tracker
            .start_job(StartRequest::new(JobType::Transform, SessionRef::new("capture-1")))
            .await
            .unwrap();
        let id = job.id().clone();
        let mut watch = tracker.watch();
        within(watch.wait_for(|job| {
            job.as_ref()
                .is_some_and(|job| job.connection() == ConnectionState::Live)
        }))
        .await
        .unwrap();

        let report = coordinator.refresh().await.unwrap();

        assert_eq!(report.opened, vec![id.clone()]);
        assert_eq!(
            coordinator.tracked(&id).map(|job| job.connection()),
            Some(ConnectionState::Live)
        );
        assert_eq!(backend.connect_count(&id), 1);

        backend.advance(&id, JobStatus::Completed, 100);

        eventually(|| coordinator.jobs()[0].status == JobStatus::Completed).await;
        eventually(|| tracker.status() == Some(JobStatus::Completed)).await;
        assert_eq!(backend.connect_count(&id), 1);
        assert_eq!(tracker_observer.count(|e| matches!(e, Observed::Success(_))), 1);
        assert_eq!(list_observer.count(|e| matches!(e, Observed::Success(_))), 1);
    }

    #[tokio::test]
    async fn stop_marks_job_cancelling() {
        let h = Harness::new();
        h.list(&[record(1, JobStatus::Running, 40), record(2, JobStatus::Completed, 100)]);
        h.wait_live(1).await;

        assert!(h.coordinator.stop(&JobId::from(1)).await.unwrap());
        assert!(!h.coordinator.stop(&JobId::from(2)).await.unwrap());

        assert_eq!(h.coordinator.jobs()[0].status, JobStatus::Cancelling);
        assert_eq!(h.backend.stop_requests(), ids(&[1]));
        // still listening for the eventual cancelled frame
        assert_eq!(h.coordinator.open_subscriptions(), ids(&[1]));
    }

    #[tokio::test]
    async fn stop_unknown_job_is_not_found() {
        let h = Harness::new();
        let err = h.coordinator.stop(&JobId::from(9)).await.unwrap_err();
        assert_eq!(err, TrackerError::Api(ApiError::NotFound(JobId::from(9))));
    }

    #[tokio::test]
    async fn delete_only_finished_jobs() {
        let h = Harness::new();
        h.list(&[record(1, JobStatus::Running, 40), record(2, JobStatus::Completed, 100)]);

        let refused = h.coordinator.delete(&JobId::from(1)).await.unwrap_err();
        assert!(matches!(refused, TrackerError::DeleteRefused { .. }));

        h.coordinator.delete(&JobId::from(2)).await.unwrap();
        let remaining: Vec<JobId> = h.coordinator.jobs().into_iter().map(|job| job.id).collect();
        assert_eq!(remaining, ids(&[1]));
        assert!(h.backend.job(&JobId::from(2)).is_none());
    }

    #[tokio::test]
    async fn teardown_closes_everything() {
        let h = Harness::new();
        h.list(&[record(1, JobStatus::Running, 40), record(2, JobStatus::Pending, 0)]);
        h.wait_live(1).await;
        h.wait_live(2).await;

        assert_eq!(h.coordinator.teardown(), 2);

        assert!(h.coordinator.open_subscriptions().is_empty());
        assert_eq!(h.connection(1), Some(ConnectionState::Closed));
        eventually(|| {
            h.backend.open_streams(&JobId::from(1)) == 0
                && h.backend.open_streams(&JobId::from(2)) == 0
        })
        .await;
        assert!(h.observer.errors().is_empty());
    }

    #[tokio::test]
    async fn completion_in_another_context_triggers_refetch() {
        let backend = InMemoryBackend::new();
        let shared = SharedStorage::new();
        let coordinator = MultiJobCoordinator::new(
            context(&backend, shared.context()),
            Arc::new(RecordingObserver::default()),
        );
        let other = context(&backend, shared.context());
        let _guard = coordinator.follow_external_completions();
        backend.insert(record(1, JobStatus::Running, 40));
        assert!(coordinator.jobs().is_empty());

        other.announce_completion();

        eventually(|| coordinator.jobs().len() == 1).await;
        eventually(|| coordinator.open_subscriptions() == ids(&[1])).await;
    }

    #[tokio::test]
    async fn own_completion_does_not_trigger_refetch() {
        let backend = InMemoryBackend::new();
        let storage = SharedStorage::new();
        let ctx = context(&backend, storage.context());
        let coordinator =
            MultiJobCoordinator::new(ctx.clone(), Arc::new(RecordingObserver::default()));
        let _guard = coordinator.follow_external_completions();
        backend.insert(record(1, JobStatus::Running, 40));

        ctx.announce_completion();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(coordinator.jobs().is_empty());
    }
}
