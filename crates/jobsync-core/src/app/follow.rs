//! Follow - ジョブ追従の共通処理
//!
//! One followed job: its latest snapshot plus the subscription lease feeding it.
//! `JobTracker` holds one, `MultiJobCoordinator` one per live list entry.
//!
//! # 設計原則
//! - State changes happen under the owner's lock and return what still has to
//!   be reported; observers hear about it after the lock is released.
//! - Completed and failed jobs keep their lease until the server closes the
//!   stream. Any other terminal status releases it on the spot.
//! - A closure is only acted on if it belongs to the subscription this follow
//!   still relies on.

use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use super::context::TrackingContext;
use super::subscription::{StreamClosure, StreamListener, SubscriptionLease};
use crate::domain::{
    Applied, ConnectionState, JobId, JobRecord, JobStatus, ProtocolAnomaly, TrackedJob,
    TrackerError,
};
use crate::ports::JobObserver;

pub(crate) struct Follow {
    job: TrackedJob,
    lease: Option<SubscriptionLease>,
    changed: bool,
}

impl Follow {
    pub(crate) fn new(record: JobRecord) -> Self {
        Self {
            job: TrackedJob::new(record, ConnectionState::Idle),
            lease: None,
            changed: true,
        }
    }

    pub(crate) fn job(&self) -> &TrackedJob {
        &self.job
    }

    pub(crate) fn id(&self) -> &JobId {
        self.job.id()
    }

    pub(crate) fn has_lease(&self) -> bool {
        self.lease.is_some()
    }

    /// Whether the snapshot or connection changed since the last call.
    pub(crate) fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    fn set_connection(&mut self, connection: ConnectionState) {
        if self.job.connection() != connection {
            self.job.set_connection(connection);
            self.changed = true;
        }
    }

    /// Mark the job as subscribing. Returns `false` if it already has a lease
    /// or has nothing left to stream.
    pub(crate) fn begin_subscribe(&mut self) -> bool {
        if self.lease.is_some() || self.job.status().is_terminal() {
            return false;
        }
        self.set_connection(ConnectionState::Subscribing);
        true
    }

    /// Keep a freshly opened lease if it is still needed. Otherwise it is left
    /// in `lease` for the caller to drop outside the lock.
    pub(crate) fn adopt(&mut self, lease: &mut Option<SubscriptionLease>) {
        let usable = lease.as_ref().is_some_and(|lease| !lease.is_closed());
        if usable && self.lease.is_none() && !self.job.status().is_terminal() {
            self.lease = lease.take();
        }
    }

    /// Merge a snapshot from any source.
    pub(crate) fn apply(&mut self, record: JobRecord) -> Step {
        let applied = self.job.apply(record);
        let mut released = None;
        if let Applied::Replaced {
            reached_terminal: true,
            ..
        } = applied
            && !self.job.status().closes_stream()
        {
            // the backend keeps the stream open after a cancellation
            self.set_connection(ConnectionState::Closed);
            released = self.lease.take();
        }
        if matches!(applied, Applied::Replaced { .. }) {
            self.changed = true;
        }
        Step {
            applied,
            snapshot: self.job.clone(),
            released,
        }
    }

    pub(crate) fn opened(&mut self) {
        if self.job.connection() == ConnectionState::Subscribing {
            self.set_connection(ConnectionState::Live);
        }
    }

    /// The stream ended. `None` if the follow already moved on to another
    /// subscription that is still running.
    pub(crate) fn closed(&mut self) -> Option<Closed> {
        if self.lease.as_ref().is_some_and(|lease| !lease.is_closed()) {
            return None;
        }
        self.set_connection(ConnectionState::Closed);
        Some(Closed {
            status: self.job.status(),
            released: self.lease.take(),
        })
    }

    /// Stop following. The returned lease must be dropped outside the lock.
    pub(crate) fn release(&mut self) -> Option<SubscriptionLease> {
        if self.job.connection() != ConnectionState::Idle {
            self.set_connection(ConnectionState::Closed);
        }
        self.lease.take()
    }
}

/// A merged snapshot, still to be reported.
#[must_use]
pub(crate) struct Step {
    applied: Applied,
    snapshot: TrackedJob,
    released: Option<SubscriptionLease>,
}

impl Step {
    pub(crate) fn report<H: FollowHost>(self, host: &H) {
        let Step {
            applied,
            snapshot,
            released,
        } = self;
        drop(released);

        match applied {
            Applied::Replaced {
                reached_terminal,
                anomalies,
            } => {
                for anomaly in &anomalies {
                    report_anomaly(host, anomaly);
                }
                debug!(
                    job_id = %snapshot.id(),
                    status = %snapshot.status(),
                    progress = snapshot.record().progress,
                    "job updated"
                );
                host.observer().on_update(snapshot.record());
                if reached_terminal {
                    finish(host, snapshot.record());
                }
            }
            Applied::TerminalLatched { incoming } => {
                debug!(job_id = %snapshot.id(), %incoming, "update after terminal status dropped");
            }
            Applied::ForeignJob { incoming } => {
                debug!(job_id = %snapshot.id(), %incoming, "update for another job dropped");
            }
        }
    }
}

/// A closed stream, still to be reported.
#[must_use]
pub(crate) struct Closed {
    status: JobStatus,
    released: Option<SubscriptionLease>,
}

/// Owner of one or more follows that subscription events are routed to.
pub(crate) trait FollowHost: Send + Sync + 'static {
    fn context(&self) -> &TrackingContext;

    fn observer(&self) -> &dyn JobObserver;

    /// Run `f` on the follow for `id` under the owner's lock and publish the
    /// result if it changed. `None` if no such job is followed.
    fn with_follow<R>(&self, id: &JobId, f: impl FnOnce(&mut Follow) -> R) -> Option<R>;

    /// A followed job reached a terminal status. Runs before the observer is told.
    fn finished(&self, _record: &JobRecord) {}
}

/// Open (or join) the subscription for `id` and hand the lease to its follow.
pub(crate) fn subscribe<H: FollowHost>(host: &Arc<H>, id: &JobId) {
    let listener = Arc::new(FollowListener {
        host: Arc::downgrade(host),
    });
    let mut lease = Some(host.context().registry().open(id, listener));
    host.with_follow(id, |follow| follow.adopt(&mut lease));
    drop(lease);
}

/// Merge a snapshot into the follow for its job and report the outcome.
pub(crate) fn apply_update<H: FollowHost>(host: &H, record: JobRecord) {
    let id = record.id.clone();
    match host.with_follow(&id, |follow| follow.apply(record)) {
        Some(step) => step.report(host),
        None => debug!(job_id = %id, "update for untracked job dropped"),
    }
}

pub(crate) fn report_anomaly<H: FollowHost>(host: &H, anomaly: &ProtocolAnomaly) {
    warn!(%anomaly, "protocol anomaly");
    host.observer().on_anomaly(anomaly);
}

pub(crate) fn notify_terminal(observer: &dyn JobObserver, record: &JobRecord) {
    match record.status {
        JobStatus::Completed => observer.on_success(record),
        JobStatus::Failed => observer.on_failure(record),
        JobStatus::Cancelled => observer.on_cancelled(record),
        _ => {}
    }
}

fn finish<H: FollowHost>(host: &H, record: &JobRecord) {
    host.finished(record);
    host.context().announce_completion();
    info!(job_id = %record.id, status = %record.status, "job finished");
    notify_terminal(host.observer(), record);
}

fn stream_closed<H: FollowHost>(host: &H, id: &JobId, closure: &StreamClosure) {
    let Some(Closed { status, released }) = host.with_follow(id, Follow::closed).flatten() else {
        return;
    };
    drop(released);

    if let StreamClosure::Interrupted { reason } = closure
        && !status.is_terminal()
    {
        let err = TrackerError::TransientStream {
            job_id: id.clone(),
            reason: reason.clone(),
        };
        warn!(job_id = %id, %reason, "live updates interrupted; status may be outdated");
        host.observer().on_error(&err);
    }
}

/// Routes subscription events back to the owner without keeping it alive.
struct FollowListener<H> {
    host: Weak<H>,
}

impl<H: FollowHost> StreamListener for FollowListener<H> {
    fn on_open(&self, job_id: &JobId) {
        if let Some(host) = self.host.upgrade() {
            host.with_follow(job_id, Follow::opened);
        }
    }

    fn on_record(&self, record: JobRecord) {
        if let Some(host) = self.host.upgrade() {
            apply_update(&*host, record);
        }
    }

    fn on_anomaly(&self, anomaly: ProtocolAnomaly) {
        if let Some(host) = self.host.upgrade() {
            report_anomaly(&*host, &anomaly);
        }
    }

    fn on_closed(&self, job_id: &JobId, closure: &StreamClosure) {
        if let Some(host) = self.host.upgrade() {
            stream_closed(&*host, job_id, closure);
        }
    }
}
