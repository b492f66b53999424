//! JobObserver port - callbacks consumed by UI code.

use crate::domain::{JobRecord, ProtocolAnomaly, TrackerError};

/// Receives lifecycle notifications from a tracker or coordinator.
///
/// Every method defaults to a no-op. Callbacks run on the task that observed the
/// change and must not block.
pub trait JobObserver: Send + Sync {
    /// A snapshot was applied.
    fn on_update(&self, _job: &JobRecord) {}

    /// An asynchronous failure (e.g. an interrupted stream).
    fn on_error(&self, _error: &TrackerError) {}

    fn on_success(&self, _job: &JobRecord) {}

    fn on_failure(&self, _job: &JobRecord) {}

    fn on_cancelled(&self, job: &JobRecord) {
        self.on_failure(job);
    }

    fn on_anomaly(&self, _anomaly: &ProtocolAnomaly) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl JobObserver for NoopObserver {}
