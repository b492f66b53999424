//! Status - ジョブ一覧の集計

use serde::Serialize;

use crate::domain::{JobRecord, JobStatus};

/// Number of jobs per status, as shown above a job list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub cancelling: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub unrecognized: usize,
}

impl JobCounts {
    pub fn tally<'a>(jobs: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            let slot = match job.status {
                JobStatus::Pending => &mut counts.pending,
                JobStatus::Running => &mut counts.running,
                JobStatus::Cancelling => &mut counts.cancelling,
                JobStatus::Completed => &mut counts.completed,
                JobStatus::Failed => &mut counts.failed,
                JobStatus::Cancelled => &mut counts.cancelled,
                JobStatus::Unrecognized => &mut counts.unrecognized,
            };
            *slot += 1;
        }
        counts
    }

    /// Jobs still doing (or winding down) work.
    pub fn active(&self) -> usize {
        self.pending + self.running + self.cancelling
    }

    pub fn total(&self) -> usize {
        self.active() + self.completed + self.failed + self.cancelled + self.unrecognized
    }
}
