//! Client-side guards shared by the tracker and the coordinator.

use crate::domain::{JobRecord, TrackerError};

/// Deleting is refused before a request is sent unless the job is finished.
pub fn ensure_deletable(record: &JobRecord) -> Result<(), TrackerError> {
    if record.status.can_delete() {
        Ok(())
    } else {
        Err(TrackerError::DeleteRefused {
            job_id: record.id.clone(),
            status: record.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobStatus;
    use crate::testing::record;
    use rstest::rstest;

    #[rstest]
    #[case::pending(JobStatus::Pending, false)]
    #[case::running(JobStatus::Running, false)]
    #[case::cancelling(JobStatus::Cancelling, false)]
    #[case::completed(JobStatus::Completed, true)]
    #[case::failed(JobStatus::Failed, true)]
    #[case::cancelled(JobStatus::Cancelled, true)]
    fn only_terminal_jobs_are_deletable(#[case] status: JobStatus, #[case] allowed: bool) {
        let job = record(5, status, 50);
        assert_eq!(ensure_deletable(&job).is_ok(), allowed);
    }
}
