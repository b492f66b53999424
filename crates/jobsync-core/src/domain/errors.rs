//! Errors - エラー型と分類
//!
//! Transport and request failures are translated into [`TrackerError`] at the
//! subscription and tracker boundaries; callers never see raw transport errors.
//! Nothing here is fatal: every variant leaves the tracker in a recoverable state.

use thiserror::Error;

use super::ids::JobId;
use super::job::{JobStatus, JobType};

/// Failure of a request/response call against the job backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("no start route configured for job type {0}")]
    UnsupportedJobType(JobType),
}

/// Failure to open a push stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("job {0} has no event stream")]
    NotFound(JobId),

    #[error("failed to connect event stream: {0}")]
    Connect(String),
}

/// Protocol-level oddities: logged, never fatal, the most recent frame still wins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolAnomaly {
    #[error("job {job_id}: progress regressed from {from} to {to}")]
    ProgressRegressed { job_id: JobId, from: u8, to: u8 },

    #[error("job {job_id}: unrecognized status value")]
    UnrecognizedStatus { job_id: JobId },

    #[error("job {job_id}: malformed frame: {detail}")]
    MalformedFrame { job_id: JobId, detail: String },
}

/// Errors surfaced by `JobTracker` and `MultiJobCoordinator`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// Starting a job failed. Surfaced immediately, not retried.
    #[error("failed to launch job: {0}")]
    Launch(#[source] ApiError),

    /// A resumed id no longer exists server-side. Local state was reset.
    #[error("persisted job {job_id} no longer exists")]
    StaleReference { job_id: JobId },

    /// The push stream dropped before a terminal frame; status may be outdated.
    #[error("live updates for job {job_id} interrupted, status may be outdated: {reason}")]
    TransientStream { job_id: JobId, reason: String },

    #[error("protocol anomaly: {0}")]
    ProtocolAnomaly(#[from] ProtocolAnomaly),

    /// A pull, stop or delete request failed.
    #[error("job request failed: {0}")]
    Api(#[source] ApiError),

    #[error("job {job_id} is {status}; only finished jobs can be deleted")]
    DeleteRefused { job_id: JobId, status: JobStatus },

    #[error("already tracking active job {0}")]
    Busy(JobId),

    #[error("no session is selected")]
    NoSession,
}

impl TrackerError {
    /// Errors after which retrying the same call (or a refresh) may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TrackerError::TransientStream { .. } => true,
            TrackerError::Api(err) | TrackerError::Launch(err) => {
                matches!(err, ApiError::Transport(_))
            }
            _ => false,
        }
    }
}
