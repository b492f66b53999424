//! State - tracked job snapshot and the merge rule applied to every update.
//!
//! # 状態遷移
//! `ConnectionState` is decoupled from `JobStatus`: a job that is already
//! terminal when first pulled never gets a subscription, while one discovered
//! live does.
//!
//! ```text
//! idle --subscribe--> subscribing --open--> live --close--> closed
//! ```

use serde::Serialize;

use super::errors::ProtocolAnomaly;
use super::ids::JobId;
use super::job::{JobRecord, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No subscription exists (nothing to follow, or known terminal by pull).
    Idle,
    /// A subscription was requested and is connecting.
    Subscribing,
    /// The push stream is open.
    Live,
    /// The push stream ended (normally or not).
    Closed,
}

/// Result of merging one incoming snapshot into a tracked job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The incoming snapshot replaced the previous one.
    Replaced {
        /// The job moved from non-terminal to terminal with this snapshot.
        reached_terminal: bool,
        anomalies: Vec<ProtocolAnomaly>,
    },
    /// Dropped: a non-terminal snapshot after a terminal one.
    TerminalLatched { incoming: JobStatus },
    /// Dropped: the snapshot belongs to another job.
    ForeignJob { incoming: JobId },
}

/// A job as seen by a tracker: the latest snapshot plus connection bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedJob {
    record: JobRecord,
    connection: ConnectionState,
    revision: u64,
}

impl TrackedJob {
    pub fn new(record: JobRecord, connection: ConnectionState) -> Self {
        Self {
            record,
            connection,
            revision: 1,
        }
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn into_record(self) -> JobRecord {
        self.record
    }

    pub fn id(&self) -> &JobId {
        &self.record.id
    }

    pub fn status(&self) -> JobStatus {
        self.record.status
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Bumped on every applied snapshot.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_processing(&self) -> bool {
        self.record.is_processing()
    }

    pub fn set_connection(&mut self, connection: ConnectionState) {
        self.connection = connection;
    }

    /// Merge an incoming snapshot (pull, push or local) into this job.
    ///
    /// The most recently applied snapshot wins, with two exceptions: nothing
    /// non-terminal is accepted once a terminal status has been applied, and an
    /// unrecognized status keeps the previous one.
    pub fn apply(&mut self, mut incoming: JobRecord) -> Applied {
        if incoming.id != self.record.id {
            return Applied::ForeignJob {
                incoming: incoming.id,
            };
        }

        let current = self.record.status;
        let mut anomalies = Vec::new();

        if incoming.status == JobStatus::Unrecognized {
            anomalies.push(ProtocolAnomaly::UnrecognizedStatus {
                job_id: incoming.id.clone(),
            });
            incoming.status = current;
        }

        if current.is_terminal() && !incoming.status.is_terminal() {
            return Applied::TerminalLatched {
                incoming: incoming.status,
            };
        }

        if !current.is_terminal()
            && !incoming.status.is_terminal()
            && incoming.progress < self.record.progress
        {
            anomalies.push(ProtocolAnomaly::ProgressRegressed {
                job_id: incoming.id.clone(),
                from: self.record.progress,
                to: incoming.progress,
            });
        }

        let reached_terminal = !current.is_terminal() && incoming.status.is_terminal();
        self.record = incoming;
        self.revision += 1;

        Applied::Replaced {
            reached_terminal,
            anomalies,
        }
    }
}
