//! Job record and status as the backend reports them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, SessionRef};

/// Lifecycle status of a server-side job.
///
/// State transitions:
/// - Pending -> Running -> Completed | Failed
/// - Pending | Running -> Cancelling -> Cancelled
///
/// `Unrecognized` is never produced by the backend on purpose; it stands in for
/// a wire value this client does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    #[serde(other)]
    Unrecognized,
}

impl JobStatus {
    /// Is this a terminal status (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Is the job still doing (or winding down) work?
    pub fn is_processing(self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Running | JobStatus::Cancelling
        )
    }

    /// Only jobs that have not started winding down accept a stop request.
    pub fn can_stop(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn can_delete(self) -> bool {
        self.is_terminal()
    }

    /// Statuses after which the backend closes the push stream on its own.
    ///
    /// `Cancelled` is terminal but the stream stays open, so it is not listed here.
    pub fn closes_stream(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Statuses that warrant a live subscription in a list view.
    pub fn wants_subscription(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a job performs. Opaque to the tracker; it only changes how
/// callers read `result_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Subnet remapping of a capture into a new session.
    Transform,
    /// DICOM metadata extraction.
    DicomExtract,
    Review,
    MacVendorUpdate,
    #[serde(other)]
    Other,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Transform => "transform",
            JobType::DicomExtract => "dicom_extract",
            JobType::Review => "review",
            JobType::MacVendorUpdate => "mac_vendor_update",
            JobType::Other => "other",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of a job.
///
/// Snapshots are replaced wholesale on update, never patched field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    #[serde(rename = "session_id")]
    pub session_ref: SessionRef,

    /// Display name of the session, when the backend joins it in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_name: Option<String>,

    pub job_type: JobType,
    pub status: JobStatus,

    /// 0..=100, meaningful only while pending or running.
    #[serde(default)]
    pub progress: u8,

    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub error_message: Option<String>,

    /// Artifact produced by a successful job (e.g. the transformed session).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<SessionRef>,

    #[serde(default)]
    pub result_data: Option<serde_json::Value>,
}

impl JobRecord {
    /// Fresh `pending` record, as the backend returns it from a start call.
    pub fn pending(id: JobId, session_ref: SessionRef, job_type: JobType) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_ref,
            trace_name: None,
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            created_at: now,
            updated_at: Some(now),
            error_message: None,
            output_ref: None,
            result_data: None,
        }
    }

    /// Copy of this snapshot with a different status.
    pub fn with_status(&self, status: JobStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Copy of this snapshot with a different status and progress.
    pub fn with_progress(&self, status: JobStatus, progress: u8) -> Self {
        Self {
            status,
            progress: progress.min(100),
            updated_at: Some(Utc::now()),
            ..self.clone()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_processing(&self) -> bool {
        self.status.is_processing()
    }
}

/// Parameters for `JobApi::start_job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub kind: JobType,
    pub session_ref: SessionRef,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl StartRequest {
    pub fn new(kind: JobType, session_ref: SessionRef) -> Self {
        Self {
            kind,
            session_ref,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Timestamps arrive either as RFC 3339 or as naive ISO-8601 (implicitly UTC).
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(dt) => Ok(dt.with_timezone(&Utc)),
            Err(_) => raw
                .parse::<NaiveDateTime>()
                .map(|naive| naive.and_utc()),
        }
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::parse(&raw).map(Some).map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
