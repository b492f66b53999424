//! Push stream frames.
//!
//! Each frame is one JSON object. Most are JobRecord-shaped updates; the
//! backend also sends `{"status": "error", "error": "...", "job_id": ...}` right
//! before closing a stream whose job vanished or could not be polled.

use serde_json::Value;

use super::job::{JobRecord, JobStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Update(JobRecord),
    ServerError { message: String },
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FrameError(String);

impl StreamFrame {
    pub fn decode(data: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(data).map_err(|e| FrameError(format!("invalid json: {e}")))?;

        let raw_status = value.get("status").and_then(Value::as_str).map(str::to_owned);
        if raw_status.as_deref() == Some("error") {
            let message = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("backend reported an error")
                .to_string();
            return Ok(StreamFrame::ServerError { message });
        }

        let record: JobRecord = serde_json::from_value(value)
            .map_err(|e| FrameError(format!("not a job record: {e}")))?;
        if record.status == JobStatus::Unrecognized {
            tracing::warn!(
                job_id = %record.id,
                raw_status = raw_status.as_deref().unwrap_or("<missing>"),
                "frame carries an unrecognized status"
            );
        }
        Ok(StreamFrame::Update(record))
    }
}
