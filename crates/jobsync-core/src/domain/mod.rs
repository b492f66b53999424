//! Domain model (ids, job records, tracked state, frames, errors).

pub mod errors;
pub mod frame;
pub mod ids;
pub mod job;
pub mod state;

pub use errors::{ApiError, ProtocolAnomaly, TrackerError, TransportError};
pub use frame::{FrameError, StreamFrame};
pub use ids::{JobId, SessionRef};
pub use job::{JobRecord, JobStatus, JobType, StartRequest};
pub use state::{Applied, ConnectionState, TrackedJob};
