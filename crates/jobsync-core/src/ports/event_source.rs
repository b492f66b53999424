//! EventSource port - the push transport, one stream per job id.
//!
//! Byte-level delivery is assumed reliable; only the application-level events
//! below matter to the subscription.

use async_trait::async_trait;

use crate::domain::{JobId, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One frame's data payload.
    Message(String),
    /// The transport went away. `clean` is true when it reports a normal
    /// closed state (the server ended the stream) rather than a failure.
    Disconnected { clean: bool, detail: Option<String> },
}

/// An open push stream.
#[async_trait]
pub trait EventStream: Send {
    /// Next event. After `Disconnected` nothing further is delivered.
    async fn next_event(&mut self) -> TransportEvent;

    /// Close the underlying transport.
    fn close(&mut self);
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self, job_id: &JobId) -> Result<Box<dyn EventStream>, TransportError>;
}
