//! Current session cell: one writer, many readers.
//!
//! Replaces ambient "current session" state. Whoever owns the writer decides
//! which session is selected; everything else gets a cloned reader.

use tokio::sync::watch;

use crate::domain::SessionRef;

pub fn session_cell(initial: Option<SessionRef>) -> (SessionWriter, SessionReader) {
    let (tx, rx) = watch::channel(initial);
    (SessionWriter { tx }, SessionReader { rx })
}

/// The only handle allowed to change the selection. Not `Clone`.
#[derive(Debug)]
pub struct SessionWriter {
    tx: watch::Sender<Option<SessionRef>>,
}

impl SessionWriter {
    pub fn select(&self, session: SessionRef) {
        tracing::debug!(session = %session, "session selected");
        self.tx.send_replace(Some(session));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn reader(&self) -> SessionReader {
        SessionReader {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReader {
    rx: watch::Receiver<Option<SessionRef>>,
}

impl SessionReader {
    /// A reader that never sees a session.
    pub fn detached() -> Self {
        let (_, reader) = session_cell(None);
        reader
    }

    pub fn current(&self) -> Option<SessionRef> {
        self.rx.borrow().clone()
    }

    /// Wait for the selection to change. `None` once the writer is gone.
    pub async fn changed(&mut self) -> Option<Option<SessionRef>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}
