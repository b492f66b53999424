//! StreamSubscription - one push connection per job id.
//!
//! # 設計原則
//! - At most one subscription per job id, enforced by [`SubscriptionRegistry`].
//!   A second `open` for the same id attaches another listener to the existing
//!   subscription instead of connecting again.
//! - The transport is closed exactly once: when the server ends the stream, or
//!   when the last [`SubscriptionLease`] is released.
//! - A disconnect is "expected" only if a `completed`/`failed` frame was seen
//!   and the transport reports a clean close. Anything else is an interruption.
//!
//! ```text
//! connecting --connect ok--> open --server close / release--> closed_normal
//!      |                       |
//!      +-----------------------+--error / early close--> closed_error
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{JobId, JobRecord, ProtocolAnomaly, StreamFrame};
use crate::ports::{EventSource, EventStream, TransportEvent};

/// Receives what a subscription sees. Called from the pump task; must not block.
pub trait StreamListener: Send + Sync {
    /// The transport is connected.
    fn on_open(&self, _job_id: &JobId) {}

    /// A decoded update, forwarded before the subscription inspects it.
    fn on_record(&self, record: JobRecord);

    fn on_anomaly(&self, _anomaly: ProtocolAnomaly) {}

    /// Last call a listener receives.
    fn on_closed(&self, job_id: &JobId, closure: &StreamClosure);
}

/// Why a subscription ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamClosure {
    /// The server closed the stream cleanly after a terminal frame.
    Finished,
    /// Every lease was released.
    Released,
    /// Anything else: connect failure, error, or a close before a terminal frame.
    Interrupted { reason: String },
}

impl StreamClosure {
    pub fn is_error(&self) -> bool {
        matches!(self, StreamClosure::Interrupted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Open,
    ClosedNormal,
    ClosedError,
}

impl SubscriptionState {
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            SubscriptionState::ClosedNormal | SubscriptionState::ClosedError
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

type ListenerId = u64;

struct Subscription {
    job_id: JobId,
    state: watch::Sender<SubscriptionState>,
    /// `true` once the subscription stops accepting listeners.
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn StreamListener>)>>,
    next_listener: AtomicU64,
}

impl Subscription {
    fn new(job_id: JobId) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Connecting);
        let (shutdown, _) = watch::channel(false);
        Self {
            job_id,
            state,
            shutdown,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        }
    }

    fn current_state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Attach a listener unless the subscription is shutting down.
    /// Returns the listener id and whether the transport is already open.
    fn attach(&self, listener: Arc<dyn StreamListener>) -> Option<(ListenerId, bool)> {
        let mut listeners = lock(&self.listeners);
        if *self.shutdown.borrow() {
            return None;
        }
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        listeners.push((id, listener));
        Some((id, self.current_state() == SubscriptionState::Open))
    }

    fn detach(&self, id: ListenerId) {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|(other, _)| *other != id);
        if listeners.is_empty() && !*self.shutdown.borrow() {
            debug!(job_id = %self.job_id, "last listener released subscription");
            self.shutdown.send_replace(true);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn StreamListener>> {
        lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    fn mark_open(&self) {
        let listeners = {
            let listeners = lock(&self.listeners);
            self.state.send_replace(SubscriptionState::Open);
            listeners
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect::<Vec<_>>()
        };
        debug!(job_id = %self.job_id, "subscription open");
        for listener in listeners {
            listener.on_open(&self.job_id);
        }
    }

    fn forward(&self, record: JobRecord) {
        for listener in self.snapshot() {
            listener.on_record(record.clone());
        }
    }

    fn anomaly(&self, anomaly: ProtocolAnomaly) {
        for listener in self.snapshot() {
            listener.on_anomaly(anomaly.clone());
        }
    }

    fn finish(self: &Arc<Self>, registry: &Weak<RegistryInner>, closure: StreamClosure) {
        if let Some(registry) = registry.upgrade() {
            let mut live = lock(&registry.live);
            if live
                .get(&self.job_id)
                .is_some_and(|current| Arc::ptr_eq(current, self))
            {
                live.remove(&self.job_id);
            }
        }

        let listeners = {
            let mut listeners = lock(&self.listeners);
            self.shutdown.send_replace(true);
            std::mem::take(&mut *listeners)
        };
        self.state.send_replace(if closure.is_error() {
            SubscriptionState::ClosedError
        } else {
            SubscriptionState::ClosedNormal
        });

        match &closure {
            StreamClosure::Interrupted { reason } => {
                warn!(job_id = %self.job_id, %reason, "subscription interrupted")
            }
            other => debug!(job_id = %self.job_id, closure = ?other, "subscription closed"),
        }
        for (_, listener) in listeners {
            listener.on_closed(&self.job_id, &closure);
        }
    }
}

/// Resolves once shutdown has been requested.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn pump(
    registry: Weak<RegistryInner>,
    source: Arc<dyn EventSource>,
    sub: Arc<Subscription>,
    mut shutdown: watch::Receiver<bool>,
    predecessor: Option<Arc<Subscription>>,
) {
    if let Some(previous) = predecessor {
        let mut previous_state = previous.state.subscribe();
        let released = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => true,
            _ = async {
                let _ = previous_state.wait_for(|state| state.is_closed()).await;
            } => false,
        };
        if released {
            sub.finish(&registry, StreamClosure::Released);
            return;
        }
    }

    let connected = tokio::select! {
        _ = shutdown_requested(&mut shutdown) => None,
        result = source.connect(&sub.job_id) => Some(result),
    };

    let closure = match connected {
        None => StreamClosure::Released,
        Some(Err(err)) => StreamClosure::Interrupted {
            reason: err.to_string(),
        },
        Some(Ok(mut stream)) => {
            sub.mark_open();
            let closure = run(&sub, stream.as_mut(), &mut shutdown).await;
            stream.close();
            closure
        }
    };

    sub.finish(&registry, closure);
}

async fn run(
    sub: &Subscription,
    stream: &mut dyn EventStream,
    shutdown: &mut watch::Receiver<bool>,
) -> StreamClosure {
    let mut terminal_observed = false;
    let mut server_error: Option<String> = None;

    loop {
        if *shutdown.borrow() {
            return StreamClosure::Released;
        }

        let event = tokio::select! {
            _ = shutdown.changed() => continue,
            event = stream.next_event() => event,
        };

        match event {
            TransportEvent::Message(data) => match StreamFrame::decode(&data) {
                Ok(StreamFrame::Update(record)) => {
                    let closes = record.status.closes_stream();
                    sub.forward(record);
                    if closes {
                        terminal_observed = true;
                    }
                }
                Ok(StreamFrame::ServerError { message }) => {
                    warn!(job_id = %sub.job_id, %message, "server reported a stream error");
                    server_error = Some(message);
                }
                Err(err) => {
                    let anomaly = ProtocolAnomaly::MalformedFrame {
                        job_id: sub.job_id.clone(),
                        detail: err.to_string(),
                    };
                    warn!(job_id = %sub.job_id, error = %err, "skipping malformed frame");
                    sub.anomaly(anomaly);
                }
            },
            TransportEvent::Disconnected { clean, detail } => {
                if terminal_observed && clean {
                    return StreamClosure::Finished;
                }
                let reason = server_error.or(detail).unwrap_or_else(|| {
                    if clean {
                        "stream closed before the job finished".to_string()
                    } else {
                        "connection lost".to_string()
                    }
                });
                return StreamClosure::Interrupted { reason };
            }
        }
    }
}

struct RegistryInner {
    source: Arc<dyn EventSource>,
    live: Mutex<HashMap<JobId, Arc<Subscription>>>,
}

/// Shared map from job id to its live subscription.
///
/// Clone it to share between a tracker and a coordinator; clones see the same map.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                source,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe `listener` to `job_id`, reusing a live subscription if one exists.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self, job_id: &JobId, listener: Arc<dyn StreamListener>) -> SubscriptionLease {
        let (sub, listener_id, already_open) = {
            let mut live = lock(&self.inner.live);
            let attached = live
                .get(job_id)
                .and_then(|sub| sub.attach(listener.clone()).map(|at| (sub.clone(), at)));
            match attached {
                Some((sub, (id, open))) => {
                    debug!(job_id = %job_id, "attached to existing subscription");
                    (sub, id, open)
                }
                None => {
                    let sub = Arc::new(Subscription::new(job_id.clone()));
                    // a fresh subscription is never shutting down
                    let (id, _) = sub.attach(listener.clone()).unwrap_or((0, false));
                    // a released subscription whose transport may still be open
                    let predecessor = live.insert(job_id.clone(), sub.clone());
                    tokio::spawn(pump(
                        Arc::downgrade(&self.inner),
                        self.inner.source.clone(),
                        sub.clone(),
                        sub.shutdown.subscribe(),
                        predecessor,
                    ));
                    info!(job_id = %job_id, "subscription opened");
                    (sub, id, false)
                }
            }
        };

        if already_open {
            listener.on_open(job_id);
        }

        SubscriptionLease {
            sub,
            listener_id,
            released: false,
        }
    }

    /// Whether a subscription for `job_id` exists and its transport is open.
    pub fn is_open(&self, job_id: &JobId) -> bool {
        self.state(job_id) == Some(SubscriptionState::Open)
    }

    pub fn state(&self, job_id: &JobId) -> Option<SubscriptionState> {
        lock(&self.inner.live).get(job_id).map(|sub| sub.current_state())
    }

    /// Number of subscriptions that have not finished yet.
    pub fn open_count(&self) -> usize {
        lock(&self.inner.live).len()
    }

    pub fn live_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = lock(&self.inner.live).keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// A listener's hold on a subscription. Dropping it detaches the listener; the
/// last detach closes the transport.
pub struct SubscriptionLease {
    sub: Arc<Subscription>,
    listener_id: ListenerId,
    released: bool,
}

impl SubscriptionLease {
    pub fn job_id(&self) -> &JobId {
        &self.sub.job_id
    }

    pub fn state(&self) -> SubscriptionState {
        self.sub.current_state()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.sub.state.subscribe()
    }

    /// Wait until the subscription has closed, returning the final state.
    pub async fn closed(&self) -> SubscriptionState {
        let mut rx = self.sub.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_closed() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    pub fn release(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.released {
            self.released = true;
            self.sub.detach(self.listener_id);
        }
    }
}

impl Drop for SubscriptionLease {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for SubscriptionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionLease")
            .field("job_id", &self.sub.job_id)
            .field("state", &self.state())
            .finish()
    }
}
