//! InMemoryBackend - 開発用・テスト用のジョブバックエンド
//!
//! Implements both [`JobApi`] and [`EventSource`] over one in-process store.
//!
//! # 使い方
//! - Tests script it: `insert`, `advance`, `publish`, `send_raw`, `disconnect`,
//!   plus one-shot failure injection (`fail_next_get` and friends).
//! - The demo lets it drive itself with [`InMemoryBackend::with_auto_run`].
//!
//! Stream semantics follow the real backend: the stream ends on its own after
//! `completed` or `failed`, stays open after `cancelled`, and reports an error
//! frame before closing when the job is deleted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::domain::{
    ApiError, JobId, JobRecord, JobStatus, JobType, SessionRef, StartRequest, TransportError,
};
use crate::ports::{EventSource, EventStream, JobApi, TransportEvent};

#[derive(Default)]
struct Store {
    jobs: HashMap<JobId, JobRecord>,
    order: Vec<JobId>,
    streams: HashMap<JobId, Vec<mpsc::UnboundedSender<TransportEvent>>>,
    connects: HashMap<JobId, usize>,
    stop_requests: Vec<JobId>,
    fail_next_get: Option<ApiError>,
    fail_next_start: Option<ApiError>,
    fail_next_connect: Option<TransportError>,
}

impl Store {
    fn send(&mut self, id: &JobId, event: TransportEvent) {
        if let Some(senders) = self.streams.get_mut(id) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn publish(&mut self, record: JobRecord) {
        let data = match serde_json::to_string(&record) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(job_id = %record.id, error = %err, "failed to encode job record");
                return;
            }
        };
        let id = record.id.clone();
        let closes = record.status.closes_stream();
        if !self.jobs.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.jobs.insert(id.clone(), record);
        self.send(&id, TransportEvent::Message(data));
        if closes {
            self.end_streams(&id, true, None);
        }
    }

    fn end_streams(&mut self, id: &JobId, clean: bool, detail: Option<String>) {
        self.send(
            id,
            TransportEvent::Disconnected {
                clean,
                detail: detail.clone(),
            },
        );
        self.streams.remove(id);
    }
}

/// In-process job backend.
#[derive(Clone)]
pub struct InMemoryBackend {
    store: Arc<Mutex<Store>>,
    closes: Arc<Mutex<HashMap<JobId, usize>>>,
    next_id: Arc<AtomicU64>,
    auto_run: Option<Duration>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            closes: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            auto_run: None,
        }
    }

    /// Jobs started through this backend advance by themselves every `tick`.
    /// New subscribers immediately receive the current snapshot.
    pub fn with_auto_run(mut self, tick: Duration) -> Self {
        self.auto_run = Some(tick);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_id(&self) -> JobId {
        JobId::from(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Put a record into the store without telling any subscriber.
    pub fn insert(&self, record: JobRecord) {
        let mut store = self.lock();
        if !store.jobs.contains_key(&record.id) {
            store.order.push(record.id.clone());
        }
        store.jobs.insert(record.id.clone(), record);
    }

    /// Record a new snapshot and push it to every open stream for the job.
    pub fn publish(&self, record: JobRecord) {
        self.lock().publish(record);
    }

    /// Move a stored job to `status`/`progress` and publish the result.
    pub fn advance(&self, id: &JobId, status: JobStatus, progress: u8) -> Option<JobRecord> {
        let mut store = self.lock();
        let next = store.jobs.get(id)?.with_progress(status, progress);
        store.publish(next.clone());
        Some(next)
    }

    /// Push an arbitrary frame payload, bypassing the store.
    pub fn send_raw(&self, id: &JobId, data: impl Into<String>) {
        self.lock().send(id, TransportEvent::Message(data.into()));
    }

    /// End every open stream for the job.
    pub fn disconnect(&self, id: &JobId, clean: bool) {
        let detail = (!clean).then(|| "connection reset".to_string());
        self.lock().end_streams(id, clean, detail);
    }

    pub fn fail_next_get(&self, error: ApiError) {
        self.lock().fail_next_get = Some(error);
    }

    pub fn fail_next_start(&self, error: ApiError) {
        self.lock().fail_next_start = Some(error);
    }

    pub fn fail_next_connect(&self, error: TransportError) {
        self.lock().fail_next_connect = Some(error);
    }

    pub fn job(&self, id: &JobId) -> Option<JobRecord> {
        self.lock().jobs.get(id).cloned()
    }

    /// How many streams were ever opened for the job.
    pub fn connect_count(&self, id: &JobId) -> usize {
        self.lock().connects.get(id).copied().unwrap_or(0)
    }

    /// How many times a stream for the job was closed by its consumer.
    pub fn close_count(&self, id: &JobId) -> usize {
        let closes = self.closes.lock().unwrap_or_else(|e| e.into_inner());
        closes.get(id).copied().unwrap_or(0)
    }

    /// Streams for the job whose consumer is still attached.
    pub fn open_streams(&self, id: &JobId) -> usize {
        self.lock()
            .streams
            .get(id)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn stop_requests(&self) -> Vec<JobId> {
        self.lock().stop_requests.clone()
    }

    fn spawn_runner(&self, id: JobId, tick: Duration) {
        let weak = Arc::downgrade(&self.store);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                let Some(store) = weak.upgrade() else {
                    return;
                };
                let mut store = store.lock().unwrap_or_else(|e| e.into_inner());
                let Some(current) = store.jobs.get(&id).cloned() else {
                    return;
                };
                let next = match current.status {
                    JobStatus::Pending => current.with_progress(JobStatus::Running, 0),
                    JobStatus::Running if current.progress >= 80 => {
                        let mut done = current.with_progress(JobStatus::Completed, 100);
                        if done.job_type == JobType::Transform {
                            done.output_ref = Some(SessionRef::new(Ulid::new().to_string()));
                        }
                        done.result_data = Some(serde_json::json!({ "source": current.session_ref }));
                        done
                    }
                    JobStatus::Running => current.with_progress(JobStatus::Running, current.progress + 20),
                    JobStatus::Cancelling => {
                        let mut cancelled = current.with_status(JobStatus::Cancelled);
                        cancelled.updated_at = Some(Utc::now());
                        cancelled.error_message = Some("Job cancelled by user.".into());
                        cancelled
                    }
                    _ => return,
                };
                let finished = next.is_terminal();
                store.publish(next);
                if finished {
                    return;
                }
            }
        });
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobApi for InMemoryBackend {
    async fn start_job(&self, request: &StartRequest) -> Result<JobRecord, ApiError> {
        if let Some(err) = self.lock().fail_next_start.take() {
            return Err(err);
        }
        let record = JobRecord::pending(
            self.allocate_id(),
            request.session_ref.clone(),
            request.kind,
        );
        self.insert(record.clone());
        tracing::debug!(job_id = %record.id, job_type = %record.job_type, "job created");
        if let Some(tick) = self.auto_run {
            self.spawn_runner(record.id.clone(), tick);
        }
        Ok(record)
    }

    async fn get_job_details(&self, id: &JobId) -> Result<JobRecord, ApiError> {
        let mut store = self.lock();
        if let Some(err) = store.fail_next_get.take() {
            return Err(err);
        }
        store
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(id.clone()))
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, ApiError> {
        let store = self.lock();
        Ok(store
            .order
            .iter()
            .rev()
            .filter_map(|id| store.jobs.get(id).cloned())
            .collect())
    }

    async fn stop_job(&self, id: &JobId) -> Result<(), ApiError> {
        let mut store = self.lock();
        let job = store
            .jobs
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(id.clone()))?;
        if !job.status.can_stop() {
            return Err(ApiError::Rejected {
                status: 400,
                message: format!("Job cannot be stopped in status '{}'", job.status),
            });
        }
        job.status = JobStatus::Cancelling;
        job.updated_at = Some(Utc::now());
        store.stop_requests.push(id.clone());
        Ok(())
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), ApiError> {
        let mut store = self.lock();
        let status = store
            .jobs
            .get(id)
            .map(|job| job.status)
            .ok_or_else(|| ApiError::NotFound(id.clone()))?;
        if !status.can_delete() {
            return Err(ApiError::Rejected {
                status: 400,
                message: format!("Cannot delete job in status '{status}'"),
            });
        }
        store.jobs.remove(id);
        store.order.retain(|other| other != id);
        let frame = serde_json::json!({
            "status": "error",
            "error": "Job not found or deleted",
            "job_id": id,
        });
        store.send(id, TransportEvent::Message(frame.to_string()));
        store.end_streams(id, true, None);
        Ok(())
    }
}

#[async_trait]
impl EventSource for InMemoryBackend {
    async fn connect(&self, job_id: &JobId) -> Result<Box<dyn EventStream>, TransportError> {
        let mut store = self.lock();
        if let Some(err) = store.fail_next_connect.take() {
            return Err(err);
        }
        let Some(current) = store.jobs.get(job_id).cloned() else {
            return Err(TransportError::NotFound(job_id.clone()));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if self.auto_run.is_some()
            && let Ok(data) = serde_json::to_string(&current)
        {
            let _ = tx.send(TransportEvent::Message(data));
        }
        store.streams.entry(job_id.clone()).or_default().push(tx);
        *store.connects.entry(job_id.clone()).or_default() += 1;
        tracing::trace!(job_id = %job_id, "event stream connected");

        Ok(Box::new(InMemoryStream {
            job_id: job_id.clone(),
            rx,
            closes: self.closes.clone(),
            ended: false,
        }))
    }
}

struct InMemoryStream {
    job_id: JobId,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    closes: Arc<Mutex<HashMap<JobId, usize>>>,
    ended: bool,
}

#[async_trait]
impl EventStream for InMemoryStream {
    async fn next_event(&mut self) -> TransportEvent {
        if self.ended {
            return TransportEvent::Disconnected {
                clean: true,
                detail: None,
            };
        }
        let event = self.rx.recv().await.unwrap_or(TransportEvent::Disconnected {
            clean: false,
            detail: Some("stream dropped".into()),
        });
        if matches!(event, TransportEvent::Disconnected { .. }) {
            self.ended = true;
        }
        event
    }

    fn close(&mut self) {
        self.rx.close();
        let mut closes = self.closes.lock().unwrap_or_else(|e| e.into_inner());
        *closes.entry(self.job_id.clone()).or_default() += 1;
    }
}
