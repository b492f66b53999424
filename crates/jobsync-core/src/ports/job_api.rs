//! JobApi port - request/response access to the job backend.
//!
//! # 実装
//! - `InMemoryBackend`（テスト・デモ用）
//! - `HttpJobApi`（本番用、REST）

use async_trait::async_trait;

use crate::domain::{ApiError, JobId, JobRecord, StartRequest};

/// Thin wrapper over the backend's job endpoints. Injected, never owned by a tracker.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Create a job; the returned record is usually `pending`.
    async fn start_job(&self, request: &StartRequest) -> Result<JobRecord, ApiError>;

    /// Authoritative snapshot; `ApiError::NotFound` when the job is gone.
    async fn get_job_details(&self, id: &JobId) -> Result<JobRecord, ApiError>;

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, ApiError>;

    /// Request cooperative cancellation. Acknowledged, not awaited.
    async fn stop_job(&self, id: &JobId) -> Result<(), ApiError>;

    /// The backend rejects this unless the job is terminal.
    async fn delete_job(&self, id: &JobId) -> Result<(), ApiError>;
}
