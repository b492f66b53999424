//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryBackend**: テスト・デモ用の JobApi + EventSource
//! - **SharedStorage / ContextStorage**: 複数コンテキスト間で共有するストレージ
//! - **FileStorage**: CLI 用の JSON ファイルストレージ
//! - **HttpJobApi / SseEventSource**: 本番用の REST + SSE クライアント

pub mod file_storage;
pub mod http;
pub mod inmem_backend;
pub mod memory_storage;

pub use self::file_storage::{FileStorage, StorageError};
pub use self::http::{HttpJobApi, SseEventSource, SseParser};
pub use self::inmem_backend::InMemoryBackend;
pub use self::memory_storage::{ContextStorage, SharedStorage};
