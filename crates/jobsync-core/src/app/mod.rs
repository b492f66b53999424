//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてジョブ追跡のロジックを実装します。
//!
//! # 主要コンポーネント
//! - **TrackingContext**: 依存関係の明示的な受け渡し
//! - **SubscriptionRegistry**: ジョブごとに高々一本の push ストリーム
//! - **JobTracker**: 単一ジョブの start / resume / stop / delete
//! - **MultiJobCoordinator**: 一覧表示向けの購読管理
//! - **follow**: 両者が共有する 1 ジョブ分の追従処理
//! - **session**: 現在のキャプチャセッション

pub mod completion;
pub mod context;
pub mod coordinator;
mod follow;
pub mod guards;
pub mod session;
pub mod status;
pub mod subscription;
pub mod tracker;

// 主要な型を再エクスポート
pub use self::completion::DEFAULT_COMPLETION_KEY;
pub use self::context::{BuildError, TrackingContext, TrackingContextBuilder};
pub use self::coordinator::{MultiJobCoordinator, SyncReport};
pub use self::guards::ensure_deletable;
pub use self::session::{SessionReader, SessionWriter, session_cell};
pub use self::status::JobCounts;
pub use self::subscription::{
    StreamClosure, StreamListener, SubscriptionLease, SubscriptionRegistry, SubscriptionState,
};
pub use self::tracker::{JobTracker, ResumeOutcome};
