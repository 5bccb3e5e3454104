//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせて scheduler を実装します。
//!
//! # 主要コンポーネント
//! - **SchedulerBuilder**: scheduler の構築とワイヤリング
//! - **Scheduler**: claim ループ、stale sweep、公開 API
//! - **TaskExecutor**: claim 済みタスク 1 件の実行（進捗・キャンセル）
//! - **FailureManager**: 失敗方針の適用、カスケード、起動時リカバリ
//! - **StageRegistry**: stage → StageExecutor の対応表

pub mod builder;
mod events;
pub mod executor;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod stats;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, SchedulerBuilder};
pub use self::executor::{RunOutcome, TaskExecutor};
pub use self::recovery::FailureManager;
pub use self::registry::{RegistryError, StageRegistry};
pub use self::scheduler::{Scheduler, SchedulerError, SchedulerResult, SchedulerSettings};
pub use self::stats::SchedulerStats;
