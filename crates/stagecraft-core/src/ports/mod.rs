//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部の協力者（永続化、生成処理、設定、通知）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - StageExecutor は stage ごとの生成処理（scheduler は中身を知らない）
//! - LimitsSource は claim のたびに読む（実行中に変更可能）

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod limits;
pub mod stage_executor;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::limits::{LimitsSource, SharedLimits, StaticLimits};
pub use self::stage_executor::{ProgressReporter, StageContext, StageExecutor, StageInput};
pub use self::task_store::{StoreError, StoreResult, TaskStore, validate_batch};
