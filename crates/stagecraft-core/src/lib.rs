//! stagecraft-core
//!
//! Core building blocks for the Stagecraft generation scheduler.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, stage, task, state, errors, events, claim, dependency, decision, plan）
//! - **ports**: 抽象化レイヤー（TaskStore, StageExecutor, EventSink, Clock, IdGenerator, LimitsSource）
//! - **app**: アプリケーションロジック（builder, scheduler, executor, recovery, registry, stats）
//! - **impls**: 実装（InMemoryTaskStore, SqliteTaskStore, BroadcastEventSink）
//! - **config**: TOML 設定ファイル

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{BuildError, Scheduler, SchedulerBuilder, SchedulerError, SchedulerSettings, SchedulerStats};
pub use config::{ConfigError, StagecraftConfig};
