//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: テスト・開発用の正本
//! - **SqliteTaskStore**: ファイルに永続化される正本（複数プロセス可）
//! - **BroadcastEventSink**: tokio broadcast によるイベント配信

pub mod broadcast_sink;
pub mod memory_store;
pub mod sqlite;

pub use self::broadcast_sink::BroadcastEventSink;
pub use self::memory_store::InMemoryTaskStore;
pub use self::sqlite::{Database, DatabaseConfig, SqliteTaskStore};
