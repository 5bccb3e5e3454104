//! SQLite backend
//!
//! - `database`: 接続設定とトランザクション
//! - `migrations`: スキーマのバージョン管理
//! - `store`: TaskStore 実装

pub mod database;
pub mod migrations;
pub mod store;

pub use self::database::{Database, DatabaseConfig};
pub use self::store::SqliteTaskStore;
