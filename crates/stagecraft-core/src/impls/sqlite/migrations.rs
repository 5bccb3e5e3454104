//! Database Migrations
//!
//! Schema creation and version management.

use rusqlite::Connection;

use super::database::Database;
use crate::ports::StoreResult;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Run all pending migrations.
pub fn run_migrations(db: &Database) -> StoreResult<()> {
    db.with_connection(|conn| {
        create_migrations_table(conn)?;

        let current_version = schema_version(conn)?;
        if current_version < 1 {
            let tx = conn.transaction()?;
            migrate_v1(&tx)?;
            set_schema_version(&tx, 1)?;
            tx.commit()?;
        }

        Ok(())
    })
}

fn create_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

pub fn schema_version(conn: &Connection) -> StoreResult<i32> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?)
}

fn set_schema_version(conn: &Connection, version: i32) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration v1: tasks table.
///
/// `seq` preserves insertion order for claim-order ties. Timestamps are
/// fixed-width RFC 3339 strings so they compare correctly as text.
fn migrate_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS tasks (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            project_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            priority INTEGER NOT NULL,
            stage_group INTEGER NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            progress_detail TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            depends_on TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error TEXT,
            error_stack TEXT,
            error_kind TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_claim
            ON tasks(status, priority DESC, stage_group, created_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_depends_on ON tasks(depends_on);
        ",
    )?;
    Ok(())
}
