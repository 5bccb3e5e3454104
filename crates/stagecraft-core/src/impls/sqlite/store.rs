//! SqliteTaskStore - ファイルに永続化される TaskStore
//!
//! # 実装詳細
//! - 全操作を spawn_blocking で実行（rusqlite は同期 API）
//! - 書き込みは BEGIN IMMEDIATE トランザクション
//! - 複数プロセスが同じファイルを開いても claim は一度だけ成功する
//!   （条件付き UPDATE ... WHERE status = 'pending'）

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::database::{Database, DatabaseConfig};
use super::migrations::run_migrations;
use crate::domain::{
    ClaimRequest, ClaimSource, DependencyGraph, ErrorKind, NewTask, ProjectId, Progress,
    StageType, StatusCounts, TaskFailure, TaskId, TaskRecord, TaskStatus, run_claim_pass,
};
use crate::ports::{Clock, StoreError, StoreResult, SystemClock, TaskStore, validate_batch};

const COLUMNS: &str = "id, project_id, stage, status, priority, stage_group, progress, \
     progress_detail, attempts, max_attempts, depends_on, created_at, started_at, \
     completed_at, error, error_stack, error_kind";

const CLAIM_ORDER: &str = "priority DESC, stage_group ASC, created_at ASC, seq ASC";

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let Some(raw) = row.get::<_, Option<String>>(idx)? else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| Some(ts.with_timezone(&Utc)))
        .map_err(|e| conversion_error(idx, format!("timestamp {raw:?}: {e}")))
}

fn parse_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<TaskId>> {
    let Some(raw) = row.get::<_, Option<String>>(idx)? else {
        return Ok(None);
    };
    TaskId::parse(&raw)
        .map(Some)
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn required<T>(value: Option<T>, idx: usize) -> rusqlite::Result<T> {
    value.ok_or(rusqlite::Error::InvalidColumnType(idx, "NULL".into(), Type::Null))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let stage: String = row.get(2)?;
    let status: String = row.get(3)?;
    let error_kind = row
        .get::<_, Option<String>>(16)?
        .map(|raw| raw.parse::<ErrorKind>().map_err(|e| conversion_error(16, e)))
        .transpose()?;

    Ok(TaskRecord {
        id: required(parse_id(row, 0)?, 0)?,
        project_id: ProjectId::new(row.get::<_, String>(1)?),
        stage: stage
            .parse::<StageType>()
            .map_err(|e| conversion_error(2, e.to_string()))?,
        status: status
            .parse::<TaskStatus>()
            .map_err(|e| conversion_error(3, e.to_string()))?,
        priority: row.get(4)?,
        stage_group: row.get(5)?,
        progress: Progress {
            percent: row.get(6)?,
            detail: row.get(7)?,
        },
        attempts: row.get(8)?,
        max_attempts: row.get(9)?,
        depends_on: parse_id(row, 10)?,
        created_at: required(parse_ts(row, 11)?, 11)?,
        started_at: parse_ts(row, 12)?,
        completed_at: parse_ts(row, 13)?,
        error: row.get(14)?,
        error_stack: row.get(15)?,
        error_kind,
    })
}

fn query_tasks(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<TaskRecord>> {
    let sql = format!("SELECT {COLUMNS} FROM tasks WHERE {filter} ORDER BY {CLAIM_ORDER}");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params, task_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn get_task(conn: &Connection, id: TaskId) -> StoreResult<Option<TaskRecord>> {
    let sql = format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1");
    Ok(conn
        .query_row(&sql, [id.as_ulid().to_string()], task_from_row)
        .optional()?)
}

fn task_exists(conn: &Connection, id: TaskId) -> StoreResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
        [id.as_ulid().to_string()],
        |row| row.get(0),
    )?)
}

fn insert_task(conn: &Connection, record: &TaskRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO tasks (id, project_id, stage, status, priority, stage_group, progress, \
         progress_detail, attempts, max_attempts, depends_on, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            record.id.as_ulid().to_string(),
            record.project_id.as_str(),
            record.stage.as_str(),
            record.status.as_str(),
            record.priority,
            record.stage_group,
            record.progress.percent,
            record.progress.detail,
            record.attempts,
            record.max_attempts,
            record.depends_on.map(|id| id.as_ulid().to_string()),
            format_ts(record.created_at),
        ],
    )?;
    Ok(())
}

fn ids_of(records: Vec<TaskRecord>) -> Vec<TaskId> {
    records.into_iter().map(|t| t.id).collect()
}

fn reset_interrupted(conn: &Connection, id: TaskId) -> StoreResult<bool> {
    let changed = conn.execute(
        "UPDATE tasks SET status = 'pending', progress = 0, progress_detail = NULL, \
         started_at = NULL WHERE id = ?1 AND status = 'processing'",
        [id.as_ulid().to_string()],
    )?;
    Ok(changed > 0)
}

fn cancel_if_pending(conn: &Connection, id: TaskId, now: &str) -> StoreResult<bool> {
    let changed = conn.execute(
        "UPDATE tasks SET status = 'cancelled', completed_at = ?1 \
         WHERE id = ?2 AND status = 'pending'",
        params![now, id.as_ulid().to_string()],
    )?;
    Ok(changed > 0)
}

/// Cancel every pending task transitively waiting for `id`.
fn cancel_dependents(conn: &Connection, id: TaskId, now: &str) -> StoreResult<Vec<TaskId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, depends_on FROM tasks \
         WHERE project_id = (SELECT project_id FROM tasks WHERE id = ?1)",
    )?;
    let edges = stmt
        .query_map([id.as_ulid().to_string()], |row| {
            Ok((required(parse_id(row, 0)?, 0)?, parse_id(row, 1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let graph = DependencyGraph::from_edges(edges);
    let mut cancelled = Vec::new();
    for dependent in graph.transitive_dependents(id) {
        if cancel_if_pending(conn, dependent, now)? {
            cancelled.push(dependent);
        }
    }
    Ok(cancelled)
}

/// Claim primitives over an open write transaction.
struct TxSource<'a> {
    conn: &'a Connection,
    now: String,
}

impl ClaimSource for TxSource<'_> {
    type Error = StoreError;

    fn pending_in_claim_order(&mut self) -> StoreResult<Vec<TaskRecord>> {
        query_tasks(self.conn, "status = 'pending'", [])
    }

    fn status_of(&mut self, id: TaskId) -> StoreResult<Option<TaskStatus>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                [id.as_ulid().to_string()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| s.parse::<TaskStatus>())
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn try_claim(&mut self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        let sql = format!(
            "UPDATE tasks SET status = 'processing', attempts = attempts + 1, \
             started_at = ?1, completed_at = NULL \
             WHERE id = ?2 AND status = 'pending' RETURNING {COLUMNS}"
        );
        Ok(self
            .conn
            .query_row(&sql, params![self.now, id.as_ulid().to_string()], task_from_row)
            .optional()?)
    }
}

/// SqliteTaskStore は SQLite ファイルを正本とする TaskStore
#[derive(Clone)]
pub struct SqliteTaskStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl SqliteTaskStore {
    /// Open (or create) the database and apply migrations.
    pub fn open(config: DatabaseConfig) -> StoreResult<Self> {
        Self::new(Database::open(config)?, Arc::new(SystemClock))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::new(Database::open_in_memory()?, Arc::new(SystemClock))
    }

    pub fn new(db: Database, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        run_migrations(&db)?;
        tracing::debug!(path = %db.path().display(), "task database ready");
        Ok(Self { db, clock })
    }

    /// Current time at the precision the database keeps.
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(6)
    }

    /// Run `f` on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Database, DateTime<Utc>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let now = self.now();
        tokio::task::spawn_blocking(move || f(&db, now))
            .await
            .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_batch(&self, tasks: Vec<NewTask>) -> StoreResult<Vec<TaskRecord>> {
        self.blocking(move |db, now| {
            db.transaction(|tx| {
                validate_batch(&tasks, |id| task_exists(tx, id))?;
                let mut inserted = Vec::with_capacity(tasks.len());
                for task in tasks {
                    let record = TaskRecord::new(task, now);
                    insert_task(tx, &record)?;
                    inserted.push(record);
                }
                Ok(inserted)
            })
        })
        .await
    }

    async fn get(&self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        self.blocking(move |db, _| db.with_connection(|conn| get_task(conn, id)))
            .await
    }

    async fn list_by_project(&self, project_id: &ProjectId) -> StoreResult<Vec<TaskRecord>> {
        let project_id = project_id.clone();
        self.blocking(move |db, _| {
            db.with_connection(|conn| query_tasks(conn, "project_id = ?1", [project_id.as_str()]))
        })
        .await
    }

    async fn list_by_status(&self, status: TaskStatus) -> StoreResult<Vec<TaskRecord>> {
        self.blocking(move |db, _| {
            db.with_connection(|conn| query_tasks(conn, "status = ?1", [status.as_str()]))
        })
        .await
    }

    async fn count_by_status(&self) -> StoreResult<StatusCounts> {
        self.blocking(|db, _| {
            db.with_connection(|conn| {
                let mut stmt =
                    conn.prepare_cached("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut counts = StatusCounts::default();
                for (status, n) in rows {
                    let status = status
                        .parse::<TaskStatus>()
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                    counts.add(status, usize::try_from(n).unwrap_or_default());
                }
                Ok(counts)
            })
        })
        .await
    }

    async fn claim_next(&self) -> StoreResult<Option<TaskRecord>> {
        Ok(self.claim_batch(&ClaimRequest::single()).await?.pop())
    }

    async fn claim_batch(&self, request: &ClaimRequest) -> StoreResult<Vec<TaskRecord>> {
        let request = request.clone();
        self.blocking(move |db, now| {
            db.transaction(|tx| {
                let mut source = TxSource {
                    conn: tx,
                    now: format_ts(now),
                };
                run_claim_pass(&mut source, &request)
            })
        })
        .await
    }

    async fn update_progress(&self, id: TaskId, progress: &Progress) -> StoreResult<bool> {
        let progress = progress.clone();
        self.blocking(move |db, _| {
            db.with_connection(|conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET progress = ?1, progress_detail = ?2 \
                     WHERE id = ?3 AND status = 'processing'",
                    params![progress.percent, progress.detail, id.as_ulid().to_string()],
                )?;
                Ok(changed > 0)
            })
        })
        .await
    }

    async fn update_priority(&self, id: TaskId, priority: i32) -> StoreResult<bool> {
        self.blocking(move |db, _| {
            db.with_connection(|conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET priority = ?1 WHERE id = ?2",
                    params![priority, id.as_ulid().to_string()],
                )?;
                Ok(changed > 0)
            })
        })
        .await
    }

    async fn mark_completed(&self, id: TaskId) -> StoreResult<bool> {
        self.blocking(move |db, now| {
            db.with_connection(|conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET status = 'completed', progress = 100, \
                     progress_detail = NULL, completed_at = ?1, error = NULL, \
                     error_stack = NULL, error_kind = NULL \
                     WHERE id = ?2 AND status = 'processing'",
                    params![format_ts(now), id.as_ulid().to_string()],
                )?;
                Ok(changed > 0)
            })
        })
        .await
    }

    async fn mark_failed(&self, id: TaskId, failure: &TaskFailure) -> StoreResult<bool> {
        let failure = failure.clone();
        self.blocking(move |db, now| {
            db.with_connection(|conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET status = 'failed', error = ?1, error_stack = ?2, \
                     error_kind = ?3, completed_at = ?4 \
                     WHERE id = ?5 AND status = 'processing'",
                    params![
                        failure.message,
                        failure.stack,
                        failure.kind.as_str(),
                        format_ts(now),
                        id.as_ulid().to_string(),
                    ],
                )?;
                Ok(changed > 0)
            })
        })
        .await
    }

    async fn cancel(&self, id: TaskId) -> StoreResult<bool> {
        self.blocking(move |db, now| {
            db.with_connection(|conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET status = 'cancelled', completed_at = ?1 \
                     WHERE id = ?2 AND status IN ('pending', 'processing')",
                    params![format_ts(now), id.as_ulid().to_string()],
                )?;
                Ok(changed > 0)
            })
        })
        .await
    }

    async fn requeue_failed(&self, id: TaskId, failure: &TaskFailure) -> StoreResult<bool> {
        let failure = failure.clone();
        self.blocking(move |db, _| {
            db.with_connection(|conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET status = 'pending', progress = 0, progress_detail = NULL, \
                     started_at = NULL, completed_at = NULL, error = ?1, error_stack = ?2, \
                     error_kind = ?3 WHERE id = ?4 AND status = 'processing'",
                    params![
                        failure.message,
                        failure.stack,
                        failure.kind.as_str(),
                        id.as_ulid().to_string(),
                    ],
                )?;
                Ok(changed > 0)
            })
        })
        .await
    }

    async fn retry(&self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        self.blocking(move |db, _| {
            db.transaction(|tx| {
                let sql = format!(
                    "UPDATE tasks SET status = 'pending', progress = 0, progress_detail = NULL, \
                     started_at = NULL, completed_at = NULL, error = NULL, error_stack = NULL, \
                     error_kind = NULL \
                     WHERE id = ?1 AND status IN ('completed', 'failed', 'cancelled') \
                     RETURNING {COLUMNS}"
                );
                let reset = tx
                    .query_row(&sql, [id.as_ulid().to_string()], task_from_row)
                    .optional()?;
                if reset.is_none() && !task_exists(tx, id)? {
                    return Err(StoreError::NotFound(id));
                }
                Ok(reset)
            })
        })
        .await
    }

    async fn reset_all_processing(&self) -> StoreResult<Vec<TaskId>> {
        self.blocking(|db, _| {
            db.transaction(|tx| {
                let ids = ids_of(query_tasks(tx, "status = 'processing'", [])?);
                for &id in &ids {
                    reset_interrupted(tx, id)?;
                }
                Ok(ids)
            })
        })
        .await
    }

    async fn reset_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        keep: &[TaskId],
    ) -> StoreResult<Vec<TaskId>> {
        let keep = keep.to_vec();
        self.blocking(move |db, _| {
            db.transaction(|tx| {
                let stale = query_tasks(
                    tx,
                    "status = 'processing' AND started_at < ?1",
                    [format_ts(started_before)],
                )?;
                let ids: Vec<TaskId> = ids_of(stale)
                    .into_iter()
                    .filter(|id| !keep.contains(id))
                    .collect();
                for &id in &ids {
                    reset_interrupted(tx, id)?;
                }
                Ok(ids)
            })
        })
        .await
    }

    async fn dependents_of(&self, id: TaskId) -> StoreResult<Vec<TaskRecord>> {
        self.blocking(move |db, _| {
            db.with_connection(|conn| {
                query_tasks(conn, "depends_on = ?1", [id.as_ulid().to_string()])
            })
        })
        .await
    }

    async fn cascade_cancel_dependents(&self, id: TaskId) -> StoreResult<Vec<TaskId>> {
        self.blocking(move |db, now| {
            db.transaction(|tx| cancel_dependents(tx, id, &format_ts(now)))
        })
        .await
    }

    async fn cascade_cancel_for_project(
        &self,
        project_id: &ProjectId,
        stage: StageType,
        except: TaskId,
    ) -> StoreResult<Vec<TaskId>> {
        let project_id = project_id.clone();
        self.blocking(move |db, now| {
            let now = format_ts(now);
            db.transaction(|tx| {
                let targets = query_tasks(
                    tx,
                    "project_id = ?1 AND stage = ?2 AND status = 'pending' AND id != ?3",
                    params![
                        project_id.as_str(),
                        stage.as_str(),
                        except.as_ulid().to_string()
                    ],
                )?;

                let mut cancelled = Vec::new();
                for id in ids_of(targets) {
                    if cancel_if_pending(tx, id, &now)? {
                        cancelled.push(id);
                    }
                    cancelled.extend(cancel_dependents(tx, id, &now)?);
                }
                Ok(cancelled)
            })
        })
        .await
    }

    async fn delete_project(&self, project_id: &ProjectId) -> StoreResult<usize> {
        let project_id = project_id.clone();
        self.blocking(move |db, _| {
            db.with_connection(|conn| {
                Ok(conn.execute(
                    "DELETE FROM tasks WHERE project_id = ?1",
                    [project_id.as_str()],
                )?)
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConcurrencyLimits;
    use crate::domain::task::fixtures::{dependent_task, new_task};
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone};

    fn store_with_clock() -> (SqliteTaskStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = SqliteTaskStore::new(Database::open_in_memory().unwrap(), clock.clone()).unwrap();
        (store, clock)
    }

    #[tokio::test]
    async fn records_survive_the_round_trip() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let prompts = new_task("p", StageType::Prompts);
        let images = dependent_task("p", StageType::Images, prompts.id);
        let inserted = store
            .insert_batch(vec![prompts.clone(), images.clone()])
            .await
            .unwrap();

        assert_eq!(store.get(images.id).await.unwrap().as_ref(), Some(&inserted[1]));

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, prompts.id);
        store
            .update_progress(prompts.id, &Progress::new(50, Some("{\"n\":5}".into())))
            .await
            .unwrap();
        store
            .mark_failed(
                prompts.id,
                &TaskFailure {
                    kind: ErrorKind::Quota,
                    message: "quota exceeded".into(),
                    stack: Some("at generate".into()),
                },
            )
            .await
            .unwrap();

        let failed = store.get(prompts.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_kind, Some(ErrorKind::Quota));
        assert_eq!(failed.error_stack.as_deref(), Some("at generate"));
        assert_eq!(failed.progress.detail.as_deref(), Some("{\"n\":5}"));
        assert_eq!(failed.attempts, 1);
    }

    #[tokio::test]
    async fn claims_follow_priority_group_and_insertion_order() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let subtitles = new_task("p", StageType::Subtitles);
        let audio_1 = new_task("p", StageType::Audio);
        let audio_2 = new_task("p", StageType::Audio);
        let mut urgent = new_task("q", StageType::Images);
        urgent.priority = 50;
        store
            .insert_batch(vec![
                subtitles.clone(),
                audio_1.clone(),
                audio_2.clone(),
                urgent.clone(),
            ])
            .await
            .unwrap();

        let claimed = store
            .claim_batch(&ClaimRequest::new(ConcurrencyLimits::unlimited()))
            .await
            .unwrap();
        let order: Vec<TaskId> = claimed.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![urgent.id, audio_1.id, audio_2.id, subtitles.id]);
    }

    #[tokio::test]
    async fn dependent_waits_for_completion() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let audio = new_task("p", StageType::Audio);
        let subtitles = dependent_task("p", StageType::Subtitles, audio.id);
        store
            .insert_batch(vec![audio.clone(), subtitles.clone()])
            .await
            .unwrap();

        store.claim_next().await.unwrap();
        assert!(store.claim_next().await.unwrap().is_none());

        assert!(store.mark_completed(audio.id).await.unwrap());
        let next = store.claim_next().await.unwrap().unwrap();
        assert_eq!(next.id, subtitles.id);
    }

    #[tokio::test]
    async fn rejects_invalid_batches_atomically() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut a = new_task("p", StageType::Prompts);
        let b = dependent_task("p", StageType::Images, a.id);
        a.depends_on = Some(b.id);

        let err = store.insert_batch(vec![a, b]).await.unwrap_err();
        assert!(matches!(err, StoreError::DependencyCycle(_)));
        assert_eq!(store.count_by_status().await.unwrap().total(), 0);

        let task = new_task("p", StageType::Audio);
        store.insert_batch(vec![task.clone()]).await.unwrap();
        let err = store.insert_batch(vec![task.clone()]).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateTask(id) if id == task.id));
    }

    #[tokio::test]
    async fn two_connections_never_claim_the_same_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let first = SqliteTaskStore::open(DatabaseConfig::with_path(&path)).unwrap();
        let second = SqliteTaskStore::open(DatabaseConfig::with_path(&path)).unwrap();

        let tasks: Vec<NewTask> = (0..20).map(|i| new_task(&format!("p{i}"), StageType::Audio)).collect();
        first.insert_batch(tasks).await.unwrap();

        let drain = |store: SqliteTaskStore| {
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(task) = store.claim_next().await.unwrap() {
                    claimed.push(task.id);
                }
                claimed
            })
        };
        let a = drain(first.clone());
        let b = drain(second);
        let mut all = a.await.unwrap();
        all.extend(b.await.unwrap());

        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20);
        assert_eq!(first.count_by_status().await.unwrap().processing, 20);
    }

    #[tokio::test]
    async fn stale_reset_uses_start_time_and_keep_list() {
        let (store, clock) = store_with_clock();
        let old = new_task("p", StageType::Prompts);
        let kept = new_task("p", StageType::Audio);
        store
            .insert_batch(vec![old.clone(), kept.clone()])
            .await
            .unwrap();
        store
            .claim_batch(&ClaimRequest::new(ConcurrencyLimits::unlimited()))
            .await
            .unwrap();

        clock.advance(Duration::minutes(10));
        let cutoff = clock.now() - Duration::minutes(5);
        let reset = store.reset_stale_processing(cutoff, &[kept.id]).await.unwrap();
        assert_eq!(reset, vec![old.id]);

        let record = store.get(old.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(record.started_at.is_none());
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn recovery_and_retry() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = new_task("p", StageType::Images);
        store.insert_batch(vec![task.clone()]).await.unwrap();
        store.claim_next().await.unwrap();

        assert_eq!(store.reset_all_processing().await.unwrap(), vec![task.id]);
        assert!(store.retry(task.id).await.unwrap().is_none());

        store.claim_next().await.unwrap();
        assert!(store.cancel(task.id).await.unwrap());
        let reset = store.retry(task.id).await.unwrap().unwrap();
        assert_eq!(reset.status, TaskStatus::Pending);
        assert_eq!(reset.attempts, 2);
        assert!(reset.completed_at.is_none());
    }

    #[tokio::test]
    async fn retry_leaves_a_running_task_alone() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = new_task("p", StageType::Audio);
        store.insert_batch(vec![task.clone()]).await.unwrap();
        store.claim_next().await.unwrap().unwrap();

        assert!(store.retry(task.id).await.unwrap().is_none());
        let record = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Processing);
        assert_eq!(record.attempts, 1);
        assert!(store.claim_next().await.unwrap().is_none());

        let missing = TaskId::from_ulid(ulid::Ulid::new());
        assert!(matches!(
            store.retry(missing).await,
            Err(StoreError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn requeue_is_a_single_step_back_to_pending() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = new_task("p", StageType::Audio);
        store.insert_batch(vec![task.clone()]).await.unwrap();
        store.claim_next().await.unwrap();
        store
            .update_progress(task.id, &Progress::new(40, None))
            .await
            .unwrap();

        let failure = TaskFailure {
            kind: ErrorKind::Transient,
            message: "connection reset".into(),
            stack: Some("at fetch".into()),
        };
        assert!(store.requeue_failed(task.id, &failure).await.unwrap());
        assert!(!store.requeue_failed(task.id, &failure).await.unwrap());

        let requeued = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.progress.percent, 0);
        assert!(requeued.started_at.is_none());
        assert_eq!(requeued.error.as_deref(), Some("connection reset"));
        assert_eq!(requeued.error_stack.as_deref(), Some("at fetch"));
        assert_eq!(requeued.error_kind, Some(ErrorKind::Transient));
        assert_eq!(store.count_by_status().await.unwrap().failed, 0);

        store.claim_next().await.unwrap().unwrap();
        assert!(store.mark_completed(task.id).await.unwrap());
        let done = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(done.attempts, 2);
        assert!(done.error.is_none());
        assert!(done.error_kind.is_none());
    }

    #[tokio::test]
    async fn cascades_match_the_in_memory_store() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let failed = new_task("p", StageType::Audio);
        let sibling = new_task("p", StageType::Audio);
        let subtitles = dependent_task("p", StageType::Subtitles, sibling.id);
        let own_subtitles = dependent_task("p", StageType::Subtitles, failed.id);
        store
            .insert_batch(vec![
                failed.clone(),
                sibling.clone(),
                subtitles.clone(),
                own_subtitles.clone(),
            ])
            .await
            .unwrap();

        let cancelled = store.cascade_cancel_dependents(failed.id).await.unwrap();
        assert_eq!(cancelled, vec![own_subtitles.id]);

        let cancelled = store
            .cascade_cancel_for_project(&ProjectId::new("p"), StageType::Audio, failed.id)
            .await
            .unwrap();
        assert_eq!(cancelled, vec![sibling.id, subtitles.id]);

        let dependents = store.dependents_of(sibling.id).await.unwrap();
        assert_eq!(dependents[0].status, TaskStatus::Cancelled);

        assert_eq!(store.delete_project(&ProjectId::new("p")).await.unwrap(), 4);
        assert_eq!(store.count_by_status().await.unwrap().total(), 0);
    }
}
