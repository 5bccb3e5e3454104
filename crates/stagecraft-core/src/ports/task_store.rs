//! TaskStore port - タスク状態の正本（source of truth）
//!
//! # 設計原則
//! - 並行する呼び出し元から原子的に見えるべき複数ステップの操作は、
//!   すべて単一トランザクション内で実行する
//! - claim の権威はここにある（scheduler のメモリ上の active 集合はキャッシュ）
//! - タスクはプロジェクト削除時のみ削除される

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    ClaimRequest, DependencyGraph, NewTask, ProjectId, Progress, StageType, StatusCounts,
    TaskFailure, TaskId, TaskRecord, TaskStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("task {task} depends on unknown task {depends_on}")]
    UnknownDependency { task: TaskId, depends_on: TaskId },

    #[error("dependency cycle: {0:?}")]
    DependencyCycle(Vec<TaskId>),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Validate a batch before inserting it.
///
/// `exists` answers whether a task id is already stored. Existing tasks can
/// never point at tasks of a new batch, so a cycle can only form inside the
/// batch itself.
pub fn validate_batch<F>(tasks: &[NewTask], mut exists: F) -> StoreResult<()>
where
    F: FnMut(TaskId) -> StoreResult<bool>,
{
    let mut batch: HashSet<TaskId> = HashSet::with_capacity(tasks.len());
    for task in tasks {
        if !batch.insert(task.id) || exists(task.id)? {
            return Err(StoreError::DuplicateTask(task.id));
        }
    }

    for task in tasks {
        if let Some(dep) = task.depends_on
            && !batch.contains(&dep)
            && !exists(dep)?
        {
            return Err(StoreError::UnknownDependency {
                task: task.id,
                depends_on: dep,
            });
        }
    }

    let graph = DependencyGraph::from_edges(tasks.iter().map(|t| (t.id, t.depends_on)));
    match graph.detect_cycle() {
        Some(cycle) => Err(StoreError::DependencyCycle(cycle)),
        None => Ok(()),
    }
}

/// Durable task records with atomic state-transition primitives.
///
/// Every method that changes more than one row, or reads then writes, is a
/// single transaction.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a batch atomically. Dependencies must point into the batch or
    /// at existing tasks, and the batch must not introduce a cycle.
    async fn insert_batch(&self, tasks: Vec<NewTask>) -> StoreResult<Vec<TaskRecord>>;

    async fn get(&self, id: TaskId) -> StoreResult<Option<TaskRecord>>;

    /// Tasks of a project in claim order.
    async fn list_by_project(&self, project_id: &ProjectId) -> StoreResult<Vec<TaskRecord>>;

    /// Tasks with a status in claim order.
    async fn list_by_status(&self, status: TaskStatus) -> StoreResult<Vec<TaskRecord>>;

    async fn count_by_status(&self) -> StoreResult<StatusCounts>;

    /// Claim the highest-priority claimable task, or nothing if none is
    /// available (or every candidate was raced away).
    async fn claim_next(&self) -> StoreResult<Option<TaskRecord>>;

    /// Run one claim pass (see [`crate::domain::run_claim_pass`]).
    async fn claim_batch(&self, request: &ClaimRequest) -> StoreResult<Vec<TaskRecord>>;

    /// Persist progress of a processing task. Returns false if the task is
    /// no longer processing.
    async fn update_progress(&self, id: TaskId, progress: &Progress) -> StoreResult<bool>;

    /// Returns false if the task does not exist.
    async fn update_priority(&self, id: TaskId, priority: i32) -> StoreResult<bool>;

    /// Processing -> Completed. Returns false if the task was not processing.
    async fn mark_completed(&self, id: TaskId) -> StoreResult<bool>;

    /// Processing -> Failed. Returns false if the task was not processing.
    async fn mark_failed(&self, id: TaskId, failure: &TaskFailure) -> StoreResult<bool>;

    /// Pending | Processing -> Cancelled. Returns false otherwise.
    async fn cancel(&self, id: TaskId) -> StoreResult<bool>;

    /// Processing -> Pending in one write, recording `failure` as the last
    /// error. Returns false if the task was not processing.
    async fn requeue_failed(&self, id: TaskId, failure: &TaskFailure) -> StoreResult<bool>;

    /// Completed | Failed | Cancelled -> Pending, clearing error, progress
    /// and timestamps. Returns the reset record, `None` if the task is
    /// pending or processing.
    async fn retry(&self, id: TaskId) -> StoreResult<Option<TaskRecord>>;

    /// Crash recovery: every processing task back to pending.
    async fn reset_all_processing(&self) -> StoreResult<Vec<TaskId>>;

    /// Reset processing tasks started before `started_before`, except the
    /// ones listed in `keep`.
    async fn reset_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        keep: &[TaskId],
    ) -> StoreResult<Vec<TaskId>>;

    /// Tasks whose `depends_on` is `id`.
    async fn dependents_of(&self, id: TaskId) -> StoreResult<Vec<TaskRecord>>;

    /// Cancel every pending task that transitively depends on `id`.
    async fn cascade_cancel_dependents(&self, id: TaskId) -> StoreResult<Vec<TaskId>>;

    /// Cancel every pending task of `stage` in the project except `except`,
    /// plus their pending dependents.
    async fn cascade_cancel_for_project(
        &self,
        project_id: &ProjectId,
        stage: StageType,
        except: TaskId,
    ) -> StoreResult<Vec<TaskId>>;

    /// Delete all tasks of a project. Returns the number of deleted tasks.
    async fn delete_project(&self, project_id: &ProjectId) -> StoreResult<usize>;
}
