//! Task record: the persisted unit of scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;
use super::ids::{ProjectId, TaskId};
use super::stage::StageType;
use super::state::TaskStatus;

/// Progress of a running task.
///
/// `detail` is an opaque, stage-defined blob (usually JSON). The core stores
/// and forwards it but never looks inside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub percent: u8,
    pub detail: Option<String>,
}

impl Progress {
    pub fn new(percent: u8, detail: Option<String>) -> Self {
        Self {
            percent: percent.min(100),
            detail,
        }
    }

    pub fn done() -> Self {
        Self::new(100, None)
    }
}

/// A permanent or per-attempt failure recorded on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub stack: Option<String>,
}

/// Everything needed to insert a task. Built by the submission plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub stage: StageType,
    pub priority: i32,
    pub stage_group: i32,
    pub max_attempts: u32,
    pub depends_on: Option<TaskId>,
}

/// Metadata for one task.
///
/// Design:
/// - The store owns these; everything else works on snapshots.
/// - Transitions are methods so the in-memory store and the SQL statements
///   of the SQLite store describe the same state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub stage: StageType,
    pub status: TaskStatus,

    /// Higher is scheduled sooner.
    pub priority: i32,

    /// Pipeline phase; lower runs first at equal priority.
    pub stage_group: i32,

    pub progress: Progress,

    /// Number of processing transitions so far (including the current one).
    pub attempts: u32,
    pub max_attempts: u32,

    pub depends_on: Option<TaskId>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub error: Option<String>,
    pub error_stack: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl TaskRecord {
    pub fn new(task: NewTask, created_at: DateTime<Utc>) -> Self {
        Self {
            id: task.id,
            project_id: task.project_id,
            stage: task.stage,
            status: TaskStatus::Pending,
            priority: task.priority,
            stage_group: task.stage_group,
            progress: Progress::default(),
            attempts: 0,
            max_attempts: task.max_attempts,
            depends_on: task.depends_on,
            created_at,
            started_at: None,
            completed_at: None,
            error: None,
            error_stack: None,
            error_kind: None,
        }
    }

    /// Pending -> Processing. Increments attempts.
    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
        self.completed_at = None;
    }

    /// Also drops the error left by an earlier attempt.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.progress = Progress::done();
        self.completed_at = Some(now);
        self.error = None;
        self.error_stack = None;
        self.error_kind = None;
    }

    pub fn mark_failed(&mut self, failure: &TaskFailure, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error = Some(failure.message.clone());
        self.error_stack = failure.stack.clone();
        self.error_kind = Some(failure.kind);
        self.completed_at = Some(now);
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(now);
    }

    /// Processing -> Pending after a retryable failure. The failure stays
    /// visible until the next attempt finishes.
    pub fn requeue_after_failure(&mut self, failure: &TaskFailure) {
        self.status = TaskStatus::Pending;
        self.progress = Progress::default();
        self.started_at = None;
        self.completed_at = None;
        self.error = Some(failure.message.clone());
        self.error_stack = failure.stack.clone();
        self.error_kind = Some(failure.kind);
    }

    /// Back to pending with a clean slate. `attempts` is kept.
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.progress = Progress::default();
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.error_stack = None;
        self.error_kind = None;
    }

    /// Processing -> Pending after a crash or a stale lease. No checkpoint is
    /// kept, the stage restarts from scratch.
    pub fn reset_interrupted(&mut self) {
        self.status = TaskStatus::Pending;
        self.progress = Progress::default();
        self.started_at = None;
    }

    pub fn has_exhausted_attempts(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
