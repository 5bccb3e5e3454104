//! Events - notifications for observers.
//!
//! Observers never take part in retry/cascade decisions; these are purely
//! informational.

use serde::{Deserialize, Serialize};

use super::ids::{ProjectId, TaskId};
use super::stage::StageType;
use super::state::TaskStatus;
use super::task::Progress;

/// Why tasks were put back to pending without a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    /// Left processing by a previous process.
    Startup,
    /// Processing for longer than the stale threshold.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskStatusChanged {
        task_id: TaskId,
        project_id: ProjectId,
        stage: StageType,
        status: TaskStatus,
        error: Option<String>,
    },

    TaskProgress {
        task_id: TaskId,
        project_id: ProjectId,
        stage: StageType,
        progress: Progress,
    },

    /// Every task of the project is completed. Sent by the instance that
    /// completed the last task; a later retry and re-run sends it again.
    ProjectCompleted { project_id: ProjectId },

    /// Out-of-band alert: a stage hit a non-retryable quota error and the
    /// remaining same-stage work of the project was cancelled.
    QuotaExhausted {
        task_id: TaskId,
        project_id: ProjectId,
        stage: StageType,
        message: String,
        cancelled: Vec<TaskId>,
    },

    TasksReset {
        reason: ResetReason,
        task_ids: Vec<TaskId>,
    },
}

impl SchedulerEvent {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            SchedulerEvent::TaskStatusChanged { task_id, .. }
            | SchedulerEvent::TaskProgress { task_id, .. }
            | SchedulerEvent::QuotaExhausted { task_id, .. } => Some(*task_id),
            SchedulerEvent::ProjectCompleted { .. } | SchedulerEvent::TasksReset { .. } => None,
        }
    }
}
