//! FailureManager - 失敗時の方針適用と起動時・滞留タスクの回収
//!
//! # フロー
//! 1. Decider が StageError から Decision を決める（純粋関数）
//! 2. FailureManager が Decision を TaskStore に反映する
//!    - Retry: failed に記録してから pending に戻す
//!    - Fail: failed + 依存タスクを推移的に cancel
//!    - FailFatal: failed + 同一プロジェクト・同一 stage の未着手タスクを cancel + alert
//!    - Cancel: cancelled（カスケードなし）
//!
//! 終端への書き込みは processing の間だけ成功するので、オペレーターが
//! 先に cancel したタスクを遅れてきた失敗が上書きすることはありません。

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{
    Decider, Decision, ResetReason, SchedulerEvent, StageError, TaskFailure, TaskId, TaskRecord,
    TaskStatus,
};
use crate::ports::{Clock, StoreResult, TaskStore};

use super::events::EventHub;

pub struct FailureManager {
    store: Arc<dyn TaskStore>,
    decider: Arc<dyn Decider>,
    events: Arc<EventHub>,
    clock: Arc<dyn Clock>,
    stale_after: chrono::Duration,
}

impl FailureManager {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        decider: Arc<dyn Decider>,
        events: Arc<EventHub>,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            decider,
            events,
            clock,
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100)),
        }
    }

    /// Apply the failure policy to a task whose stage returned `error`.
    ///
    /// `task` is the record as claimed (attempts include this run).
    pub async fn handle_failure(
        &self,
        task: &TaskRecord,
        error: &StageError,
    ) -> StoreResult<Decision> {
        let decision = self.decider.decide(task, error);
        match &decision {
            Decision::Retry { reason } => {
                tracing::warn!(task_id = %task.id, attempt = task.attempts, %reason, "stage failed, retrying");
                if let Some(failure) = failure_of(error) {
                    if self.store.requeue_failed(task.id, &failure).await? {
                        self.events
                            .status_changed(task, TaskStatus::Pending, Some(error.to_string()));
                    } else {
                        tracing::debug!(task_id = %task.id, "task left processing before it could be requeued");
                    }
                }
            }
            Decision::Fail { reason } => {
                tracing::error!(task_id = %task.id, attempt = task.attempts, %reason, "task failed");
                if self.record_failure(task, error).await? {
                    self.events
                        .status_changed(task, TaskStatus::Failed, Some(error.to_string()));
                    let cancelled = self.store.cascade_cancel_dependents(task.id).await?;
                    self.announce_cancelled(&cancelled, "dependency failed").await?;
                }
            }
            Decision::FailFatal { reason } => {
                if self.record_failure(task, error).await? {
                    self.events
                        .status_changed(task, TaskStatus::Failed, Some(error.to_string()));
                    let mut cancelled = self
                        .store
                        .cascade_cancel_for_project(&task.project_id, task.stage, task.id)
                        .await?;
                    cancelled.extend(self.store.cascade_cancel_dependents(task.id).await?);
                    self.announce_cancelled(&cancelled, "quota exhausted").await?;

                    tracing::error!(
                        target: "stagecraft::alert",
                        task_id = %task.id,
                        project_id = %task.project_id,
                        stage = %task.stage,
                        cancelled = cancelled.len(),
                        %reason,
                        "stage quota exhausted"
                    );
                    self.events.emit(SchedulerEvent::QuotaExhausted {
                        task_id: task.id,
                        project_id: task.project_id.clone(),
                        stage: task.stage,
                        message: error.to_string(),
                        cancelled,
                    });
                }
            }
            Decision::Cancel => {
                if self.store.cancel(task.id).await? {
                    tracing::info!(task_id = %task.id, "task cancelled by its stage");
                    self.events.status_changed(task, TaskStatus::Cancelled, None);
                }
            }
        }
        Ok(decision)
    }

    /// Write the failure. Returns false if the task had already left
    /// processing (e.g. an operator cancelled it).
    async fn record_failure(&self, task: &TaskRecord, error: &StageError) -> StoreResult<bool> {
        let Some(failure) = failure_of(error) else {
            return Ok(false);
        };
        let written = self.store.mark_failed(task.id, &failure).await?;
        if !written {
            tracing::debug!(task_id = %task.id, "task left processing before its failure was recorded");
        }
        Ok(written)
    }

    /// Emit a status change for each cascaded task.
    pub(crate) async fn announce_cancelled(&self, ids: &[TaskId], why: &str) -> StoreResult<()> {
        for &id in ids {
            if let Some(record) = self.store.get(id).await? {
                tracing::info!(task_id = %id, reason = why, "task cancelled by cascade");
                self.events
                    .status_changed(&record, TaskStatus::Cancelled, Some(why.to_owned()));
            }
        }
        Ok(())
    }

    /// Reset every task left processing by a previous process.
    pub async fn startup_recovery(&self) -> StoreResult<Vec<TaskId>> {
        let reset = self.store.reset_all_processing().await?;
        if !reset.is_empty() {
            tracing::warn!(count = reset.len(), "reset interrupted tasks to pending");
            self.events.emit(SchedulerEvent::TasksReset {
                reason: ResetReason::Startup,
                task_ids: reset.clone(),
            });
        }
        Ok(reset)
    }

    /// Reset tasks stuck in processing for longer than the stale threshold.
    /// Tasks in `keep` are being executed right now and are left alone.
    pub async fn sweep_stale(&self, keep: &[TaskId]) -> StoreResult<Vec<TaskId>> {
        let cutoff = self.clock.now() - self.stale_after;

        let reset = self.store.reset_stale_processing(cutoff, keep).await?;
        if !reset.is_empty() {
            tracing::warn!(count = reset.len(), %cutoff, "reset stale tasks to pending");
            self.events.emit(SchedulerEvent::TasksReset {
                reason: ResetReason::Stale,
                task_ids: reset.clone(),
            });
        }
        Ok(reset)
    }
}

fn failure_of(error: &StageError) -> Option<TaskFailure> {
    Some(TaskFailure {
        kind: error.kind()?,
        message: error.to_string(),
        stack: error.stack().map(str::to_owned),
    })
}
