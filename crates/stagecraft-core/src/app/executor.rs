//! TaskExecutor - claim 済みタスク 1 件の実行
//!
//! # フロー
//! 1. stage に対応する StageExecutor を解決（未登録なら恒久的失敗）
//! 2. StageContext を組み立てる（出力先、前段の出力、CancellationToken）
//! 3. stage の future と進捗レポートを select で同時に駆動
//! 4. 成功 → completed + プロジェクト完了判定 / 失敗 → FailureManager

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::domain::{Progress, ProjectId, SchedulerEvent, StageError, TaskRecord, TaskStatus};
use crate::ports::{ProgressReporter, StageContext, StageInput, StoreResult, TaskStore};

use super::events::EventHub;
use super::recovery::FailureManager;
use super::registry::StageRegistry;

/// How a run ended, from the executor's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// The failure policy was applied.
    Failed(StageError),
    /// The cancellation token fired; whoever cancelled owns the status.
    Aborted,
    /// The store rejected a write; the task is left for recovery.
    StoreError(String),
}

pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    registry: Arc<StageRegistry>,
    failures: Arc<FailureManager>,
    events: Arc<EventHub>,
    output_root: PathBuf,
    /// Serializes "mark completed + check project" so that sibling tasks
    /// finishing together announce their project once.
    completion: Mutex<()>,
}

impl TaskExecutor {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<StageRegistry>,
        failures: Arc<FailureManager>,
        events: Arc<EventHub>,
        output_root: PathBuf,
    ) -> Self {
        Self {
            store,
            registry,
            failures,
            events,
            output_root,
            completion: Mutex::new(()),
        }
    }

    pub fn project_dir(&self, project_id: &ProjectId) -> PathBuf {
        self.output_root.join(project_id.as_str())
    }

    /// Drive one claimed task to a terminal (or retry) state.
    pub async fn run(&self, task: TaskRecord, cancel: CancellationToken) -> RunOutcome {
        let span = tracing::info_span!(
            "task",
            task_id = %task.id,
            project_id = %task.project_id,
            stage = %task.stage,
            attempt = task.attempts,
        );
        async move {
            match self.run_inner(&task, &cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "store error while running task");
                    RunOutcome::StoreError(e.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_inner(
        &self,
        task: &TaskRecord,
        cancel: &CancellationToken,
    ) -> StoreResult<RunOutcome> {
        self.events.status_changed(task, TaskStatus::Processing, None);
        tracing::info!("task started");

        let result = match self.registry.get(task.stage) {
            Some(stage) => {
                let ctx = self.context(task, cancel.clone()).await?;
                let (reporter, reports) = ProgressReporter::channel();
                self.drive(task, stage.execute(ctx, reporter), reports, cancel)
                    .await
            }
            None => Err(StageError::permanent(format!(
                "no executor registered for stage {}",
                task.stage
            ))),
        };

        if cancel.is_cancelled() {
            tracing::info!("task aborted");
            return Ok(RunOutcome::Aborted);
        }

        match result {
            Ok(()) => {
                let _completion = self.completion.lock().await;
                if self.store.mark_completed(task.id).await? {
                    tracing::info!("task completed");
                    self.events.status_changed(task, TaskStatus::Completed, None);
                    self.check_project_completed(&task.project_id).await?;
                } else {
                    tracing::debug!("task left processing before completion was recorded");
                }
                Ok(RunOutcome::Completed)
            }
            Err(error) => {
                self.failures.handle_failure(task, &error).await?;
                Ok(RunOutcome::Failed(error))
            }
        }
    }

    async fn context(
        &self,
        task: &TaskRecord,
        cancel: CancellationToken,
    ) -> StoreResult<StageContext> {
        let project_dir = self.project_dir(&task.project_id);
        let mut inputs = Vec::new();
        if let Some(dep) = task.depends_on
            && let Some(prerequisite) = self.store.get(dep).await?
        {
            inputs.push(StageInput {
                task_id: prerequisite.id,
                stage: prerequisite.stage,
                dir: stage_dir(&project_dir, prerequisite.stage.as_str()),
            });
        }

        Ok(StageContext {
            task_id: task.id,
            project_id: task.project_id.clone(),
            stage: task.stage,
            attempt: task.attempts,
            output_dir: stage_dir(&project_dir, task.stage.as_str()),
            project_dir,
            inputs,
            cancel,
        })
    }

    /// Poll the stage and its progress reports together. Cancellation drops
    /// the stage future.
    async fn drive<F>(
        &self,
        task: &TaskRecord,
        stage: F,
        mut reports: mpsc::UnboundedReceiver<Progress>,
        cancel: &CancellationToken,
    ) -> Result<(), StageError>
    where
        F: Future<Output = Result<(), StageError>>,
    {
        tokio::pin!(stage);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(StageError::Cancelled),
                result = &mut stage => break result,
                Some(progress) = reports.recv() => self.record_progress(task, progress).await,
            }
        };

        if !cancel.is_cancelled() {
            while let Ok(progress) = reports.try_recv() {
                self.record_progress(task, progress).await;
            }
        }
        result
    }

    async fn record_progress(&self, task: &TaskRecord, progress: Progress) {
        match self.store.update_progress(task.id, &progress).await {
            Ok(true) => self.events.emit(SchedulerEvent::TaskProgress {
                task_id: task.id,
                project_id: task.project_id.clone(),
                stage: task.stage,
                progress,
            }),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "failed to persist progress"),
        }
    }

    /// Emits `ProjectCompleted` once per instance when the last task of the
    /// project completes. Instances sharing a store may each announce it.
    async fn check_project_completed(&self, project_id: &ProjectId) -> StoreResult<()> {
        let tasks = self.store.list_by_project(project_id).await?;
        if !tasks.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            tracing::info!(%project_id, "project completed");
            self.events.emit(SchedulerEvent::ProjectCompleted {
                project_id: project_id.clone(),
            });
        }
        Ok(())
    }
}

fn stage_dir(project_dir: &Path, stage: &str) -> PathBuf {
    project_dir.join(stage)
}
