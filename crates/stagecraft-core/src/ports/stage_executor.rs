//! StageExecutor port - 外部の生成処理（prompts/audio/images/subtitles）
//!
//! Scheduler は生成アルゴリズムを知りません。stage ごとに登録された
//! StageExecutor を呼び出すだけです。

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{ProjectId, Progress, StageError, StageType, TaskId};

/// Output of a prerequisite task, handed to the dependent stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInput {
    pub task_id: TaskId,
    pub stage: StageType,
    pub dir: PathBuf,
}

/// Everything a stage gets to run one task.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub stage: StageType,

    /// 1-based attempt number of this run.
    pub attempt: u32,

    /// `<output_root>/<project_id>`
    pub project_dir: PathBuf,

    /// `<project_dir>/<stage>`, where this stage writes its artifacts.
    pub output_dir: PathBuf,

    /// Output directories of prerequisite tasks.
    pub inputs: Vec<StageInput>,

    /// Cancelled when an operator cancels the task. Stages should check it
    /// at safe points and return `StageError::Cancelled`; the in-flight
    /// future is dropped either way.
    pub cancel: CancellationToken,
}

/// Progress callback handed to a stage.
///
/// `report` never blocks; the executor persists and forwards reports in the
/// background. Reports sent after the task finished are dropped.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<Progress>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, percent: u8, detail: Option<String>) {
        // receiver gone means the task already finished
        let _ = self.tx.send(Progress::new(percent, detail));
    }
}

/// A generator for one stage type.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, ctx: StageContext, progress: ProgressReporter) -> Result<(), StageError>;
}
