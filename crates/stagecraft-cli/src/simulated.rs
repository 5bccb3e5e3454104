//! Simulated stage executors for `stagecraft run`.
//!
//! Each run walks through a few progress steps, then writes a small JSON
//! manifest into its output directory. The first `failures` runs of a stage
//! fail with a transient error to exercise the retry path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use stagecraft_core::domain::StageError;
use stagecraft_core::ports::{ProgressReporter, StageContext, StageExecutor};

const STEPS: u8 = 4;

pub struct SimulatedStage {
    step_delay: Duration,
    remaining_failures: AtomicU32,
}

impl SimulatedStage {
    pub fn new(step_delay: Duration, failures: u32) -> Self {
        Self {
            step_delay,
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    task_id: String,
    project_id: &'a str,
    stage: &'a str,
    attempt: u32,
    inputs: Vec<String>,
}

#[async_trait]
impl StageExecutor for SimulatedStage {
    async fn execute(
        &self,
        ctx: StageContext,
        progress: ProgressReporter,
    ) -> Result<(), StageError> {
        for step in 1..=STEPS {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(StageError::Cancelled),
                _ = tokio::time::sleep(self.step_delay) => {}
            }
            let percent = step * (100 / STEPS);
            progress.report(percent, Some(format!(r#"{{"step":{step},"of":{STEPS}}}"#)));
        }

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(StageError::transient(format!(
                "simulated upstream failure (left={left})"
            )));
        }

        let manifest = Manifest {
            task_id: ctx.task_id.to_string(),
            project_id: ctx.project_id.as_str(),
            stage: ctx.stage.as_str(),
            attempt: ctx.attempt,
            inputs: ctx
                .inputs
                .iter()
                .map(|input| input.dir.display().to_string())
                .collect(),
        };
        let body = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StageError::permanent(format!("encode manifest: {e}")))?;
        tokio::fs::create_dir_all(&ctx.output_dir)
            .await
            .map_err(|e| StageError::transient(format!("create {}: {e}", ctx.output_dir.display())))?;
        tokio::fs::write(ctx.output_dir.join("manifest.json"), body)
            .await
            .map_err(|e| StageError::transient(format!("write manifest: {e}")))?;
        Ok(())
    }
}
