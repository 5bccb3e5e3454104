//! Submission plan: which tasks a project generation request creates.

use serde::{Deserialize, Serialize};

use super::ids::{ProjectId, TaskId};
use super::stage::StageType;
use super::task::NewTask;

/// Which artifacts a project wants.
///
/// - `images`: prompts (group 0) + images (group 1, needs prompts)
/// - `audio`: audio (group 0) + subtitles (group 1, needs audio)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOptions {
    #[serde(default)]
    pub images: bool,
    #[serde(default)]
    pub audio: bool,
}

impl StageOptions {
    pub fn all() -> Self {
        Self {
            images: true,
            audio: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.images && !self.audio
    }

    /// Entry stages selected by these options, in submission order.
    fn entry_stages(&self) -> Vec<StageType> {
        let mut stages = Vec::new();
        if self.images {
            stages.push(StageType::Prompts);
        }
        if self.audio {
            stages.push(StageType::Audio);
        }
        stages
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("no stages selected for project {0}")]
    NothingSelected(ProjectId),
}

/// Build the task batch for a project.
///
/// Phase-0 tasks come first, each phase-1 task points at its phase-0
/// counterpart.
pub fn plan_project(
    project_id: &ProjectId,
    options: StageOptions,
    max_attempts: u32,
    mut next_id: impl FnMut() -> TaskId,
) -> Result<Vec<NewTask>, PlanError> {
    if options.is_empty() {
        return Err(PlanError::NothingSelected(project_id.clone()));
    }

    let mut make = |stage: StageType, depends_on: Option<TaskId>| NewTask {
        id: next_id(),
        project_id: project_id.clone(),
        stage,
        priority: stage.default_priority(),
        stage_group: stage.stage_group(),
        max_attempts,
        depends_on,
    };

    let entries: Vec<NewTask> = options
        .entry_stages()
        .into_iter()
        .map(|stage| make(stage, None))
        .collect();

    let mut dependents = Vec::new();
    for entry in &entries {
        for stage in StageType::ALL {
            if stage.prerequisite() == Some(entry.stage) {
                dependents.push(make(stage, Some(entry.id)));
            }
        }
    }

    Ok(entries.into_iter().chain(dependents).collect())
}
