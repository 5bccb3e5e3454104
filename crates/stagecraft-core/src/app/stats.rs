//! SchedulerStats - ステータスクエリ
//!
//! store の件数と、scheduler のメモリ上の active 集合のスナップショット。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{ConcurrencyLimits, ProjectId, StageType, StatusCounts};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Task counts per status, from the store.
    pub counts: StatusCounts,

    /// Tasks executing in this process.
    pub active_workers: usize,

    /// Projects with executing tasks, sorted.
    pub active_projects: Vec<ProjectId>,

    /// Executing tasks per stage.
    pub active_per_stage: BTreeMap<StageType, usize>,

    pub limits: ConcurrencyLimits,
    pub running: bool,
    pub paused: bool,
}

impl SchedulerStats {
    /// True when nothing is pending or executing.
    pub fn is_idle(&self) -> bool {
        self.counts.pending == 0 && self.counts.processing == 0 && self.active_workers == 0
    }
}
