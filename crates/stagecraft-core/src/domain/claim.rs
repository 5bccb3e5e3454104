//! Claim pass: dependency- and concurrency-aware selection of pending tasks.
//!
//! The pass runs inside a store transaction. Stores expose the three
//! primitives of [`ClaimSource`]; the selection logic lives here once so
//! every backend claims in exactly the same way.

use std::cmp::{Ordering, Reverse};
use std::collections::{HashMap, HashSet};
use std::num::NonZero;

use serde::{Deserialize, Serialize};

use super::ids::{ProjectId, TaskId};
use super::stage::StageType;
use super::state::TaskStatus;
use super::task::TaskRecord;

/// Concurrency caps. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    /// Maximum number of distinct projects with processing tasks.
    pub max_projects: Option<usize>,

    /// Maximum number of processing tasks of any one stage type.
    pub max_per_stage: Option<usize>,
}

impl ConcurrencyLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Build from configured numbers where `0` means "no limit".
    pub fn from_counts(max_projects: usize, max_per_stage: usize) -> Self {
        Self {
            max_projects: NonZero::new(max_projects).map(NonZero::get),
            max_per_stage: NonZero::new(max_per_stage).map(NonZero::get),
        }
    }
}

/// Input of one claim pass.
#[derive(Debug, Clone, Default)]
pub struct ClaimRequest {
    pub limits: ConcurrencyLimits,

    /// Projects that already have processing tasks owned by the caller.
    pub active_projects: HashSet<ProjectId>,

    /// Processing task counts per stage owned by the caller.
    pub active_per_stage: HashMap<StageType, usize>,

    /// Stop after this many claims.
    pub limit: Option<usize>,
}

impl ClaimRequest {
    pub fn new(limits: ConcurrencyLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Claim at most one task, ignoring caps.
    pub fn single() -> Self {
        Self {
            limit: Some(1),
            ..Self::default()
        }
    }
}

/// Transactional primitives a store provides to the claim pass.
pub trait ClaimSource {
    type Error;

    /// Pending tasks in claim order (see [`claim_order`]).
    fn pending_in_claim_order(&mut self) -> Result<Vec<TaskRecord>, Self::Error>;

    /// Current status of a task, `None` if it does not exist.
    fn status_of(&mut self, id: TaskId) -> Result<Option<TaskStatus>, Self::Error>;

    /// Conditional pending -> processing update scoped to `id`.
    /// Returns the updated record, or `None` if the task was no longer
    /// pending (another caller won).
    fn try_claim(&mut self, id: TaskId) -> Result<Option<TaskRecord>, Self::Error>;
}

/// Claim order: priority DESC, stage_group ASC, created_at ASC.
///
/// Stores break the remaining ties on insertion order.
pub fn claim_order(a: &TaskRecord, b: &TaskRecord) -> Ordering {
    (Reverse(a.priority), a.stage_group, a.created_at).cmp(&(
        Reverse(b.priority),
        b.stage_group,
        b.created_at,
    ))
}

/// Running capacity counters for one pass.
struct Capacity<'a> {
    request: &'a ClaimRequest,
    projects: HashSet<ProjectId>,
    per_stage: HashMap<StageType, usize>,
}

impl<'a> Capacity<'a> {
    fn new(request: &'a ClaimRequest) -> Self {
        Self {
            request,
            projects: request.active_projects.clone(),
            per_stage: request.active_per_stage.clone(),
        }
    }

    fn admits_project(&self, project: &ProjectId) -> bool {
        match self.request.limits.max_projects {
            None => true,
            Some(max) => self.projects.contains(project) || self.projects.len() < max,
        }
    }

    fn admits_stage(&self, stage: StageType) -> bool {
        match self.request.limits.max_per_stage {
            None => true,
            Some(max) => self.per_stage.get(&stage).copied().unwrap_or(0) < max,
        }
    }

    fn reserve(&mut self, task: &TaskRecord) {
        self.projects.insert(task.project_id.clone());
        *self.per_stage.entry(task.stage).or_default() += 1;
    }
}

/// Run one claim pass against `source`.
///
/// Walks the pending list once. Capacity is only reserved after the
/// conditional update succeeded, so a task lost to a concurrent claimer
/// never blocks another one.
pub fn run_claim_pass<S>(source: &mut S, request: &ClaimRequest) -> Result<Vec<TaskRecord>, S::Error>
where
    S: ClaimSource + ?Sized,
{
    let mut capacity = Capacity::new(request);
    let mut claimed = Vec::new();

    for task in source.pending_in_claim_order()? {
        if request.limit.is_some_and(|limit| claimed.len() >= limit) {
            break;
        }

        if let Some(dep) = task.depends_on
            && source.status_of(dep)? != Some(TaskStatus::Completed)
        {
            continue;
        }
        if !capacity.admits_project(&task.project_id) || !capacity.admits_stage(task.stage) {
            continue;
        }

        let Some(record) = source.try_claim(task.id)? else {
            tracing::debug!(task_id = %task.id, "claim lost to a concurrent caller");
            continue;
        };
        capacity.reserve(&record);
        claimed.push(record);
    }

    Ok(claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::fixtures::{dependent_task, new_task};
    use chrono::{Duration, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::convert::Infallible;

    /// Minimal source over a Vec, in insertion order for ties.
    #[derive(Default)]
    struct VecSource {
        tasks: Vec<TaskRecord>,
        /// Ids another caller "steals" right before our conditional update.
        stolen: HashSet<TaskId>,
    }

    impl VecSource {
        fn push(&mut self, record: TaskRecord) -> TaskId {
            let id = record.id;
            self.tasks.push(record);
            id
        }

        fn get(&self, id: TaskId) -> &TaskRecord {
            self.tasks.iter().find(|t| t.id == id).unwrap()
        }

        fn set_status(&mut self, id: TaskId, status: TaskStatus) {
            self.tasks.iter_mut().find(|t| t.id == id).unwrap().status = status;
        }
    }

    impl ClaimSource for VecSource {
        type Error = Infallible;

        fn pending_in_claim_order(&mut self) -> Result<Vec<TaskRecord>, Infallible> {
            let mut pending: Vec<TaskRecord> = self
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Pending)
                .cloned()
                .collect();
            pending.sort_by(claim_order);
            Ok(pending)
        }

        fn status_of(&mut self, id: TaskId) -> Result<Option<TaskStatus>, Infallible> {
            Ok(self.tasks.iter().find(|t| t.id == id).map(|t| t.status))
        }

        fn try_claim(&mut self, id: TaskId) -> Result<Option<TaskRecord>, Infallible> {
            if self.stolen.contains(&id) {
                self.set_status(id, TaskStatus::Processing);
                return Ok(None);
            }
            let task = self.tasks.iter_mut().find(|t| t.id == id).unwrap();
            if task.status != TaskStatus::Pending {
                return Ok(None);
            }
            task.start_attempt(Utc::now());
            Ok(Some(task.clone()))
        }
    }

    fn record(task: crate::domain::NewTask) -> TaskRecord {
        TaskRecord::new(task, Utc::now())
    }

    fn claim(source: &mut VecSource, request: &ClaimRequest) -> Vec<TaskRecord> {
        run_claim_pass(source, request).unwrap()
    }

    #[test]
    fn orders_by_priority_then_group_then_age() {
        let now = Utc::now();
        let mut low = record(new_task("p", StageType::Audio));
        low.priority = 1;
        let mut late_group = record(new_task("p", StageType::Prompts));
        late_group.stage_group = 1;
        let mut older = record(new_task("p", StageType::Prompts));
        older.created_at = now - Duration::seconds(5);
        let mut newer = record(new_task("p", StageType::Prompts));
        newer.created_at = now;
        late_group.created_at = now - Duration::seconds(10);

        let mut all = vec![low.clone(), late_group.clone(), newer.clone(), older.clone()];
        all.sort_by(claim_order);
        let order: Vec<TaskId> = all.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![older.id, newer.id, late_group.id, low.id]);
    }

    #[test]
    fn skips_tasks_with_unfinished_dependency() {
        let mut source = VecSource::default();
        let prompts = source.push(record(new_task("p", StageType::Prompts)));
        let images = source.push(record(dependent_task("p", StageType::Images, prompts)));

        let claimed = claim(&mut source, &ClaimRequest::new(ConcurrencyLimits::unlimited()));
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, prompts);
        assert_eq!(source.get(images).status, TaskStatus::Pending);

        source.set_status(prompts, TaskStatus::Completed);
        let claimed = claim(&mut source, &ClaimRequest::new(ConcurrencyLimits::unlimited()));
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, images);
    }

    #[test]
    fn failed_dependency_never_unblocks() {
        let mut source = VecSource::default();
        let prompts = source.push(record(new_task("p", StageType::Prompts)));
        source.push(record(dependent_task("p", StageType::Images, prompts)));
        source.set_status(prompts, TaskStatus::Failed);

        assert!(claim(&mut source, &ClaimRequest::new(ConcurrencyLimits::unlimited())).is_empty());
    }

    #[test]
    fn respects_max_per_stage_including_active_tasks() {
        let mut source = VecSource::default();
        source.push(record(new_task("a", StageType::Audio)));
        source.push(record(new_task("b", StageType::Audio)));
        source.push(record(new_task("c", StageType::Audio)));

        let mut request = ClaimRequest::new(ConcurrencyLimits {
            max_projects: None,
            max_per_stage: Some(2),
        });
        request.active_per_stage.insert(StageType::Audio, 1);

        let claimed = claim(&mut source, &request);
        assert_eq!(claimed.len(), 1);
    }

    #[test]
    fn respects_max_projects_but_admits_already_active_projects() {
        let mut source = VecSource::default();
        source.push(record(new_task("active", StageType::Audio)));
        source.push(record(new_task("new-1", StageType::Audio)));
        source.push(record(new_task("new-1", StageType::Prompts)));
        source.push(record(new_task("new-2", StageType::Audio)));

        let mut request = ClaimRequest::new(ConcurrencyLimits {
            max_projects: Some(2),
            max_per_stage: None,
        });
        request.active_projects.insert(ProjectId::new("active"));

        let claimed = claim(&mut source, &request);
        let projects: HashSet<&str> = claimed.iter().map(|t| t.project_id.as_str()).collect();
        assert_eq!(claimed.len(), 3);
        assert_eq!(projects, HashSet::from(["active", "new-1"]));
    }

    #[test]
    fn lost_race_does_not_reserve_capacity() {
        let mut source = VecSource::default();
        let first = source.push(record(new_task("a", StageType::Audio)));
        let second = source.push(record(new_task("b", StageType::Audio)));
        source.stolen.insert(first);

        let request = ClaimRequest::new(ConcurrencyLimits {
            max_projects: Some(1),
            max_per_stage: Some(1),
        });
        let claimed = claim(&mut source, &request);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, second);
    }

    #[test]
    fn single_claim_takes_the_highest_priority_task() {
        let mut source = VecSource::default();
        source.push(record(new_task("a", StageType::Images)));
        let top = source.push(record(new_task("a", StageType::Prompts)));

        let claimed = claim(&mut source, &ClaimRequest::single());
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, top);
        assert_eq!(claimed[0].attempts, 1);
    }

    #[test]
    fn zero_in_config_means_unlimited() {
        assert_eq!(ConcurrencyLimits::from_counts(0, 0), ConcurrencyLimits::unlimited());
        assert_eq!(
            ConcurrencyLimits::from_counts(3, 2),
            ConcurrencyLimits {
                max_projects: Some(3),
                max_per_stage: Some(2)
            }
        );
    }

    /// Random DAGs: repeatedly claim, then finish a random subset of the
    /// claimed tasks. No task may be claimed before its dependency completed,
    /// and no pass may exceed the caps.
    #[test]
    fn randomized_graphs_respect_dependencies_and_caps() {
        for seed in 0..25u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut source = VecSource::default();
            let mut ids: Vec<TaskId> = Vec::new();
            for i in 0..30 {
                let stage = StageType::ALL[rng.gen_range(0..4)];
                let project = format!("p{}", rng.gen_range(0..5));
                let mut task = new_task(&project, stage);
                task.priority = rng.gen_range(0..3);
                if i > 0 && rng.gen_bool(0.6) {
                    task.depends_on = Some(ids[rng.gen_range(0..ids.len())]);
                }
                ids.push(source.push(record(task)));
            }

            let limits = ConcurrencyLimits {
                max_projects: Some(rng.gen_range(1..4)),
                max_per_stage: Some(rng.gen_range(1..3)),
            };
            let mut active: Vec<TaskRecord> = Vec::new();

            for _round in 0..200 {
                let mut request = ClaimRequest::new(limits);
                for task in &active {
                    request.active_projects.insert(task.project_id.clone());
                    *request.active_per_stage.entry(task.stage).or_default() += 1;
                }

                for task in claim(&mut source, &request) {
                    if let Some(dep) = task.depends_on {
                        assert_eq!(source.get(dep).status, TaskStatus::Completed);
                    }
                    active.push(task);
                }

                let projects: HashSet<&ProjectId> = active.iter().map(|t| &t.project_id).collect();
                assert!(projects.len() <= limits.max_projects.unwrap());
                for stage in StageType::ALL {
                    let n = active.iter().filter(|t| t.stage == stage).count();
                    assert!(n <= limits.max_per_stage.unwrap());
                }

                active.retain(|task| {
                    if rng.gen_bool(0.5) {
                        source.set_status(task.id, TaskStatus::Completed);
                        false
                    } else {
                        true
                    }
                });
            }

            // Drain: with everything finished each round, the oldest pending
            // task is always claimable because edges only point backwards.
            for _ in 0..ids.len() {
                for task in active.drain(..) {
                    source.set_status(task.id, TaskStatus::Completed);
                }
                active = claim(&mut source, &ClaimRequest::new(limits));
            }
            assert!(source.tasks.iter().all(|t| t.status != TaskStatus::Pending));
        }
    }
}
