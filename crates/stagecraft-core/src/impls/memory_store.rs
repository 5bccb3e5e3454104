//! InMemoryTaskStore - テスト・開発用の正本
//!
//! # 実装詳細
//! - 全状態を 1 つの Mutex で保護（ロック中の操作 = 1 トランザクション）
//! - 挿入順の連番（seq）で claim 順の最後のタイを解消
//! - ロック中に await しないので std::sync::Mutex で十分

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    ClaimRequest, ClaimSource, DependencyGraph, NewTask, ProjectId, Progress, StageType,
    StatusCounts, TaskFailure, TaskId, TaskRecord, TaskStatus, claim_order, run_claim_pass,
};
use crate::ports::{Clock, StoreError, StoreResult, SystemClock, TaskStore, validate_batch};

#[derive(Debug)]
struct Entry {
    record: TaskRecord,
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<TaskId, Entry>,
    next_seq: u64,
}

impl State {
    /// Records matching `filter`, in claim order.
    fn sorted<F>(&self, filter: F) -> Vec<TaskRecord>
    where
        F: Fn(&TaskRecord) -> bool,
    {
        let mut entries: Vec<&Entry> = self.tasks.values().filter(|e| filter(&e.record)).collect();
        entries.sort_by(|a, b| claim_order(&a.record, &b.record).then(a.seq.cmp(&b.seq)));
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    fn record_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        self.tasks.get_mut(&id).map(|e| &mut e.record)
    }

    /// Dependency graph of one project.
    fn project_graph(&self, project_id: &ProjectId) -> DependencyGraph {
        DependencyGraph::from_edges(
            self.tasks
                .values()
                .filter(|e| &e.record.project_id == project_id)
                .map(|e| (e.record.id, e.record.depends_on)),
        )
    }

    fn cancel_if_pending(&mut self, id: TaskId, now: DateTime<Utc>) -> bool {
        match self.record_mut(id) {
            Some(record) if record.status == TaskStatus::Pending => {
                record.mark_cancelled(now);
                true
            }
            _ => false,
        }
    }

    /// Cancel every pending task transitively waiting for `id`.
    fn cancel_dependents(&mut self, id: TaskId, now: DateTime<Utc>) -> Vec<TaskId> {
        let Some(project_id) = self.tasks.get(&id).map(|e| e.record.project_id.clone()) else {
            return Vec::new();
        };
        let graph = self.project_graph(&project_id);
        graph
            .transitive_dependents(id)
            .into_iter()
            .filter(|&dependent| self.cancel_if_pending(dependent, now))
            .collect()
    }
}

/// Claim primitives over the locked state.
struct LockedSource<'a> {
    state: &'a mut State,
    now: DateTime<Utc>,
}

impl ClaimSource for LockedSource<'_> {
    type Error = StoreError;

    fn pending_in_claim_order(&mut self) -> StoreResult<Vec<TaskRecord>> {
        Ok(self.state.sorted(|t| t.status == TaskStatus::Pending))
    }

    fn status_of(&mut self, id: TaskId) -> StoreResult<Option<TaskStatus>> {
        Ok(self.state.tasks.get(&id).map(|e| e.record.status))
    }

    fn try_claim(&mut self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        match self.state.record_mut(id) {
            Some(record) if record.status == TaskStatus::Pending => {
                record.start_attempt(self.now);
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }
}

/// InMemoryTaskStore はプロセス内だけの TaskStore
///
/// Clone するとストアを共有します（同じ Arc を指す）。
#[derive(Clone)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| StoreError::Backend(format!("state lock poisoned: {e}")))
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_batch(&self, tasks: Vec<NewTask>) -> StoreResult<Vec<TaskRecord>> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        validate_batch(&tasks, |id| Ok(state.tasks.contains_key(&id)))?;

        let mut inserted = Vec::with_capacity(tasks.len());
        for task in tasks {
            let record = TaskRecord::new(task, now);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.tasks.insert(
                record.id,
                Entry {
                    record: record.clone(),
                    seq,
                },
            );
            inserted.push(record);
        }
        Ok(inserted)
    }

    async fn get(&self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        Ok(self.lock()?.tasks.get(&id).map(|e| e.record.clone()))
    }

    async fn list_by_project(&self, project_id: &ProjectId) -> StoreResult<Vec<TaskRecord>> {
        Ok(self.lock()?.sorted(|t| &t.project_id == project_id))
    }

    async fn list_by_status(&self, status: TaskStatus) -> StoreResult<Vec<TaskRecord>> {
        Ok(self.lock()?.sorted(|t| t.status == status))
    }

    async fn count_by_status(&self) -> StoreResult<StatusCounts> {
        let state = self.lock()?;
        let mut counts = StatusCounts::default();
        for entry in state.tasks.values() {
            counts.add(entry.record.status, 1);
        }
        Ok(counts)
    }

    async fn claim_next(&self) -> StoreResult<Option<TaskRecord>> {
        Ok(self.claim_batch(&ClaimRequest::single()).await?.pop())
    }

    async fn claim_batch(&self, request: &ClaimRequest) -> StoreResult<Vec<TaskRecord>> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let mut source = LockedSource {
            state: &mut *state,
            now,
        };
        run_claim_pass(&mut source, request)
    }

    async fn update_progress(&self, id: TaskId, progress: &Progress) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.record_mut(id) {
            Some(record) if record.status == TaskStatus::Processing => {
                record.progress = progress.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_priority(&self, id: TaskId, priority: i32) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.record_mut(id) {
            Some(record) => {
                record.priority = priority;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_completed(&self, id: TaskId) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        match state.record_mut(id) {
            Some(record) if record.status == TaskStatus::Processing => {
                record.mark_completed(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, id: TaskId, failure: &TaskFailure) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        match state.record_mut(id) {
            Some(record) if record.status == TaskStatus::Processing => {
                record.mark_failed(failure, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, id: TaskId) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        match state.record_mut(id) {
            Some(record) if !record.status.is_terminal() => {
                record.mark_cancelled(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_failed(&self, id: TaskId, failure: &TaskFailure) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.record_mut(id) {
            Some(record) if record.status == TaskStatus::Processing => {
                record.requeue_after_failure(failure);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn retry(&self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        let mut state = self.lock()?;
        let record = state.record_mut(id).ok_or(StoreError::NotFound(id))?;
        if !record.status.is_terminal() {
            return Ok(None);
        }
        record.reset_for_retry();
        Ok(Some(record.clone()))
    }

    async fn reset_all_processing(&self) -> StoreResult<Vec<TaskId>> {
        let mut state = self.lock()?;
        let ids: Vec<TaskId> = state
            .sorted(|t| t.status == TaskStatus::Processing)
            .into_iter()
            .map(|t| t.id)
            .collect();
        for &id in &ids {
            if let Some(record) = state.record_mut(id) {
                record.reset_interrupted();
            }
        }
        Ok(ids)
    }

    async fn reset_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        keep: &[TaskId],
    ) -> StoreResult<Vec<TaskId>> {
        let mut state = self.lock()?;
        let ids: Vec<TaskId> = state
            .sorted(|t| {
                t.status == TaskStatus::Processing
                    && t.started_at.is_some_and(|at| at < started_before)
                    && !keep.contains(&t.id)
            })
            .into_iter()
            .map(|t| t.id)
            .collect();
        for &id in &ids {
            if let Some(record) = state.record_mut(id) {
                record.reset_interrupted();
            }
        }
        Ok(ids)
    }

    async fn dependents_of(&self, id: TaskId) -> StoreResult<Vec<TaskRecord>> {
        Ok(self.lock()?.sorted(|t| t.depends_on == Some(id)))
    }

    async fn cascade_cancel_dependents(&self, id: TaskId) -> StoreResult<Vec<TaskId>> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        Ok(state.cancel_dependents(id, now))
    }

    async fn cascade_cancel_for_project(
        &self,
        project_id: &ProjectId,
        stage: StageType,
        except: TaskId,
    ) -> StoreResult<Vec<TaskId>> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let targets: Vec<TaskId> = state
            .sorted(|t| {
                &t.project_id == project_id
                    && t.stage == stage
                    && t.status == TaskStatus::Pending
                    && t.id != except
            })
            .into_iter()
            .map(|t| t.id)
            .collect();

        let mut cancelled = Vec::new();
        for id in targets {
            if state.cancel_if_pending(id, now) {
                cancelled.push(id);
            }
            cancelled.extend(state.cancel_dependents(id, now));
        }
        Ok(cancelled)
    }

    async fn delete_project(&self, project_id: &ProjectId) -> StoreResult<usize> {
        let mut state = self.lock()?;
        let before = state.tasks.len();
        state.tasks.retain(|_, e| &e.record.project_id != project_id);
        Ok(before - state.tasks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::fixtures::{dependent_task, new_task};
    use crate::domain::{ConcurrencyLimits, ErrorKind};
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone};

    fn store_with_clock() -> (InMemoryTaskStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        (InMemoryTaskStore::with_clock(clock.clone()), clock)
    }

    fn failure(kind: ErrorKind) -> TaskFailure {
        TaskFailure {
            kind,
            message: "generation failed".into(),
            stack: None,
        }
    }

    #[tokio::test]
    async fn insert_then_claim_in_priority_order() {
        let store = InMemoryTaskStore::new();
        let images = new_task("p", StageType::Images);
        let prompts = new_task("p", StageType::Prompts);
        store
            .insert_batch(vec![images.clone(), prompts.clone()])
            .await
            .unwrap();

        let first = store.claim_next().await.unwrap().unwrap();
        assert_eq!(first.id, prompts.id);
        assert_eq!(first.status, TaskStatus::Processing);
        assert_eq!(first.attempts, 1);
        assert!(first.started_at.is_some());

        let second = store.claim_next().await.unwrap().unwrap();
        assert_eq!(second.id, images.id);
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn equal_keys_claim_in_insertion_order() {
        let store = InMemoryTaskStore::new();
        let tasks: Vec<NewTask> = (0..5).map(|_| new_task("p", StageType::Audio)).collect();
        store.insert_batch(tasks.clone()).await.unwrap();

        for task in &tasks {
            assert_eq!(store.claim_next().await.unwrap().unwrap().id, task.id);
        }
    }

    #[tokio::test]
    async fn concurrent_claim_next_hands_out_a_task_once() {
        let store = InMemoryTaskStore::new();
        store
            .insert_batch(vec![new_task("p", StageType::Audio)])
            .await
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.claim_next().await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn invalid_batches_insert_nothing() {
        let store = InMemoryTaskStore::new();
        let missing = TaskId::from_ulid(ulid::Ulid::new());
        let ok = new_task("p", StageType::Prompts);
        let bad = dependent_task("p", StageType::Images, missing);

        let err = store.insert_batch(vec![ok, bad]).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownDependency { .. }));
        assert_eq!(store.count_by_status().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn terminal_writes_require_processing() {
        let store = InMemoryTaskStore::new();
        let task = new_task("p", StageType::Audio);
        store.insert_batch(vec![task.clone()]).await.unwrap();

        assert!(!store.mark_completed(task.id).await.unwrap());
        assert!(!store.mark_failed(task.id, &failure(ErrorKind::Permanent)).await.unwrap());

        store.claim_next().await.unwrap();
        assert!(store.cancel(task.id).await.unwrap());
        // late completion after an operator cancel is ignored
        assert!(!store.mark_completed(task.id).await.unwrap());
        let record = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn progress_is_only_written_while_processing() {
        let store = InMemoryTaskStore::new();
        let task = new_task("p", StageType::Images);
        store.insert_batch(vec![task.clone()]).await.unwrap();
        let progress = Progress::new(40, Some("{\"frame\":4}".into()));

        assert!(!store.update_progress(task.id, &progress).await.unwrap());
        store.claim_next().await.unwrap();
        assert!(store.update_progress(task.id, &progress).await.unwrap());
        assert_eq!(store.get(task.id).await.unwrap().unwrap().progress, progress);
    }

    #[tokio::test]
    async fn retry_resets_failed_task_and_keeps_attempts() {
        let store = InMemoryTaskStore::new();
        let task = new_task("p", StageType::Audio);
        store.insert_batch(vec![task.clone()]).await.unwrap();
        store.claim_next().await.unwrap();
        store
            .mark_failed(task.id, &failure(ErrorKind::Permanent))
            .await
            .unwrap();

        let reset = store.retry(task.id).await.unwrap().unwrap();
        assert_eq!(reset.status, TaskStatus::Pending);
        assert_eq!(reset.attempts, 1);
        assert!(reset.error.is_none());
        assert!(reset.error_kind.is_none());

        assert!(store.retry(task.id).await.unwrap().is_none());
        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 2);
    }

    #[tokio::test]
    async fn retry_leaves_a_running_task_alone() {
        let store = InMemoryTaskStore::new();
        let task = new_task("p", StageType::Audio);
        store.insert_batch(vec![task.clone()]).await.unwrap();
        store.claim_next().await.unwrap().unwrap();

        assert!(store.retry(task.id).await.unwrap().is_none());
        let record = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Processing);
        assert!(record.started_at.is_some());
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_accepts_a_completed_task() {
        let store = InMemoryTaskStore::new();
        let task = new_task("p", StageType::Audio);
        store.insert_batch(vec![task.clone()]).await.unwrap();
        store.claim_next().await.unwrap();
        assert!(store.mark_completed(task.id).await.unwrap());

        let reset = store.retry(task.id).await.unwrap().unwrap();
        assert_eq!(reset.status, TaskStatus::Pending);
        assert_eq!(reset.progress.percent, 0);
    }

    #[tokio::test]
    async fn requeue_keeps_the_last_error_until_success() {
        let store = InMemoryTaskStore::new();
        let task = new_task("p", StageType::Audio);
        store.insert_batch(vec![task.clone()]).await.unwrap();
        store.claim_next().await.unwrap();

        assert!(store
            .requeue_failed(task.id, &failure(ErrorKind::Transient))
            .await
            .unwrap());
        let requeued = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.error.as_deref(), Some("generation failed"));
        assert_eq!(requeued.error_kind, Some(ErrorKind::Transient));
        assert!(requeued.started_at.is_none());
        assert_eq!(store.count_by_status().await.unwrap().failed, 0);

        // Only processing tasks are requeued.
        assert!(!store
            .requeue_failed(task.id, &failure(ErrorKind::Transient))
            .await
            .unwrap());

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 2);
        assert!(store.mark_completed(task.id).await.unwrap());
        let done = store.get(task.id).await.unwrap().unwrap();
        assert!(done.error.is_none());
        assert!(done.error_kind.is_none());
    }

    #[tokio::test]
    async fn retry_of_unknown_task_is_not_found() {
        let store = InMemoryTaskStore::new();
        let id = TaskId::from_ulid(ulid::Ulid::new());
        assert!(matches!(
            store.retry(id).await,
            Err(StoreError::NotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn reset_all_processing_returns_tasks_to_pending() {
        let store = InMemoryTaskStore::new();
        let a = new_task("p", StageType::Prompts);
        let b = new_task("p", StageType::Audio);
        store.insert_batch(vec![a.clone(), b.clone()]).await.unwrap();
        store
            .claim_batch(&ClaimRequest::new(ConcurrencyLimits::unlimited()))
            .await
            .unwrap();

        let reset = store.reset_all_processing().await.unwrap();
        assert_eq!(reset, vec![a.id, b.id]);
        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.processing, 0);
        // the attempt that was interrupted still counts
        assert_eq!(store.get(a.id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn stale_reset_skips_recent_and_kept_tasks() {
        let (store, clock) = store_with_clock();
        let old = new_task("p", StageType::Prompts);
        let kept = new_task("p", StageType::Audio);
        let recent = new_task("q", StageType::Prompts);
        store
            .insert_batch(vec![old.clone(), kept.clone()])
            .await
            .unwrap();
        store
            .claim_batch(&ClaimRequest::new(ConcurrencyLimits::unlimited()))
            .await
            .unwrap();

        clock.advance(Duration::minutes(10));
        store.insert_batch(vec![recent.clone()]).await.unwrap();
        store.claim_next().await.unwrap();

        let cutoff = clock.now() - Duration::minutes(5);
        let reset = store.reset_stale_processing(cutoff, &[kept.id]).await.unwrap();
        assert_eq!(reset, vec![old.id]);
        assert_eq!(
            store.get(kept.id).await.unwrap().unwrap().status,
            TaskStatus::Processing
        );
        assert_eq!(
            store.get(recent.id).await.unwrap().unwrap().status,
            TaskStatus::Processing
        );
    }

    #[tokio::test]
    async fn cascade_cancel_follows_chains_and_skips_finished_tasks() {
        let store = InMemoryTaskStore::new();
        let root = new_task("p", StageType::Prompts);
        let child = dependent_task("p", StageType::Images, root.id);
        let grandchild = dependent_task("p", StageType::Subtitles, child.id);
        let other = new_task("p", StageType::Audio);
        store
            .insert_batch(vec![root.clone(), child.clone(), grandchild.clone(), other.clone()])
            .await
            .unwrap();

        let cancelled = store.cascade_cancel_dependents(root.id).await.unwrap();
        assert_eq!(cancelled, vec![child.id, grandchild.id]);
        assert_eq!(
            store.get(other.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
        assert!(store.cascade_cancel_dependents(root.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn project_cascade_cancels_same_stage_and_dependents() {
        let store = InMemoryTaskStore::new();
        let failed = new_task("p", StageType::Audio);
        let sibling = new_task("p", StageType::Audio);
        let subtitles = dependent_task("p", StageType::Subtitles, sibling.id);
        let prompts = new_task("p", StageType::Prompts);
        let elsewhere = new_task("q", StageType::Audio);
        store
            .insert_batch(vec![
                failed.clone(),
                sibling.clone(),
                subtitles.clone(),
                prompts.clone(),
                elsewhere.clone(),
            ])
            .await
            .unwrap();

        let cancelled = store
            .cascade_cancel_for_project(&ProjectId::new("p"), StageType::Audio, failed.id)
            .await
            .unwrap();
        assert_eq!(cancelled, vec![sibling.id, subtitles.id]);
        for untouched in [failed.id, prompts.id, elsewhere.id] {
            assert_eq!(
                store.get(untouched).await.unwrap().unwrap().status,
                TaskStatus::Pending
            );
        }
    }

    #[tokio::test]
    async fn delete_project_removes_only_its_tasks() {
        let store = InMemoryTaskStore::new();
        store
            .insert_batch(vec![
                new_task("p", StageType::Prompts),
                new_task("p", StageType::Audio),
                new_task("q", StageType::Audio),
            ])
            .await
            .unwrap();

        assert_eq!(store.delete_project(&ProjectId::new("p")).await.unwrap(), 2);
        assert!(store.list_by_project(&ProjectId::new("p")).await.unwrap().is_empty());
        assert_eq!(store.count_by_status().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn dependents_of_lists_direct_dependents() {
        let store = InMemoryTaskStore::new();
        let prompts = new_task("p", StageType::Prompts);
        let images = dependent_task("p", StageType::Images, prompts.id);
        let later = dependent_task("p", StageType::Subtitles, images.id);
        store
            .insert_batch(vec![prompts.clone(), images.clone(), later])
            .await
            .unwrap();

        let dependents = store.dependents_of(prompts.id).await.unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].id, images.id);
    }
}
