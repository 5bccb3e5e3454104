//! Scheduler - claim ループと公開 API
//!
//! # 構成
//! - tick ループ: 一定間隔 + wake 通知で claim pass を実行
//! - sweep ループ: 滞留した processing タスクを回収
//! - active マップ: このプロセスで実行中のタスク（store から再構築可能なキャッシュ）
//!
//! claim pass はプロセス内で claim_lock により直列化されるので、
//! pass に渡す active のスナップショットが古くなることはありません。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    ClaimRequest, PlanError, ProjectId, SchedulerEvent, StageOptions, StageType, TaskId,
    TaskRecord, TaskStatus, plan_project,
};
use crate::ports::{IdGenerator, LimitsSource, StoreError, TaskStore};

use super::events::EventHub;
use super::executor::TaskExecutor;
use super::recovery::FailureManager;
use super::stats::SchedulerStats;

/// Lower bound for loop intervals; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Runtime knobs of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Interval of the claim loop.
    pub tick_interval: Duration,

    /// `max_attempts` of newly submitted tasks.
    pub max_attempts: u32,

    /// A processing task older than this is considered stale.
    pub stale_after: Duration,

    pub stale_sweep_interval: Duration,

    /// Stage outputs go to `<output_root>/<project_id>/<stage>`.
    pub output_root: PathBuf,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_attempts: 3,
            stale_after: Duration::from_secs(300),
            stale_sweep_interval: Duration::from_secs(60),
            output_root: PathBuf::from("./output"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {task_id} is {status}")]
    InvalidState { task_id: TaskId, status: TaskStatus },

    #[error("scheduler is not running")]
    NotRunning,

    #[error("scheduler is already running")]
    AlreadyRunning,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// A task executing in this process.
#[derive(Debug)]
struct ActiveTask {
    project_id: ProjectId,
    stage: StageType,
    /// Distinguishes runs of a retried task.
    attempt: u32,
    cancel: CancellationToken,
}

/// Background loop handle.
/// - `shutdown_tx` に true を送るとループが止まる
/// - `joins` で終了を待てる
struct Loops {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) limits: Arc<dyn LimitsSource>,
    pub(crate) settings: SchedulerSettings,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) events: Arc<EventHub>,
    pub(crate) failures: Arc<FailureManager>,
    pub(crate) executor: TaskExecutor,
    active: Mutex<HashMap<TaskId, ActiveTask>>,
    claim_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    paused: AtomicBool,
    recovered: AtomicBool,
    loops: tokio::sync::Mutex<Option<Loops>>,
}

impl Inner {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        limits: Arc<dyn LimitsSource>,
        settings: SchedulerSettings,
        ids: Arc<dyn IdGenerator>,
        events: Arc<EventHub>,
        failures: Arc<FailureManager>,
        executor: TaskExecutor,
    ) -> Self {
        Self {
            store,
            limits,
            settings,
            ids,
            events,
            failures,
            executor,
            active: Mutex::new(HashMap::new()),
            claim_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            paused: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            loops: tokio::sync::Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<TaskId, ActiveTask>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn active_ids(&self) -> Vec<TaskId> {
        self.active().keys().copied().collect()
    }

    /// One claim pass, then spawn an executor per claimed task.
    async fn claim_and_dispatch(self: &Arc<Self>) -> SchedulerResult<Vec<TaskId>> {
        if self.paused.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let _pass = self.claim_lock.lock().await;

        let mut request = ClaimRequest::new(self.limits.limits());
        for task in self.active().values() {
            request.active_projects.insert(task.project_id.clone());
            *request.active_per_stage.entry(task.stage).or_default() += 1;
        }

        let claimed = self.store.claim_batch(&request).await?;
        let mut dispatched = Vec::with_capacity(claimed.len());
        for task in claimed {
            let cancel = CancellationToken::new();
            self.active().insert(
                task.id,
                ActiveTask {
                    project_id: task.project_id.clone(),
                    stage: task.stage,
                    attempt: task.attempts,
                    cancel: cancel.clone(),
                },
            );
            dispatched.push(task.id);
            self.spawn_run(task, cancel);
        }

        if !dispatched.is_empty() {
            tracing::debug!(count = dispatched.len(), "dispatched tasks");
            // reuse capacity the pass left unused without waiting for a tick
            self.wake.notify_one();
        }
        Ok(dispatched)
    }

    fn spawn_run(self: &Arc<Self>, task: TaskRecord, cancel: CancellationToken) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let (id, attempt) = (task.id, task.attempts);
            inner.executor.run(task, cancel).await;
            inner.release(id, attempt);
            inner.wake.notify_one();
        });
    }

    /// Free the slot of a finished run, unless the task was already
    /// released (cancel) and claimed again since.
    fn release(&self, id: TaskId, attempt: u32) {
        let mut active = self.active();
        if active.get(&id).is_some_and(|task| task.attempt == attempt) {
            active.remove(&id);
        }
    }

    /// Abort the in-flight run of `id`, if any.
    fn abort(&self, id: TaskId) -> bool {
        match self.active().remove(&id) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

async fn tick_loop(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.settings.tick_interval.max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
            _ = inner.wake.notified() => {}
        }

        if let Err(e) = inner.claim_and_dispatch().await {
            tracing::warn!(error = %e, "claim pass failed");
        }
    }
    tracing::debug!("claim loop stopped");
}

async fn sweep_loop(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker =
        tokio::time::interval(inner.settings.stale_sweep_interval.max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately; startup recovery already ran
    ticker.tick().await;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let keep = inner.active_ids();
        match inner.failures.sweep_stale(&keep).await {
            Ok(reset) if !reset.is_empty() => inner.wake.notify_one(),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "stale sweep failed"),
        }
    }
    tracing::debug!("stale sweep stopped");
}

/// Scheduler は claim ループと操作 API を提供
///
/// Clone すると同じ scheduler を共有します。
///
/// # 使用例
/// ```ignore
/// let scheduler = SchedulerBuilder::new(store)
///     .register(StageType::Audio, AudioStage::new())?
///     .build()?;
/// scheduler.start().await?;
/// scheduler.submit(ProjectId::new("p1"), StageOptions::all()).await?;
/// ```
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub(crate) fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Start the claim and stale-sweep loops.
    ///
    /// The first start of a process runs startup recovery: every task left
    /// processing is reset to pending. Returns the reset ids.
    pub async fn start(&self) -> SchedulerResult<Vec<TaskId>> {
        let mut loops = self.inner.loops.lock().await;
        if loops.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let recovered = if self.inner.recovered.swap(true, Ordering::SeqCst) {
            Vec::new()
        } else {
            self.inner.failures.startup_recovery().await?
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = vec![
            tokio::spawn(tick_loop(Arc::clone(&self.inner), shutdown_rx.clone())),
            tokio::spawn(sweep_loop(Arc::clone(&self.inner), shutdown_rx)),
        ];
        *loops = Some(Loops { shutdown_tx, joins });
        self.inner.wake.notify_one();

        tracing::info!(recovered = recovered.len(), "scheduler started");
        Ok(recovered)
    }

    /// Stop the loops and wait for them. In-flight tasks keep running to
    /// completion; use `cancel_task` to abort one.
    pub async fn stop(&self) -> SchedulerResult<()> {
        let Some(loops) = self.inner.loops.lock().await.take() else {
            return Err(SchedulerError::NotRunning);
        };
        // ignore send error: loops may already be gone
        let _ = loops.shutdown_tx.send(true);
        for join in loops.joins {
            if let Err(e) = join.await {
                tracing::warn!(error = %e, "scheduler loop panicked");
            }
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.loops.lock().await.is_some()
    }

    /// Stop claiming new tasks. In-flight tasks are not affected.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        tracing::info!("scheduler paused");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();
        tracing::info!("scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Run one claim pass now and dispatch what it claimed.
    pub async fn claim_and_dispatch(&self) -> SchedulerResult<Vec<TaskId>> {
        self.inner.claim_and_dispatch().await
    }

    /// Create the tasks of a project.
    pub async fn submit(
        &self,
        project_id: ProjectId,
        options: StageOptions,
    ) -> SchedulerResult<Vec<TaskRecord>> {
        let tasks = plan_project(&project_id, options, self.inner.settings.max_attempts, || {
            self.inner.ids.generate_task_id()
        })?;
        let records = self.inner.store.insert_batch(tasks).await?;
        for record in &records {
            self.inner
                .events
                .status_changed(record, TaskStatus::Pending, None);
        }
        tracing::info!(%project_id, tasks = records.len(), "project submitted");
        self.inner.wake.notify_one();
        Ok(records)
    }

    /// Cancel a pending or processing task and abort its run. Dependents
    /// are left alone. Returns false if the task had already finished.
    pub async fn cancel_task(&self, id: TaskId) -> SchedulerResult<bool> {
        let task = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or(SchedulerError::TaskNotFound(id))?;
        if !self.inner.store.cancel(id).await? {
            return Ok(false);
        }
        let aborted = self.inner.abort(id);
        tracing::info!(task_id = %id, aborted, "task cancelled");
        self.inner
            .events
            .status_changed(&task, TaskStatus::Cancelled, None);
        self.inner.wake.notify_one();
        Ok(true)
    }

    /// Cancel a task and every pending task transitively depending on it.
    pub async fn cancel_task_cascading(&self, id: TaskId) -> SchedulerResult<Vec<TaskId>> {
        let mut cancelled = Vec::new();
        if self.cancel_task(id).await? {
            cancelled.push(id);
        }
        let dependents = self.inner.store.cascade_cancel_dependents(id).await?;
        self.inner
            .failures
            .announce_cancelled(&dependents, "dependency cancelled")
            .await?;
        cancelled.extend(dependents);
        Ok(cancelled)
    }

    /// Put a completed, failed or cancelled task back to pending. Attempts
    /// are kept. Pending and processing tasks are rejected, including ones
    /// another scheduler instance is running.
    pub async fn retry_task(&self, id: TaskId) -> SchedulerResult<TaskRecord> {
        let task = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or(SchedulerError::TaskNotFound(id))?;
        if self.inner.active().contains_key(&id) {
            return Err(SchedulerError::InvalidState {
                task_id: id,
                status: task.status,
            });
        }
        let Some(record) = self.inner.store.retry(id).await? else {
            return Err(SchedulerError::InvalidState {
                task_id: id,
                status: task.status,
            });
        };
        tracing::info!(task_id = %id, attempts = record.attempts, "task retried");
        self.inner
            .events
            .status_changed(&record, TaskStatus::Pending, None);
        self.inner.wake.notify_one();
        Ok(record)
    }

    /// Change the priority of a task. Takes effect on the next claim pass.
    pub async fn reorder_task(&self, id: TaskId, priority: i32) -> SchedulerResult<()> {
        if !self.inner.store.update_priority(id, priority).await? {
            return Err(SchedulerError::TaskNotFound(id));
        }
        tracing::debug!(task_id = %id, priority, "task reordered");
        Ok(())
    }

    pub async fn get_stats(&self) -> SchedulerResult<SchedulerStats> {
        let counts = self.inner.store.count_by_status().await?;
        let running = self.is_running().await;

        let (active_workers, active_projects, active_per_stage) = {
            let active = self.inner.active();
            let projects: HashSet<&ProjectId> = active.values().map(|t| &t.project_id).collect();
            let mut projects: Vec<ProjectId> = projects.into_iter().cloned().collect();
            projects.sort();
            let mut per_stage: BTreeMap<StageType, usize> = BTreeMap::new();
            for task in active.values() {
                *per_stage.entry(task.stage).or_default() += 1;
            }
            (active.len(), projects, per_stage)
        };

        Ok(SchedulerStats {
            counts,
            active_workers,
            active_projects,
            active_per_stage,
            limits: self.inner.limits.limits(),
            running,
            paused: self.is_paused(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    pub async fn project_tasks(&self, project_id: &ProjectId) -> SchedulerResult<Vec<TaskRecord>> {
        Ok(self.inner.store.list_by_project(project_id).await?)
    }

    pub async fn task(&self, id: TaskId) -> SchedulerResult<Option<TaskRecord>> {
        Ok(self.inner.store.get(id).await?)
    }

    /// Abort the project's in-flight tasks and delete all of its tasks.
    pub async fn delete_project(&self, project_id: &ProjectId) -> SchedulerResult<usize> {
        let in_flight: Vec<TaskId> = self
            .inner
            .active()
            .iter()
            .filter(|(_, task)| &task.project_id == project_id)
            .map(|(&id, _)| id)
            .collect();
        for &id in &in_flight {
            self.inner.abort(id);
        }

        let deleted = self.inner.store.delete_project(project_id).await?;
        tracing::info!(%project_id, deleted, aborted = in_flight.len(), "project deleted");
        self.inner.wake.notify_one();
        Ok(deleted)
    }
}
