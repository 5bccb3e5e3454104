//! SchedulerBuilder - scheduler の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - ports の差し替え（テストでは InMemoryTaskStore / FixedClock）

use std::sync::Arc;

use crate::domain::{ConcurrencyLimits, Decider, DefaultDecider, StageType};
use crate::impls::broadcast_sink::DEFAULT_EVENT_CAPACITY;
use crate::ports::{
    Clock, EventSink, IdGenerator, LimitsSource, StageExecutor, StaticLimits, SystemClock,
    TaskStore, UlidGenerator,
};

use super::events::EventHub;
use super::executor::TaskExecutor;
use super::recovery::FailureManager;
use super::registry::{RegistryError, StageRegistry};
use super::scheduler::{Inner, Scheduler, SchedulerSettings};

/// SchedulerBuilder は Scheduler を構築
///
/// # 使用例
/// ```ignore
/// let scheduler = SchedulerBuilder::new(Arc::new(SqliteTaskStore::open(config)?))
///     .register(StageType::Prompts, PromptStage::new())?
///     .register(StageType::Images, ImageStage::new())?
///     .expect_stages(&StageType::ALL)
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_stages() で実行が必要な stage を宣言
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct SchedulerBuilder {
    store: Arc<dyn TaskStore>,
    registry: StageRegistry,
    expected_stages: Option<Vec<StageType>>,
    limits: Arc<dyn LimitsSource>,
    settings: SchedulerSettings,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Arc<dyn Decider>,
    sinks: Vec<Arc<dyn EventSink>>,
    event_capacity: usize,
}

/// BuildError は scheduler 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing stage executors: {0:?}. These stages were expected but not registered.")]
    MissingStages(Vec<StageType>),
}

impl SchedulerBuilder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            registry: StageRegistry::new(),
            expected_stages: None,
            limits: Arc::new(StaticLimits(ConcurrencyLimits::from_counts(3, 2))),
            settings: SchedulerSettings::default(),
            clock: Arc::new(SystemClock),
            ids: None,
            decider: Arc::new(DefaultDecider),
            sinks: Vec::new(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// StageExecutor を登録
    pub fn register<E: StageExecutor + 'static>(
        self,
        stage: StageType,
        executor: E,
    ) -> Result<Self, RegistryError> {
        self.register_shared(stage, Arc::new(executor))
    }

    /// 共有済みの StageExecutor を登録（複数 stage で同じ executor を使う場合など）
    pub fn register_shared(
        mut self,
        stage: StageType,
        executor: Arc<dyn StageExecutor>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(stage, executor)?;
        Ok(self)
    }

    /// 期待される stage のリストを設定
    pub fn expect_stages(mut self, stages: &[StageType]) -> Self {
        self.expected_stages = Some(stages.to_vec());
        self
    }

    /// Caps source. Defaults to 3 projects / 2 per stage.
    pub fn limits(mut self, limits: Arc<dyn LimitsSource>) -> Self {
        self.limits = limits;
        self
    }

    pub fn settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to a [`UlidGenerator`] on the builder's clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    /// Additional event sink next to the built-in broadcast channel.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Buffer size of the broadcast channel behind `Scheduler::subscribe`.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// SchedulerBuilder を検証して Scheduler を生成
    ///
    /// # 検証
    /// - expect_stages() で設定された stage が全て登録されているかチェック
    /// - 不足があれば BuildError::MissingStages を返す
    ///
    /// 未登録の stage のタスクは、expect_stages() を使わない場合は実行時に
    /// 恒久的失敗になります。
    pub fn build(self) -> Result<Scheduler, BuildError> {
        if let Some(expected) = &self.expected_stages {
            let registered = self.registry.registered_stages();
            let missing: Vec<StageType> = expected
                .iter()
                .filter(|stage| !registered.contains(stage))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingStages(missing));
            }
        }

        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(self.clock.clone())));
        let events = Arc::new(EventHub::new(self.event_capacity, self.sinks));
        let failures = Arc::new(FailureManager::new(
            self.store.clone(),
            self.decider,
            events.clone(),
            self.clock,
            self.settings.stale_after,
        ));
        let executor = TaskExecutor::new(
            self.store.clone(),
            Arc::new(self.registry),
            failures.clone(),
            events.clone(),
            self.settings.output_root.clone(),
        );

        tracing::debug!(settings = ?self.settings, "scheduler built");
        Ok(Scheduler::from_inner(Inner::new(
            self.store,
            self.limits,
            self.settings,
            ids,
            events,
            failures,
            executor,
        )))
    }
}
