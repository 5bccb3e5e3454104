//! StageRegistry - stage ごとの StageExecutor を登録・管理
//!
//! Design:
//! - Built during initialization (mutable).
//! - Used during runtime (immutable, shared through Arc).

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::StageType;
use crate::ports::StageExecutor;

/// RegistryError は StageRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Executor for stage '{0}' is already registered")]
    AlreadyRegistered(StageType),
}

#[derive(Default)]
pub struct StageRegistry {
    executors: HashMap<StageType, Arc<dyn StageExecutor>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        stage: StageType,
        executor: Arc<dyn StageExecutor>,
    ) -> Result<(), RegistryError> {
        if self.executors.contains_key(&stage) {
            return Err(RegistryError::AlreadyRegistered(stage));
        }
        self.executors.insert(stage, executor);
        Ok(())
    }

    pub fn get(&self, stage: StageType) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&stage).cloned()
    }

    /// Registered stages in pipeline order.
    pub fn registered_stages(&self) -> Vec<StageType> {
        let mut stages: Vec<StageType> = self.executors.keys().copied().collect();
        stages.sort();
        stages
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
