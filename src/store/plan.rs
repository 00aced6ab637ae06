//! Execution plan repository.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::StoreError;
use crate::model::{ExecutionPlan, ScriptId};

/// Maps a trigger event to its ordered layers of script ids.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn get(&self, trigger_event: &str) -> Result<Option<ExecutionPlan>, StoreError>;
    async fn set(
        &self,
        trigger_event: &str,
        layers: Vec<Vec<ScriptId>>,
    ) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryPlanStore {
    plans: RwLock<HashMap<String, ExecutionPlan>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn get(&self, trigger_event: &str) -> Result<Option<ExecutionPlan>, StoreError> {
        Ok(self.plans.read().get(trigger_event).cloned())
    }

    async fn set(
        &self,
        trigger_event: &str,
        layers: Vec<Vec<ScriptId>>,
    ) -> Result<(), StoreError> {
        self.plans.write().insert(
            trigger_event.to_string(),
            ExecutionPlan {
                trigger_event: trigger_event.to_string(),
                layers,
            },
        );
        Ok(())
    }
}
