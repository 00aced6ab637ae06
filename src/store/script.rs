//! Script source repository.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::StoreError;
use crate::model::{Script, ScriptId};

/// Fetch and persist script source by id.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Script>, StoreError>;
    async fn create(&self, script: Script) -> Result<(), StoreError>;
    async fn update(&self, script: Script) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryScriptStore {
    scripts: RwLock<HashMap<ScriptId, Script>>,
}

impl InMemoryScriptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScriptStore for InMemoryScriptStore {
    async fn get(&self, id: &str) -> Result<Option<Script>, StoreError> {
        Ok(self.scripts.read().get(id).cloned())
    }

    async fn create(&self, script: Script) -> Result<(), StoreError> {
        let mut scripts = self.scripts.write();
        if scripts.contains_key(&script.id) {
            return Err(StoreError::Conflict(script.id));
        }
        scripts.insert(script.id.clone(), script);
        Ok(())
    }

    async fn update(&self, script: Script) -> Result<(), StoreError> {
        let mut scripts = self.scripts.write();
        if !scripts.contains_key(&script.id) {
            return Err(StoreError::NotFound(script.id));
        }
        scripts.insert(script.id.clone(), script);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.scripts
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
