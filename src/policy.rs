//! Safety policy: the five fixed limits applied to every run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ScriptError};
use crate::model::{ExecutionPlan, Script};

/// Structural and runtime limits for one trigger pipeline.
///
/// Chain depth and parallel width are checked before any script runs; the
/// script size, instruction budget, and wall-clock limits are enforced per
/// node inside the execution wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyPolicy {
    /// Max number of layers in a plan.
    pub max_chain_depth: usize,
    /// Max scripts per layer.
    pub max_parallel_nodes: usize,
    /// Max script source size in bytes.
    pub max_script_bytes: usize,
    /// Instruction budget enforced through the interpreter's runtime limits.
    /// A script abandoned by the wall-clock timeout keeps its pool slot
    /// until this budget trips, so the pinning window scales with it.
    pub max_instructions: u64,
    /// Per-script wall-clock timeout, raced against execution.
    pub script_timeout: Duration,
    /// When false, a script returning no value denies instead of allowing.
    pub fail_open_on_nil: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            max_chain_depth: 10,
            max_parallel_nodes: 8,
            max_script_bytes: 64 * 1024,
            max_instructions: 1_000_000,
            script_timeout: Duration::from_secs(5),
            fail_open_on_nil: true,
        }
    }
}

impl SafetyPolicy {
    /// Validates plan shape. Runs before any execution; a violation rejects
    /// the whole run with no trace.
    pub fn validate_plan(&self, plan: &ExecutionPlan) -> Result<(), EngineError> {
        if plan.layers.len() > self.max_chain_depth {
            return Err(EngineError::ChainDepthExceeded {
                actual: plan.layers.len(),
                max: self.max_chain_depth,
            });
        }
        for (index, layer) in plan.layers.iter().enumerate() {
            if layer.len() > self.max_parallel_nodes {
                return Err(EngineError::ParallelNodesExceeded {
                    layer: index,
                    actual: layer.len(),
                    max: self.max_parallel_nodes,
                });
            }
        }
        Ok(())
    }

    /// Size gate applied per node before the script is handed to the pool.
    pub fn check_script_size(&self, script: &Script) -> Result<(), ScriptError> {
        if script.code.len() > self.max_script_bytes {
            return Err(ScriptError::CodeTooLarge {
                max: self.max_script_bytes,
                actual: script.code.len(),
            });
        }
        Ok(())
    }
}
