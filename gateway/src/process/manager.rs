//! `ProcessGroupManager::swap` (spec §4.3): resolves the owning group, pushes runtime
//! overrides, enforces group exclusivity, then enforces kill-previous/max-running policy.

use std::collections::HashMap;
use std::sync::Arc;

use gwconfig::ToolRuntimeSettings;
use tracing::info;

use crate::error::GatewayError;
use crate::model::{ProcessState, RuntimeOverrides};
use crate::process::{Process, ProcessGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStrategy {
    StopImmediately,
    StopWaitForInflightRequest,
}

pub struct SwapOutcome {
    pub target: Arc<Process>,
}

/// Owns the set of process groups. Mutation of the `groups` map itself is expected to
/// happen under the dispatcher's single `pmLock` (spec §5); this type only implements
/// the swap algorithm over whatever group set it is handed.
pub struct ProcessGroupManager {
    pub groups: HashMap<String, ProcessGroup>,
}

impl ProcessGroupManager {
    pub fn new() -> Self {
        Self { groups: HashMap::new() }
    }

    fn owning_group(&self, model_id: &str) -> Option<&ProcessGroup> {
        self.groups.values().find(|g| g.find(model_id).is_some())
    }

    /// `swap(modelID)` (spec §4.3).
    pub async fn swap(
        &self,
        model_id: &str,
        overrides: RuntimeOverrides,
        tool_settings: &ToolRuntimeSettings,
        stop_strategy: StopStrategy,
    ) -> Result<SwapOutcome, GatewayError> {
        let group = self
            .owning_group(model_id)
            .ok_or_else(|| GatewayError::NotFound(format!("no group owns model {model_id}")))?;

        let target = group
            .find(model_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("model {model_id} not found in its group")))?;

        *target.overrides.lock().await = overrides;

        if group.exclusive {
            self.stop_other_groups(&group.name, stop_strategy).await;
        }

        self.enforce_concurrency_policy(&target, tool_settings, stop_strategy).await;

        info!(model = %model_id, group = %group.name, "process group swap resolved target");
        Ok(SwapOutcome { target })
    }

    /// Stops all non-persistent processes belonging to groups other than `group_name`
    /// (spec §4.3 step 4 "exclusive").
    async fn stop_other_groups(&self, group_name: &str, strategy: StopStrategy) {
        for (name, group) in &self.groups {
            if name == group_name || group.persistent {
                continue;
            }
            for member in &group.members {
                if member.state() == ProcessState::Ready {
                    member.stop(strategy).await;
                }
            }
        }
    }

    /// `killPreviousOnSwap`: stop every ready process whose modelID differs from target;
    /// otherwise keep at most `maxRunningModels-1` others (newest kept), stopping the
    /// remainder (spec §4.3 step 5). "Newest" is approximated by declaration order within
    /// each group's member vector, since no separate activity-ordering index is kept here;
    /// the dispatcher's activity ring is the source of truth for recency elsewhere.
    async fn enforce_concurrency_policy(
        &self,
        target: &Arc<Process>,
        settings: &ToolRuntimeSettings,
        strategy: StopStrategy,
    ) {
        let others: Vec<&Arc<Process>> = self
            .groups
            .values()
            .flat_map(|g| g.members.iter())
            .filter(|p| p.model_id != target.model_id && p.state() == ProcessState::Ready)
            .collect();

        if settings.kill_previous_on_swap {
            for p in others {
                p.stop(strategy).await;
            }
            return;
        }

        let max_others = (settings.max_running_models as usize).saturating_sub(1);
        if others.len() > max_others {
            let to_stop = others.len() - max_others;
            for p in others.into_iter().take(to_stop) {
                p.stop(strategy).await;
            }
        }
    }
}

impl Default for ProcessGroupManager {
    fn default() -> Self {
        Self::new()
    }
}
