//! Runtime data model (spec §3) that complements `gwconfig`'s static descriptors:
//! process state machine, per-model runtime overrides, and the prompt-optimization
//! snapshot. Static shape (model/group/tool descriptors) lives in `gwconfig`.

use chrono::{DateTime, Utc};
use gwconfig::PromptPolicy;
use serde::Serialize;

/// Cap applied to snapshot bodies (spec §3 "truncated-to-2 MiB").
pub const SNAPSHOT_BODY_CAP: usize = 2 * 1024 * 1024;

/// `Process` lifecycle (spec §4.3). Terminal `Shutdown` is reached only once, propagated
/// from a whole-gateway shutdown; it is never exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Shutdown,
}

impl ProcessState {
    /// Whether `to` is a legal transition from `self` (spec §4.3 state machine).
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        use ProcessState::*;
        if self == Shutdown {
            return false;
        }
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Ready)
                | (Starting, Stopping)
                | (Ready, Stopping)
                | (Stopping, Stopped)
                | (_, Shutdown)
        )
    }
}

/// `fitCtxMode` (spec §3 Process, §4.3 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitCtxMode {
    Max,
    Min,
}

/// Per-model runtime overrides held only in memory (spec §3 "Runtime overrides").
/// Cleared on hard restart (`POST /api/restart`), preserved across a config reload.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub ctx_size: Option<u32>,
    pub fit_enabled: bool,
    pub fit_ctx_mode: Option<FitCtxMode>,
    pub prompt_policy: Option<PromptPolicy>,
}

/// Prompt optimization snapshot (spec §3, §4.5). One slot per model, overwritten in place.
#[derive(Debug, Clone, Serialize)]
pub struct PromptSnapshot {
    pub policy: PromptPolicy,
    pub applied: bool,
    pub updated_at: DateTime<Utc>,
    pub note: String,
    pub original_body: String,
    pub optimized_body: String,
}

/// Truncates `body` to [`SNAPSHOT_BODY_CAP`] bytes (on a UTF-8 char boundary) with a
/// trailing marker, matching spec §3's "truncated-to-2 MiB ... bodies".
pub fn cap_snapshot_body(body: &str) -> String {
    if body.len() <= SNAPSHOT_BODY_CAP {
        return body.to_string();
    }
    let mut end = SNAPSHOT_BODY_CAP;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = body[..end].to_string();
    out.push_str("...[truncated]");
    out
}

/// Mirror record for a discovered Ollama model (spec §3 "Ollama model").
/// Read-only for context overrides; refreshed by `gateway::ollama::refresh`.
#[derive(Debug, Clone, Serialize)]
pub struct OllamaModel {
    pub id: String,
    pub name: String,
    pub ctx_reference: Option<u32>,
}

impl OllamaModel {
    /// Builds the stable `ollama/<name>` namespace id (spec §4.8).
    pub fn namespaced_id(name: &str) -> String {
        format!("ollama/{name}")
    }
}
