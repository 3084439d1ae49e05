//! Activity preview ring (spec §3 "Activity preview ring", §5 shared-resource policy):
//! a bounded (<=200) sequence of request/step snapshots, keyed by the last user prompt's
//! normalized signature so a fresh prompt opens a new `userTurn` and resets the ring.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Ring capacity (spec §5 "activity ring is bounded to 200 entries; older entries are
/// dropped").
pub const ACTIVITY_RING_CAPACITY: usize = 200;

/// Preview text cap; long prompts are truncated rather than stored in full.
const PREVIEW_CAP: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    UserRequest,
    AgentStep,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub kind: ActivityKind,
    pub user_turn: u64,
    pub path: String,
    pub last_role: String,
    pub last_user_prompt: String,
    pub prompt_preview: String,
    pub message_count: usize,
    pub user_agent: Option<String>,
}

/// Input describing one activity recording (spec §2 step 9 "keyed by the last user
/// prompt's normalized lowercase form").
pub struct RecordActivity<'a> {
    pub model: &'a str,
    pub kind: ActivityKind,
    pub path: &'a str,
    pub last_role: &'a str,
    pub last_user_prompt: &'a str,
    pub message_count: usize,
    pub user_agent: Option<String>,
}

fn normalize_signature(prompt: &str) -> String {
    prompt.trim().to_lowercase()
}

fn preview(prompt: &str) -> String {
    if prompt.chars().count() <= PREVIEW_CAP {
        return prompt.to_string();
    }
    let truncated: String = prompt.chars().take(PREVIEW_CAP).collect();
    format!("{truncated}...")
}

struct RingState {
    entries: VecDeque<ActivityEntry>,
    last_signature: Option<String>,
    user_turn: u64,
}

/// Process-wide activity ring, guarded by its own mutex (spec §5 names it among the
/// maps `pmLock` covers; held only for the map mutation itself).
pub struct ActivityRing {
    state: Mutex<RingState>,
}

impl ActivityRing {
    pub fn new() -> Self {
        Self { state: Mutex::new(RingState { entries: VecDeque::new(), last_signature: None, user_turn: 0 }) }
    }

    /// Appends one entry, opening a new `userTurn` (and clearing the ring) when the
    /// normalized prompt signature differs from the previous recording.
    pub fn record(&self, input: RecordActivity<'_>) -> ActivityEntry {
        let signature = normalize_signature(input.last_user_prompt);
        let mut state = self.state.lock().expect("activity ring mutex poisoned");

        let opens_new_turn = state.last_signature.as_deref() != Some(signature.as_str());
        if opens_new_turn {
            state.entries.clear();
            state.user_turn += 1;
            state.last_signature = Some(signature);
        }

        let entry = ActivityEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            model: input.model.to_string(),
            kind: input.kind,
            user_turn: state.user_turn,
            path: input.path.to_string(),
            last_role: input.last_role.to_string(),
            last_user_prompt: input.last_user_prompt.to_string(),
            prompt_preview: preview(input.last_user_prompt),
            message_count: input.message_count,
            user_agent: input.user_agent,
        };

        if state.entries.len() >= ACTIVITY_RING_CAPACITY {
            state.entries.pop_front();
        }
        state.entries.push_back(entry.clone());
        entry
    }

    pub fn snapshot(&self) -> Vec<ActivityEntry> {
        self.state.lock().expect("activity ring mutex poisoned").entries.iter().cloned().collect()
    }

    /// Looks up one capture by its entry id (spec §6 `GET /api/captures/:id`); entries
    /// fall out of the ring the same way any other entry does once it is evicted or a
    /// new user turn opens.
    pub fn find(&self, id: &str) -> Option<ActivityEntry> {
        self.state.lock().expect("activity ring mutex poisoned").entries.iter().find(|e| e.id == id).cloned()
    }

    /// Clears the ring without resetting the user-turn counter (spec §6 `POST
    /// /api/restart` "soft: clears runtime overrides and activity ring").
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("activity ring mutex poisoned");
        state.entries.clear();
        state.last_signature = None;
    }
}

impl Default for ActivityRing {
    fn default() -> Self {
        Self::new()
    }
}
