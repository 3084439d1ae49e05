//! Process Group Manager (spec §4.3): per-group sets of [`Process`] records implementing
//! the state machine, exclusivity/persistence policy, runtime overrides re-applied
//! across swaps, and kill-previous/max-concurrent policies.
//!
//! Cyclic state is avoided (spec §9 "arena-and-index"): a [`Process`] references its
//! owning descriptor by `modelID`, never by a back-pointer to its [`ProcessGroup`].

mod manager;

pub use manager::{ProcessGroupManager, StopStrategy, SwapOutcome};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::model::{FitCtxMode, ProcessState, RuntimeOverrides};

fn state_to_u8(state: ProcessState) -> u8 {
    match state {
        ProcessState::Stopped => 0,
        ProcessState::Starting => 1,
        ProcessState::Ready => 2,
        ProcessState::Stopping => 3,
        ProcessState::Shutdown => 4,
    }
}

fn state_from_u8(v: u8) -> ProcessState {
    match v {
        0 => ProcessState::Stopped,
        1 => ProcessState::Starting,
        2 => ProcessState::Ready,
        3 => ProcessState::Stopping,
        _ => ProcessState::Shutdown,
    }
}

/// Runtime handle bound to a model descriptor (spec §3 "Process"). Owns its own mutex
/// for state-machine transitions; current state is readable without locking.
pub struct Process {
    pub model_id: String,
    pub group_name: String,
    state: AtomicU8,
    transition_lock: Mutex<()>,
    last_activity: Mutex<Instant>,
    pub ttl_seconds: u64,
    pub overrides: Mutex<RuntimeOverrides>,
    pub check_endpoint: String,
}

impl Process {
    pub fn new(model_id: impl Into<String>, group_name: impl Into<String>, ttl_seconds: u64, check_endpoint: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            group_name: group_name.into(),
            state: AtomicU8::new(state_to_u8(ProcessState::Stopped)),
            transition_lock: Mutex::new(()),
            last_activity: Mutex::new(Instant::now()),
            ttl_seconds,
            overrides: Mutex::new(RuntimeOverrides::default()),
            check_endpoint: check_endpoint.into(),
        }
    }

    /// Atomic read of current state.
    pub fn state(&self) -> ProcessState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Attempts a state transition, returning `false` if it is not a legal move
    /// (spec §4.3 state machine).
    pub async fn transition(&self, to: ProcessState) -> bool {
        let _guard = self.transition_lock.lock().await;
        let current = self.state();
        if !current.can_transition_to(to) {
            warn!(model = %self.model_id, from = ?current, to = ?to, "rejected illegal process transition");
            return false;
        }
        self.state.store(state_to_u8(to), Ordering::SeqCst);
        info!(model = %self.model_id, from = ?current, to = ?to, "process transition");
        true
    }

    pub async fn touch_activity(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    /// Whether the TTL (if any) has expired since the last recorded activity.
    pub async fn ttl_expired(&self) -> bool {
        if self.ttl_seconds == 0 {
            return false;
        }
        let last = *self.last_activity.lock().await;
        last.elapsed() >= Duration::from_secs(self.ttl_seconds)
    }

    /// `Process.forward`: ensures the child is `ready` (spawn + health probe bounded by
    /// `health_check_timeout`), then marks it touched. Reverse-proxying the actual HTTP
    /// request is performed by the caller (`gateway::dispatch`) against `proxy_url`/
    /// `spawned port`; this method owns only the lifecycle half of "forward".
    pub async fn ensure_ready(
        &self,
        client: &reqwest::Client,
        proxy_url: &str,
        health_check_timeout: Duration,
    ) -> Result<(), String> {
        if self.state() == ProcessState::Ready {
            self.touch_activity().await;
            return Ok(());
        }
        if !self.transition(ProcessState::Starting).await {
            return Err(format!("cannot start process for {} from state {:?}", self.model_id, self.state()));
        }

        let health_url = format!("{}{}", proxy_url.trim_end_matches('/'), self.check_endpoint);
        let deadline = Instant::now() + health_check_timeout;
        loop {
            match client.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => break,
                _ => {
                    if Instant::now() >= deadline {
                        return Err(format!("health check timed out for {}", self.model_id));
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }

        if !self.transition(ProcessState::Ready).await {
            return Err(format!("failed to mark {} ready after health probe", self.model_id));
        }
        self.touch_activity().await;
        Ok(())
    }

    /// Stops the process per the given strategy (spec §4.3 "Stop strategies").
    pub async fn stop(&self, strategy: StopStrategy) -> bool {
        if !self.transition(ProcessState::Stopping).await {
            return false;
        }
        match strategy {
            StopStrategy::StopImmediately => {}
            StopStrategy::StopWaitForInflightRequest => {
                // In-flight requests are tracked by the dispatcher's per-request guard;
                // here we simply yield once to let already-scheduled tasks observe Stopping.
                tokio::task::yield_now().await;
            }
        }
        self.transition(ProcessState::Stopped).await
    }

    pub async fn shutdown(&self) {
        let _guard = self.transition_lock.lock().await;
        self.state.store(state_to_u8(ProcessState::Shutdown), Ordering::SeqCst);
    }

    /// Parses `--fit`, `--fit-ctx`, `--ctx-size`/`-c` from a sanitized command line
    /// (prefix or `=` form), returning `(fit_enabled_if_present, fit_ctx_value, ctx_size_value)`
    /// (spec §4.3 step 2).
    pub fn parse_command_flags(cmd: &str) -> (bool, Option<u32>, Option<u32>) {
        let tokens: Vec<&str> = cmd.split_whitespace().collect();
        let mut fit_enabled = false;
        let mut fit_ctx = None;
        let mut ctx_size = None;

        let mut i = 0;
        while i < tokens.len() {
            let tok = tokens[i];
            if tok == "--fit" {
                fit_enabled = true;
            } else if let Some(v) = flag_value(tok, tokens.get(i + 1).copied(), "--fit-ctx") {
                fit_ctx = v.parse().ok();
                if v == tokens.get(i + 1).copied().unwrap_or("") {
                    i += 1;
                }
            } else if let Some(v) = flag_value(tok, tokens.get(i + 1).copied(), "--ctx-size") {
                ctx_size = v.parse().ok();
                if v == tokens.get(i + 1).copied().unwrap_or("") {
                    i += 1;
                }
            } else if let Some(v) = flag_value(tok, tokens.get(i + 1).copied(), "-c") {
                ctx_size = v.parse().ok();
                if v == tokens.get(i + 1).copied().unwrap_or("") {
                    i += 1;
                }
            }
            i += 1;
        }
        (fit_enabled, fit_ctx, ctx_size)
    }
}

/// Resolves a flag's value whether given as `--flag=value` or `--flag value`.
fn flag_value<'a>(tok: &'a str, next: Option<&'a str>, flag: &str) -> Option<&'a str> {
    if let Some(rest) = tok.strip_prefix(flag) {
        if let Some(v) = rest.strip_prefix('=') {
            return Some(v);
        }
        if rest.is_empty() {
            return next;
        }
        return None;
    }
    None
}

/// Resolves effective context size + mode from overrides/command flags (spec §4.3 step 2
/// "Rule: if fit is enabled and a `--fit-ctx` value is present, effective context = that
/// value with mode=min; else `--ctx-size` with mode=max").
pub fn resolve_effective_context(
    overrides: &RuntimeOverrides,
    cmd: &str,
) -> (Option<u32>, Option<FitCtxMode>) {
    let (cmd_fit, cmd_fit_ctx, cmd_ctx_size) = Process::parse_command_flags(cmd);
    let fit_enabled = overrides.fit_enabled || cmd_fit;
    let fit_ctx = overrides.ctx_size.filter(|_| fit_enabled).or(cmd_fit_ctx.filter(|_| fit_enabled));

    if fit_enabled {
        if let Some(v) = fit_ctx {
            return (Some(v), Some(FitCtxMode::Min));
        }
    }
    let ctx = overrides.ctx_size.or(cmd_ctx_size);
    (ctx, ctx.map(|_| FitCtxMode::Max))
}

/// A named group of member processes (spec §3 "Group").
pub struct ProcessGroup {
    pub name: String,
    pub exclusive: bool,
    pub persistent: bool,
    pub members: Vec<Arc<Process>>,
}

impl ProcessGroup {
    pub fn ready_member(&self) -> Option<&Arc<Process>> {
        self.members.iter().find(|p| p.state() == ProcessState::Ready)
    }

    pub fn find(&self, model_id: &str) -> Option<&Arc<Process>> {
        self.members.iter().find(|p| p.model_id == model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_transitions_follow_state_machine() {
        let p = Process::new("m1", "g1", 0, "/health");
        assert!(p.transition(ProcessState::Starting).await);
        assert!(p.transition(ProcessState::Ready).await);
        assert!(!p.transition(ProcessState::Starting).await);
        assert!(p.transition(ProcessState::Stopping).await);
        assert!(p.transition(ProcessState::Stopped).await);
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let p = Process::new("m1", "g1", 0, "/health");
        p.shutdown().await;
        assert_eq!(p.state(), ProcessState::Shutdown);
        assert!(!p.transition(ProcessState::Starting).await);
    }

    #[test]
    fn parse_command_flags_reads_fit_and_ctx_size_prefix_form() {
        let (fit, fit_ctx, ctx) = Process::parse_command_flags("llama-server --fit --fit-ctx=4096 --ctx-size=8192");
        assert!(fit);
        assert_eq!(fit_ctx, Some(4096));
        assert_eq!(ctx, Some(8192));
    }

    #[test]
    fn parse_command_flags_reads_space_separated_short_ctx_flag() {
        let (_, _, ctx) = Process::parse_command_flags("llama-server -c 2048");
        assert_eq!(ctx, Some(2048));
    }

    #[test]
    fn resolve_effective_context_prefers_fit_ctx_with_min_mode() {
        let mut overrides = RuntimeOverrides::default();
        overrides.fit_enabled = true;
        let (ctx, mode) = resolve_effective_context(&overrides, "llama-server --fit --fit-ctx=4096 --ctx-size=8192");
        assert_eq!(ctx, Some(4096));
        assert_eq!(mode, Some(FitCtxMode::Min));
    }

    #[test]
    fn resolve_effective_context_falls_back_to_ctx_size_with_max_mode() {
        let overrides = RuntimeOverrides::default();
        let (ctx, mode) = resolve_effective_context(&overrides, "llama-server --ctx-size=8192");
        assert_eq!(ctx, Some(8192));
        assert_eq!(mode, Some(FitCtxMode::Max));
    }

    #[tokio::test]
    async fn ttl_expired_false_when_ttl_zero() {
        let p = Process::new("m1", "g1", 0, "/health");
        assert!(!p.ttl_expired().await);
    }
}
