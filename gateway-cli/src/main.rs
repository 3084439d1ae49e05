//! `llamaswap-gateway` binary: CLI flags, tracing setup, config load, server startup.
//!
//! Mirrors the teacher's `cli/src/main.rs` bootstrap order (`config::load_and_apply(...).ok();
//! logging::init()?;` before anything else touches the network or disk) and `serve/src/lib.rs`'s
//! `TcpListener::bind` + `axum::serve` startup.

mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gateway::dispatch::{DispatcherMaps, GatewayState};
use gateway::events::EventBus;
use gateway::ollama::OllamaAdapter;
use gateway::process::{Process, ProcessGroup, ProcessGroupManager};
use gateway::tools::registry::ToolCatalog;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "llamaswap-gateway")]
#[command(about = "OpenAI-compatible inference gateway: routes, swaps, and optimizes for llama.cpp/ollama backends")]
struct Args {
    /// Path to the static model/group/peer/tool TOML file.
    #[arg(long, env = "LLAMASWAP_CONFIG_PATH", default_value = "gateway.toml")]
    config: PathBuf,

    /// Address to bind the HTTP server to.
    #[arg(long, env = "LLAMASWAP_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,

    /// Re-run config-reload logic on SIGHUP instead of exiting untouched.
    #[arg(long)]
    watch: bool,
}

/// Builds the `ProcessGroupManager` from the loaded config: one `ProcessGroup` per
/// declared group, plus a synthetic non-exclusive, non-persistent singleton group for
/// any model not named by a declared group (spec §4.3's `swap` requires an owning group
/// for every model id it is asked to resolve; §3 does not require every model be grouped
/// explicitly, so ungrouped models get a group of one, decided here since spec.md leaves
/// it open — recorded in DESIGN.md).
fn build_process_manager(config: &gwconfig::GatewayConfig) -> ProcessGroupManager {
    let mut manager = ProcessGroupManager::new();
    let mut grouped: std::collections::HashSet<&str> = std::collections::HashSet::new();

    for g in &config.groups {
        let members = g
            .members
            .iter()
            .filter_map(|model_id| {
                config.models.iter().find(|m| &m.id == model_id).map(|m| {
                    grouped.insert(m.id.as_str());
                    Arc::new(Process::new(m.id.clone(), g.name.clone(), m.ttl_seconds, m.check_endpoint.clone()))
                })
            })
            .collect();
        manager.groups.insert(
            g.name.clone(),
            ProcessGroup { name: g.name.clone(), exclusive: g.exclusive, persistent: g.persistent, members },
        );
    }

    for m in &config.models {
        if grouped.contains(m.id.as_str()) {
            continue;
        }
        let group_name = m.id.clone();
        manager.groups.insert(
            group_name.clone(),
            ProcessGroup {
                name: group_name.clone(),
                exclusive: false,
                persistent: false,
                members: vec![Arc::new(Process::new(m.id.clone(), group_name, m.ttl_seconds, m.check_endpoint.clone()))],
            },
        );
    }

    manager
}

async fn build_state(config_path: &PathBuf, events: EventBus) -> Result<Arc<GatewayState>, Box<dyn std::error::Error>> {
    let config = gwconfig::model_config::load(config_path)?;
    let http_client = reqwest::Client::new();

    let tools_path = config_path.parent().unwrap_or_else(|| std::path::Path::new(".")).join("tools.json");
    let tool_catalog = ToolCatalog::load(&tools_path)?;

    let process_manager = build_process_manager(&config);
    let health_check_timeout = Duration::from_secs(config.settings.health_check_timeout_seconds);

    let state = GatewayState {
        config: tokio::sync::RwLock::new(config),
        maps: tokio::sync::Mutex::new(DispatcherMaps::new(process_manager)),
        tool_catalog: tokio::sync::Mutex::new(tool_catalog),
        activity: gateway::activity::ActivityRing::new(),
        ollama: OllamaAdapter::new(http_client.clone(), None),
        events,
        http_client,
        health_check_timeout,
    };

    Ok(Arc::new(state))
}

/// Re-runs config-reload logic on SIGHUP when `--watch` is set (spec.md is silent on
/// hot-reload; this mirrors the teacher CLI's signal-driven pattern, see SPEC_FULL.md §C).
/// `gwconfig`'s loader does no hot diffing, so this clears runtime overrides the same way
/// `POST /api/restart` does rather than re-reading the model directory from disk.
#[cfg(unix)]
fn spawn_watch_task(state: Arc<GatewayState>) {
    tokio::spawn(async move {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGHUP handler; --watch is inactive");
                return;
            }
        };
        loop {
            hangup.recv().await;
            info!("SIGHUP received, clearing runtime overrides (config reload is not hot-swappable)");
            gateway::dispatch::soft_restart(&state).await;
        }
    });
}

#[cfg(not(unix))]
fn spawn_watch_task(_state: Arc<GatewayState>) {
    warn!("--watch relies on SIGHUP, which is unavailable on this platform; ignoring");
}

/// Periodically re-probes for a live ollama endpoint and refreshes its model list (spec
/// §4.8), so `ollama/<name>` routing has something to resolve against. `refresh` itself
/// enforces the 10 s minimum interval, so this just needs to call it regularly enough to
/// notice a newly-started ollama.
fn spawn_ollama_refresh_task(state: Arc<GatewayState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(gateway::ollama::MIN_REFRESH_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = state.ollama.refresh(false).await {
                warn!(error = %e, "ollama refresh failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    gwconfig::load_and_apply("llamaswap-gateway", None::<&std::path::Path>).ok();

    let events = EventBus::new();
    logging::init(events.clone());

    let args = Args::parse();
    std::env::set_var("LLAMASWAP_CONFIG_PATH", args.config.display().to_string());

    let state = build_state(&args.config, events).await?;

    if args.watch {
        spawn_watch_task(state.clone());
    }
    spawn_ollama_refresh_task(state.clone());

    let app = gateway::http::build_router(state);
    let listener = TcpListener::bind(&args.listen).await?;
    info!(addr = %args.listen, "llamaswap-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
