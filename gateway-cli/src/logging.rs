//! Tracing initialization: stdout formatting layer plus an [`gateway::events::EventBusLogLayer`]
//! so `/logs/stream` and `/api/events` see the same log traffic stdout does.
//!
//! Reads `RUST_LOG` the way the teacher's `graphweave-cli::logging` does, defaulting to
//! `info` with `hyper_util` quieted.

use gateway::events::EventBusLogLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

pub fn init(bus: gateway::events::EventBus) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hyper_util=off"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    let bus_layer = EventBusLogLayer::new(bus);

    tracing_subscriber::registry().with(stdout_layer).with(bus_layer).init();
}
