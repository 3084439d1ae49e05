//! Event Stream bridge (spec §2, §9): fans `GatewayEvent`s out to `/api/events`
//! subscribers over bounded per-subscriber buffers, dropping on lag rather than
//! blocking producers.
//!
//! Grounded on the teacher's `ToolStreamWriter`/`StreamWriter` (`loom/src/stream/mod.rs`),
//! which uses `tokio::sync::mpsc::channel` + `try_send` for the same non-blocking,
//! drop-when-full semantics; generalized here from one run's stream to many independent
//! subscribers of one shared bus.

use std::sync::{Arc, Mutex};

use gw_event::{to_json, EnvelopeState, GatewayEvent};
use tokio::sync::mpsc;
use tracing_subscriber::Layer;

/// Per-subscriber channel capacity (spec §9 "slow consumers drop messages rather than
/// block producers").
const SUBSCRIBER_BUFFER: usize = 256;

struct Subscriber {
    tx: mpsc::Sender<serde_json::Value>,
    envelope: EnvelopeState,
}

/// Shared fan-out bus: `publish` is called from anywhere in the gateway (process
/// transitions, log lines, metric samples); each live subscriber gets its own queue and
/// its own monotonically increasing `seq`.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { subscribers: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Registers a new subscriber and returns the receiving half of its channel.
    pub fn subscribe(&self) -> mpsc::Receiver<serde_json::Value> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .push(Subscriber { tx, envelope: EnvelopeState::new() });
        rx
    }

    /// Publishes one event to every live subscriber, dropping silently for any whose
    /// buffer is full and pruning any whose receiver has gone away.
    pub fn publish(&self, event: GatewayEvent) {
        let mut subs = self.subscribers.lock().expect("event bus mutex poisoned");
        subs.retain_mut(|sub| {
            let Ok(value) = to_json(&event, &mut sub.envelope) else { return true };
            match sub.tx.try_send(value) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("event bus mutex poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A `tracing_subscriber::Layer` that forwards formatted log lines into the bus as
/// `GatewayEvent::LogData`, so `/logs/stream` and `/api/events` see the same log traffic
/// the process's own stdout does.
pub struct EventBusLogLayer {
    bus: EventBus,
}

impl EventBusLogLayer {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S> Layer<S> for EventBusLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.bus.publish(GatewayEvent::LogData {
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.0,
        });
    }
}
