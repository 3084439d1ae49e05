//! Wire types for the gateway's outbound event stream: type + payload + envelope.
//!
//! This crate has no dependency on the gateway crate itself; `gateway::events` bridges
//! process/log/metric occurrences into [`GatewayEvent`] and feeds them through
//! [`to_json`] before writing SSE lines.

pub mod envelope;
pub mod event;

pub use envelope::{to_json, Envelope, EnvelopeState};
pub use event::GatewayEvent;
