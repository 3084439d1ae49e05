//! Envelope (sequence number, wall-clock timestamp) applied to every outbound event.
//!
//! One `EnvelopeState` lives per SSE subscriber connection; it hands out a monotonically
//! increasing `seq` so a slow client can detect a gap once messages start getting dropped
//! (spec §9: "slow consumers drop messages rather than block producers").

use crate::event::GatewayEvent;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Envelope fields attached to every event: sequence number and emission time.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub seq: Option<u64>,
    pub emitted_at_ms: Option<u64>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_emitted_at_ms(mut self, ms: u64) -> Self {
        self.emitted_at_ms = Some(ms);
        self
    }

    /// Merges envelope fields into the given JSON object (top-level only).
    pub fn inject_into(&self, obj: &mut Value) {
        let Some(obj) = obj.as_object_mut() else {
            return;
        };
        if let Some(seq) = self.seq {
            obj.entry("seq").or_insert_with(|| Value::Number(seq.into()));
        }
        if let Some(ms) = self.emitted_at_ms {
            obj.entry("emitted_at_ms").or_insert_with(|| Value::Number(ms.into()));
        }
    }
}

/// Per-subscriber envelope state: hands out sequence numbers and timestamps.
pub struct EnvelopeState {
    next_seq: u64,
}

impl EnvelopeState {
    pub fn new() -> Self {
        Self { next_seq: 0 }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Injects envelope into the event value and advances the sequence counter.
    pub fn inject_into(&mut self, value: &mut Value) {
        let env = Envelope::new().with_seq(self.next_seq).with_emitted_at_ms(Self::now_ms());
        self.next_seq += 1;
        env.inject_into(value);
    }
}

impl Default for EnvelopeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a gateway event to JSON and stamps it with an envelope.
pub fn to_json(event: &GatewayEvent, state: &mut EnvelopeState) -> Result<Value, serde_json::Error> {
    let mut value = event.to_value()?;
    state.inject_into(&mut value);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_inject_sets_seq_and_timestamp() {
        let mut obj = serde_json::json!({"type":"logData"});
        let env = Envelope::new().with_seq(3).with_emitted_at_ms(1000);
        env.inject_into(&mut obj);
        assert_eq!(obj["seq"], 3);
        assert_eq!(obj["emitted_at_ms"], 1000);
    }

    #[test]
    fn to_json_assigns_increasing_seq() {
        let ev = GatewayEvent::LogData {
            level: "info".into(),
            target: "gateway".into(),
            message: "hi".into(),
        };
        let mut state = EnvelopeState::new();
        let first = to_json(&ev, &mut state).unwrap();
        let second = to_json(&ev, &mut state).unwrap();
        assert_eq!(first["seq"], 0);
        assert_eq!(second["seq"], 1);
    }
}
