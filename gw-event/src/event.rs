//! Wire shape for one outbound event: type + payload.
//!
//! The three variants mirror the SSE multiplex spec §6 names for `GET /api/events`
//! (`modelStatus`, `logData`, `metrics`). Envelope fields (sequence number) are applied
//! separately by [`crate::envelope`].

use serde::Serialize;
use serde_json::Value;

/// One event pushed to the `/api/events` SSE stream.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GatewayEvent {
    /// A process transitioned state (spec §3 Process state machine).
    ModelStatus {
        model_id: String,
        state: String,
        group: Option<String>,
    },
    /// One formatted log line, forwarded from the tracing subscriber.
    LogData { level: String, target: String, message: String },
    /// A point-in-time metric sample.
    Metrics {
        name: String,
        value: f64,
        #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
        labels: serde_json::Map<String, Value>,
    },
}

impl GatewayEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_status_serializes_with_tag() {
        let ev = GatewayEvent::ModelStatus {
            model_id: "coder".into(),
            state: "ready".into(),
            group: Some("main".into()),
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "modelStatus");
        assert_eq!(v["model_id"], "coder");
    }

    #[test]
    fn metrics_omits_empty_labels() {
        let ev = GatewayEvent::Metrics {
            name: "requests_total".into(),
            value: 1.0,
            labels: serde_json::Map::new(),
        };
        let v = ev.to_value().unwrap();
        assert!(v.get("labels").is_none());
    }
}
