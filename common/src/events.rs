use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default JetStream stream / subject carrying every lifecycle event.
/// Controllers subscribe here and self-filter on the message headers.
pub const CLUSTER_EVENTS: &str = "cluster-events";

/// Message header names subscribers can filter on without parsing the body.
pub mod headers {
    pub const EVENT_TYPE: &str = "event-type";
    pub const RESOURCE_ID: &str = "resource-id";
    pub const GENERATION: &str = "generation";
    pub const PLATFORM_TYPE: &str = "platform-type";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "cluster.created")]
    ClusterCreated,
    #[serde(rename = "cluster.updated")]
    ClusterUpdated,
    #[serde(rename = "cluster.deleted")]
    ClusterDeleted,
    #[serde(rename = "cluster.reconcile")]
    ClusterReconcile,
    #[serde(rename = "nodepool.created")]
    NodePoolCreated,
    #[serde(rename = "nodepool.updated")]
    NodePoolUpdated,
    #[serde(rename = "nodepool.deleted")]
    NodePoolDeleted,
    #[serde(rename = "nodepool.reconcile")]
    NodePoolReconcile,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ClusterCreated => "cluster.created",
            EventType::ClusterUpdated => "cluster.updated",
            EventType::ClusterDeleted => "cluster.deleted",
            EventType::ClusterReconcile => "cluster.reconcile",
            EventType::NodePoolCreated => "nodepool.created",
            EventType::NodePoolUpdated => "nodepool.updated",
            EventType::NodePoolDeleted => "nodepool.deleted",
            EventType::NodePoolReconcile => "nodepool.reconcile",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope published for every lifecycle change and every scheduler sweep.
///
/// Delivery is at-least-once and unordered; `generation` is the partial
/// order subscribers converge on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub event_type: EventType,
    pub resource_id: Uuid,
    pub generation: i64,
    pub emitted_at: DateTime<Utc>,
    /// Scheduler reason code; absent on plain lifecycle events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Full resource state at emit time.
    pub resource: serde_json::Value,
}

/// Pull `spec.platform.type` out of an opaque spec document, when present.
pub fn platform_type(spec: &serde_json::Value) -> Option<&str> {
    spec.get("platform")?.get("type")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_serde() {
        let json = serde_json::to_string(&EventType::ClusterReconcile).expect("serialize");
        assert_eq!(json, "\"cluster.reconcile\"");
        let back: EventType = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, EventType::ClusterReconcile);
    }

    #[test]
    fn platform_type_extraction() {
        let spec = serde_json::json!({"platform": {"type": "gcp", "region": "us-east1"}});
        assert_eq!(platform_type(&spec), Some("gcp"));
        assert_eq!(platform_type(&serde_json::json!({})), None);
        assert_eq!(
            platform_type(&serde_json::json!({"platform": {"type": 3}})),
            None
        );
    }

    #[test]
    fn envelope_serializes_without_reason_when_absent() {
        let event = ResourceEvent {
            event_type: EventType::ClusterCreated,
            resource_id: Uuid::nil(),
            generation: 1,
            emitted_at: Utc::now(),
            reason: None,
            resource: serde_json::json!({"name": "alpha"}),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert!(value.get("reason").is_none());
        assert_eq!(value["event_type"], "cluster.created");
    }
}
