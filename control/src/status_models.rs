use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;
use uuid::Uuid;

use crate::models::ResourceKind;

pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_READY: &str = "Ready";

/// Metadata key a controller sets to opt a resource into the extended
/// provisioning grace window.
pub const META_LONG_RUNNING_PROVISIONING: &str = "long_running_provisioning";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// One condition inside a controller report or an aggregate status,
/// following the Kubernetes condition convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// True when this condition marks the resource available.
    pub fn is_available(&self) -> bool {
        self.condition_type == CONDITION_AVAILABLE && self.status == ConditionStatus::True
    }
}

/// One controller's report about one resource, keyed by
/// `(resource_id, controller_name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerReport {
    pub resource_id: Uuid,
    pub resource_kind: ResourceKind,
    pub controller_name: String,
    /// The resource generation this report pertains to. Aggregation ignores
    /// reports lagging the resource.
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl ControllerReport {
    pub fn from_row(row: &Row) -> Self {
        let kind: String = row.get("resource_kind");
        let conditions: serde_json::Value = row.get("conditions");
        ControllerReport {
            resource_id: row.get("resource_id"),
            resource_kind: if kind == "nodepool" {
                ResourceKind::NodePool
            } else {
                ResourceKind::Cluster
            },
            controller_name: row.get("controller_name"),
            observed_generation: row.get("observed_generation"),
            conditions: serde_json::from_value(conditions).unwrap_or_default(),
            metadata: row.get("metadata"),
            last_error: row.get("last_error"),
            updated_at: row.get("updated_at"),
        }
    }

    /// Whether this controller asked for the extended provisioning window.
    pub fn wants_extended_grace(&self) -> bool {
        match self.metadata.get(META_LONG_RUNNING_PROVISIONING) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s == "true",
            _ => false,
        }
    }
}

/// Body of `PUT /clusters/{id}/status` and the node-pool variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutStatusRequest {
    pub controller_name: String,
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Required; an empty map is fine, absence is not.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub last_error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Ready,
    Progressing,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Ready => "Ready",
            Phase::Progressing => "Progressing",
            Phase::Failed => "Failed",
        }
    }
}

/// The Kubernetes-style aggregate the control plane computes per resource
/// and caches in the `status` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateStatus {
    pub observed_generation: i64,
    pub phase: Phase,
    pub reason: String,
    pub message: String,
    pub conditions: Vec<Condition>,
    pub last_update_time: DateTime<Utc>,
}

/// Response of `GET .../status`: the aggregate plus the current-generation
/// per-controller reports it was folded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: Option<AggregateStatus>,
    pub reports: Vec<ControllerReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_serializes_with_k8s_field_names() {
        let cond = Condition {
            condition_type: CONDITION_AVAILABLE.into(),
            status: ConditionStatus::True,
            reason: Some("Ready".into()),
            message: None,
            last_transition_time: None,
        };
        let value = serde_json::to_value(&cond).expect("serialize");
        assert_eq!(value["type"], "Available");
        assert_eq!(value["status"], "True");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn availability_requires_true_status() {
        let mut cond = Condition {
            condition_type: CONDITION_AVAILABLE.into(),
            status: ConditionStatus::False,
            reason: None,
            message: None,
            last_transition_time: None,
        };
        assert!(!cond.is_available());
        cond.status = ConditionStatus::True;
        assert!(cond.is_available());
        cond.condition_type = CONDITION_READY.into();
        assert!(!cond.is_available());
    }

    #[test]
    fn extended_grace_flag_reads_bool_and_string() {
        let mut report = ControllerReport {
            resource_id: Uuid::nil(),
            resource_kind: ResourceKind::Cluster,
            controller_name: "gcp-ctrl".into(),
            observed_generation: 1,
            conditions: vec![],
            metadata: serde_json::json!({}),
            last_error: None,
            updated_at: Utc::now(),
        };
        assert!(!report.wants_extended_grace());
        report.metadata = serde_json::json!({META_LONG_RUNNING_PROVISIONING: "true"});
        assert!(report.wants_extended_grace());
        report.metadata = serde_json::json!({META_LONG_RUNNING_PROVISIONING: true});
        assert!(report.wants_extended_grace());
        report.metadata = serde_json::json!({META_LONG_RUNNING_PROVISIONING: "false"});
        assert!(!report.wants_extended_grace());
    }
}
