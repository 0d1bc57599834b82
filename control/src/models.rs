use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;
use uuid::Uuid;

/// Discriminator for rows in `controller_status`, which holds reports for
/// both clusters and node pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cluster,
    NodePool,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::NodePool => "nodepool",
        }
    }
}

/// A user-declared cluster. `spec` is what the owner wants; `status` is the
/// cached aggregate the control plane computes from controller reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    /// Creator identity; keys owner isolation.
    pub owner: String,
    pub spec: serde_json::Value,
    /// Cached aggregate status; absent until first computed.
    pub status: Option<serde_json::Value>,
    /// True when the cache may lag the current controller reports.
    #[serde(skip_serializing, default)]
    pub status_dirty: bool,
    /// Bumped on every spec mutation; the version of what the user wants.
    pub generation: i64,
    /// Opaque optimistic-concurrency token, rotated on every mutation.
    pub resource_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete tombstone. NULL means live.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Cluster {
    pub fn from_row(row: &Row) -> Self {
        Cluster {
            id: row.get("id"),
            name: row.get("name"),
            owner: row.get("owner"),
            spec: row.get("spec"),
            status: row.get("status"),
            status_dirty: row.get("status_dirty"),
            generation: row.get("generation"),
            resource_version: row.get("resource_version"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            deleted_at: row.get("deleted_at"),
        }
    }
}

/// A pool of nodes inside a cluster. Access is inherited through the
/// owning cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePool {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub name: String,
    pub spec: serde_json::Value,
    pub status: Option<serde_json::Value>,
    #[serde(skip_serializing, default)]
    pub status_dirty: bool,
    pub generation: i64,
    pub resource_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl NodePool {
    pub fn from_row(row: &Row) -> Self {
        NodePool {
            id: row.get("id"),
            cluster_id: row.get("cluster_id"),
            name: row.get("name"),
            spec: row.get("spec"),
            status: row.get("status"),
            status_dirty: row.get("status_dirty"),
            generation: row.get("generation"),
            resource_version: row.get("resource_version"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            deleted_at: row.get("deleted_at"),
        }
    }
}

/// Request to create a new cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    pub spec: serde_json::Value,
}

/// Request to replace a cluster's spec. The write is rejected with a
/// conflict unless `resource_version` matches the stored one; when omitted,
/// the handler pins the write to the version it read, so a concurrent
/// mutation still surfaces as a conflict rather than a silent overwrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateClusterRequest {
    pub spec: serde_json::Value,
    #[serde(default)]
    pub resource_version: Option<String>,
}

/// Request to create a node pool under a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNodePoolRequest {
    pub name: String,
    pub spec: serde_json::Value,
}

/// Request to replace a node pool's spec. Same optimistic-version
/// semantics as [`UpdateClusterRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNodePoolRequest {
    pub spec: serde_json::Value,
    #[serde(default)]
    pub resource_version: Option<String>,
}

/// Paginated cluster listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterList {
    pub items: Vec<Cluster>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Paginated node-pool listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePoolList {
    pub items: Vec<NodePool>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_serialization_hides_dirty_flag() {
        let cluster = Cluster {
            id: Uuid::nil(),
            name: "alpha".into(),
            owner: "u@x.com".into(),
            spec: serde_json::json!({}),
            status: None,
            status_dirty: true,
            generation: 1,
            resource_version: "rv".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        let value = serde_json::to_value(&cluster).expect("serialize");
        assert!(value.get("status_dirty").is_none());
        assert_eq!(value["generation"], 1);
    }

    #[test]
    fn resource_kind_strings() {
        assert_eq!(ResourceKind::Cluster.as_str(), "cluster");
        assert_eq!(ResourceKind::NodePool.as_str(), "nodepool");
    }
}
