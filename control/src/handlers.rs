use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use flotilla_common::Pagination;
use flotilla_common::events::EventType;

use crate::aggregator;
use crate::db::{self, ClusterInsert, ClusterUpdate};
use crate::error::ApiError;
use crate::identity::Caller;
use crate::metrics;
use crate::models::{CreateClusterRequest, UpdateClusterRequest};
use crate::server::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteParams {
    /// When true, hard-delete instead of tombstoning.
    #[serde(default)]
    pub force: bool,
}

/// Reject empty or absurd resource names before they reach the store.
pub fn validate_name(name: &str) -> Result<(), ApiError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ApiError::Validation("name must not be empty".into()));
    }
    if trimmed.len() > 253 {
        return Err(ApiError::Validation(
            "name must be at most 253 characters".into(),
        ));
    }
    Ok(())
}

/// The spec document is opaque, but it must at least be a JSON object.
pub fn validate_spec(spec: &serde_json::Value) -> Result<(), ApiError> {
    if !spec.is_object() {
        return Err(ApiError::Validation("spec must be a JSON object".into()));
    }
    Ok(())
}

/// Health check: 200 when the database answers, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    db::ping(&state.pool).await.map_err(|e| {
        metrics::db_error("ping");
        ApiError::Unavailable(format!("{e:#}"))
    })?;
    Ok("OK")
}

/// List clusters visible to the caller, status-enriched per item.
pub async fn list_clusters(
    State(state): State<AppState>,
    caller: Caller,
    Query(page): Query<Pagination>,
) -> Result<impl IntoResponse, ApiError> {
    let (offset, limit) = page.clamp(state.pagination.default_limit, state.pagination.max_limit);

    let mut list = db::list_clusters(&state.pool, caller.owner_filter(), offset, limit)
        .await
        .map_err(|e| {
            metrics::db_error("list_clusters");
            ApiError::Internal(e)
        })?;

    // Per-item enrichment: one broken aggregate must not fail the page.
    for cluster in &mut list.items {
        if let Err(e) = aggregator::load_cluster_status(&state.pool, cluster, &state.grace).await {
            tracing::warn!(cluster_id = %cluster.id, "skipping status enrichment: {e:#}");
        }
    }

    Ok(Json(list))
}

/// Create a cluster owned by the caller and emit `cluster.created`.
pub async fn create_cluster(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateClusterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_name(&req.name)?;
    validate_spec(&req.spec)?;

    let id = Uuid::new_v4();
    let resource_version = Uuid::new_v4().to_string();
    let mut cluster = match db::insert_cluster(
        &state.pool,
        id,
        req.name.trim(),
        caller.email(),
        &req.spec,
        &resource_version,
    )
    .await
    .map_err(|e| {
        metrics::db_error("insert_cluster");
        ApiError::Internal(e)
    })? {
        ClusterInsert::Created(c) => c,
        ClusterInsert::DuplicateName => {
            return Err(ApiError::Conflict(format!(
                "cluster {:?} already exists",
                req.name.trim()
            )));
        }
    };

    // The response carries a freshly folded status (Pending for a new
    // cluster) instead of a null cache.
    if let Err(e) = aggregator::load_cluster_status(&state.pool, &mut cluster, &state.grace).await {
        tracing::warn!(cluster_id = %cluster.id, "status enrichment failed: {e:#}");
    }

    match serde_json::to_value(&cluster) {
        Ok(resource) => {
            state
                .emitter
                .emit(
                    EventType::ClusterCreated,
                    cluster.id,
                    cluster.generation,
                    None,
                    resource,
                    &cluster.spec,
                )
                .await;
        }
        Err(e) => tracing::warn!(cluster_id = %cluster.id, "failed to serialize event: {e}"),
    }

    metrics::cluster_created();
    Ok((StatusCode::CREATED, Json(cluster)))
}

/// Get a cluster by ID. An ownership-masked row answers exactly like an
/// absent one.
pub async fn get_cluster(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut cluster = db::get_cluster(&state.pool, id, None)
        .await
        .map_err(|e| {
            metrics::db_error("get_cluster");
            ApiError::Internal(e)
        })?
        .ok_or_else(|| ApiError::not_found("cluster", id))?;
    if !caller.can_read(&cluster.owner) {
        return Err(ApiError::not_found("cluster", id));
    }

    aggregator::load_cluster_status(&state.pool, &mut cluster, &state.grace)
        .await
        .map_err(ApiError::Internal)?;

    Ok(Json(cluster))
}

/// Replace a cluster's spec. The generation is bumped and `cluster.updated`
/// is emitted only when the spec actually changed. A request that omits
/// `resource_version` is pinned to the version this handler just read, so
/// no write ever lands unguarded.
pub async fn update_cluster(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateClusterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_spec(&req.spec)?;

    let current = db::get_cluster(&state.pool, id, None)
        .await
        .map_err(|e| {
            metrics::db_error("get_cluster");
            ApiError::Internal(e)
        })?
        .ok_or_else(|| ApiError::not_found("cluster", id))?;
    if !caller.can_mutate(&current.owner) {
        return Err(ApiError::not_found("cluster", id));
    }

    if current.spec == req.spec {
        // No-op write: no generation bump, no event.
        let mut cluster = current;
        aggregator::load_cluster_status(&state.pool, &mut cluster, &state.grace)
            .await
            .map_err(ApiError::Internal)?;
        return Ok(Json(cluster));
    }

    let expected_version = req
        .resource_version
        .as_deref()
        .unwrap_or(&current.resource_version);
    let new_version = Uuid::new_v4().to_string();
    let mut cluster = match db::update_cluster_spec(
        &state.pool,
        id,
        caller.owner_filter(),
        &req.spec,
        Some(expected_version),
        &new_version,
    )
    .await
    .map_err(|e| {
        metrics::db_error("update_cluster");
        ApiError::Internal(e)
    })? {
        ClusterUpdate::Updated(c) => c,
        ClusterUpdate::VersionMismatch => {
            return Err(ApiError::Conflict("resource version mismatch".into()));
        }
        ClusterUpdate::NotFound => return Err(ApiError::not_found("cluster", id)),
    };

    if let Err(e) = aggregator::load_cluster_status(&state.pool, &mut cluster, &state.grace).await {
        tracing::warn!(cluster_id = %cluster.id, "status enrichment failed: {e:#}");
    }

    match serde_json::to_value(&cluster) {
        Ok(resource) => {
            state
                .emitter
                .emit(
                    EventType::ClusterUpdated,
                    cluster.id,
                    cluster.generation,
                    None,
                    resource,
                    &cluster.spec,
                )
                .await;
        }
        Err(e) => tracing::warn!(cluster_id = %cluster.id, "failed to serialize event: {e}"),
    }

    metrics::cluster_updated();
    Ok(Json(cluster))
}

/// Delete a cluster (soft by default, hard with `?force=true`), cascade to
/// its node pools and controller reports, and emit `cluster.deleted`
/// carrying the final observed state.
pub async fn delete_cluster(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Query(params): Query<DeleteParams>,
) -> Result<impl IntoResponse, ApiError> {
    let mut cluster = db::get_cluster(&state.pool, id, None)
        .await
        .map_err(|e| {
            metrics::db_error("get_cluster");
            ApiError::Internal(e)
        })?
        .ok_or_else(|| ApiError::not_found("cluster", id))?;
    if !caller.can_mutate(&cluster.owner) {
        return Err(ApiError::not_found("cluster", id));
    }

    // Fold one last time so the deleted event carries the final state.
    if let Err(e) = aggregator::load_cluster_status(&state.pool, &mut cluster, &state.grace).await {
        tracing::warn!(cluster_id = %cluster.id, "final status fold failed: {e:#}");
    }

    let deleted = if params.force {
        db::hard_delete_cluster(&state.pool, id, caller.owner_filter()).await
    } else {
        db::soft_delete_cluster(&state.pool, id, caller.owner_filter()).await
    }
    .map_err(|e| {
        metrics::db_error("delete_cluster");
        ApiError::Internal(e)
    })?;
    if !deleted {
        return Err(ApiError::not_found("cluster", id));
    }

    cluster.deleted_at = Some(Utc::now());
    match serde_json::to_value(&cluster) {
        Ok(resource) => {
            state
                .emitter
                .emit(
                    EventType::ClusterDeleted,
                    cluster.id,
                    cluster.generation,
                    None,
                    resource,
                    &cluster.spec,
                )
                .await;
        }
        Err(e) => tracing::warn!(cluster_id = %cluster.id, "failed to serialize event: {e}"),
    }

    metrics::cluster_deleted();
    Ok((StatusCode::ACCEPTED, Json(cluster)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("alpha").is_ok());
        assert!(validate_name("  alpha  ").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(254)).is_err());
    }

    #[test]
    fn spec_must_be_an_object() {
        assert!(validate_spec(&serde_json::json!({})).is_ok());
        assert!(validate_spec(&serde_json::json!({"platform": {"type": "gcp"}})).is_ok());
        assert!(validate_spec(&serde_json::json!([])).is_err());
        assert!(validate_spec(&serde_json::json!("gcp")).is_err());
        assert!(validate_spec(&serde_json::Value::Null).is_err());
    }
}
