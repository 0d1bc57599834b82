use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

use crate::aggregator;
use crate::db;
use crate::error::ApiError;
use crate::identity::Caller;
use crate::metrics;
use crate::models::ResourceKind;
use crate::nodepool_db;
use crate::nodepool_handlers;
use crate::server::AppState;
use crate::status_db;
use crate::status_models::{AggregateStatus, PutStatusRequest, StatusResponse};

/// A report must name its controller and carry a metadata object, even an
/// empty one.
pub fn validate_report(req: &PutStatusRequest) -> Result<(), ApiError> {
    if req.controller_name.trim().is_empty() {
        return Err(ApiError::Validation("controller_name is required".into()));
    }
    if req.observed_generation < 0 {
        return Err(ApiError::Validation(
            "observed_generation must not be negative".into(),
        ));
    }
    match &req.metadata {
        Some(serde_json::Value::Object(_)) => Ok(()),
        Some(_) => Err(ApiError::Validation(
            "metadata must be a JSON object".into(),
        )),
        None => Err(ApiError::Validation("metadata is required".into())),
    }
}

fn parse_aggregate(status: Option<&serde_json::Value>) -> Option<AggregateStatus> {
    status.and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Aggregate status of a cluster plus its current-generation reports.
pub async fn get_cluster_status(
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

    let reports = status_db::list_reports(&state.pool, id)
        .await
        .map_err(|e| {
            metrics::db_error("list_reports");
            ApiError::Internal(e)
        })?
        .into_iter()
        .filter(|r| r.observed_generation == cluster.generation)
        .collect();

    Ok(Json(StatusResponse {
        status: parse_aggregate(cluster.status.as_ref()),
        reports,
    }))
}

/// Controller-only: upsert one report for a cluster. The dirty flag is set
/// here and by the persistence trigger; status is never recomputed
/// synchronously on the write path.
pub async fn put_cluster_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(req): Json<PutStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !caller.can_report_status() {
        return Err(ApiError::Forbidden(
            "only controllers may report status".into(),
        ));
    }
    validate_report(&req)?;

    db::get_cluster(&state.pool, id, None)
        .await
        .map_err(|e| {
            metrics::db_error("get_cluster");
            ApiError::Internal(e)
        })?
        .ok_or_else(|| ApiError::not_found("cluster", id))?;

    let conditions = serde_json::to_value(&req.conditions).map_err(anyhow::Error::from)?;
    let metadata = req.metadata.clone().unwrap_or_else(|| serde_json::json!({}));
    let report = status_db::upsert_report(
        &state.pool,
        id,
        ResourceKind::Cluster,
        req.controller_name.trim(),
        req.observed_generation,
        &conditions,
        &metadata,
        req.last_error.as_ref(),
    )
    .await
    .map_err(|e| {
        metrics::db_error("upsert_report");
        ApiError::Internal(e)
    })?;

    // Explicit post-write hook on top of the persistence trigger; the next
    // read recomputes either way.
    if let Err(e) = db::mark_cluster_dirty(&state.pool, id).await {
        metrics::db_error("mark_cluster_dirty");
        tracing::warn!(cluster_id = %id, "failed to mark cluster dirty: {e:#}");
    }

    metrics::status_report_received("cluster");
    Ok(Json(report))
}

/// Aggregate status of a node pool plus its current-generation reports.
pub async fn get_nodepool_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (mut nodepool, owner) = nodepool_handlers::fetch_with_owner(&state, id).await?;
    if !caller.can_read(&owner) {
        return Err(ApiError::not_found("node pool", id));
    }

    aggregator::load_nodepool_status(&state.pool, &mut nodepool, &state.grace)
        .await
        .map_err(ApiError::Internal)?;

    let reports = status_db::list_reports(&state.pool, id)
        .await
        .map_err(|e| {
            metrics::db_error("list_reports");
            ApiError::Internal(e)
        })?
        .into_iter()
        .filter(|r| r.observed_generation == nodepool.generation)
        .collect();

    Ok(Json(StatusResponse {
        status: parse_aggregate(nodepool.status.as_ref()),
        reports,
    }))
}

/// Controller-only: upsert one report for a node pool. Besides the trigger
/// marking the pool itself, the parent cluster is marked dirty here so its
/// aggregate reflects pool changes on the next read.
pub async fn put_nodepool_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(req): Json<PutStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !caller.can_report_status() {
        return Err(ApiError::Forbidden(
            "only controllers may report status".into(),
        ));
    }
    validate_report(&req)?;

    let nodepool = nodepool_db::get_nodepool(&state.pool, id, None)
        .await
        .map_err(|e| {
            metrics::db_error("get_nodepool");
            ApiError::Internal(e)
        })?
        .ok_or_else(|| ApiError::not_found("node pool", id))?;

    let conditions = serde_json::to_value(&req.conditions).map_err(anyhow::Error::from)?;
    let metadata = req.metadata.clone().unwrap_or_else(|| serde_json::json!({}));
    let report = status_db::upsert_report(
        &state.pool,
        id,
        ResourceKind::NodePool,
        req.controller_name.trim(),
        req.observed_generation,
        &conditions,
        &metadata,
        req.last_error.as_ref(),
    )
    .await
    .map_err(|e| {
        metrics::db_error("upsert_report");
        ApiError::Internal(e)
    })?;

    // Best effort by policy: a report side effect never fails the request.
    if let Err(e) = nodepool_db::mark_nodepool_dirty(&state.pool, id).await {
        metrics::db_error("mark_nodepool_dirty");
        tracing::warn!(nodepool_id = %id, "failed to mark node pool dirty: {e:#}");
    }
    if let Err(e) = db::mark_cluster_dirty(&state.pool, nodepool.cluster_id).await {
        metrics::db_error("mark_cluster_dirty");
        tracing::warn!(cluster_id = %nodepool.cluster_id, "failed to mark parent dirty: {e:#}");
    }

    metrics::status_report_received("nodepool");
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PutStatusRequest {
        PutStatusRequest {
            controller_name: "gcp-ctrl".into(),
            observed_generation: 1,
            conditions: vec![],
            metadata: Some(serde_json::json!({})),
            last_error: None,
        }
    }

    #[test]
    fn accepts_a_minimal_report() {
        assert!(validate_report(&request()).is_ok());
    }

    #[test]
    fn rejects_missing_controller_name() {
        let mut req = request();
        req.controller_name = "  ".into();
        assert!(validate_report(&req).is_err());
    }

    #[test]
    fn rejects_missing_or_non_object_metadata() {
        let mut req = request();
        req.metadata = None;
        assert!(validate_report(&req).is_err());
        req.metadata = Some(serde_json::json!("notes"));
        assert!(validate_report(&req).is_err());
        req.metadata = Some(serde_json::json!({"zone": "us-east1-b"}));
        assert!(validate_report(&req).is_ok());
    }

    #[test]
    fn rejects_negative_observed_generation() {
        let mut req = request();
        req.observed_generation = -1;
        assert!(validate_report(&req).is_err());
    }
}
