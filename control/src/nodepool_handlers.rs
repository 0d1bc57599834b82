use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use flotilla_common::Pagination;
use flotilla_common::events::EventType;

use crate::aggregator;
use crate::db;
use crate::error::ApiError;
use crate::handlers::{DeleteParams, validate_name, validate_spec};
use crate::identity::Caller;
use crate::metrics;
use crate::models::{CreateNodePoolRequest, NodePool, UpdateNodePoolRequest};
use crate::nodepool_db::{self, NodePoolInsert, NodePoolUpdate};
use crate::server::AppState;

/// Resolve a node pool together with its cluster's owner, which the access
/// policy is asked about. Masked and absent pools answer identically.
pub(crate) async fn fetch_with_owner(
    state: &AppState,
    id: Uuid,
) -> Result<(NodePool, String), ApiError> {
    let nodepool = nodepool_db::get_nodepool(&state.pool, id, None)
        .await
        .map_err(|e| {
            metrics::db_error("get_nodepool");
            ApiError::Internal(e)
        })?
        .ok_or_else(|| ApiError::not_found("node pool", id))?;

    let cluster = db::get_cluster(&state.pool, nodepool.cluster_id, None)
        .await
        .map_err(|e| {
            metrics::db_error("get_cluster");
            ApiError::Internal(e)
        })?
        .ok_or_else(|| ApiError::not_found("node pool", id))?;

    Ok((nodepool, cluster.owner))
}

/// List the node pools of one cluster. Visibility of the cluster gates the
/// whole listing.
pub async fn list_nodepools(
    State(state): State<AppState>,
    caller: Caller,
    Path(cluster_id): Path<Uuid>,
    Query(page): Query<Pagination>,
) -> Result<impl IntoResponse, ApiError> {
    let cluster = db::get_cluster(&state.pool, cluster_id, None)
        .await
        .map_err(|e| {
            metrics::db_error("get_cluster");
            ApiError::Internal(e)
        })?
        .ok_or_else(|| ApiError::not_found("cluster", cluster_id))?;
    if !caller.can_read(&cluster.owner) {
        return Err(ApiError::not_found("cluster", cluster_id));
    }

    let (offset, limit) = page.clamp(state.pagination.default_limit, state.pagination.max_limit);
    let mut list = nodepool_db::list_nodepools(&state.pool, cluster_id, offset, limit)
        .await
        .map_err(|e| {
            metrics::db_error("list_nodepools");
            ApiError::Internal(e)
        })?;

    for nodepool in &mut list.items {
        if let Err(e) = aggregator::load_nodepool_status(&state.pool, nodepool, &state.grace).await
        {
            tracing::warn!(nodepool_id = %nodepool.id, "skipping status enrichment: {e:#}");
        }
    }

    Ok(Json(list))
}

/// Create a node pool under a cluster the caller can mutate.
pub async fn create_nodepool(
    State(state): State<AppState>,
    caller: Caller,
    Path(cluster_id): Path<Uuid>,
    Json(req): Json<CreateNodePoolRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_name(&req.name)?;
    validate_spec(&req.spec)?;

    // A cluster the caller may not mutate is indistinguishable from an
    // absent one.
    let cluster = db::get_cluster(&state.pool, cluster_id, None)
        .await
        .map_err(|e| {
            metrics::db_error("get_cluster");
            ApiError::Internal(e)
        })?
        .ok_or_else(|| ApiError::not_found("cluster", cluster_id))?;
    if !caller.can_mutate(&cluster.owner) {
        return Err(ApiError::not_found("cluster", cluster_id));
    }

    let id = Uuid::new_v4();
    let resource_version = Uuid::new_v4().to_string();
    let mut nodepool = match nodepool_db::insert_nodepool(
        &state.pool,
        id,
        cluster_id,
        req.name.trim(),
        &req.spec,
        &resource_version,
    )
    .await
    .map_err(|e| {
        metrics::db_error("insert_nodepool");
        ApiError::Internal(e)
    })? {
        NodePoolInsert::Created(p) => p,
        NodePoolInsert::DuplicateName => {
            return Err(ApiError::Conflict(format!(
                "node pool {:?} already exists in this cluster",
                req.name.trim()
            )));
        }
    };

    if let Err(e) = aggregator::load_nodepool_status(&state.pool, &mut nodepool, &state.grace).await
    {
        tracing::warn!(nodepool_id = %nodepool.id, "status enrichment failed: {e:#}");
    }

    match serde_json::to_value(&nodepool) {
        Ok(resource) => {
            state
                .emitter
                .emit(
                    EventType::NodePoolCreated,
                    nodepool.id,
                    nodepool.generation,
                    None,
                    resource,
                    &nodepool.spec,
                )
                .await;
        }
        Err(e) => tracing::warn!(nodepool_id = %nodepool.id, "failed to serialize event: {e}"),
    }

    metrics::nodepool_created();
    Ok((StatusCode::CREATED, Json(nodepool)))
}

/// Get a node pool by ID, access inherited through its cluster.
pub async fn get_nodepool(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (mut nodepool, owner) = fetch_with_owner(&state, id).await?;
    if !caller.can_read(&owner) {
        return Err(ApiError::not_found("node pool", id));
    }

    aggregator::load_nodepool_status(&state.pool, &mut nodepool, &state.grace)
        .await
        .map_err(ApiError::Internal)?;

    Ok(Json(nodepool))
}

/// Replace a node pool's spec with the same no-op and optimistic-version
/// semantics as the cluster update: an omitted `resource_version` is pinned
/// to the version just read.
pub async fn update_nodepool(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateNodePoolRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_spec(&req.spec)?;

    let (current, owner) = fetch_with_owner(&state, id).await?;
    if !caller.can_mutate(&owner) {
        return Err(ApiError::not_found("node pool", id));
    }

    if current.spec == req.spec {
        let mut nodepool = current;
        aggregator::load_nodepool_status(&state.pool, &mut nodepool, &state.grace)
            .await
            .map_err(ApiError::Internal)?;
        return Ok(Json(nodepool));
    }

    let expected_version = req
        .resource_version
        .as_deref()
        .unwrap_or(&current.resource_version);
    let new_version = Uuid::new_v4().to_string();
    let mut nodepool = match nodepool_db::update_nodepool_spec(
        &state.pool,
        id,
        caller.owner_filter(),
        &req.spec,
        Some(expected_version),
        &new_version,
    )
    .await
    .map_err(|e| {
        metrics::db_error("update_nodepool");
        ApiError::Internal(e)
    })? {
        NodePoolUpdate::Updated(p) => p,
        NodePoolUpdate::VersionMismatch => {
            return Err(ApiError::Conflict("resource version mismatch".into()));
        }
        NodePoolUpdate::NotFound => return Err(ApiError::not_found("node pool", id)),
    };

    if let Err(e) = aggregator::load_nodepool_status(&state.pool, &mut nodepool, &state.grace).await
    {
        tracing::warn!(nodepool_id = %nodepool.id, "status enrichment failed: {e:#}");
    }

    match serde_json::to_value(&nodepool) {
        Ok(resource) => {
            state
                .emitter
                .emit(
                    EventType::NodePoolUpdated,
                    nodepool.id,
                    nodepool.generation,
                    None,
                    resource,
                    &nodepool.spec,
                )
                .await;
        }
        Err(e) => tracing::warn!(nodepool_id = %nodepool.id, "failed to serialize event: {e}"),
    }

    metrics::nodepool_updated();
    Ok(Json(nodepool))
}

/// Delete a node pool (soft by default) and its controller reports, then
/// emit `nodepool.deleted`.
pub async fn delete_nodepool(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Query(params): Query<DeleteParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (mut nodepool, owner) = fetch_with_owner(&state, id).await?;
    if !caller.can_mutate(&owner) {
        return Err(ApiError::not_found("node pool", id));
    }

    if let Err(e) = aggregator::load_nodepool_status(&state.pool, &mut nodepool, &state.grace).await
    {
        tracing::warn!(nodepool_id = %nodepool.id, "final status fold failed: {e:#}");
    }

    let deleted = if params.force {
        nodepool_db::hard_delete_nodepool(&state.pool, id, caller.owner_filter()).await
    } else {
        nodepool_db::soft_delete_nodepool(&state.pool, id, caller.owner_filter()).await
    }
    .map_err(|e| {
        metrics::db_error("delete_nodepool");
        ApiError::Internal(e)
    })?;
    if !deleted {
        return Err(ApiError::not_found("node pool", id));
    }

    nodepool.deleted_at = Some(Utc::now());
    match serde_json::to_value(&nodepool) {
        Ok(resource) => {
            state
                .emitter
                .emit(
                    EventType::NodePoolDeleted,
                    nodepool.id,
                    nodepool.generation,
                    None,
                    resource,
                    &nodepool.spec,
                )
                .await;
        }
        Err(e) => tracing::warn!(nodepool_id = %nodepool.id, "failed to serialize event: {e}"),
    }

    metrics::nodepool_deleted();
    Ok((StatusCode::ACCEPTED, Json(nodepool)))
}
