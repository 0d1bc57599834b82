use anyhow::{Context, Result};
use deadpool_postgres::Pool;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::db::is_unique_violation;
use crate::models::{NodePool, NodePoolList};

const NODEPOOL_COLUMNS: &str = "id, cluster_id, name, spec, status, status_dirty, generation, \
     resource_version, created_at, updated_at, deleted_at";

pub enum NodePoolInsert {
    Created(NodePool),
    DuplicateName,
}

pub enum NodePoolUpdate {
    Updated(NodePool),
    VersionMismatch,
    NotFound,
}

/// Insert a new node pool under a cluster the handler has already resolved.
pub async fn insert_nodepool(
    pool: &Pool,
    id: Uuid,
    cluster_id: Uuid,
    name: &str,
    spec: &serde_json::Value,
    resource_version: &str,
) -> Result<NodePoolInsert> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = match client
        .query_one(
            &format!(
                r#"
                INSERT INTO nodepools (id, cluster_id, name, spec, resource_version)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {NODEPOOL_COLUMNS}
                "#
            ),
            &[&id, &cluster_id, &name, &spec, &resource_version],
        )
        .await
    {
        Ok(row) => row,
        Err(e) if is_unique_violation(&e) => return Ok(NodePoolInsert::DuplicateName),
        Err(e) => return Err(e).context("failed to insert node pool"),
    };

    Ok(NodePoolInsert::Created(NodePool::from_row(&row)))
}

/// Get a live node pool by ID. Ownership is inherited: the row is visible
/// iff its cluster is visible to the caller.
pub async fn get_nodepool(pool: &Pool, id: Uuid, owner: Option<&str>) -> Result<Option<NodePool>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let mut query = format!(
        r#"
        SELECT {}
        FROM nodepools p
        JOIN clusters c ON c.id = p.cluster_id AND c.deleted_at IS NULL
        WHERE p.id = $1 AND p.deleted_at IS NULL
        "#,
        prefixed_columns()
    );
    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&id];
    if let Some(ref o) = owner {
        query.push_str(" AND c.owner = $2");
        params.push(o);
    }

    let row = client
        .query_opt(&query, &params)
        .await
        .context("failed to query node pool")?;

    Ok(row.map(|r| NodePool::from_row(&r)))
}

/// List live node pools of one cluster with pagination.
pub async fn list_nodepools(
    pool: &Pool,
    cluster_id: Uuid,
    offset: i64,
    limit: i64,
) -> Result<NodePoolList> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                r#"
                SELECT {NODEPOOL_COLUMNS}, COUNT(*) OVER() AS full_count
                FROM nodepools
                WHERE cluster_id = $1 AND deleted_at IS NULL
                ORDER BY name ASC, id ASC
                LIMIT $2
                OFFSET $3
                "#
            ),
            &[&cluster_id, &limit, &offset],
        )
        .await
        .context("failed to list node pools")?;

    let total: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
    let items: Vec<NodePool> = rows.iter().map(NodePool::from_row).collect();

    Ok(NodePoolList {
        items,
        total,
        limit,
        offset,
    })
}

/// Replace a node pool's spec with the same generation/version semantics as
/// the cluster update.
pub async fn update_nodepool_spec(
    pool: &Pool,
    id: Uuid,
    owner: Option<&str>,
    spec: &serde_json::Value,
    expected_version: Option<&str>,
    new_version: &str,
) -> Result<NodePoolUpdate> {
    let client = pool.get().await.context("failed to get db connection")?;

    let mut query = String::from(
        "UPDATE nodepools SET spec = $1, generation = generation + 1, \
         resource_version = $2, status_dirty = TRUE, updated_at = now() \
         WHERE id = $3 AND deleted_at IS NULL",
    );
    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&spec, &new_version, &id];
    if let Some(ref o) = owner {
        query.push_str(&format!(
            " AND cluster_id IN (SELECT id FROM clusters WHERE deleted_at IS NULL AND owner = ${})",
            params.len() + 1
        ));
        params.push(o);
    }
    if let Some(ref v) = expected_version {
        query.push_str(&format!(" AND resource_version = ${}", params.len() + 1));
        params.push(v);
    }
    query.push_str(&format!(" RETURNING {NODEPOOL_COLUMNS}"));

    let row = client
        .query_opt(&query, &params)
        .await
        .context("failed to update node pool")?;

    if let Some(row) = row {
        return Ok(NodePoolUpdate::Updated(NodePool::from_row(&row)));
    }

    match get_nodepool(pool, id, owner).await? {
        Some(_) => Ok(NodePoolUpdate::VersionMismatch),
        None => Ok(NodePoolUpdate::NotFound),
    }
}

/// Soft-delete a node pool and drop its controller-status rows.
pub async fn soft_delete_nodepool(pool: &Pool, id: Uuid, owner: Option<&str>) -> Result<bool> {
    let mut client = pool.get().await.context("failed to get db connection")?;
    let tx = client
        .transaction()
        .await
        .context("failed to begin transaction")?;

    let mut query = String::from(
        "UPDATE nodepools SET deleted_at = now(), updated_at = now() \
         WHERE id = $1 AND deleted_at IS NULL",
    );
    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&id];
    if let Some(ref o) = owner {
        query.push_str(
            " AND cluster_id IN (SELECT id FROM clusters WHERE deleted_at IS NULL AND owner = $2)",
        );
        params.push(o);
    }

    let tombstoned = tx
        .execute(&query, &params)
        .await
        .context("failed to soft-delete node pool")?;
    if tombstoned == 0 {
        return Ok(false);
    }

    tx.execute("DELETE FROM controller_status WHERE resource_id = $1", &[&id])
        .await
        .context("failed to delete controller status rows")?;

    tx.commit().await.context("failed to commit cascade")?;
    Ok(true)
}

/// Hard-delete a node pool and its controller-status rows.
pub async fn hard_delete_nodepool(pool: &Pool, id: Uuid, owner: Option<&str>) -> Result<bool> {
    let mut client = pool.get().await.context("failed to get db connection")?;
    let tx = client
        .transaction()
        .await
        .context("failed to begin transaction")?;

    tx.execute("DELETE FROM controller_status WHERE resource_id = $1", &[&id])
        .await
        .context("failed to delete controller status rows")?;

    let mut query = String::from("DELETE FROM nodepools WHERE id = $1");
    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&id];
    if let Some(ref o) = owner {
        query.push_str(
            " AND cluster_id IN (SELECT id FROM clusters WHERE deleted_at IS NULL AND owner = $2)",
        );
        params.push(o);
    }

    let deleted = tx
        .execute(&query, &params)
        .await
        .context("failed to hard-delete node pool")?;
    if deleted == 0 {
        return Ok(false);
    }

    tx.commit().await.context("failed to commit cascade")?;
    Ok(true)
}

/// Flag the cached status as stale. Idempotent.
pub async fn mark_nodepool_dirty(pool: &Pool, id: Uuid) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let updated = client
        .execute(
            "UPDATE nodepools SET status_dirty = TRUE, updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
            &[&id],
        )
        .await
        .context("failed to mark node pool dirty")?;

    Ok(updated > 0)
}

/// Persist a freshly computed aggregate and clear the dirty flag, guarded
/// by the generation it was computed for.
pub async fn write_back_nodepool_status(
    pool: &Pool,
    id: Uuid,
    generation: i64,
    status: &serde_json::Value,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let updated = client
        .execute(
            "UPDATE nodepools SET status = $2, status_dirty = FALSE \
             WHERE id = $1 AND generation = $3 AND deleted_at IS NULL",
            &[&id, &status, &generation],
        )
        .await
        .context("failed to write back node pool status")?;

    Ok(updated > 0)
}

fn prefixed_columns() -> String {
    NODEPOOL_COLUMNS
        .split(", ")
        .map(|c| format!("p.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
