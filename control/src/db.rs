use anyhow::{Context, Result};
use deadpool_postgres::Pool;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::models::{Cluster, ClusterList};

const CLUSTER_COLUMNS: &str = "id, name, owner, spec, status, status_dirty, generation, \
     resource_version, created_at, updated_at, deleted_at";

/// Defaults baked into freshly created schedule rows and the auto-create
/// trigger.
#[derive(Debug, Clone)]
pub struct ScheduleDefaults {
    pub initial_delay_secs: i64,
    pub healthy_interval_secs: i64,
    pub unhealthy_interval_secs: i64,
}

pub enum ClusterInsert {
    Created(Cluster),
    DuplicateName,
}

pub enum ClusterUpdate {
    Updated(Cluster),
    VersionMismatch,
    NotFound,
}

pub fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

/// Initialize the database schema, creating tables and triggers if they
/// don't exist. Idempotent; run at every startup.
pub async fn init_schema(pool: &Pool, defaults: &ScheduleDefaults) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                owner TEXT NOT NULL,
                spec JSONB NOT NULL,
                status JSONB,
                status_dirty BOOLEAN NOT NULL DEFAULT TRUE,
                generation BIGINT NOT NULL DEFAULT 1,
                resource_version TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                deleted_at TIMESTAMPTZ
            )
            "#,
            &[],
        )
        .await
        .context("failed to create clusters table")?;

    // (owner, name) must be unique among live rows only; tombstones may
    // shadow any number of reused names.
    client
        .execute(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_clusters_owner_name
            ON clusters (owner, name) WHERE deleted_at IS NULL
            "#,
            &[],
        )
        .await
        .context("failed to create cluster name index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS nodepools (
                id UUID PRIMARY KEY,
                cluster_id UUID NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                spec JSONB NOT NULL,
                status JSONB,
                status_dirty BOOLEAN NOT NULL DEFAULT TRUE,
                generation BIGINT NOT NULL DEFAULT 1,
                resource_version TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                deleted_at TIMESTAMPTZ
            )
            "#,
            &[],
        )
        .await
        .context("failed to create nodepools table")?;

    client
        .execute(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_nodepools_cluster_name
            ON nodepools (cluster_id, name) WHERE deleted_at IS NULL
            "#,
            &[],
        )
        .await
        .context("failed to create nodepool name index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS controller_status (
                resource_id UUID NOT NULL,
                resource_kind TEXT NOT NULL,
                controller_name TEXT NOT NULL,
                observed_generation BIGINT NOT NULL,
                conditions JSONB NOT NULL DEFAULT '[]',
                metadata JSONB NOT NULL DEFAULT '{}',
                last_error JSONB,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (resource_id, controller_name)
            )
            "#,
            &[],
        )
        .await
        .context("failed to create controller_status table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS reconciliation_schedules (
                cluster_id UUID PRIMARY KEY REFERENCES clusters(id) ON DELETE CASCADE,
                last_reconciled_at TIMESTAMPTZ,
                next_reconcile_at TIMESTAMPTZ NOT NULL,
                healthy_interval_secs BIGINT NOT NULL,
                unhealthy_interval_secs BIGINT NOT NULL,
                adaptive_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                is_healthy BOOLEAN,
                last_health_check TIMESTAMPTZ,
                enabled BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
            &[],
        )
        .await
        .context("failed to create reconciliation_schedules table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS cluster_events (
                id BIGSERIAL PRIMARY KEY,
                event_type TEXT NOT NULL,
                resource_id UUID NOT NULL,
                generation BIGINT NOT NULL,
                payload JSONB NOT NULL,
                emitted_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            &[],
        )
        .await
        .context("failed to create cluster_events table")?;

    // Every new cluster gets a schedule row without the insert path having
    // to remember to create one.
    client
        .execute(
            &format!(
                r#"
                CREATE OR REPLACE FUNCTION create_reconciliation_schedule() RETURNS trigger AS $$
                BEGIN
                    INSERT INTO reconciliation_schedules
                        (cluster_id, next_reconcile_at, healthy_interval_secs, unhealthy_interval_secs)
                    VALUES
                        (NEW.id, now() + make_interval(secs => {}), {}, {})
                    ON CONFLICT (cluster_id) DO NOTHING;
                    RETURN NEW;
                END;
                $$ LANGUAGE plpgsql
                "#,
                defaults.initial_delay_secs,
                defaults.healthy_interval_secs,
                defaults.unhealthy_interval_secs,
            ),
            &[],
        )
        .await
        .context("failed to create schedule trigger function")?;

    client
        .execute(
            "DROP TRIGGER IF EXISTS trg_clusters_create_schedule ON clusters",
            &[],
        )
        .await
        .context("failed to drop schedule trigger")?;

    client
        .execute(
            r#"
            CREATE TRIGGER trg_clusters_create_schedule
            AFTER INSERT ON clusters
            FOR EACH ROW EXECUTE FUNCTION create_reconciliation_schedule()
            "#,
            &[],
        )
        .await
        .context("failed to create schedule trigger")?;

    // Controller reports invalidate the owning resource's cached status at
    // the persistence layer, so no write path can forget to.
    client
        .execute(
            r#"
            CREATE OR REPLACE FUNCTION mark_resource_status_dirty() RETURNS trigger AS $$
            BEGIN
                IF NEW.resource_kind = 'nodepool' THEN
                    UPDATE nodepools SET status_dirty = TRUE, updated_at = now()
                    WHERE id = NEW.resource_id;
                ELSE
                    UPDATE clusters SET status_dirty = TRUE, updated_at = now()
                    WHERE id = NEW.resource_id;
                END IF;
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql
            "#,
            &[],
        )
        .await
        .context("failed to create dirty-flag trigger function")?;

    client
        .execute(
            "DROP TRIGGER IF EXISTS trg_controller_status_dirty ON controller_status",
            &[],
        )
        .await
        .context("failed to drop dirty-flag trigger")?;

    client
        .execute(
            r#"
            CREATE TRIGGER trg_controller_status_dirty
            AFTER INSERT OR UPDATE ON controller_status
            FOR EACH ROW EXECUTE FUNCTION mark_resource_status_dirty()
            "#,
            &[],
        )
        .await
        .context("failed to create dirty-flag trigger")?;

    tracing::info!("database schema initialized");
    Ok(())
}

/// Liveness probe for the health endpoint.
pub async fn ping(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .query_one("SELECT 1", &[])
        .await
        .context("database ping failed")?;
    Ok(())
}

/// Insert a new cluster. The schedule row is created by trigger.
pub async fn insert_cluster(
    pool: &Pool,
    id: Uuid,
    name: &str,
    owner: &str,
    spec: &serde_json::Value,
    resource_version: &str,
) -> Result<ClusterInsert> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = match client
        .query_one(
            &format!(
                r#"
                INSERT INTO clusters (id, name, owner, spec, resource_version)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {CLUSTER_COLUMNS}
                "#
            ),
            &[&id, &name, &owner, &spec, &resource_version],
        )
        .await
    {
        Ok(row) => row,
        Err(e) if is_unique_violation(&e) => return Ok(ClusterInsert::DuplicateName),
        Err(e) => return Err(e).context("failed to insert cluster"),
    };

    Ok(ClusterInsert::Created(Cluster::from_row(&row)))
}

/// Get a live cluster by ID, owner-scoped unless the caller is a controller.
pub async fn get_cluster(pool: &Pool, id: Uuid, owner: Option<&str>) -> Result<Option<Cluster>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let mut query = format!(
        "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = $1 AND deleted_at IS NULL"
    );
    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&id];
    if let Some(ref o) = owner {
        query.push_str(" AND owner = $2");
        params.push(o);
    }

    let row = client
        .query_opt(&query, &params)
        .await
        .context("failed to query cluster")?;

    Ok(row.map(|r| Cluster::from_row(&r)))
}

/// List live clusters with pagination, owner-scoped unless unfiltered.
/// Uses a window function for efficient full count retrieval.
pub async fn list_clusters(
    pool: &Pool,
    owner: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<ClusterList> {
    let client = pool.get().await.context("failed to get db connection")?;

    let mut query = format!(
        r#"
        SELECT {CLUSTER_COLUMNS}, COUNT(*) OVER() AS full_count
        FROM clusters
        WHERE deleted_at IS NULL
        "#
    );
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
    if let Some(ref o) = owner {
        query.push_str(" AND owner = $1");
        params.push(o);
    }
    query.push_str(&format!(
        " ORDER BY name ASC, id ASC LIMIT ${} OFFSET ${}",
        params.len() + 1,
        params.len() + 2
    ));
    params.push(&limit);
    params.push(&offset);

    let rows = client
        .query(&query, &params)
        .await
        .context("failed to list clusters")?;

    let total: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
    let items: Vec<Cluster> = rows.iter().map(Cluster::from_row).collect();

    Ok(ClusterList {
        items,
        total,
        limit,
        offset,
    })
}

/// Replace a cluster's spec, bumping the generation and rotating the
/// resource version atomically. When `expected_version` is supplied the
/// write only lands on a matching row.
pub async fn update_cluster_spec(
    pool: &Pool,
    id: Uuid,
    owner: Option<&str>,
    spec: &serde_json::Value,
    expected_version: Option<&str>,
    new_version: &str,
) -> Result<ClusterUpdate> {
    let client = pool.get().await.context("failed to get db connection")?;

    let mut query = String::from(
        "UPDATE clusters SET spec = $1, generation = generation + 1, \
         resource_version = $2, status_dirty = TRUE, updated_at = now() \
         WHERE id = $3 AND deleted_at IS NULL",
    );
    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&spec, &new_version, &id];
    if let Some(ref o) = owner {
        query.push_str(&format!(" AND owner = ${}", params.len() + 1));
        params.push(o);
    }
    if let Some(ref v) = expected_version {
        query.push_str(&format!(" AND resource_version = ${}", params.len() + 1));
        params.push(v);
    }
    query.push_str(&format!(" RETURNING {CLUSTER_COLUMNS}"));

    let row = client
        .query_opt(&query, &params)
        .await
        .context("failed to update cluster")?;

    if let Some(row) = row {
        return Ok(ClusterUpdate::Updated(Cluster::from_row(&row)));
    }

    // Zero rows: either the version raced or the cluster is gone. Probe the
    // live row to tell Conflict apart from NotFound.
    match get_cluster(pool, id, owner).await? {
        Some(_) => Ok(ClusterUpdate::VersionMismatch),
        None => Ok(ClusterUpdate::NotFound),
    }
}

/// Soft-delete a cluster and cascade: tombstone its node pools, drop every
/// controller-status row for the cluster and its pools, and remove the
/// schedule row. Returns false when no live row matched.
pub async fn soft_delete_cluster(pool: &Pool, id: Uuid, owner: Option<&str>) -> Result<bool> {
    let mut client = pool.get().await.context("failed to get db connection")?;
    let tx = client
        .transaction()
        .await
        .context("failed to begin transaction")?;

    let mut query = String::from(
        "UPDATE clusters SET deleted_at = now(), updated_at = now() \
         WHERE id = $1 AND deleted_at IS NULL",
    );
    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&id];
    if let Some(ref o) = owner {
        query.push_str(" AND owner = $2");
        params.push(o);
    }

    let tombstoned = tx
        .execute(&query, &params)
        .await
        .context("failed to soft-delete cluster")?;
    if tombstoned == 0 {
        return Ok(false);
    }

    tx.execute(
        r#"
        DELETE FROM controller_status
        WHERE resource_id = $1
           OR resource_id IN (SELECT id FROM nodepools WHERE cluster_id = $1)
        "#,
        &[&id],
    )
    .await
    .context("failed to delete controller status rows")?;

    tx.execute(
        "UPDATE nodepools SET deleted_at = now(), updated_at = now() \
         WHERE cluster_id = $1 AND deleted_at IS NULL",
        &[&id],
    )
    .await
    .context("failed to soft-delete node pools")?;

    tx.execute(
        "DELETE FROM reconciliation_schedules WHERE cluster_id = $1",
        &[&id],
    )
    .await
    .context("failed to delete schedule row")?;

    tx.commit().await.context("failed to commit cascade")?;
    Ok(true)
}

/// Hard-delete a cluster. Node pools and the schedule row go with it via
/// foreign keys; controller-status rows are removed explicitly.
pub async fn hard_delete_cluster(pool: &Pool, id: Uuid, owner: Option<&str>) -> Result<bool> {
    let mut client = pool.get().await.context("failed to get db connection")?;
    let tx = client
        .transaction()
        .await
        .context("failed to begin transaction")?;

    tx.execute(
        r#"
        DELETE FROM controller_status
        WHERE resource_id = $1
           OR resource_id IN (SELECT id FROM nodepools WHERE cluster_id = $1)
        "#,
        &[&id],
    )
    .await
    .context("failed to delete controller status rows")?;

    let mut query = String::from("DELETE FROM clusters WHERE id = $1");
    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&id];
    if let Some(ref o) = owner {
        query.push_str(" AND owner = $2");
        params.push(o);
    }

    let deleted = tx
        .execute(&query, &params)
        .await
        .context("failed to hard-delete cluster")?;
    if deleted == 0 {
        return Ok(false);
    }

    tx.commit().await.context("failed to commit cascade")?;
    Ok(true)
}

/// Flag the cached status as stale. Idempotent.
pub async fn mark_cluster_dirty(pool: &Pool, id: Uuid) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let updated = client
        .execute(
            "UPDATE clusters SET status_dirty = TRUE, updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
            &[&id],
        )
        .await
        .context("failed to mark cluster dirty")?;

    Ok(updated > 0)
}

/// Persist a freshly computed aggregate and clear the dirty flag, but only
/// while the generation it was computed for is still current.
pub async fn write_back_cluster_status(
    pool: &Pool,
    id: Uuid,
    generation: i64,
    status: &serde_json::Value,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let updated = client
        .execute(
            "UPDATE clusters SET status = $2, status_dirty = FALSE \
             WHERE id = $1 AND generation = $3 AND deleted_at IS NULL",
            &[&id, &status, &generation],
        )
        .await
        .context("failed to write back cluster status")?;

    Ok(updated > 0)
}
