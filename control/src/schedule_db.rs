use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use uuid::Uuid;

/// One cluster selected by the scheduler sweep, with everything the tick
/// needs to pick a reason code and the follow-up interval.
#[derive(Debug, Clone)]
pub struct DueCluster {
    pub cluster_id: Uuid,
    pub generation: i64,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub next_reconcile_at: DateTime<Utc>,
    pub healthy_interval_secs: i64,
    pub unhealthy_interval_secs: i64,
    pub adaptive_enabled: bool,
    /// Tri-state: None until the first health observation.
    pub is_healthy: Option<bool>,
    /// Highest generation any controller has reported for this cluster;
    /// None when no controller has reported yet.
    pub max_observed_generation: Option<i64>,
}

/// Select every cluster the scheduler must emit for in this tick:
/// never-reconciled ones, ones whose next-reconcile time has passed, and
/// ones whose generation has outrun every controller report. Unhealthy
/// clusters come first, then the longest-overdue.
pub async fn select_due_clusters(pool: &Pool, limit: i64) -> Result<Vec<DueCluster>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            r#"
            SELECT c.id AS cluster_id,
                   c.generation,
                   s.last_reconciled_at,
                   s.next_reconcile_at,
                   s.healthy_interval_secs,
                   s.unhealthy_interval_secs,
                   s.adaptive_enabled,
                   s.is_healthy,
                   max(cs.observed_generation) AS max_observed_generation,
                   count(cs.controller_name) AS report_count
            FROM clusters c
            JOIN reconciliation_schedules s ON s.cluster_id = c.id
            LEFT JOIN controller_status cs ON cs.resource_id = c.id
            WHERE c.deleted_at IS NULL AND s.enabled
            GROUP BY c.id, c.generation, s.last_reconciled_at, s.next_reconcile_at,
                     s.healthy_interval_secs, s.unhealthy_interval_secs,
                     s.adaptive_enabled, s.is_healthy
            HAVING s.last_reconciled_at IS NULL
                OR s.next_reconcile_at <= now()
                OR (count(cs.controller_name) > 0
                    AND c.generation > max(cs.observed_generation))
            ORDER BY (s.is_healthy IS DISTINCT FROM TRUE) DESC, s.next_reconcile_at ASC
            LIMIT $1
            "#,
            &[&limit],
        )
        .await
        .context("failed to select due clusters")?;

    Ok(rows
        .iter()
        .map(|r| DueCluster {
            cluster_id: r.get("cluster_id"),
            generation: r.get("generation"),
            last_reconciled_at: r.get("last_reconciled_at"),
            next_reconcile_at: r.get("next_reconcile_at"),
            healthy_interval_secs: r.get("healthy_interval_secs"),
            unhealthy_interval_secs: r.get("unhealthy_interval_secs"),
            adaptive_enabled: r.get("adaptive_enabled"),
            is_healthy: r.get("is_healthy"),
            max_observed_generation: r.get("max_observed_generation"),
        })
        .collect())
}

/// Advance a cluster's schedule after an emit: stamp the reconcile time,
/// push the next one out by `interval_secs`, and record the health
/// observation the interval was chosen from.
pub async fn mark_reconciled(
    pool: &Pool,
    cluster_id: Uuid,
    healthy: bool,
    interval_secs: i64,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let interval = interval_secs as f64;
    let updated = client
        .execute(
            r#"
            UPDATE reconciliation_schedules
            SET last_reconciled_at = now(),
                next_reconcile_at = now() + make_interval(secs => $2),
                is_healthy = $3,
                last_health_check = now()
            WHERE cluster_id = $1
            "#,
            &[&cluster_id, &interval, &healthy],
        )
        .await
        .context("failed to advance schedule")?;

    Ok(updated > 0)
}
