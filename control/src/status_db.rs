use anyhow::{Context, Result};
use deadpool_postgres::Pool;
use uuid::Uuid;

use crate::models::ResourceKind;
use crate::status_models::ControllerReport;

const REPORT_COLUMNS: &str = "resource_id, resource_kind, controller_name, observed_generation, \
     conditions, metadata, last_error, updated_at";

/// Insert or overwrite one controller's report for one resource.
///
/// Last writer wins, including observed-generation downgrades; the
/// aggregator's generation filter keeps stale rows benign. Dirty-marking of
/// the owning resource happens in the database trigger, not here.
pub async fn upsert_report(
    pool: &Pool,
    resource_id: Uuid,
    resource_kind: ResourceKind,
    controller_name: &str,
    observed_generation: i64,
    conditions: &serde_json::Value,
    metadata: &serde_json::Value,
    last_error: Option<&serde_json::Value>,
) -> Result<ControllerReport> {
    let client = pool.get().await.context("failed to get db connection")?;

    let kind = resource_kind.as_str();
    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO controller_status
                    (resource_id, resource_kind, controller_name, observed_generation,
                     conditions, metadata, last_error, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, now())
                ON CONFLICT (resource_id, controller_name) DO UPDATE
                SET resource_kind = EXCLUDED.resource_kind,
                    observed_generation = EXCLUDED.observed_generation,
                    conditions = EXCLUDED.conditions,
                    metadata = EXCLUDED.metadata,
                    last_error = EXCLUDED.last_error,
                    updated_at = now()
                RETURNING {REPORT_COLUMNS}
                "#
            ),
            &[
                &resource_id,
                &kind,
                &controller_name,
                &observed_generation,
                &conditions,
                &metadata,
                &last_error,
            ],
        )
        .await
        .context("failed to upsert controller report")?;

    Ok(ControllerReport::from_row(&row))
}

/// All reports for one resource, newest first.
pub async fn list_reports(pool: &Pool, resource_id: Uuid) -> Result<Vec<ControllerReport>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                r#"
                SELECT {REPORT_COLUMNS}
                FROM controller_status
                WHERE resource_id = $1
                ORDER BY updated_at DESC, controller_name ASC
                "#
            ),
            &[&resource_id],
        )
        .await
        .context("failed to list controller reports")?;

    Ok(rows.iter().map(ControllerReport::from_row).collect())
}
