use anyhow::Result;
use deadpool_postgres::Pool;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use flotilla_common::events::EventType;

use crate::emitter::Emitter;
use crate::schedule_db::{self, DueCluster};
use crate::{aggregator, db, metrics};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the sweep runs.
    pub tick: Duration,
    /// Hard bound on one sweep, kept under the tick so runs never overlap.
    pub tick_budget: Duration,
    /// Maximum clusters handled per sweep; the rest stay due and are
    /// picked up next tick.
    pub batch_limit: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileReason {
    NeverReconciled,
    GenerationMismatch,
    HealthyReconciliation,
    UnhealthyReconciliation,
    PeriodicReconciliation,
}

impl ReconcileReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileReason::NeverReconciled => "never_reconciled",
            ReconcileReason::GenerationMismatch => "generation_mismatch",
            ReconcileReason::HealthyReconciliation => "healthy_reconciliation",
            ReconcileReason::UnhealthyReconciliation => "unhealthy_reconciliation",
            ReconcileReason::PeriodicReconciliation => "periodic_reconciliation",
        }
    }
}

/// Pick the reason code for one due cluster. Never-reconciled wins, then a
/// generation controllers have not caught up with, then the plain periodic
/// cases split by the recorded health bit.
pub fn reason_for(due: &DueCluster) -> ReconcileReason {
    if due.last_reconciled_at.is_none() {
        return ReconcileReason::NeverReconciled;
    }
    if let Some(max_observed) = due.max_observed_generation
        && due.generation > max_observed
    {
        return ReconcileReason::GenerationMismatch;
    }
    match due.is_healthy {
        Some(true) => ReconcileReason::HealthyReconciliation,
        Some(false) => ReconcileReason::UnhealthyReconciliation,
        None => ReconcileReason::PeriodicReconciliation,
    }
}

/// Pick the follow-up interval from the health just observed. With
/// adaptation disabled the schedule sticks to its healthy cadence.
pub fn interval_for(due: &DueCluster, ready_now: bool) -> i64 {
    if !due.adaptive_enabled || ready_now {
        due.healthy_interval_secs
    } else {
        due.unhealthy_interval_secs
    }
}

/// The reconciliation sweep. One long-lived task; cooperates with the
/// shutdown token and finishes the in-flight tick before exiting.
pub async fn run_scheduler(
    cancel: CancellationToken,
    pool: Pool,
    emitter: Emitter,
    config: SchedulerConfig,
) -> Result<()> {
    tracing::info!(
        tick_secs = config.tick.as_secs(),
        "reconciliation scheduler started"
    );
    let mut ticker = tokio::time::interval(config.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("reconciliation scheduler stopped");
                return Ok(());
            }
            _ = ticker.tick() => {
                let start = Instant::now();
                match tokio::time::timeout(
                    config.tick_budget,
                    run_tick(&pool, &emitter, config.batch_limit),
                )
                .await
                {
                    Ok(Ok(emitted)) => {
                        metrics::scheduler_tick(emitted, start.elapsed().as_secs_f64());
                    }
                    Ok(Err(e)) => {
                        tracing::error!("scheduler tick failed: {e:#}");
                    }
                    Err(_) => {
                        tracing::warn!(
                            budget_secs = config.tick_budget.as_secs(),
                            "scheduler tick exceeded its budget"
                        );
                    }
                }
            }
        }
    }
}

/// One sweep: select due clusters, emit, advance each schedule. A failing
/// cluster is logged and skipped; it stays due and the next tick retries.
async fn run_tick(pool: &Pool, emitter: &Emitter, batch_limit: i64) -> Result<usize> {
    let due = schedule_db::select_due_clusters(pool, batch_limit).await?;
    if due.is_empty() {
        return Ok(0);
    }
    tracing::debug!(count = due.len(), "clusters due for reconciliation");

    let mut emitted = 0;
    for item in &due {
        match reconcile_one(pool, emitter, item).await {
            Ok(()) => emitted += 1,
            Err(e) => {
                tracing::warn!(cluster_id = %item.cluster_id, "reconcile emit failed: {e:#}");
            }
        }
    }
    Ok(emitted)
}

async fn reconcile_one(pool: &Pool, emitter: &Emitter, due: &DueCluster) -> Result<()> {
    // The cluster may have been deleted between the sweep and this emit.
    let Some(cluster) = db::get_cluster(pool, due.cluster_id, None).await? else {
        return Ok(());
    };

    let reason = reason_for(due);
    let healthy = aggregator::is_ready_phase(cluster.status.as_ref());

    let resource = serde_json::to_value(&cluster)?;
    emitter
        .emit(
            EventType::ClusterReconcile,
            cluster.id,
            cluster.generation,
            Some(reason.as_str()),
            resource,
            &cluster.spec,
        )
        .await;
    metrics::reconcile_emitted(reason.as_str());

    // Advance the schedule after the emit. If we die in between, the
    // cluster is simply re-selected next tick; controllers deduplicate.
    let interval = interval_for(due, healthy);
    schedule_db::mark_reconciled(pool, due.cluster_id, healthy, interval).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn due() -> DueCluster {
        DueCluster {
            cluster_id: Uuid::nil(),
            generation: 1,
            last_reconciled_at: Some(Utc::now()),
            next_reconcile_at: Utc::now(),
            healthy_interval_secs: 300,
            unhealthy_interval_secs: 30,
            adaptive_enabled: true,
            is_healthy: None,
            max_observed_generation: None,
        }
    }

    #[test]
    fn never_reconciled_takes_priority() {
        let mut d = due();
        d.last_reconciled_at = None;
        d.max_observed_generation = Some(0);
        d.generation = 2;
        assert_eq!(reason_for(&d), ReconcileReason::NeverReconciled);
    }

    #[test]
    fn generation_mismatch_needs_a_lagging_report() {
        let mut d = due();
        d.generation = 3;
        d.max_observed_generation = Some(1);
        assert_eq!(reason_for(&d), ReconcileReason::GenerationMismatch);

        // No reports at all is not a mismatch; the periodic terms cover it.
        d.max_observed_generation = None;
        assert_eq!(reason_for(&d), ReconcileReason::PeriodicReconciliation);

        // Caught-up controllers fall through to the health split.
        d.max_observed_generation = Some(3);
        d.is_healthy = Some(true);
        assert_eq!(reason_for(&d), ReconcileReason::HealthyReconciliation);
        d.is_healthy = Some(false);
        assert_eq!(reason_for(&d), ReconcileReason::UnhealthyReconciliation);
    }

    #[test]
    fn interval_follows_observed_health() {
        let d = due();
        assert_eq!(interval_for(&d, true), 300);
        assert_eq!(interval_for(&d, false), 30);
    }

    #[test]
    fn adaptive_disabled_pins_the_healthy_interval() {
        let mut d = due();
        d.adaptive_enabled = false;
        assert_eq!(interval_for(&d, false), 300);
    }

    #[test]
    fn reason_codes_serialize_to_snake_case() {
        assert_eq!(
            ReconcileReason::NeverReconciled.as_str(),
            "never_reconciled"
        );
        assert_eq!(
            ReconcileReason::GenerationMismatch.as_str(),
            "generation_mismatch"
        );
        assert_eq!(
            ReconcileReason::PeriodicReconciliation.as_str(),
            "periodic_reconciliation"
        );
    }
}
