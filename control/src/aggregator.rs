use chrono::{DateTime, Duration, Utc};
use deadpool_postgres::Pool;

use crate::models::{Cluster, NodePool};
use crate::status_models::{
    AggregateStatus, CONDITION_AVAILABLE, CONDITION_READY, Condition, ConditionStatus,
    ControllerReport, Phase,
};
use crate::{db, metrics, nodepool_db, status_db};

/// Time windows steering the ready-none branch of the fold.
#[derive(Debug, Clone)]
pub struct GraceConfig {
    /// How long after the first report "no readies" still counts as
    /// provisioning.
    pub grace: Duration,
    /// Window used instead when a controller flags long-running
    /// provisioning in its report metadata.
    pub extended_grace: Duration,
    /// A report newer than this counts as controller activity.
    pub activity_window: Duration,
}

impl GraceConfig {
    pub fn from_minutes(grace_minutes: i64, extended_grace_minutes: i64) -> Self {
        GraceConfig {
            grace: Duration::minutes(grace_minutes),
            extended_grace: Duration::minutes(extended_grace_minutes),
            activity_window: Duration::minutes(5),
        }
    }
}

/// Fold the current-generation controller reports into one aggregate
/// status. Reports for older generations describe a superseded spec and
/// are ignored entirely.
pub fn aggregate(
    generation: i64,
    reports: &[ControllerReport],
    now: DateTime<Utc>,
    grace: &GraceConfig,
) -> AggregateStatus {
    let current: Vec<&ControllerReport> = reports
        .iter()
        .filter(|r| r.observed_generation == generation)
        .collect();

    let total = current.len();
    let ready = current
        .iter()
        .filter(|r| r.conditions.iter().any(Condition::is_available))
        .count();
    let errors = current.iter().filter(|r| r.last_error.is_some()).count();
    let earliest_report_at = current.iter().map(|r| r.updated_at).min();
    let recent_activity = current
        .iter()
        .any(|r| now - r.updated_at < grace.activity_window);
    let window = if current.iter().any(|r| r.wants_extended_grace()) {
        grace.extended_grace
    } else {
        grace.grace
    };

    let (phase, reason, message) = if total == 0 {
        (
            Phase::Pending,
            "NoControllers".to_string(),
            "no controllers have reported for this generation".to_string(),
        )
    } else if ready == total && errors == 0 {
        (
            Phase::Ready,
            "AllControllersReady".to_string(),
            format!("{ready}/{total} controllers ready"),
        )
    } else if ready > 0 {
        let reason = if errors > 0 {
            "ControllersWithErrors"
        } else {
            "PartialProgress"
        };
        let mut message = format!("{ready}/{total} controllers ready");
        if errors > 0 {
            message.push_str(&format!(", {errors} reporting errors"));
        }
        (Phase::Progressing, reason.to_string(), message)
    } else {
        // Nothing ready. Within the grace window (or before any report has
        // a timestamp) this is normal provisioning; past it, only activity
        // or reported errors keep the phase out of Failed.
        let within_grace = earliest_report_at.map(|t| now - t < window).unwrap_or(true);
        if within_grace {
            (
                Phase::Progressing,
                "ControllersProvisioning".to_string(),
                format!("0/{total} controllers ready, provisioning in progress"),
            )
        } else if recent_activity || errors > 0 {
            (
                Phase::Progressing,
                "ControllersShowingProgress".to_string(),
                format!("0/{total} controllers ready, controllers still active"),
            )
        } else {
            (
                Phase::Failed,
                "ControllerTimeout".to_string(),
                "no controller became ready within the grace period".to_string(),
            )
        }
    };

    let condition_status = if phase == Phase::Ready {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    let conditions = vec![
        Condition {
            condition_type: CONDITION_READY.to_string(),
            status: condition_status,
            reason: Some(reason.clone()),
            message: Some(message.clone()),
            last_transition_time: Some(now),
        },
        Condition {
            condition_type: CONDITION_AVAILABLE.to_string(),
            status: condition_status,
            reason: Some(reason.clone()),
            message: Some(message.clone()),
            last_transition_time: Some(now),
        },
    ];

    AggregateStatus {
        observed_generation: generation,
        phase,
        reason,
        message,
        conditions,
        last_update_time: now,
    }
}

/// Whether a cached status document says the resource is Ready.
pub fn is_ready_phase(status: Option<&serde_json::Value>) -> bool {
    status
        .and_then(|s| s.get("phase"))
        .and_then(|p| p.as_str())
        .map(|p| p == Phase::Ready.as_str())
        .unwrap_or(false)
}

/// Ensure `cluster.status` reflects the current controller reports.
///
/// Fast path: the cached column when the dirty flag is clear. Dirty path:
/// recompute, write the cache back and clear the flag in one statement, and
/// serve the in-memory result even when the write-back fails (the flag then
/// stays set and the next reader retries).
pub async fn load_cluster_status(
    pool: &Pool,
    cluster: &mut Cluster,
    grace: &GraceConfig,
) -> anyhow::Result<()> {
    if !cluster.status_dirty {
        metrics::status_served_cached("cluster");
        return Ok(());
    }

    let reports = status_db::list_reports(pool, cluster.id).await?;
    let status = aggregate(cluster.generation, &reports, Utc::now(), grace);
    let value = serde_json::to_value(&status)?;

    match db::write_back_cluster_status(pool, cluster.id, cluster.generation, &value).await {
        Ok(cleared) => {
            if cleared {
                cluster.status_dirty = false;
            }
        }
        Err(e) => {
            tracing::warn!(cluster_id = %cluster.id, "status write-back failed: {e:#}");
        }
    }

    cluster.status = Some(value);
    metrics::status_recomputed("cluster");
    Ok(())
}

/// Node-pool twin of [`load_cluster_status`].
pub async fn load_nodepool_status(
    pool: &Pool,
    nodepool: &mut NodePool,
    grace: &GraceConfig,
) -> anyhow::Result<()> {
    if !nodepool.status_dirty {
        metrics::status_served_cached("nodepool");
        return Ok(());
    }

    let reports = status_db::list_reports(pool, nodepool.id).await?;
    let status = aggregate(nodepool.generation, &reports, Utc::now(), grace);
    let value = serde_json::to_value(&status)?;

    match nodepool_db::write_back_nodepool_status(pool, nodepool.id, nodepool.generation, &value)
        .await
    {
        Ok(cleared) => {
            if cleared {
                nodepool.status_dirty = false;
            }
        }
        Err(e) => {
            tracing::warn!(nodepool_id = %nodepool.id, "status write-back failed: {e:#}");
        }
    }

    nodepool.status = Some(value);
    metrics::status_recomputed("nodepool");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceKind;
    use crate::status_models::META_LONG_RUNNING_PROVISIONING;
    use uuid::Uuid;

    fn grace() -> GraceConfig {
        GraceConfig::from_minutes(20, 30)
    }

    fn report(
        name: &str,
        observed_generation: i64,
        available: bool,
        age: Duration,
        now: DateTime<Utc>,
    ) -> ControllerReport {
        ControllerReport {
            resource_id: Uuid::nil(),
            resource_kind: ResourceKind::Cluster,
            controller_name: name.to_string(),
            observed_generation,
            conditions: vec![Condition {
                condition_type: CONDITION_AVAILABLE.to_string(),
                status: if available {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
                reason: None,
                message: None,
                last_transition_time: None,
            }],
            metadata: serde_json::json!({}),
            last_error: None,
            updated_at: now - age,
        }
    }

    #[test]
    fn no_reports_is_pending() {
        let now = Utc::now();
        let status = aggregate(1, &[], now, &grace());
        assert_eq!(status.phase, Phase::Pending);
        assert_eq!(status.reason, "NoControllers");
        assert_eq!(status.observed_generation, 1);
    }

    #[test]
    fn all_ready_is_ready_with_both_conditions_true() {
        let now = Utc::now();
        let reports = vec![
            report("a", 1, true, Duration::minutes(1), now),
            report("b", 1, true, Duration::minutes(2), now),
        ];
        let status = aggregate(1, &reports, now, &grace());
        assert_eq!(status.phase, Phase::Ready);
        assert_eq!(status.conditions.len(), 2);
        assert!(
            status
                .conditions
                .iter()
                .all(|c| c.status == ConditionStatus::True)
        );
        let types: Vec<&str> = status
            .conditions
            .iter()
            .map(|c| c.condition_type.as_str())
            .collect();
        assert!(types.contains(&CONDITION_READY));
        assert!(types.contains(&CONDITION_AVAILABLE));
    }

    #[test]
    fn partial_progress_and_error_reasons() {
        let now = Utc::now();
        let mut reports = vec![
            report("a", 1, true, Duration::minutes(1), now),
            report("b", 1, false, Duration::minutes(1), now),
        ];
        let status = aggregate(1, &reports, now, &grace());
        assert_eq!(status.phase, Phase::Progressing);
        assert_eq!(status.reason, "PartialProgress");

        reports[1].last_error = Some(serde_json::json!({"message": "quota exceeded"}));
        let status = aggregate(1, &reports, now, &grace());
        assert_eq!(status.phase, Phase::Progressing);
        assert_eq!(status.reason, "ControllersWithErrors");
    }

    #[test]
    fn stale_generation_reports_never_make_ready() {
        let now = Utc::now();
        let reports = vec![
            report("a", 1, true, Duration::minutes(1), now),
            report("a2", 2, false, Duration::minutes(1), now),
        ];
        let status = aggregate(2, &reports, now, &grace());
        assert_ne!(status.phase, Phase::Ready);
        assert_eq!(status.phase, Phase::Progressing);
    }

    #[test]
    fn only_stale_reports_is_pending() {
        let now = Utc::now();
        let reports = vec![report("a", 1, true, Duration::minutes(1), now)];
        let status = aggregate(2, &reports, now, &grace());
        assert_eq!(status.phase, Phase::Pending);
        assert_eq!(status.reason, "NoControllers");
    }

    #[test]
    fn none_ready_within_grace_is_provisioning() {
        let now = Utc::now();
        let reports = vec![report("a", 1, false, Duration::minutes(10), now)];
        let status = aggregate(1, &reports, now, &grace());
        assert_eq!(status.phase, Phase::Progressing);
        assert_eq!(status.reason, "ControllersProvisioning");
    }

    #[test]
    fn none_ready_past_grace_without_activity_fails() {
        let now = Utc::now();
        let reports = vec![report("a", 1, false, Duration::minutes(25), now)];
        let status = aggregate(1, &reports, now, &grace());
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.reason, "ControllerTimeout");
        assert!(
            status
                .conditions
                .iter()
                .all(|c| c.status == ConditionStatus::False)
        );
    }

    #[test]
    fn activity_past_grace_keeps_progressing() {
        let now = Utc::now();
        // First report is old, but a second controller touched its report
        // moments ago.
        let reports = vec![
            report("a", 1, false, Duration::minutes(40), now),
            report("b", 1, false, Duration::minutes(1), now),
        ];
        let status = aggregate(1, &reports, now, &grace());
        assert_eq!(status.phase, Phase::Progressing);
        assert_eq!(status.reason, "ControllersShowingProgress");
    }

    #[test]
    fn errors_past_grace_keep_progressing() {
        let now = Utc::now();
        let mut reports = vec![report("a", 1, false, Duration::minutes(40), now)];
        reports[0].last_error = Some(serde_json::json!({"message": "boom"}));
        let status = aggregate(1, &reports, now, &grace());
        assert_eq!(status.phase, Phase::Progressing);
        assert_eq!(status.reason, "ControllersShowingProgress");
    }

    #[test]
    fn extended_grace_applies_when_metadata_asks() {
        let now = Utc::now();
        // 25 minutes in: past the default window, inside the extended one.
        let mut reports = vec![report("a", 1, false, Duration::minutes(25), now)];
        let status = aggregate(1, &reports, now, &grace());
        assert_eq!(status.phase, Phase::Failed);

        reports[0].metadata = serde_json::json!({META_LONG_RUNNING_PROVISIONING: "true"});
        let status = aggregate(1, &reports, now, &grace());
        assert_eq!(status.phase, Phase::Progressing);
        assert_eq!(status.reason, "ControllersProvisioning");
    }

    #[test]
    fn ready_phase_detection_from_cached_value() {
        assert!(!is_ready_phase(None));
        assert!(!is_ready_phase(Some(&serde_json::json!({}))));
        assert!(!is_ready_phase(Some(
            &serde_json::json!({"phase": "Progressing"})
        )));
        assert!(is_ready_phase(Some(&serde_json::json!({"phase": "Ready"}))));
    }
}
