use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, put},
};
use deadpool_postgres::Pool;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;

use flotilla_common::shutdown;

use crate::aggregator::GraceConfig;
use crate::args::ServerArgs;
use crate::db::{self, ScheduleDefaults};
use crate::emitter::Emitter;
use crate::identity::AuthConfig;
use crate::scheduler::{self, SchedulerConfig};
use crate::{handlers, nodepool_handlers, status_handlers};

/// Upper bound on any single request; individual publish and tick
/// deadlines are tighter.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Clusters handled per scheduler sweep.
const SCHEDULER_BATCH_LIMIT: i64 = 500;

#[derive(Debug, Clone)]
pub struct PageLimits {
    pub default_limit: i64,
    pub max_limit: i64,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub emitter: Emitter,
    pub auth: AuthConfig,
    pub grace: GraceConfig,
    pub pagination: PageLimits,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/clusters",
            get(handlers::list_clusters).post(handlers::create_cluster),
        )
        .route(
            "/clusters/{id}",
            get(handlers::get_cluster)
                .put(handlers::update_cluster)
                .delete(handlers::delete_cluster),
        )
        .route(
            "/clusters/{id}/status",
            get(status_handlers::get_cluster_status).put(status_handlers::put_cluster_status),
        )
        .route(
            "/clusters/{id}/nodepools",
            get(nodepool_handlers::list_nodepools).post(nodepool_handlers::create_nodepool),
        )
        .route(
            "/nodepools/{id}",
            get(nodepool_handlers::get_nodepool)
                .put(nodepool_handlers::update_nodepool)
                .delete(nodepool_handlers::delete_nodepool),
        )
        .route(
            "/nodepools/{id}/status",
            put(status_handlers::put_nodepool_status).get(status_handlers::get_nodepool_status),
        )
        .layer(axum::middleware::from_fn(
            flotilla_common::access_log::public_error_only,
        ))
        .layer(axum::middleware::from_fn(
            flotilla_common::middleware::extract_context,
        ))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

/// Run the control-plane server: schema init, event stream, scheduler task,
/// HTTP surface. Blocks until shutdown.
pub async fn run_server(args: ServerArgs) -> Result<()> {
    flotilla_common::metrics::maybe_spawn_metrics_server();

    let cancel = CancellationToken::new();
    shutdown::cancel_on_shutdown(&cancel);

    let pool = flotilla_common::postgres::create_pool(args.postgres.clone()).await;
    let defaults = ScheduleDefaults {
        initial_delay_secs: args.scheduler.initial_reconcile_delay_secs,
        healthy_interval_secs: args.scheduler.healthy_interval_secs,
        unhealthy_interval_secs: args.scheduler.unhealthy_interval_secs,
    };
    db::init_schema(&pool, &defaults)
        .await
        .context("failed to initialize database schema")?;

    let nats = args.nats.connect().await?;
    tracing::info!(url = %args.nats.nats_url, "connected to NATS");
    let emitter = Emitter::new(
        nats,
        pool.clone(),
        &args.events.stream_name,
        &args.events.subject,
        Duration::from_secs(args.events.publish_timeout_secs),
    )
    .await?;

    let state = AppState {
        pool: pool.clone(),
        emitter: emitter.clone(),
        auth: AuthConfig {
            enabled: !args.auth.auth_disabled,
            controller_domain: args.auth.controller_domain.clone(),
            mock_identity: args.auth.mock_identity.clone(),
        },
        grace: GraceConfig::from_minutes(
            args.aggregator.grace_period_minutes,
            args.aggregator.extended_grace_period_minutes,
        ),
        pagination: PageLimits {
            default_limit: args.pagination.default_page_limit,
            max_limit: args.pagination.max_page_limit,
        },
    };

    let scheduler_task = if args.scheduler.scheduler_disabled {
        tracing::warn!("reconciliation scheduler disabled by flag");
        None
    } else {
        let tick = Duration::from_secs(args.scheduler.scheduler_tick_secs);
        let config = SchedulerConfig {
            tick,
            // Leave headroom before the next tick so sweeps never overlap.
            tick_budget: Duration::from_secs(
                args.scheduler.scheduler_tick_secs.saturating_sub(5).max(1),
            ),
            batch_limit: SCHEDULER_BATCH_LIMIT,
        };
        Some(tokio::spawn(scheduler::run_scheduler(
            cancel.clone(),
            pool.clone(),
            emitter.clone(),
            config,
        )))
    };

    let app = router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    tracing::info!(%addr, "starting control-plane HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    flotilla_common::signal_ready();

    let serve_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            serve_cancel.cancelled().await;
        })
        .await?;

    cancel.cancel();
    if let Some(task) = scheduler_task {
        task.await
            .context("failed to join scheduler task")?
            .context("scheduler task failed")?;
    }

    tracing::info!("server stopped gracefully");
    Ok(())
}
