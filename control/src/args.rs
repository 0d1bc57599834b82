use clap::{Parser, Subcommand};
use flotilla_common::args::{NatsArgs, PostgresArgs};
use flotilla_common::events::CLUSTER_EVENTS;

#[derive(Parser, Debug)]
#[command(name = "flotilla-control")]
#[command(about = "Control-plane backend for cluster lifecycle management")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control-plane server
    Server(ServerArgs),

    /// Check service health
    Health(HealthArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// HTTP port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub nats: NatsArgs,

    #[clap(flatten)]
    pub events: EventsArgs,

    #[clap(flatten)]
    pub scheduler: SchedulerArgs,

    #[clap(flatten)]
    pub aggregator: AggregatorArgs,

    #[clap(flatten)]
    pub auth: AuthArgs,

    #[clap(flatten)]
    pub pagination: PaginationArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct EventsArgs {
    /// JetStream stream carrying the fan-out subject
    #[arg(long, env = "STREAM_NAME", default_value = CLUSTER_EVENTS)]
    pub stream_name: String,

    /// Subject every lifecycle event is published on
    #[arg(long, env = "EVENTS_SUBJECT", default_value = CLUSTER_EVENTS)]
    pub subject: String,

    /// Deadline for a single publish, including the ack
    #[arg(long, env = "PUBLISH_TIMEOUT_SECS", default_value_t = 5)]
    pub publish_timeout_secs: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct SchedulerArgs {
    /// How often the reconciliation sweep runs
    #[arg(long, env = "SCHEDULER_TICK_SECS", default_value_t = 30)]
    pub scheduler_tick_secs: u64,

    /// Re-emit interval for clusters whose aggregate is Ready
    #[arg(long, env = "HEALTHY_INTERVAL_SECS", default_value_t = 300)]
    pub healthy_interval_secs: i64,

    /// Re-emit interval for clusters that are not Ready
    #[arg(long, env = "UNHEALTHY_INTERVAL_SECS", default_value_t = 30)]
    pub unhealthy_interval_secs: i64,

    /// Delay before a freshly created cluster is first swept
    #[arg(long, env = "INITIAL_RECONCILE_DELAY_SECS", default_value_t = 10)]
    pub initial_reconcile_delay_secs: i64,

    /// Run the HTTP surface without the scheduler (replicated handlers)
    #[arg(long, env = "SCHEDULER_DISABLED", default_value_t = false)]
    pub scheduler_disabled: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct AggregatorArgs {
    /// Minutes after the first report during which "no readies" still
    /// counts as provisioning
    #[arg(long, env = "GRACE_PERIOD_MINUTES", default_value_t = 20)]
    pub grace_period_minutes: i64,

    /// Grace window used when a controller flags long-running provisioning
    #[arg(long, env = "EXTENDED_GRACE_PERIOD_MINUTES", default_value_t = 30)]
    pub extended_grace_period_minutes: i64,
}

#[derive(Parser, Debug, Clone)]
pub struct AuthArgs {
    /// Skip header classification and inject a mock controller identity
    #[arg(long, env = "AUTH_DISABLED", default_value_t = false)]
    pub auth_disabled: bool,

    /// E-mail domain identifying controller principals
    #[arg(long, env = "CONTROLLER_DOMAIN", default_value = "controllers.internal")]
    pub controller_domain: String,

    /// Identity injected when auth is disabled
    #[arg(
        long,
        env = "MOCK_IDENTITY",
        default_value = "dev-controller@controllers.internal"
    )]
    pub mock_identity: String,
}

#[derive(Parser, Debug, Clone)]
pub struct PaginationArgs {
    /// Page size when the request does not specify one
    #[arg(long, env = "DEFAULT_PAGE_LIMIT", default_value_t = 50)]
    pub default_page_limit: i64,

    /// Largest page size a request may ask for
    #[arg(long, env = "MAX_PAGE_LIMIT", default_value_t = 100)]
    pub max_page_limit: i64,
}

#[derive(Parser, Debug, Clone)]
pub struct HealthArgs {
    /// Control-plane endpoint
    #[arg(long, env = "CONTROL_ENDPOINT")]
    pub endpoint: Option<String>,
}
