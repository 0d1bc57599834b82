use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize;

use crate::args::HealthArgs;

const DEFAULT_ENDPOINT: &str = "http://localhost:8080";

/// `health` subcommand: probe the running server's health endpoint.
pub async fn run_health(args: HealthArgs) -> Result<()> {
    let endpoint = args
        .endpoint
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let url = format!("{}/health", endpoint.trim_end_matches('/'));

    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("health request to {url} failed"))?;

    if response.status().is_success() {
        println!("{}", "✅ healthy".green());
        Ok(())
    } else {
        bail!("service unhealthy: {}", response.status());
    }
}
