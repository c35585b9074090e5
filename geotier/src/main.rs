use anyhow::{Context, Result};
use clap::Parser;
use geotier::config::LoggingConfig;
use geotier::{CacheConfig, MultiTierCache};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "geotier")]
#[command(about = "Region-aware multi-tier cache", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (JSON, or YAML by extension); created with defaults if missing
    #[arg(short, long, env = "GEOTIER_CONFIG", default_value = "config/geotier.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = CacheConfig::load_or_init(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    init_tracing(&config.logging, cli.verbose);

    info!("Starting Geotier v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {}", cli.config.display());

    let cache = Arc::new(
        MultiTierCache::from_config(&config)
            .await
            .context("building cache engine")?,
    );

    let maintenance = spawn_maintenance(cache.clone(), config.maintenance.optimize_interval_secs);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    if let Some(handle) = maintenance {
        handle.abort();
    }

    let stats = cache.get_stats(None);
    match serde_json::to_string(&stats) {
        Ok(json) => info!("Final cache stats: {}", json),
        Err(e) => warn!("Could not encode final stats: {}", e),
    }
    match geotier::metrics::encode_metrics() {
        Ok(text) => debug!("Metrics at shutdown:\n{}", text),
        Err(e) => warn!("Could not encode metrics: {}", e),
    }

    cache.close().await;
    Ok(())
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .init();
    }
}

/// Periodic `optimize` over every connected region
fn spawn_maintenance(
    cache: Arc<MultiTierCache>,
    interval_secs: u64,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval_secs == 0 {
        info!("Periodic optimization disabled");
        return None;
    }

    info!("Starting optimization task (interval={}s)", interval_secs);
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            match cache.optimize(None).await {
                Ok(report) => {
                    for recommendation in &report.recommendations {
                        info!("Recommendation: {}", recommendation);
                    }
                }
                Err(e) => warn!("Optimization failed: {}", e),
            }
        }
    }))
}
