//! Rates Aggregation Server
//!
//! Periodically pulls every configured feed into the snapshot file and
//! serves the result over HTTP.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rates_core::{AggregatorConfig, HttpJsonAdapter, RateAggregator};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Starting Rates Aggregation Server");

    let config = AggregatorConfig::from_env()?;
    info!(
        snapshot = %config.snapshot_path.display(),
        cache_ttl_secs = config.cache_ttl.as_secs(),
        refresh_interval_secs = config.refresh_interval.as_secs(),
        "✅ Configuration loaded"
    );

    let api_port = config.api_port;
    let retry = config.retry_policy();
    let mut aggregator = RateAggregator::new(config)?;

    let feed_adapter = Arc::new(HttpJsonAdapter::new(retry)?);
    for source in aggregator.bind_feed_sources(feed_adapter)? {
        info!("📡 {} bound to JSON feed", source);
    }
    for source in aggregator.coordinator().unbound_sources() {
        warn!("{} has no adapter bound, its stored rates will be served as-is", source);
    }

    let snapshot = aggregator.coordinator().store().current();
    info!("📊 Loaded snapshot with {} records", snapshot.total_records());

    aggregator.start()?;
    aggregator.start_api(api_port).await;
    info!("✅ Rates API listening on port {}", api_port);

    info!("📊 System is running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    info!("🛑 Shutdown signal received...");

    aggregator.stop().await?;

    info!("✅ Rates aggregation server shutdown complete");
    Ok(())
}
