//! Rate Aggregation Library
//!
//! Collects currency and precious-metal quotes from several upstream
//! sources, reconciles them against the last known values and serves a
//! single versioned snapshot. Can be embedded or run through `rates-server`.

pub mod sources;
pub mod normalizer;
pub mod reconciler;
pub mod snapshot;
pub mod refresh;
pub mod clock;
pub mod config;
pub mod api;

// Re-export main types for easy access
pub use sources::{
    FeedEndpoint, FeedLayout, FetchError, FetchResult, HttpJsonAdapter, IncomingQuote,
    QuoteAdapter, RawValue, RetryPolicy, SourceConfig, SourceName,
};
pub use reconciler::{reconcile, RateMap, RateRecord, ReconcileReport, Side};
pub use snapshot::{Snapshot, SnapshotError, SnapshotStore};
pub use refresh::{
    RefreshCoordinator, RefreshOutcome, RefreshReport, RefreshState, SkipReason,
    SourceOutcome, SourceStatistics,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AggregatorConfig, ConfigError};
pub use api::RatesApiServer;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Main interface for embedding the aggregator
pub struct RateAggregator {
    config: AggregatorConfig,
    coordinator: Arc<RefreshCoordinator>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RateAggregator {
    /// Create an aggregator on the system clock at the configured offset
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        config.validate()?;
        let clock = SystemClock::with_offset_hours(config.utc_offset_hours)
            .ok_or(ConfigError::OffsetOutOfRange(config.utc_offset_hours))?;
        Self::with_clock(config, Arc::new(clock))
    }

    pub fn with_clock(config: AggregatorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(SnapshotStore::open(
            config.snapshot_path.clone(),
            config.source_names(),
            config.cache_ttl,
            clock.clone(),
        ));
        let coordinator = RefreshCoordinator::new(
            store,
            clock,
            config.refresh_settings(),
            config.sources.clone(),
        );

        Ok(Self {
            config,
            coordinator: Arc::new(coordinator),
            timer: Mutex::new(None),
        })
    }

    /// Bind an adapter to one source. Only possible before the aggregator
    /// is started or served.
    pub fn bind_adapter(&mut self, source: impl Into<SourceName>, adapter: Arc<dyn QuoteAdapter>) -> Result<()> {
        Arc::get_mut(&mut self.coordinator)
            .ok_or_else(|| anyhow!("adapters must be bound before the aggregator is shared"))?
            .bind(&source.into(), adapter)
    }

    /// Bind `adapter` to every source with a feed endpoint, returning them
    pub fn bind_feed_sources(&mut self, adapter: Arc<dyn QuoteAdapter>) -> Result<Vec<SourceName>> {
        let feeds: Vec<SourceName> = self
            .config
            .sources
            .iter()
            .filter(|s| s.endpoint.is_some())
            .map(|s| s.name.clone())
            .collect();

        for name in &feeds {
            self.bind_adapter(name.clone(), adapter.clone())?;
        }
        Ok(feeds)
    }

    /// Start periodic refreshes
    pub fn start(&self) -> Result<()> {
        let handle = self.coordinator.start()?;
        *self.timer.lock() = Some(handle);
        Ok(())
    }

    /// Stop periodic refreshes, waiting for a running cycle to finish
    pub async fn stop(&self) -> Result<()> {
        self.coordinator.stop();
        let handle = self.timer.lock().take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }

    /// Last good snapshot; schedules a refresh when it is stale
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.coordinator.snapshot()
    }

    /// Refresh every bound source now, ignoring the minimum interval
    pub async fn force_refresh_now(&self) -> RefreshOutcome {
        self.coordinator.refresh_now().await
    }

    pub fn source_statistics(&self) -> Vec<(SourceName, SourceStatistics)> {
        self.coordinator.source_statistics()
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Start the rates API server
    pub async fn start_api(&self, port: u16) {
        let api_server = RatesApiServer::new(self.coordinator.clone(), port);
        tokio::spawn(async move {
            api_server.start().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::time::Duration;

    struct FixedAdapter;

    #[async_trait]
    impl QuoteAdapter for FixedAdapter {
        async fn fetch(&self, _source: &SourceConfig) -> FetchResult<Vec<IncomingQuote>> {
            Ok(vec![
                IncomingQuote::new("USD", "US Dollar", "31.15", "31.30"),
                IncomingQuote::new("EUR", "Euro", 35.2, None::<f64>),
            ])
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> AggregatorConfig {
        AggregatorConfig {
            snapshot_path: dir.path().join("rates.json"),
            refresh_interval: Duration::from_millis(20),
            ..AggregatorConfig::default()
        }
    }

    fn manual_clock() -> Arc<ManualClock> {
        let start = DateTime::parse_from_rfc3339("2024-01-01T10:00:00+03:00").unwrap();
        Arc::new(ManualClock::new(start))
    }

    #[tokio::test]
    async fn test_aggregator_creation() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = RateAggregator::new(test_config(&dir)).unwrap();

        // Nothing on disk yet: every source present and empty
        let snapshot = aggregator.coordinator().store().current();
        assert_eq!(snapshot.source_names().len(), 4);
        assert_eq!(snapshot.total_records(), 0);
        assert!(aggregator.source_statistics().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.sources.clear();
        assert!(RateAggregator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_extreme_offset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for hours in [i32::MAX, i32::MIN, 24] {
            let config = AggregatorConfig {
                utc_offset_hours: hours,
                ..test_config(&dir)
            };
            let err = RateAggregator::new(config).err().unwrap();
            assert_eq!(
                err.downcast_ref::<ConfigError>(),
                Some(&ConfigError::OffsetOutOfRange(hours))
            );
        }
    }

    #[tokio::test]
    async fn test_force_refresh_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let mut aggregator = RateAggregator::with_clock(test_config(&dir), clock.clone()).unwrap();
        aggregator.bind_adapter("Primary", Arc::new(FixedAdapter)).unwrap();

        assert!(aggregator.force_refresh_now().await.is_completed());

        let snapshot = aggregator.snapshot();
        let primary = snapshot.source("Primary").unwrap();
        assert_eq!(primary["USD"].buy, "31.15");
        assert_eq!(primary["EUR"].buy, "35.2");
        assert_eq!(primary["EUR"].sell, "0");
        assert_eq!(snapshot.generated_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_stale_read_refreshes_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let mut aggregator = RateAggregator::with_clock(test_config(&dir), manual_clock()).unwrap();
        aggregator.bind_adapter("BridgeFeed", Arc::new(FixedAdapter)).unwrap();

        // The stale read itself returns the old, empty snapshot
        assert_eq!(aggregator.snapshot().total_records(), 0);

        tokio::time::timeout(Duration::from_secs(2), async {
            while aggregator.coordinator().store().current().total_records() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(aggregator.snapshot().source("BridgeFeed").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_aggregator_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.sources[1].endpoint = Some(FeedEndpoint::new("http://127.0.0.1:9/feed"));

        let mut aggregator = RateAggregator::new(config).unwrap();
        let bound = aggregator.bind_feed_sources(Arc::new(FixedAdapter)).unwrap();
        assert_eq!(bound, vec![SourceName::from("BridgeFeed")]);

        // Should start and stop without error
        assert!(aggregator.start().is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(aggregator.stop().await.is_ok());

        assert!(aggregator.snapshot().source("BridgeFeed").unwrap().contains_key("USD"));
    }
}
