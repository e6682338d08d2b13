//! Single-flight refresh of every bound source into the snapshot store

pub mod stats;

pub use stats::SourceStatistics;

use crate::clock::Clock;
use crate::reconciler::{reconcile, ReconcileReport, Reconciliation};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::sources::{FetchError, FetchResult, IncomingQuote, QuoteAdapter, SourceConfig, SourceName};
use anyhow::{bail, Result};
use chrono::{DateTime, FixedOffset};
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Timing knobs for the coordinator
#[derive(Clone, Debug)]
pub struct RefreshSettings {
    /// Period of the background timer
    pub refresh_interval: Duration,
    /// Minimum gap between the start of one cycle and an on-demand trigger
    pub min_refresh_interval: Duration,
    /// Upper bound on a single adapter call
    pub fetch_timeout: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            min_refresh_interval: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshState {
    Idle,
    Refreshing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// Another cycle is running
    InFlight,
    /// The previous cycle started less than the minimum interval ago
    TooSoon,
}

#[derive(Clone, Debug)]
pub enum RefreshOutcome {
    Completed(RefreshReport),
    Skipped(SkipReason),
    /// Sources were fetched but the snapshot could not be persisted
    Failed(String),
}

impl RefreshOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub generated_at: Option<DateTime<FixedOffset>>,
    pub sources: Vec<SourceOutcome>,
}

impl RefreshReport {
    pub fn failed_sources(&self) -> Vec<&SourceName> {
        self.sources
            .iter()
            .filter_map(|outcome| match outcome {
                SourceOutcome::Failed { source, .. } => Some(source),
                SourceOutcome::Updated { .. } => None,
            })
            .collect()
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SourceOutcome {
    Updated {
        source: SourceName,
        report: ReconcileReport,
    },
    Failed {
        source: SourceName,
        #[serde(serialize_with = "serialize_display")]
        error: FetchError,
    },
}

impl SourceOutcome {
    pub fn source(&self) -> &SourceName {
        match self {
            Self::Updated { source, .. } | Self::Failed { source, .. } => source,
        }
    }
}

fn serialize_display<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Releases the in-flight flag when a cycle ends, panics included
struct RefreshGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RefreshGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Owns the refresh state machine.
///
/// Only sources with a bound adapter are fetched; the rest keep whatever
/// the store already holds for them.
pub struct RefreshCoordinator {
    store: Arc<SnapshotStore>,
    clock: Arc<dyn Clock>,
    settings: RefreshSettings,
    sources: Vec<SourceConfig>,
    adapters: HashMap<SourceName, Arc<dyn QuoteAdapter>>,
    statistics: DashMap<SourceName, SourceStatistics>,
    refreshing: AtomicBool,
    running: AtomicBool,
    last_attempt: Mutex<Option<DateTime<FixedOffset>>>,
    last_success: Mutex<Option<DateTime<FixedOffset>>>,
    shutdown: Notify,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<SnapshotStore>,
        clock: Arc<dyn Clock>,
        settings: RefreshSettings,
        sources: Vec<SourceConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            sources,
            adapters: HashMap::new(),
            statistics: DashMap::new(),
            refreshing: AtomicBool::new(false),
            running: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
            last_success: Mutex::new(None),
            shutdown: Notify::new(),
        }
    }

    /// Bind an adapter to a configured source
    pub fn bind(&mut self, source: &SourceName, adapter: Arc<dyn QuoteAdapter>) -> Result<()> {
        if !self.sources.iter().any(|s| &s.name == source) {
            bail!("cannot bind adapter to unknown source {}", source);
        }
        self.statistics
            .insert(source.clone(), SourceStatistics::for_adapter(adapter.name()));
        self.adapters.insert(source.clone(), adapter);
        Ok(())
    }

    pub fn with_adapter(mut self, source: impl Into<SourceName>, adapter: Arc<dyn QuoteAdapter>) -> Result<Self> {
        self.bind(&source.into(), adapter)?;
        Ok(self)
    }

    pub fn unbound_sources(&self) -> Vec<&SourceName> {
        self.sources
            .iter()
            .map(|s| &s.name)
            .filter(|name| !self.adapters.contains_key(*name))
            .collect()
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Last durable snapshot. A stale one also schedules a background
    /// refresh, visible to later reads.
    pub fn snapshot(self: &Arc<Self>) -> Arc<Snapshot> {
        let snapshot = self.store.current();
        if snapshot.is_stale(self.clock.now()) {
            self.spawn_trigger();
        }
        snapshot
    }

    pub fn state(&self) -> RefreshState {
        if self.refreshing.load(Ordering::Acquire) {
            RefreshState::Refreshing
        } else {
            RefreshState::Idle
        }
    }

    pub fn last_success(&self) -> Option<DateTime<FixedOffset>> {
        *self.last_success.lock()
    }

    /// Statistics for bound sources, in configured order
    pub fn source_statistics(&self) -> Vec<(SourceName, SourceStatistics)> {
        self.sources
            .iter()
            .filter_map(|s| self.statistics.get(&s.name).map(|stats| (s.name.clone(), stats.clone())))
            .collect()
    }

    /// On-demand refresh, honoring the minimum interval
    pub async fn trigger(&self) -> RefreshOutcome {
        if self.refreshing.load(Ordering::Acquire) {
            return RefreshOutcome::Skipped(SkipReason::InFlight);
        }
        if self.too_soon() {
            return RefreshOutcome::Skipped(SkipReason::TooSoon);
        }
        self.run_cycle().await
    }

    /// Refresh regardless of the minimum interval. Still single-flight.
    pub async fn refresh_now(&self) -> RefreshOutcome {
        self.run_cycle().await
    }

    /// Fire-and-forget [`trigger`](Self::trigger) for readers that must not wait
    pub fn spawn_trigger(self: &Arc<Self>) {
        if self.state() == RefreshState::Refreshing || self.too_soon() {
            return;
        }
        let coordinator = self.clone();
        tokio::spawn(async move {
            if let RefreshOutcome::Failed(error) = coordinator.trigger().await {
                warn!(%error, "background refresh failed");
            }
        });
    }

    /// Start the periodic timer. The first tick fires immediately.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            bail!("refresh coordinator already running");
        }

        let coordinator = self.clone();
        let period = self.settings.refresh_interval;
        info!(interval_secs = period.as_secs(), sources = self.adapters.len(), "refresh loop starting");

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = coordinator.shutdown.notified() => break,
                    _ = ticker.tick() => {
                        match coordinator.run_cycle().await {
                            RefreshOutcome::Skipped(reason) => debug!(?reason, "timer refresh skipped"),
                            RefreshOutcome::Failed(error) => error!(%error, "timer refresh failed"),
                            RefreshOutcome::Completed(_) => {}
                        }
                    }
                }
            }

            info!("refresh loop stopped");
        }))
    }

    /// Stop the timer loop. A cycle already running completes first.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.shutdown.notify_one();
        }
    }

    fn too_soon(&self) -> bool {
        let last_attempt = *self.last_attempt.lock();
        match last_attempt {
            Some(at) => {
                let elapsed = self.clock.now() - at;
                elapsed.num_milliseconds() < self.settings.min_refresh_interval.as_millis() as i64
            }
            None => false,
        }
    }

    async fn run_cycle(&self) -> RefreshOutcome {
        let _guard = match RefreshGuard::acquire(&self.refreshing) {
            Some(guard) => guard,
            None => return RefreshOutcome::Skipped(SkipReason::InFlight),
        };
        *self.last_attempt.lock() = Some(self.clock.now());

        let existing = self.store.current();
        let stamp = self.clock.rate_timestamp();

        let bound: Vec<_> = self
            .sources
            .iter()
            .filter_map(|source| self.adapters.get(&source.name).map(|adapter| (source, adapter.clone())))
            .collect();
        let results = join_all(bound.iter().map(|(source, adapter)| self.fetch_source(source, adapter.as_ref()))).await;

        let mut updates = HashMap::new();
        let mut outcomes = Vec::with_capacity(results.len());
        for ((source, _), result) in bound.iter().zip(results) {
            match result {
                Ok(quotes) => {
                    let previous = existing.source(source.name.as_str()).cloned().unwrap_or_default();
                    let Reconciliation { records, report } = reconcile(&quotes, &previous, source.fix_names, &stamp);
                    if report.is_noop() {
                        debug!(source = %source.name, codes = records.len(), "no price changes");
                    } else {
                        info!(
                            source = %source.name,
                            codes = records.len(),
                            inserted = report.inserted,
                            buy_changes = report.buy_changes,
                            sell_changes = report.sell_changes,
                            "source reconciled"
                        );
                    }
                    updates.insert(source.name.clone(), records);
                    outcomes.push(SourceOutcome::Updated {
                        source: source.name.clone(),
                        report,
                    });
                }
                Err(error) => {
                    if error.should_retry() {
                        warn!(source = %source.name, kind = ?error.kind(), %error, "fetch failed, keeping previous rates");
                    } else {
                        error!(source = %source.name, kind = ?error.kind(), %error, "feed payload rejected, keeping previous rates");
                    }
                    outcomes.push(SourceOutcome::Failed {
                        source: source.name.clone(),
                        error,
                    });
                }
            }
        }

        let store = self.store.clone();
        let saved = match tokio::task::spawn_blocking(move || store.save(updates)).await {
            Ok(saved) => saved.map_err(|e| e.to_string()),
            Err(e) => Err(format!("snapshot writer task failed: {}", e)),
        };

        match saved {
            Ok(snapshot) => {
                *self.last_success.lock() = snapshot.generated_at;
                let report = RefreshReport {
                    generated_at: snapshot.generated_at,
                    sources: outcomes,
                };
                let failed = report.failed_sources().len();
                info!(
                    sources = report.sources.len(),
                    failed,
                    records = snapshot.total_records(),
                    "refresh cycle complete"
                );
                RefreshOutcome::Completed(report)
            }
            Err(error) => {
                error!(%error, "failed to persist snapshot, previous file kept");
                RefreshOutcome::Failed(error)
            }
        }
    }

    async fn fetch_source(&self, source: &SourceConfig, adapter: &dyn QuoteAdapter) -> FetchResult<Vec<IncomingQuote>> {
        let started = Instant::now();
        let result = match timeout(self.settings.fetch_timeout, adapter.fetch(source)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                seconds: self.settings.fetch_timeout.as_secs(),
            }),
        };

        let elapsed = started.elapsed();
        let now = self.clock.now();
        let mut stats = self
            .statistics
            .entry(source.name.clone())
            .or_insert_with(|| SourceStatistics::for_adapter(adapter.name()));
        match &result {
            Ok(quotes) => stats.record_success(now, elapsed, quotes.len()),
            Err(error) => stats.record_failure(now, elapsed, error),
        }

        result
    }
}
