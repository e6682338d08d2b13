//! Per-source fetch statistics

use crate::sources::FetchError;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatistics {
    pub adapter: String,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<FixedOffset>>,
    pub last_latency_ms: u64,
    pub last_quote_count: usize,
}

impl SourceStatistics {
    pub fn for_adapter(adapter: &str) -> Self {
        Self {
            adapter: adapter.to_string(),
            ..Self::default()
        }
    }

    pub fn record_success(&mut self, at: DateTime<FixedOffset>, latency: Duration, quotes: usize) {
        self.successes += 1;
        self.consecutive_failures = 0;
        self.last_success_at = Some(at);
        self.last_latency_ms = latency.as_millis() as u64;
        self.last_quote_count = quotes;
    }

    pub fn record_failure(&mut self, at: DateTime<FixedOffset>, latency: Duration, error: &FetchError) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        self.last_failure_at = Some(at);
        self.last_latency_ms = latency.as_millis() as u64;
    }

    /// Ratio of successful fetches, 1.0 before the first attempt
    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_streak_resets_on_success() {
        let at = DateTime::parse_from_rfc3339("2024-01-01T10:00:00+03:00").unwrap();
        let mut stats = SourceStatistics::for_adapter("http-json");

        stats.record_failure(at, Duration::from_millis(12), &FetchError::RateLimited);
        stats.record_failure(at, Duration::from_millis(40), &FetchError::Http { status: 502 });
        assert_eq!(stats.consecutive_failures, 2);
        assert_eq!(stats.last_error.as_deref(), Some("HTTP status 502"));

        stats.record_success(at, Duration::from_millis(7), 21);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.last_quote_count, 21);
        assert_eq!(stats.last_latency_ms, 7);
        assert!((stats.success_rate() - 1.0 / 3.0).abs() < 1e-9);

        // last error is kept for operators after recovery
        assert!(stats.last_error.is_some());
    }
}
