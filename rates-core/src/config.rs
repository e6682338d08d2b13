//! Aggregator configuration

use crate::refresh::RefreshSettings;
use crate::sources::{FeedEndpoint, RetryPolicy, SourceConfig, SourceName};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "RATES_";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid feed URL for {source_name}: {reason}")]
    InvalidUrl { source_name: String, reason: String },

    #[error("Invalid source name: '{0}'")]
    InvalidSourceName(String),

    #[error("Duplicate source name: {0}")]
    DuplicateSource(String),

    #[error("No sources configured")]
    NoSources,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("UTC offset out of range: {0} hours")]
    OffsetOutOfRange(i32),
}

/// Aggregator configuration
#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    pub snapshot_path: PathBuf,
    pub cache_ttl: Duration,
    pub refresh_interval: Duration,
    pub min_refresh_interval: Duration,
    pub fetch_timeout: Duration,
    /// Offset applied to every generated timestamp
    pub utc_offset_hours: i32,
    pub api_port: u16,
    /// Fixed, ordered source set
    pub sources: Vec<SourceConfig>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("data/rates-snapshot.json"),
            cache_ttl: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(60),
            min_refresh_interval: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(30),
            utc_offset_hours: 3,
            api_port: 8080,
            sources: vec![
                SourceConfig::new("Primary"),
                SourceConfig::new("BridgeFeed"),
                SourceConfig::new("GoldFeed").with_fix_names(true),
                SourceConfig::new("CentralBank"),
            ],
        }
    }
}

impl AggregatorConfig {
    /// Defaults overlaid with `RATES_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup, then validate
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let key = format!("{}{}", ENV_PREFIX, suffix);
            lookup(&key).map(|value| (key, value.trim().to_string()))
        };

        if let Some((_, path)) = var("SNAPSHOT_PATH") {
            self.snapshot_path = PathBuf::from(path);
        }
        if let Some((key, value)) = var("CACHE_TTL_SECS") {
            self.cache_ttl = parse_secs(&key, &value)?;
        }
        if let Some((key, value)) = var("REFRESH_INTERVAL_SECS") {
            self.refresh_interval = parse_secs(&key, &value)?;
        }
        if let Some((key, value)) = var("MIN_REFRESH_INTERVAL_SECS") {
            self.min_refresh_interval = parse_secs(&key, &value)?;
        }
        if let Some((key, value)) = var("FETCH_TIMEOUT_SECS") {
            self.fetch_timeout = parse_secs(&key, &value)?;
        }
        if let Some((key, value)) = var("UTC_OFFSET_HOURS") {
            self.utc_offset_hours = parse(&key, &value)?;
        }
        if let Some((key, value)) = var("API_PORT") {
            self.api_port = parse(&key, &value)?;
        }

        for source in &mut self.sources {
            let prefix = source.name.env_key();
            let url = match var(&format!("{}_URL", prefix)) {
                Some((_, url)) if !url.is_empty() => url,
                _ => continue,
            };
            Url::parse(&url).map_err(|e| ConfigError::InvalidUrl {
                source_name: source.name.to_string(),
                reason: e.to_string(),
            })?;

            let mut endpoint = source.endpoint.take().unwrap_or_else(|| FeedEndpoint::new(url.clone()));
            endpoint.url = url;
            if let Some((_, referer)) = var(&format!("{}_REFERER", prefix)) {
                endpoint.referer = Some(referer);
            }
            if let Some((_, pointer)) = var(&format!("{}_ITEMS_POINTER", prefix)) {
                endpoint.layout.items_pointer = pointer;
            }
            if let Some((_, field)) = var(&format!("{}_BUY_FIELD", prefix)) {
                endpoint.layout.buy_field = field;
            }
            if let Some((_, field)) = var(&format!("{}_SELL_FIELD", prefix)) {
                endpoint.layout.sell_field = field;
            }
            source.endpoint = Some(endpoint);
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !source.name.validate() {
                return Err(ConfigError::InvalidSourceName(source.name.to_string()));
            }
            if !seen.insert(&source.name) {
                return Err(ConfigError::DuplicateSource(source.name.to_string()));
            }
        }

        for (name, duration) in [
            ("cache_ttl", self.cache_ttl),
            ("refresh_interval", self.refresh_interval),
            ("fetch_timeout", self.fetch_timeout),
        ] {
            if duration.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        if !(-23..=23).contains(&self.utc_offset_hours) {
            return Err(ConfigError::OffsetOutOfRange(self.utc_offset_hours));
        }

        Ok(())
    }

    pub fn source_names(&self) -> Vec<SourceName> {
        self.sources.iter().map(|s| s.name.clone()).collect()
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            refresh_interval: self.refresh_interval,
            min_refresh_interval: self.min_refresh_interval,
            fetch_timeout: self.fetch_timeout,
        }
    }

    /// HTTP retry policy whose worst case finishes inside `fetch_timeout`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().fitted_to(self.fetch_timeout)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AggregatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(
            config.source_names(),
            vec![
                SourceName::from("Primary"),
                SourceName::from("BridgeFeed"),
                SourceName::from("GoldFeed"),
                SourceName::from("CentralBank"),
            ]
        );
        assert!(config.sources[2].fix_names);
        assert!(config.sources.iter().all(|s| s.endpoint.is_none()));
    }

    #[test]
    fn test_retry_policy_within_fetch_timeout() {
        let config = AggregatorConfig::default();
        let policy = config.retry_policy();
        assert_eq!(policy.tries, 3);
        assert!(policy.worst_case() <= config.fetch_timeout);

        let config = AggregatorConfig::default()
            .overlay(lookup(&[("RATES_FETCH_TIMEOUT_SECS", "10")]))
            .unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.tries, 3);
        assert!(policy.worst_case() <= Duration::from_secs(10));
    }

    #[test]
    fn test_overlay_attaches_feed_endpoint() {
        let config = AggregatorConfig::default()
            .overlay(lookup(&[
                ("RATES_CACHE_TTL_SECS", "30"),
                ("RATES_API_PORT", "9090"),
                ("RATES_GOLDFEED_URL", "https://feed.example.com/tmp/gold.json?lang=tr"),
                ("RATES_GOLDFEED_REFERER", "https://feed.example.com/"),
                ("RATES_GOLDFEED_BUY_FIELD", "alis"),
                ("RATES_GOLDFEED_SELL_FIELD", "satis"),
            ]))
            .unwrap();

        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.api_port, 9090);

        let endpoint = config.sources[2].endpoint.as_ref().unwrap();
        assert_eq!(endpoint.url, "https://feed.example.com/tmp/gold.json?lang=tr");
        assert_eq!(endpoint.referer.as_deref(), Some("https://feed.example.com/"));
        assert_eq!(endpoint.layout.buy_field, "alis");
        assert_eq!(endpoint.layout.items_pointer, "/data");
        assert!(config.sources[0].endpoint.is_none());
    }

    #[test]
    fn test_overlay_rejects_bad_values() {
        let err = AggregatorConfig::default()
            .overlay(lookup(&[("RATES_REFRESH_INTERVAL_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = AggregatorConfig::default()
            .overlay(lookup(&[("RATES_BRIDGEFEED_URL", "not a url")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));

        let err = AggregatorConfig::default()
            .overlay(lookup(&[("RATES_FETCH_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroDuration("fetch_timeout"));
    }

    #[test]
    fn test_validate_source_set() {
        let mut config = AggregatorConfig::default();
        config.sources.push(SourceConfig::new("Primary"));
        assert_eq!(config.validate(), Err(ConfigError::DuplicateSource("Primary".into())));

        config.sources = vec![SourceConfig::new("Bad Name")];
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSourceName(_))));

        config.sources.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoSources));

        let config = AggregatorConfig {
            utc_offset_hours: 30,
            ..AggregatorConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::OffsetOutOfRange(30)));
    }
}
