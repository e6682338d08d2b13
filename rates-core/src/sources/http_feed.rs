//! JSON-over-HTTP quote feed adapter

use super::{FeedEndpoint, FeedLayout, FetchError, FetchResult, IncomingQuote, QuoteAdapter, RawValue, SourceConfig};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, REFERER, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; rates-aggregator)";
const DEFAULT_ACCEPT: &str = "application/json,text/plain,*/*";
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_millis(100);

/// Retry behaviour for one fetch
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub tries: u32,
    pub request_timeout: Duration,
    /// Multiplied by the attempt number after an HTTP 429
    pub rate_limit_backoff: Duration,
    /// Multiplied by the attempt number after a transport error
    pub error_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: 3,
            request_timeout: Duration::from_secs(8),
            rate_limit_backoff: Duration::from_millis(1500),
            error_backoff: Duration::from_millis(800),
        }
    }
}

impl RetryPolicy {
    /// Longest total sleep between attempts, assuming every attempt backs off
    fn backoff_total(&self) -> Duration {
        let tries = self.tries.max(1);
        let longest = self.rate_limit_backoff.max(self.error_backoff);
        longest * (tries * (tries - 1) / 2)
    }

    /// Upper bound on one `fetch`: every request times out and every gap backs off
    pub fn worst_case(&self) -> Duration {
        self.request_timeout * self.tries.max(1) + self.backoff_total()
    }

    /// Shrink this policy so `worst_case()` stays within `budget`.
    ///
    /// Drops tries whose backoff alone would exhaust the budget, then splits
    /// what remains between the requests. Never raises the request timeout
    /// and never goes below 100 ms per request.
    pub fn fitted_to(&self, budget: Duration) -> Self {
        let mut fitted = self.clone();
        fitted.tries = self.tries.max(1);
        while fitted.tries > 1 && fitted.backoff_total() >= budget {
            fitted.tries -= 1;
        }

        let per_request = budget.saturating_sub(fitted.backoff_total()) / fitted.tries;
        fitted.request_timeout = self.request_timeout.min(per_request).max(MIN_REQUEST_TIMEOUT);
        fitted
    }
}

/// Adapter for feeds publishing quotes as a JSON object or array.
///
/// The endpoint and payload layout come from the source's config, so a
/// single adapter can serve several feed sources.
#[derive(Clone, Debug)]
pub struct HttpJsonAdapter {
    client: Client,
    retry: RetryPolicy,
}

impl HttpJsonAdapter {
    pub fn new(retry: RetryPolicy) -> FetchResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(retry.request_timeout)
            .build()
            .map_err(|e| FetchError::Unavailable { message: e.to_string() })?;

        Ok(Self { client, retry })
    }

    async fn fetch_document(&self, endpoint: &FeedEndpoint) -> FetchResult<Value> {
        let mut last_error = FetchError::Unavailable {
            message: "no attempt made".to_string(),
        };

        let tries = self.retry.tries.max(1);
        for attempt in 1..=tries {
            let mut request = self.client.get(&endpoint.url);
            if let Some(referer) = &endpoint.referer {
                request = request.header(REFERER, referer);
            }

            match request.send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    let body = response.text().await?;
                    return Ok(serde_json::from_str(&body)?);
                }
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    debug!(url = %endpoint.url, attempt, "rate limited, backing off");
                    last_error = FetchError::RateLimited;
                    if attempt < tries {
                        tokio::time::sleep(self.retry.rate_limit_backoff * attempt).await;
                    }
                }
                Ok(response) => {
                    // retried immediately, no backoff
                    last_error = FetchError::Http {
                        status: response.status().as_u16(),
                    };
                }
                Err(e) => {
                    last_error = if e.is_timeout() {
                        FetchError::Timeout {
                            seconds: self.retry.request_timeout.as_secs(),
                        }
                    } else {
                        e.into()
                    };
                    debug!(url = %endpoint.url, attempt, error = %last_error, "request failed");
                    if attempt < tries {
                        tokio::time::sleep(self.retry.error_backoff * attempt).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Convert a feed document into incoming quotes.
    ///
    /// The collection may be an object keyed by code or an array of entries
    /// carrying their own code field.
    pub fn parse_quotes(document: &Value, layout: &FeedLayout) -> FetchResult<Vec<IncomingQuote>> {
        let items = if layout.items_pointer.is_empty() {
            document
        } else {
            document
                .pointer(&layout.items_pointer)
                .ok_or_else(|| FetchError::Parse(format!("no quote collection at {}", layout.items_pointer)))?
        };

        let mut quotes = Vec::new();
        match items {
            Value::Object(entries) => {
                for (key, entry) in entries {
                    if !entry.is_object() {
                        continue;
                    }
                    let code = text_field(entry, &layout.code_field).unwrap_or_else(|| key.clone());
                    quotes.push(quote_from_entry(code, entry, layout));
                }
            }
            Value::Array(entries) => {
                for entry in entries {
                    match text_field(entry, &layout.code_field) {
                        Some(code) => quotes.push(quote_from_entry(code, entry, layout)),
                        None => debug!("skipping feed entry without {}", layout.code_field),
                    }
                }
            }
            _ => {
                return Err(FetchError::Parse(format!(
                    "quote collection at '{}' is neither an object nor an array",
                    layout.items_pointer
                )))
            }
        }

        Ok(quotes)
    }
}

#[async_trait]
impl QuoteAdapter for HttpJsonAdapter {
    async fn fetch(&self, source: &SourceConfig) -> FetchResult<Vec<IncomingQuote>> {
        let endpoint = source.endpoint.as_ref().ok_or_else(|| FetchError::Unavailable {
            message: format!("{} has no feed endpoint configured", source.name),
        })?;

        let document = self.fetch_document(endpoint).await?;
        let quotes = Self::parse_quotes(&document, &endpoint.layout)?;
        if quotes.is_empty() {
            warn!(source = %source.name, "feed returned no quotes");
        }
        Ok(quotes)
    }

    fn name(&self) -> &str {
        "http-json"
    }
}

fn quote_from_entry(code: String, entry: &Value, layout: &FeedLayout) -> IncomingQuote {
    IncomingQuote {
        code,
        name: text_field(entry, &layout.name_field).unwrap_or_default(),
        buy: RawValue::from(entry.get(&layout.buy_field)),
        sell: RawValue::from(entry.get(&layout.sell_field)),
    }
}

fn text_field(entry: &Value, field: &str) -> Option<String> {
    match entry.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use warp::Filter;

    fn gold_layout() -> FeedLayout {
        FeedLayout {
            items_pointer: "/data".into(),
            code_field: "code".into(),
            name_field: "name".into(),
            buy_field: "alis".into(),
            sell_field: "satis".into(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            tries: 3,
            request_timeout: Duration::from_secs(2),
            rate_limit_backoff: Duration::from_millis(5),
            error_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_parse_object_keyed_feed() {
        let doc = json!({
            "meta": {"time": 1},
            "data": {
                "ALTIN": {"code": "ALTIN", "alis": "2450.10", "satis": 2460.5},
                "USDTRY": {"alis": null, "satis": "34.20", "name": "Dolar"},
                "junk": 5
            }
        });

        let quotes = HttpJsonAdapter::parse_quotes(&doc, &gold_layout()).unwrap();
        assert_eq!(quotes.len(), 2);

        let usd = quotes.iter().find(|q| q.code == "USDTRY").unwrap();
        assert_eq!(usd.buy, RawValue::Null);
        assert_eq!(usd.sell, RawValue::Text("34.20".into()));
        assert_eq!(usd.name, "Dolar");

        let gold = quotes.iter().find(|q| q.code == "ALTIN").unwrap();
        assert_eq!(gold.sell, RawValue::Number(2460.5));
        assert_eq!(gold.name, "");
    }

    #[test]
    fn test_parse_array_feed() {
        let layout = FeedLayout {
            items_pointer: String::new(),
            ..FeedLayout::default()
        };
        let doc = json!([
            {"code": "EUR", "name": "Euro", "buy": "35.1", "sell": "35.3"},
            {"name": "no code"},
            {"code": 840, "buy": 31.1}
        ]);

        let quotes = HttpJsonAdapter::parse_quotes(&doc, &layout).unwrap();
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[1].code, "840");
        assert_eq!(quotes[1].sell, RawValue::Absent);
    }

    #[test]
    fn test_parse_rejects_missing_collection() {
        let doc = json!({"items": []});
        let err = HttpJsonAdapter::parse_quotes(&doc, &gold_layout()).unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));

        let scalar = json!({"data": "maintenance"});
        assert!(HttpJsonAdapter::parse_quotes(&scalar, &gold_layout()).is_err());
    }

    #[tokio::test]
    async fn test_fetch_retries_after_rate_limit() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let route = warp::path!("feed").map(move || {
            let status = if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                warp::http::StatusCode::TOO_MANY_REQUESTS
            } else {
                warp::http::StatusCode::OK
            };
            warp::reply::with_status(
                warp::reply::json(&json!({"data": {"USD": {"alis": "31.1", "satis": "31.3"}}})),
                status,
            )
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let source = SourceConfig::new("GoldFeed").with_endpoint(FeedEndpoint {
            url: format!("http://{}/feed", addr),
            referer: Some("https://example.com/".into()),
            layout: gold_layout(),
        });
        let adapter = HttpJsonAdapter::new(fast_retry()).unwrap();

        let quotes = adapter.fetch(&source).await.unwrap();
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].buy, RawValue::Text("31.1".into()));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_with_last_status() {
        let route = warp::path!("feed").map(|| {
            warp::reply::with_status("down", warp::http::StatusCode::SERVICE_UNAVAILABLE)
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let source = SourceConfig::new("BridgeFeed")
            .with_endpoint(FeedEndpoint::new(format!("http://{}/feed", addr)));
        let adapter = HttpJsonAdapter::new(fast_retry()).unwrap();

        let err = adapter.fetch(&source).await.unwrap_err();
        assert_eq!(err, FetchError::Http { status: 503 });
    }

    #[test]
    fn test_retry_policy_fits_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.worst_case(), Duration::from_millis(28_500));

        // Already fits: untouched
        let roomy = policy.fitted_to(Duration::from_secs(30));
        assert_eq!(roomy.tries, 3);
        assert_eq!(roomy.request_timeout, Duration::from_secs(8));

        let tight = policy.fitted_to(Duration::from_secs(10));
        assert_eq!(tight.tries, 3);
        assert!(tight.request_timeout < Duration::from_secs(2));
        assert!(tight.worst_case() <= Duration::from_secs(10));

        // Backoff alone exceeds the budget: fewer tries
        let cramped = policy.fitted_to(Duration::from_secs(2));
        assert_eq!(cramped.tries, 2);
        assert!(cramped.worst_case() <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_final_attempt_does_not_back_off() {
        let route = warp::path!("feed").map(|| {
            warp::reply::with_status("slow down", warp::http::StatusCode::TOO_MANY_REQUESTS)
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let source = SourceConfig::new("GoldFeed")
            .with_endpoint(FeedEndpoint::new(format!("http://{}/feed", addr)));
        let adapter = HttpJsonAdapter::new(RetryPolicy {
            tries: 1,
            request_timeout: Duration::from_secs(2),
            rate_limit_backoff: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
        })
        .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(3), adapter.fetch(&source))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, FetchError::RateLimited);
    }

    #[tokio::test]
    async fn test_fetch_without_endpoint_is_unavailable() {
        let adapter = HttpJsonAdapter::new(RetryPolicy::default()).unwrap();
        let err = adapter.fetch(&SourceConfig::new("Primary")).await.unwrap_err();
        assert!(matches!(err, FetchError::Unavailable { .. }));
    }
}
