//! Quote source adapters

pub mod errors;
pub mod http_feed;
pub mod types;

pub use errors::{ErrorKind, FetchError, FetchResult};
pub use http_feed::{HttpJsonAdapter, RetryPolicy};
pub use types::{FeedEndpoint, FeedLayout, IncomingQuote, RawValue, SourceConfig, SourceName};

use async_trait::async_trait;

/// Fetches the current quotes of one upstream.
///
/// Implementations own every transport concern (headers, retries, payload
/// parsing) and never touch the snapshot.
#[async_trait]
pub trait QuoteAdapter: Send + Sync {
    async fn fetch(&self, source: &SourceConfig) -> FetchResult<Vec<IncomingQuote>>;
    fn name(&self) -> &str;
}
