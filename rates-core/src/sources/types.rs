//! Source and quote data types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Name of an upstream quote provider ("Primary", "GoldFeed", ...)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceName(pub String);

impl SourceName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn validate(&self) -> bool {
        !self.0.trim().is_empty()
            && self.0.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Upper-case form used for per-source environment variables
    pub fn env_key(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect()
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A price exactly as an upstream delivered it
#[derive(Clone, Debug, PartialEq, Default)]
pub enum RawValue {
    #[default]
    Absent,
    Null,
    Number(f64),
    Text(String),
}

impl From<&Value> for RawValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => RawValue::Null,
            Value::Number(n) => n.as_f64().map(RawValue::Number).unwrap_or(RawValue::Null),
            Value::String(s) => RawValue::Text(s.clone()),
            Value::Bool(_) | Value::Array(_) | Value::Object(_) => RawValue::Null,
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Text(s)
    }
}

impl From<f64> for RawValue {
    fn from(n: f64) -> Self {
        RawValue::Number(n)
    }
}

/// `None` means the field was missing upstream
impl<T: Into<RawValue>> From<Option<T>> for RawValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(RawValue::Absent)
    }
}

/// Normalized quote handed over by an adapter
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingQuote {
    pub code: String,
    pub name: String,
    pub buy: RawValue,
    pub sell: RawValue,
}

impl IncomingQuote {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        buy: impl Into<RawValue>,
        sell: impl Into<RawValue>,
    ) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            buy: buy.into(),
            sell: sell.into(),
        }
    }
}

/// Where and how a JSON feed publishes its quotes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedLayout {
    /// JSON pointer to the quote collection; empty means the document root
    pub items_pointer: String,
    pub code_field: String,
    pub name_field: String,
    pub buy_field: String,
    pub sell_field: String,
}

impl Default for FeedLayout {
    fn default() -> Self {
        Self {
            items_pointer: "/data".to_string(),
            code_field: "code".to_string(),
            name_field: "name".to_string(),
            buy_field: "buy".to_string(),
            sell_field: "sell".to_string(),
        }
    }
}

/// HTTP endpoint of a feed source
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedEndpoint {
    pub url: String,
    pub referer: Option<String>,
    pub layout: FeedLayout,
}

impl FeedEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referer: None,
            layout: FeedLayout::default(),
        }
    }
}

/// Static description of one configured source
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: SourceName,
    /// Repair mis-encoded display names coming from this source
    pub fix_names: bool,
    pub endpoint: Option<FeedEndpoint>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: SourceName::new(name),
            fix_names: false,
            endpoint: None,
        }
    }

    pub fn with_fix_names(mut self, fix_names: bool) -> Self {
        self.fix_names = fix_names;
        self
    }

    pub fn with_endpoint(mut self, endpoint: FeedEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }
}
