//! Snapshot document model and tolerant decoding of persisted shapes

use crate::normalizer::normalize;
use crate::reconciler::{RateMap, RateRecord};
use crate::sources::{RawValue, SourceName};
use chrono::{DateTime, FixedOffset};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

/// Every configured source's records at one point in time
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub generated_at: Option<DateTime<FixedOffset>>,
    pub cache_ttl_seconds: u64,
    sources: Vec<(SourceName, RateMap)>,
}

impl Snapshot {
    pub fn new(
        generated_at: Option<DateTime<FixedOffset>>,
        cache_ttl_seconds: u64,
        sources: Vec<(SourceName, RateMap)>,
    ) -> Self {
        Self {
            generated_at,
            cache_ttl_seconds,
            sources,
        }
    }

    /// All sources present with no records and no generation time
    pub fn empty(sources: &[SourceName], cache_ttl_seconds: u64) -> Self {
        Self::new(
            None,
            cache_ttl_seconds,
            sources.iter().map(|name| (name.clone(), RateMap::new())).collect(),
        )
    }

    pub fn source(&self, name: &str) -> Option<&RateMap> {
        self.sources
            .iter()
            .find(|(source, _)| source.as_str() == name)
            .map(|(_, map)| map)
    }

    pub fn sources(&self) -> impl Iterator<Item = (&SourceName, &RateMap)> {
        self.sources.iter().map(|(name, map)| (name, map))
    }

    pub fn source_names(&self) -> Vec<&SourceName> {
        self.sources.iter().map(|(name, _)| name).collect()
    }

    pub fn total_records(&self) -> usize {
        self.sources.iter().map(|(_, map)| map.len()).sum()
    }

    /// A snapshot never generated, or generated more than its TTL ago
    pub fn is_stale(&self, now: DateTime<FixedOffset>) -> bool {
        match self.generated_at {
            Some(generated_at) => {
                (now - generated_at).num_seconds() >= self.cache_ttl_seconds as i64
            }
            None => true,
        }
    }

    /// Decode any persisted shape.
    ///
    /// Accepts the `{meta, data}` document, documents with the sources
    /// hoisted to the top level, and per-source arrays of records. Only the
    /// given sources are kept; the TTL always comes from the caller.
    pub fn from_document(document: &Value, sources: &[SourceName], cache_ttl_seconds: u64) -> Self {
        let root = match document.as_object() {
            Some(root) => root,
            None => {
                warn!("snapshot document is not an object, starting empty");
                return Self::empty(sources, cache_ttl_seconds);
            }
        };

        let data = match root.get("data") {
            Some(Value::Object(data)) => data,
            _ => root,
        };

        let generated_at = root
            .get("meta")
            .and_then(|meta| meta.get("generatedAt"))
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok());

        let maps = sources
            .iter()
            .map(|name| {
                let map = data
                    .get(name.as_str())
                    .map(|value| decode_source(name, value))
                    .unwrap_or_default();
                (name.clone(), map)
            })
            .collect();

        Self::new(generated_at, cache_ttl_seconds, maps)
    }
}

fn decode_source(name: &SourceName, value: &Value) -> RateMap {
    let mut map = RateMap::new();
    match value {
        Value::Object(entries) => {
            for (key, entry) in entries {
                if let Some(record) = decode_record(key, entry) {
                    map.insert(record.code.clone(), record);
                }
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                if let Some(record) = decode_record("", entry) {
                    map.insert(record.code.clone(), record);
                }
            }
        }
        Value::Null => {}
        _ => warn!(source = %name, "unexpected source shape in snapshot, ignoring"),
    }
    map
}

fn decode_record(key: &str, entry: &Value) -> Option<RateRecord> {
    let fields = entry.as_object()?;
    let code = text(fields, "code").unwrap_or_else(|| key.trim().to_string());
    if code.is_empty() {
        return None;
    }

    Some(RateRecord {
        name: text(fields, "name").unwrap_or_default(),
        buy: normalize(&RawValue::from(fields.get("buy"))),
        buy_updated_at: text(fields, "buyUpdatedAt").unwrap_or_default(),
        sell: normalize(&RawValue::from(fields.get("sell"))),
        sell_updated_at: text(fields, "sellUpdatedAt").unwrap_or_default(),
        previous_buy: previous_price(fields, "previousBuy"),
        previous_buy_at: text(fields, "previousBuyAt"),
        previous_sell: previous_price(fields, "previousSell"),
        previous_sell_at: text(fields, "previousSellAt"),
        code,
    })
}

fn text(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn previous_price(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key) {
        None | Some(Value::Null) => None,
        Some(value) => Some(normalize(&RawValue::from(value))),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaDocument<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    generated_at: Option<String>,
    cache_ttl_seconds: u64,
    sources: Vec<&'a str>,
}

struct DataDocument<'a>(&'a [(SourceName, RateMap)]);

impl Serialize for DataDocument<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, records) in self.0 {
            map.serialize_entry(name.as_str(), records)?;
        }
        map.end()
    }
}

#[derive(Serialize)]
struct SnapshotDocument<'a> {
    meta: MetaDocument<'a>,
    data: DataDocument<'a>,
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SnapshotDocument {
            meta: MetaDocument {
                generated_at: self.generated_at.map(|t| t.to_rfc3339()),
                cache_ttl_seconds: self.cache_ttl_seconds,
                sources: self.sources.iter().map(|(name, _)| name.as_str()).collect(),
            },
            data: DataDocument(&self.sources),
        }
        .serialize(serializer)
    }
}
