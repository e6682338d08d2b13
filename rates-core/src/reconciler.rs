//! Per-source merge of fetched quotes into persisted rate records
//!
//! A reconcile pass is a non-destructive merge: codes missing from the
//! incoming batch are carried over verbatim, and replaying the same batch
//! changes nothing. A price moving away from a real value keeps that value
//! as `previous*`; a price appearing where only the sentinel was known is a
//! first observation and leaves no previous value behind.

use crate::normalizer::{fix_encoding, is_sentinel, normalize, normalize_text, SENTINEL};
use crate::sources::IncomingQuote;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One source's records keyed by code
pub type RateMap = BTreeMap<String, RateRecord>;

/// Persisted state of one currency or metal code.
///
/// Field declaration order is the serialized order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateRecord {
    pub code: String,
    #[serde(default)]
    pub name: String,
    pub buy: String,
    #[serde(default)]
    pub buy_updated_at: String,
    pub sell: String,
    #[serde(default)]
    pub sell_updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_buy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_buy_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_sell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_sell_at: Option<String>,
}

impl RateRecord {
    /// Record for a code never seen before: both prices at the sentinel and
    /// no timestamps recorded
    pub fn unobserved(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: String::new(),
            buy: SENTINEL.to_string(),
            buy_updated_at: String::new(),
            sell: SENTINEL.to_string(),
            sell_updated_at: String::new(),
            previous_buy: None,
            previous_buy_at: None,
            previous_sell: None,
            previous_sell_at: None,
        }
    }

    pub fn price(&self, side: Side) -> &str {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    pub fn previous(&self, side: Side) -> Option<&str> {
        match side {
            Side::Buy => self.previous_buy.as_deref(),
            Side::Sell => self.previous_sell.as_deref(),
        }
    }

    fn field_mut(&mut self, side: Side) -> PriceField<'_> {
        match side {
            Side::Buy => PriceField {
                value: &mut self.buy,
                updated_at: &mut self.buy_updated_at,
                previous: &mut self.previous_buy,
                previous_at: &mut self.previous_buy_at,
            },
            Side::Sell => PriceField {
                value: &mut self.sell,
                updated_at: &mut self.sell_updated_at,
                previous: &mut self.previous_sell,
                previous_at: &mut self.previous_sell_at,
            },
        }
    }
}

struct PriceField<'a> {
    value: &'a mut String,
    updated_at: &'a mut String,
    previous: &'a mut Option<String>,
    previous_at: &'a mut Option<String>,
}

/// Quote side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// A price transition on an already known code
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PriceChange {
    pub code: String,
    pub side: Side,
    pub from: String,
    pub to: String,
}

/// What a reconcile pass did
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub inserted: usize,
    pub buy_changes: usize,
    pub sell_changes: usize,
    /// Existing codes absent from the batch, carried over untouched
    pub retained: usize,
    /// Quotes dropped for an empty code
    pub skipped: usize,
    /// Quotes shadowed by a later quote for the same code
    pub duplicates: usize,
    pub changes: Vec<PriceChange>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.changes.is_empty()
    }

    fn record(&mut self, change: PriceChange) {
        match change.side {
            Side::Buy => self.buy_changes += 1,
            Side::Sell => self.sell_changes += 1,
        }
        self.changes.push(change);
    }
}

/// Merged map plus change metadata
#[derive(Clone, Debug)]
pub struct Reconciliation {
    pub records: RateMap,
    pub report: ReconcileReport,
}

/// Merge one source's incoming quotes into its existing records.
///
/// `now` is stamped on every price touched by this pass. When the same code
/// appears more than once in `incoming`, the last quote wins.
pub fn reconcile(
    incoming: &[IncomingQuote],
    existing: &RateMap,
    fix_names: bool,
    now: &str,
) -> Reconciliation {
    let mut report = ReconcileReport::default();

    let mut batch: BTreeMap<&str, &IncomingQuote> = BTreeMap::new();
    for quote in incoming {
        let code = quote.code.trim();
        if code.is_empty() {
            report.skipped += 1;
            continue;
        }
        if batch.insert(code, quote).is_some() {
            report.duplicates += 1;
        }
    }

    let mut records = RateMap::new();
    for (code, quote) in batch {
        let prior = existing.get(code);
        let mut record = match prior {
            Some(record) => record.clone(),
            None => {
                report.inserted += 1;
                RateRecord::unobserved(code)
            }
        };

        for (side, raw) in [(Side::Buy, &quote.buy), (Side::Sell, &quote.sell)] {
            if let Some(change) = apply_price(&mut record, side, normalize(raw), prior.is_none(), now) {
                report.record(change);
            }
        }

        record.code = code.to_string();
        record.name = pick_name(quote, prior, fix_names);
        records.insert(code.to_string(), record);
    }

    for (code, record) in existing {
        if !records.contains_key(code) {
            records.insert(code.clone(), record.clone());
            report.retained += 1;
        }
    }

    Reconciliation { records, report }
}

/// Canonical map for a freshly fetched list with no prior state
pub fn quotes_to_map(incoming: &[IncomingQuote], fix_names: bool, now: &str) -> RateMap {
    reconcile(incoming, &RateMap::new(), fix_names, now).records
}

/// Apply one normalized incoming price. Returns the transition when a known
/// code's value actually moved.
fn apply_price(
    record: &mut RateRecord,
    side: Side,
    incoming: String,
    first_observation: bool,
    now: &str,
) -> Option<PriceChange> {
    let code = record.code.clone();
    let field = record.field_mut(side);
    let old = normalize_text(field.value.as_str());
    let never_stamped = field.updated_at.is_empty();

    if incoming == old && !first_observation && !never_stamped {
        return None;
    }

    let changed = incoming != old;
    if changed && !first_observation && !is_sentinel(&old) {
        let old_at = if never_stamped {
            now.to_string()
        } else {
            field.updated_at.clone()
        };
        *field.previous = Some(old.clone());
        *field.previous_at = Some(old_at);
    }

    *field.value = incoming.clone();
    *field.updated_at = now.to_string();

    (changed && !first_observation).then(|| PriceChange {
        code,
        side,
        from: old,
        to: incoming,
    })
}

fn pick_name(quote: &IncomingQuote, prior: Option<&RateRecord>, fix_names: bool) -> String {
    let incoming = quote.name.trim();
    let name = if incoming.is_empty() {
        prior.map(|r| r.name.as_str()).unwrap_or_default()
    } else {
        incoming
    };

    if fix_names {
        fix_encoding(name)
    } else {
        name.to_string()
    }
}
