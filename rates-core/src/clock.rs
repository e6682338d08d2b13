//! Wall-clock access for record and snapshot timestamps

use chrono::{DateTime, FixedOffset, Offset, Utc};
use parking_lot::RwLock;

/// Format of `buyUpdatedAt` / `sellUpdatedAt` and their previous values
pub const RATE_TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;

    /// Current time in the record timestamp format
    fn rate_timestamp(&self) -> String {
        self.now().format(RATE_TIMESTAMP_FORMAT).to_string()
    }
}

/// System time shifted to a fixed UTC offset
#[derive(Clone, Debug)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Returns `None` when the offset is outside +/-23 hours
    pub fn with_offset_hours(hours: i32) -> Option<Self> {
        hours.checked_mul(3600).and_then(FixedOffset::east_opt).map(Self::new)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(Utc.fix())
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    current: RwLock<DateTime<FixedOffset>>,
}

impl ManualClock {
    pub fn new(start: DateTime<FixedOffset>) -> Self {
        Self {
            current: RwLock::new(start),
        }
    }

    pub fn set(&self, time: DateTime<FixedOffset>) {
        *self.current.write() = time;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut current = self.current.write();
        *current += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.current.read()
    }
}
