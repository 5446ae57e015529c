use std::fmt;

use rollup_common::UnixTimestamp;
use serde::{Deserialize, Serialize};

/// Number of buckets that make up the window of every period.
pub const BUCKETS_PER_PERIOD: u64 = 60;

/// The default periods maintained in parallel: one hour, six hours, one day and seven days.
pub const DEFAULT_PERIODS: [Period; 4] = [
    Period::from_minutes(60),
    Period::from_minutes(360),
    Period::from_minutes(1440),
    Period::from_minutes(10080),
];

/// A rollup granularity.
///
/// A period is identified by the number of minutes its window covers, which is also the value
/// persisted in the `period` column. Every window is split into [`BUCKETS_PER_PERIOD`] buckets, so
/// the bucket width in seconds is numerically equal to the period:
///
/// ```
/// use rollup_common::UnixTimestamp;
/// use rollup_metrics::Period;
///
/// let hour = Period::from_minutes(60);
/// assert_eq!(hour.bucket_width(), 60);
/// assert_eq!(hour.window(), 3600);
/// assert_eq!(hour.bucket(UnixTimestamp::from_secs(119)), UnixTimestamp::from_secs(60));
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Period(u32);

impl Period {
    /// Creates a period covering the given number of minutes.
    pub const fn from_minutes(minutes: u32) -> Self {
        Self(minutes)
    }

    /// Returns the number of minutes covered, which is the persisted value.
    pub const fn as_minutes(self) -> u32 {
        self.0
    }

    /// Returns the width of a single bucket in seconds.
    pub const fn bucket_width(self) -> u64 {
        self.0 as u64 * 60 / BUCKETS_PER_PERIOD
    }

    /// Returns the length of the whole window in seconds.
    pub const fn window(self) -> u64 {
        self.0 as u64 * 60
    }

    /// Returns the start of the bucket containing `timestamp`.
    pub fn bucket(self, timestamp: UnixTimestamp) -> UnixTimestamp {
        let width = self.bucket_width().max(1);
        UnixTimestamp::from_secs(timestamp.as_secs() / width * width)
    }

    /// Returns the first bucket boundary at or after `timestamp`.
    pub fn ceil_bucket(self, timestamp: UnixTimestamp) -> UnixTimestamp {
        let width = self.bucket_width().max(1);
        UnixTimestamp::from_secs(timestamp.as_secs().div_ceil(width) * width)
    }

    /// Returns `true` if a sample taken at `timestamp` still lands in this period's window.
    pub fn covers(self, timestamp: UnixTimestamp, now: UnixTimestamp) -> bool {
        timestamp >= now.saturating_sub_secs(self.window())
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Picks the period used to answer a query over the last `window_minutes`.
///
/// This is the first period (in ascending order) whose window covers the requested one, or the
/// largest configured period if none does. Returns `None` if no periods are configured.
pub fn best_period(periods: &[Period], window_minutes: u32) -> Option<Period> {
    let mut sorted = periods.to_vec();
    sorted.sort_unstable();

    sorted
        .iter()
        .copied()
        .find(|period| window_minutes <= period.as_minutes())
        .or_else(|| sorted.last().copied())
}
