use rollup_common::UnixTimestamp;
use serde::{Deserialize, Serialize};

use crate::store::TrimCutoffs;

/// The longest time raw entries and values are kept, in seconds.
///
/// A configured `keep` beyond this limit has no effect.
pub const MAX_KEEP: u64 = 7 * 24 * 60 * 60;

/// Retention of raw rows.
///
/// Aggregate buckets are not affected by `keep`: a bucket is deleted once it ages out of its own
/// period's window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// How long raw entries and values are kept, in seconds. Defaults to seven days.
    pub keep: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { keep: MAX_KEEP }
    }
}

impl RetentionConfig {
    /// Returns the deletion thresholds of a sweep running at `now`.
    ///
    /// The raw cutoff is the later of `now - keep` and `now - MAX_KEEP`. Cutoffs before the epoch
    /// delete nothing.
    pub fn cutoffs(&self, now: UnixTimestamp) -> TrimCutoffs {
        let raw = std::cmp::max(
            now.checked_sub_secs(self.keep),
            now.checked_sub_secs(MAX_KEEP),
        );

        TrimCutoffs { now, raw }
    }
}
