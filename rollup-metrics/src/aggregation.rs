//! The merge algebra shared by the digest, the stores and the query composer.

use std::collections::BTreeMap;

use rollup_common::UnixTimestamp;

use crate::bucket::Period;
use crate::protocol::{AggregateKind, Entry};
use crate::store::AggregateRow;

/// A partially aggregated value together with the number of samples it represents.
///
/// Partials of the same kind form a commutative monoid under [`Partial::merge`] with
/// [`Partial::EMPTY`] as the identity. The sample count is tracked for every kind since it is
/// needed to merge averages.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Partial {
    /// The aggregated value.
    pub value: f64,
    /// Number of samples merged into the value.
    pub count: u64,
}

impl Partial {
    /// The identity element, representing no samples.
    pub const EMPTY: Self = Self {
        value: 0.0,
        count: 0,
    };

    /// Creates a partial from an aggregated value and its sample count.
    pub fn new(value: f64, count: u64) -> Self {
        Self { value, count }
    }

    /// Seeds a partial from a single sample.
    ///
    /// Returns `None` if the kind requires a value and the sample has none.
    pub fn seed(kind: AggregateKind, value: Option<i64>) -> Option<Self> {
        match kind {
            AggregateKind::Count => Some(Self::new(1.0, 1)),
            _ => value.map(|value| Self::new(value as f64, 1)),
        }
    }

    /// Merges two partials of the same kind.
    #[must_use]
    pub fn merge(self, kind: AggregateKind, other: Self) -> Self {
        if other.count == 0 {
            return self;
        }
        if self.count == 0 {
            return other;
        }

        let count = self.count + other.count;
        let value = match kind {
            AggregateKind::Count | AggregateKind::Sum => self.value + other.value,
            AggregateKind::Min => self.value.min(other.value),
            AggregateKind::Max => self.value.max(other.value),
            AggregateKind::Avg => {
                (self.value * self.count as f64 + other.value * other.count as f64) / count as f64
            }
        };

        Self { value, count }
    }
}

/// Merges a sequence of partials of the same kind.
pub fn merge_all(kind: AggregateKind, partials: impl IntoIterator<Item = Partial>) -> Partial {
    partials
        .into_iter()
        .fold(Partial::EMPTY, |acc, partial| acc.merge(kind, partial))
}

/// The identity of an aggregate row, in the order of the uniqueness constraint.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AggregateKey {
    /// Start of the bucket.
    pub bucket: UnixTimestamp,
    /// The period the bucket belongs to.
    pub period: Period,
    /// Sample type.
    pub ty: String,
    /// Aggregation kind.
    pub kind: AggregateKind,
    /// Digest of the sample key.
    pub key_hash: String,
}

impl AggregateKey {
    /// Returns the key of an aggregate row.
    pub fn of(row: &AggregateRow) -> Self {
        Self {
            bucket: row.bucket,
            period: row.period,
            ty: row.ty.clone(),
            kind: row.kind,
            key_hash: row.key_hash.clone(),
        }
    }
}

/// Merges entries into one aggregate row per bucket, period, type, kind and key.
///
/// For every period that still covers the entry's timestamp at `now`, the entry contributes to
/// each of its requested aggregations. Entries missing a value for a value-based aggregation do
/// not contribute to that aggregation.
pub fn preaggregate<'a>(
    entries: impl IntoIterator<Item = &'a Entry>,
    periods: &[Period],
    now: UnixTimestamp,
) -> Vec<AggregateRow> {
    let mut merged: BTreeMap<AggregateKey, (String, Partial)> = BTreeMap::new();

    for entry in entries {
        let hash = entry.key_hash();

        for &period in periods {
            if !period.covers(entry.timestamp, now) {
                continue;
            }

            let bucket = period.bucket(entry.timestamp);
            for kind in entry.aggregations {
                let Some(partial) = Partial::seed(kind, entry.value) else {
                    continue;
                };

                let key = AggregateKey {
                    bucket,
                    period,
                    ty: entry.ty.clone(),
                    kind,
                    key_hash: hash.clone(),
                };

                merged
                    .entry(key)
                    .and_modify(|(_, existing)| *existing = existing.merge(kind, partial))
                    .or_insert_with(|| (entry.key.clone(), partial));
            }
        }
    }

    merged
        .into_iter()
        .map(|(key, (sample_key, partial))| AggregateRow {
            bucket: key.bucket,
            period: key.period,
            ty: key.ty,
            key: sample_key,
            key_hash: key.key_hash,
            kind: key.kind,
            value: partial.value,
            count: partial.count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use enumset::EnumSet;

    use super::*;

    const KINDS: [AggregateKind; 5] = [
        AggregateKind::Count,
        AggregateKind::Min,
        AggregateKind::Max,
        AggregateKind::Sum,
        AggregateKind::Avg,
    ];

    fn entry(ts: u64, key: &str, value: i64) -> Entry {
        let mut entry = Entry::new("slow_query", key, Some(value)).at(UnixTimestamp::from_secs(ts));
        entry.aggregations = EnumSet::all();
        entry
    }

    #[test]
    fn test_merge_identity() {
        let row = Partial::new(42.5, 7);
        for kind in KINDS {
            assert_eq!(row.merge(kind, Partial::EMPTY), row, "{kind}");
            assert_eq!(Partial::EMPTY.merge(kind, row), row, "{kind}");
        }
    }

    #[test]
    fn test_merge_per_kind() {
        let a = Partial::new(10.0, 2);
        let b = Partial::new(4.0, 1);
        assert_eq!(a.merge(AggregateKind::Count, b), Partial::new(14.0, 3));
        assert_eq!(a.merge(AggregateKind::Sum, b), Partial::new(14.0, 3));
        assert_eq!(a.merge(AggregateKind::Min, b), Partial::new(4.0, 3));
        assert_eq!(a.merge(AggregateKind::Max, b), Partial::new(10.0, 3));
        assert_eq!(a.merge(AggregateKind::Avg, b), Partial::new(8.0, 3));
    }

    #[test]
    fn test_avg_is_associative() {
        let values = [3, 8, 1, 9, 4, 12, 7];
        let mean = values.iter().sum::<i64>() as f64 / values.len() as f64;

        for split in 1..values.len() {
            let (left, right) = values.split_at(split);
            let left = merge_all(
                AggregateKind::Avg,
                left.iter().filter_map(|v| Partial::seed(AggregateKind::Avg, Some(*v))),
            );
            let right = merge_all(
                AggregateKind::Avg,
                right.iter().filter_map(|v| Partial::seed(AggregateKind::Avg, Some(*v))),
            );

            let merged = left.merge(AggregateKind::Avg, right);
            assert!((merged.value - mean).abs() < 1e-9, "split at {split}");
            assert_eq!(merged.count, values.len() as u64);
        }
    }

    #[test]
    fn test_preaggregate_groups_by_bucket() {
        let hour = Period::from_minutes(60);
        let entries = [
            entry(10, "a", 5),
            entry(50, "a", 1),
            entry(70, "a", 9),
            entry(20, "b", 2),
        ];

        let rows = preaggregate(&entries, &[hour], UnixTimestamp::from_secs(100));
        let mut counts: Vec<_> = rows
            .iter()
            .filter(|row| row.kind == AggregateKind::Count)
            .map(|row| (row.bucket.as_secs(), row.key.as_str(), row.value, row.count))
            .collect();
        counts.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        assert_eq!(
            counts,
            [(0, "a", 2.0, 2), (0, "b", 1.0, 1), (60, "a", 1.0, 1)]
        );

        let min_a = rows
            .iter()
            .find(|row| row.kind == AggregateKind::Min && row.key == "a" && row.bucket.as_secs() == 0)
            .unwrap();
        assert_eq!((min_a.value, min_a.count), (1.0, 2));

        let avg_a = rows
            .iter()
            .find(|row| row.kind == AggregateKind::Avg && row.key == "a" && row.bucket.as_secs() == 0)
            .unwrap();
        assert_eq!((avg_a.value, avg_a.count), (3.0, 2));
    }

    #[test]
    fn test_preaggregate_skips_expired_periods() {
        let hour = Period::from_minutes(60);
        let day = Period::from_minutes(1440);
        let entries = [entry(100, "a", 1)];

        // An hour and a bit later, the sample only lands in the daily period.
        let rows = preaggregate(&entries, &[hour, day], UnixTimestamp::from_secs(3701));
        assert!(rows.iter().all(|row| row.period == day));
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].bucket, UnixTimestamp::from_secs(0));
    }

    #[test]
    fn test_preaggregate_skips_missing_values() {
        let mut entry = Entry::new("cache", "users", None).at(UnixTimestamp::from_secs(5));
        entry.aggregations = AggregateKind::Count | AggregateKind::Sum;

        let rows = preaggregate([&entry], &[Period::from_minutes(60)], UnixTimestamp::from_secs(5));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, AggregateKind::Count);
    }
}
