//! Windowed queries over the rollup store.
//!
//! A query over the last `N` minutes is answered from the buckets of the [best
//! period](crate::best_period) for `N`. Buckets starting before the window are never read, so the
//! oldest part of the window that is not covered by a whole bucket is computed from raw entries
//! instead:
//!
//! ```text
//!   window_start         oldest_bucket                          now
//!        |<---- tail ---->|<-------------- buckets -------------->|
//! ```
//!
//! Both portions are merged with the aggregation algebra, which keeps `min`, `max` and `avg`
//! exact across the seam.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use enumset::EnumSet;
use rollup_common::UnixTimestamp;
use rollup_statsd::metric;
use serde::{Deserialize, Serialize};

use crate::aggregation::Partial;
use crate::bucket::{best_period, Period};
use crate::protocol::{AggregateKind, Value};
use crate::statsd::{RollupDistributions, RollupTimers};
use crate::storage::Storage;
use crate::store::{BucketFilter, EntryFilter, StoreError};

/// The default number of results returned by [`Query::aggregate`].
///
/// One more than a page of 100, so that callers can tell whether there are more results.
pub const DEFAULT_LIMIT: usize = 101;

/// Configuration of the [`Query`] composer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Number of slots in every series returned by [`Query::graph`].
    pub graph_points: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { graph_points: 60 }
    }
}

/// An error returned by a [`Query`].
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The storage has no periods to answer queries from.
    #[error("no rollup periods are configured")]
    NoPeriods,

    /// Reading from the rollup store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The sort direction of aggregate results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smallest values first.
    Asc,
    /// Largest values first.
    #[default]
    Desc,
}

/// Parameters of [`Query::aggregate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateQuery {
    ty: String,
    kinds: EnumSet<AggregateKind>,
    window_minutes: u32,
    order_by: Option<AggregateKind>,
    direction: Direction,
    limit: usize,
}

impl AggregateQuery {
    /// Aggregates `kinds` of a type over the last `window_minutes`.
    pub fn new(
        ty: impl Into<String>,
        kinds: impl Into<EnumSet<AggregateKind>>,
        window_minutes: u32,
    ) -> Self {
        Self {
            ty: ty.into(),
            kinds: kinds.into(),
            window_minutes,
            order_by: None,
            direction: Direction::default(),
            limit: DEFAULT_LIMIT,
        }
    }

    /// Sorts by the given kind instead of the first requested one.
    pub fn order_by(mut self, kind: AggregateKind) -> Self {
        self.order_by = Some(kind);
        self
    }

    /// Sets the sort direction.
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Sets the maximum number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// The aggregates of a single key.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AggregateResult {
    /// The sample key.
    pub key: String,
    /// The value of every requested kind that has samples.
    pub values: BTreeMap<AggregateKind, f64>,
}

/// One aggregate of a single key across several types.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TypesResult {
    /// The sample key.
    pub key: String,
    /// The value per type that has samples for this key.
    pub values: BTreeMap<String, f64>,
}

/// A series of evenly spaced bucket values, `None` where no bucket exists.
pub type Series = BTreeMap<UnixTimestamp, Option<f64>>;

/// Series per key and type, see [`Query::graph`].
pub type Graph = BTreeMap<String, BTreeMap<String, Series>>;

type Merged = BTreeMap<(String, String), BTreeMap<AggregateKind, Partial>>;

/// Composes windowed answers from aggregate buckets and raw entries.
#[derive(Clone, Debug)]
pub struct Query {
    storage: Storage,
    config: QueryConfig,
    now: Option<UnixTimestamp>,
}

impl Query {
    /// Creates a query composer reading from `storage`.
    pub fn new(storage: Storage, config: QueryConfig) -> Self {
        Self {
            storage,
            config,
            now: None,
        }
    }

    /// Returns a composer that answers all queries as of `now` instead of the current time.
    pub fn at(&self, now: UnixTimestamp) -> Self {
        Self {
            now: Some(now),
            ..self.clone()
        }
    }

    fn now(&self) -> UnixTimestamp {
        self.now.unwrap_or_else(UnixTimestamp::now)
    }

    fn period(&self, window_minutes: u32) -> Result<Period, QueryError> {
        best_period(self.storage.periods(), window_minutes).ok_or(QueryError::NoPeriods)
    }

    /// Merges buckets and the raw tail per type and key.
    async fn merged(
        &self,
        types: &[String],
        kinds: EnumSet<AggregateKind>,
        window_minutes: u32,
    ) -> Result<Merged, QueryError> {
        let mut merged = Merged::new();
        if types.is_empty() || kinds.is_empty() {
            return Ok(merged);
        }

        let period = self.period(window_minutes)?;
        let now = self.now();
        let window_start = window_start(now, window_minutes);
        let oldest_bucket = period.ceil_bucket(window_start);

        let store = self.storage.rollup_store();

        let filter = BucketFilter {
            period,
            types: types.to_vec(),
            kinds,
            from: oldest_bucket,
        };

        for row in store.aggregates(&filter).await? {
            let partial = merged
                .entry((row.ty, row.key))
                .or_default()
                .entry(row.kind)
                .or_insert(Partial::EMPTY);
            *partial = partial.merge(row.kind, Partial::new(row.value, row.count));
        }

        if window_start < oldest_bucket {
            let filter = EntryFilter {
                types: types.to_vec(),
                from: window_start,
                until: oldest_bucket,
            };

            let entries = store.entries(&filter).await?;
            metric!(distribution(RollupDistributions::QueryTailEntries) = entries.len() as u64);

            for entry in entries {
                let per_kind = merged.entry((entry.ty, entry.key)).or_default();
                for kind in kinds {
                    if let Some(seed) = Partial::seed(kind, entry.value) {
                        let partial = per_kind.entry(kind).or_insert(Partial::EMPTY);
                        *partial = partial.merge(kind, seed);
                    }
                }
            }
        }

        Ok(merged)
    }

    /// Aggregates one type per key over a window.
    ///
    /// Results are sorted by the `order_by` kind, keys without a value for that kind sort as the
    /// smallest. Keys with equal values keep their order by key.
    pub async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<AggregateResult>, QueryError> {
        let types = [query.ty.clone()];

        let merged = metric!(timer(RollupTimers::QueryDuration), query = "aggregate", {
            self.merged(&types, query.kinds, query.window_minutes).await?
        });

        let mut results: Vec<_> = merged
            .into_iter()
            .map(|((_, key), partials)| AggregateResult {
                key,
                values: partials
                    .into_iter()
                    .filter(|(_, partial)| partial.count > 0)
                    .map(|(kind, partial)| (kind, partial.value))
                    .collect(),
            })
            .collect();

        if let Some(order_by) = query.order_by.or_else(|| query.kinds.iter().next()) {
            sort_by_value(&mut results, query.direction, |result| {
                result.values.get(&order_by).copied()
            });
        }

        results.truncate(query.limit);
        Ok(results)
    }

    /// Aggregates one kind of several types per key over a window.
    ///
    /// Results are sorted by the value of the first type, largest first, and truncated to
    /// [`DEFAULT_LIMIT`].
    pub async fn aggregate_types(
        &self,
        types: &[String],
        kind: AggregateKind,
        window_minutes: u32,
    ) -> Result<Vec<TypesResult>, QueryError> {
        let merged = metric!(timer(RollupTimers::QueryDuration), query = "aggregate_types", {
            self.merged(types, kind.into(), window_minutes).await?
        });

        let mut by_key: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for ((ty, key), partials) in merged {
            if let Some(partial) = partials.get(&kind).filter(|partial| partial.count > 0) {
                by_key.entry(key).or_default().insert(ty, partial.value);
            }
        }

        let mut results: Vec<_> = by_key
            .into_iter()
            .map(|(key, values)| TypesResult { key, values })
            .collect();

        if let Some(first) = types.first() {
            sort_by_value(&mut results, Direction::Desc, |result| {
                result.values.get(first).copied()
            });
        }

        results.truncate(DEFAULT_LIMIT);
        Ok(results)
    }

    /// Aggregates one kind per type across all keys over a window.
    ///
    /// Types without samples in the window are omitted.
    pub async fn total(
        &self,
        types: &[String],
        kind: AggregateKind,
        window_minutes: u32,
    ) -> Result<BTreeMap<String, f64>, QueryError> {
        let merged = metric!(timer(RollupTimers::QueryDuration), query = "total", {
            self.merged(types, kind.into(), window_minutes).await?
        });

        let mut totals: BTreeMap<String, Partial> = BTreeMap::new();
        for ((ty, _), partials) in merged {
            if let Some(partial) = partials.get(&kind) {
                let total = totals.entry(ty).or_insert(Partial::EMPTY);
                *total = total.merge(kind, *partial);
            }
        }

        Ok(totals
            .into_iter()
            .filter(|(_, total)| total.count > 0)
            .map(|(ty, total)| (ty, total.value))
            .collect())
    }

    /// Returns a series of bucket values per key and type.
    ///
    /// Every series has up to [`QueryConfig::graph_points`] slots one bucket apart, the last
    /// being the bucket containing now. Slots never start before the oldest bucket within the
    /// window, so a window shorter than the configured points yields fewer slots. Every requested
    /// type is present for every key that has samples in any of them.
    pub async fn graph(
        &self,
        types: &[String],
        kind: AggregateKind,
        window_minutes: u32,
    ) -> Result<Graph, QueryError> {
        let period = self.period(window_minutes)?;
        let width = period.bucket_width().max(1);
        let points = self.config.graph_points as u64;

        let now = self.now();
        let last = period.bucket(now);
        let first = last
            .saturating_sub_secs(points.saturating_sub(1) * width)
            .max(period.ceil_bucket(window_start(now, window_minutes)))
            .min(last);
        let slots: Vec<_> = (0..points)
            .map(|index| first.add_secs(index * width))
            .take_while(|slot| *slot <= last)
            .collect();

        let filter = BucketFilter {
            period,
            types: types.to_vec(),
            kinds: kind.into(),
            from: first,
        };

        let rows = metric!(timer(RollupTimers::QueryDuration), query = "graph", {
            self.storage.rollup_store().aggregates(&filter).await?
        });

        let empty: Series = slots.iter().map(|slot| (*slot, None)).collect();
        let mut graph = Graph::new();

        for row in rows {
            let series = graph.entry(row.key).or_insert_with(|| {
                types
                    .iter()
                    .map(|ty| (ty.clone(), empty.clone()))
                    .collect()
            });

            if let Some(slot) = series.get_mut(&row.ty).and_then(|s| s.get_mut(&row.bucket)) {
                *slot = Some(row.value);
            }
        }

        Ok(graph)
    }

    /// Returns the latest values of a type, optionally restricted to some keys.
    pub async fn values(&self, ty: &str, keys: Option<&[String]>) -> Result<Vec<Value>, QueryError> {
        Ok(self.storage.values(ty, keys).await?)
    }
}

/// The first second inside a window of `window_minutes` ending at `now`.
fn window_start(now: UnixTimestamp, window_minutes: u32) -> UnixTimestamp {
    now.add_secs(1).saturating_sub_secs(u64::from(window_minutes) * 60)
}

/// Stable sort by an optional value, `None` sorting as the smallest.
fn sort_by_value<T>(items: &mut [T], direction: Direction, value: impl Fn(&T) -> Option<f64>) {
    items.sort_by(|a, b| {
        let ordering = match (value(a), value(b)) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };

        match direction {
            Direction::Asc => ordering,
            Direction::Desc => ordering.reverse(),
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::{Entry, Sample};
    use crate::retention::RetentionConfig;
    use crate::storage::StorageConfig;
    use crate::store::MemoryStore;

    const NOW: UnixTimestamp = UnixTimestamp::from_secs(10_000);

    fn ts(secs: u64) -> UnixTimestamp {
        UnixTimestamp::from_secs(secs)
    }

    fn types(types: &[&str]) -> Vec<String> {
        types.iter().map(|ty| (*ty).to_owned()).collect()
    }

    async fn query(samples: Vec<Sample>, config: QueryConfig) -> Query {
        let storage = Storage::new(
            Arc::new(MemoryStore::new()),
            StorageConfig::default(),
            RetentionConfig::default(),
        );
        storage.store(&samples, NOW).await;
        Query::new(storage, config).at(NOW)
    }

    fn request(key: &str, timestamp: u64, value: i64) -> Sample {
        Entry::new("slow_request", key, Some(value))
            .at(ts(timestamp))
            .count()
            .max()
            .sum()
            .into()
    }

    async fn requests() -> Query {
        let samples = vec![
            request("a", 9900, 10),
            request("a", 9910, 20),
            request("a", 9920, 30),
            request("b", 9900, 50),
            request("c", 9930, 5),
            request("c", 9990, 5),
            Entry::new("cache", "a", None).at(ts(9950)).count().into(),
            Entry::new("cache", "a", None).at(ts(9960)).count().into(),
            Entry::new("cache", "d", None).at(ts(9960)).count().into(),
        ];
        query(samples, QueryConfig::default()).await
    }

    fn keys(results: &[AggregateResult]) -> Vec<&str> {
        results.iter().map(|result| result.key.as_str()).collect()
    }

    #[tokio::test]
    async fn test_tail_and_buckets_are_stitched() {
        // The window starts at 6401, so the oldest bucket read is 6420 and the entry at 6405
        // only contributes through the raw tail.
        let query = query(
            vec![request("GET /", 6405, 5), request("GET /", 9990, 7)],
            QueryConfig::default(),
        )
        .await;

        let results = query
            .aggregate(&AggregateQuery::new("slow_request", AggregateKind::Sum | AggregateKind::Max, 60))
            .await
            .unwrap();

        similar_asserts::assert_eq!(
            results,
            vec![AggregateResult {
                key: "GET /".to_owned(),
                values: [(AggregateKind::Max, 7.0), (AggregateKind::Sum, 12.0)].into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_aggregate_sorting() {
        let query = requests().await;

        let results = query
            .aggregate(&AggregateQuery::new(
                "slow_request",
                AggregateKind::Count | AggregateKind::Max,
                60,
            ))
            .await
            .unwrap();
        assert_eq!(keys(&results), ["a", "c", "b"]);
        assert_eq!(results[0].values[&AggregateKind::Count], 3.0);
        assert_eq!(results[0].values[&AggregateKind::Max], 30.0);

        let results = query
            .aggregate(
                &AggregateQuery::new("slow_request", AggregateKind::Count | AggregateKind::Max, 60)
                    .order_by(AggregateKind::Max)
                    .direction(Direction::Asc)
                    .limit(2),
            )
            .await
            .unwrap();
        assert_eq!(keys(&results), ["c", "a"]);
    }

    #[tokio::test]
    async fn test_aggregate_uses_best_period() {
        let query = requests().await;

        // Two hours are answered from the six hour period with buckets of 360 seconds.
        let results = query
            .aggregate(&AggregateQuery::new("slow_request", AggregateKind::Sum, 120))
            .await
            .unwrap();
        let sums: Vec<_> = results
            .iter()
            .map(|result| (result.key.as_str(), result.values[&AggregateKind::Sum]))
            .collect();
        assert_eq!(sums, [("a", 60.0), ("b", 50.0), ("c", 10.0)]);
    }

    #[tokio::test]
    async fn test_total() {
        let query = requests().await;

        let totals = query
            .total(&types(&["slow_request", "cache", "unknown"]), AggregateKind::Count, 60)
            .await
            .unwrap();
        assert_eq!(
            totals,
            BTreeMap::from([("cache".to_owned(), 3.0), ("slow_request".to_owned(), 6.0)])
        );

        let totals = query
            .total(&types(&["slow_request"]), AggregateKind::Max, 60)
            .await
            .unwrap();
        assert_eq!(totals["slow_request"], 50.0);
    }

    #[tokio::test]
    async fn test_aggregate_types() {
        let query = requests().await;

        let results = query
            .aggregate_types(&types(&["slow_request", "cache"]), AggregateKind::Count, 60)
            .await
            .unwrap();

        let keys: Vec<_> = results.iter().map(|result| result.key.as_str()).collect();
        assert_eq!(keys, ["a", "c", "b", "d"]);
        assert_eq!(
            results[0].values,
            BTreeMap::from([("cache".to_owned(), 2.0), ("slow_request".to_owned(), 3.0)])
        );
    }

    #[tokio::test]
    async fn test_graph_is_padded() {
        let samples = vec![request("a", 9900, 1), request("a", 9910, 1), request("a", 9960, 1)];
        let query = query(samples, QueryConfig { graph_points: 3 }).await;

        let graph = query
            .graph(&types(&["slow_request", "cache"]), AggregateKind::Count, 60)
            .await
            .unwrap();

        let empty: Series = [(ts(9840), None), (ts(9900), None), (ts(9960), None)].into();
        let requests: Series = [(ts(9840), None), (ts(9900), Some(2.0)), (ts(9960), Some(1.0))].into();

        similar_asserts::assert_eq!(
            graph,
            Graph::from([(
                "a".to_owned(),
                BTreeMap::from([
                    ("cache".to_owned(), empty),
                    ("slow_request".to_owned(), requests),
                ])
            )])
        );
    }

    #[tokio::test]
    async fn test_graph_is_clipped_to_window() {
        let samples = vec![request("a", 9910, 1), request("b", 9850, 1)];
        let query = query(samples, QueryConfig { graph_points: 5 }).await;

        // The window starts at 9881 with 60 second buckets, so only two slots fit.
        let graph = query
            .graph(&types(&["slow_request"]), AggregateKind::Count, 2)
            .await
            .unwrap();

        let requests: Series = [(ts(9900), Some(1.0)), (ts(9960), None)].into();
        similar_asserts::assert_eq!(
            graph,
            Graph::from([(
                "a".to_owned(),
                BTreeMap::from([("slow_request".to_owned(), requests)])
            )])
        );
    }

    #[tokio::test]
    async fn test_no_periods() {
        let storage = Storage::new(
            Arc::new(MemoryStore::new()),
            StorageConfig {
                chunk_size: 10,
                periods: Vec::new(),
            },
            RetentionConfig::default(),
        );
        let query = Query::new(storage, QueryConfig::default());

        let result = query
            .aggregate(&AggregateQuery::new("slow_request", AggregateKind::Count, 60))
            .await;
        assert!(matches!(result, Err(QueryError::NoPeriods)));
    }
}
