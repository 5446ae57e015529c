use std::collections::btree_map::Entry as MapEntry;
use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use itertools::Itertools;
use rollup_common::UnixTimestamp;
use rollup_statsd::metric;
use serde::{Deserialize, Serialize};

use crate::aggregation::preaggregate;
use crate::bucket::{Period, DEFAULT_PERIODS};
use crate::protocol::{Entry, Sample, Value};
use crate::retention::RetentionConfig;
use crate::statsd::{RollupCounters, RollupTimers};
use crate::store::{RawEntryRow, RawValueRow, RollupStore, StoreError, TrimStats};

/// Configuration of how samples are persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Maximum number of rows written by a single statement.
    pub chunk_size: usize,
    /// Periods maintained in parallel, in minutes of coverage.
    pub periods: Vec<Period>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            periods: DEFAULT_PERIODS.to_vec(),
        }
    }
}

/// Number of rows written by [`Storage::store`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Raw entries inserted.
    pub entries: u64,
    /// Values upserted.
    pub values: u64,
    /// Aggregate rows inserted or merged.
    pub aggregates: u64,
}

impl StoreStats {
    /// Returns the number of rows written to all tables.
    pub fn total(&self) -> u64 {
        self.entries + self.values + self.aggregates
    }
}

/// Writes samples into a [`RollupStore`] and applies retention.
///
/// This is the only writer of aggregate rows. It is shared between the digest and the
/// transparent ingest queue, which writes samples right when they are recorded.
#[derive(Clone, Debug)]
pub struct Storage {
    store: Arc<dyn RollupStore>,
    config: StorageConfig,
    retention: RetentionConfig,
}

impl Storage {
    /// Creates a new storage facade over `store`.
    pub fn new(store: Arc<dyn RollupStore>, config: StorageConfig, retention: RetentionConfig) -> Self {
        Self {
            store,
            config,
            retention,
        }
    }

    /// Returns the underlying store.
    pub fn rollup_store(&self) -> &dyn RollupStore {
        self.store.as_ref()
    }

    /// Returns the configured periods.
    pub fn periods(&self) -> &[Period] {
        &self.config.periods
    }

    /// Persists a batch of samples as of `now`.
    ///
    /// Entries are written to raw storage unless they are `only_buckets`, and merged into the
    /// buckets of every period still covering them. Values are collapsed to the latest per type
    /// and key before they are upserted. A chunk that fails to be written is logged and skipped,
    /// so the returned counts only include rows that were written.
    pub async fn store(&self, samples: &[Sample], now: UnixTimestamp) -> StoreStats {
        let mut entries = Vec::new();
        let mut values = Vec::new();

        for sample in samples {
            match sample {
                Sample::Entry(entry) => entries.push(entry),
                Sample::Value(value) => values.push(value),
            }
        }

        StoreStats {
            entries: self.store_entries(&entries).await,
            values: self.store_values(&values).await,
            aggregates: self.store_aggregates(&entries, now).await,
        }
    }

    async fn store_entries(&self, entries: &[&Entry]) -> u64 {
        let rows: Vec<_> = entries
            .iter()
            .filter(|entry| !entry.only_buckets)
            .map(|entry| RawEntryRow::from(*entry))
            .collect();

        let mut written = 0;
        for chunk in rows.chunks(self.chunk_size()) {
            match self.store.insert_entries(chunk).await {
                Ok(()) => written += chunk.len() as u64,
                Err(err) => chunk_failed("entries", &err),
            }
        }

        metric!(counter(RollupCounters::RowsWritten) += written as i64, table = "entries");
        written
    }

    async fn store_values(&self, values: &[&Value]) -> u64 {
        let mut latest = BTreeMap::new();
        for value in values {
            match latest.entry((value.ty.as_str(), value.key.as_str())) {
                MapEntry::Vacant(slot) => {
                    slot.insert(*value);
                }
                MapEntry::Occupied(mut slot) => {
                    if value.timestamp >= slot.get().timestamp {
                        slot.insert(*value);
                    }
                }
            }
        }

        let rows: Vec<_> = latest.into_values().map(RawValueRow::from).collect();

        let mut written = 0;
        for chunk in rows.chunks(self.chunk_size()) {
            match self.store.upsert_values(chunk).await {
                Ok(()) => written += chunk.len() as u64,
                Err(err) => chunk_failed("values", &err),
            }
        }

        metric!(counter(RollupCounters::RowsWritten) += written as i64, table = "values");
        written
    }

    async fn store_aggregates(&self, entries: &[&Entry], now: UnixTimestamp) -> u64 {
        let rows = preaggregate(entries.iter().copied(), &self.config.periods, now);
        let by_kind = rows.into_iter().into_group_map_by(|row| row.kind);

        let mut written = 0;
        for (kind, rows) in by_kind {
            for chunk in rows.chunks(self.chunk_size()) {
                match self.store.upsert_aggregates(kind, chunk).await {
                    Ok(()) => written += chunk.len() as u64,
                    Err(err) => chunk_failed("aggregates", &err),
                }
            }
        }

        metric!(counter(RollupCounters::RowsWritten) += written as i64, table = "aggregates");
        written
    }

    fn chunk_size(&self) -> usize {
        self.config.chunk_size.max(1)
    }

    /// Reads the latest values of a type, optionally restricted to some keys.
    pub async fn values(&self, ty: &str, keys: Option<&[String]>) -> Result<Vec<Value>, StoreError> {
        let rows = self.store.values(ty, keys).await?;
        Ok(rows.into_iter().map(Value::from).collect())
    }

    /// Deletes raw rows older than the retention and buckets that aged out of their period.
    pub async fn trim(&self, now: UnixTimestamp) -> Result<TrimStats, StoreError> {
        let cutoffs = self.retention.cutoffs(now);

        let stats = metric!(timer(RollupTimers::TrimDuration), {
            self.store.trim(&cutoffs).await?
        });

        metric!(counter(RollupCounters::RowsTrimmed) += stats.entries as i64, table = "entries");
        metric!(counter(RollupCounters::RowsTrimmed) += stats.values as i64, table = "values");
        metric!(
            counter(RollupCounters::RowsTrimmed) += stats.aggregates as i64,
            table = "aggregates"
        );

        rollup_log::debug!(
            entries = stats.entries,
            values = stats.values,
            aggregates = stats.aggregates,
            "trimmed rollup store"
        );

        Ok(stats)
    }

    /// Deletes all rows, or only those of the given types.
    pub async fn purge(&self, types: Option<&[String]>) -> Result<(), StoreError> {
        self.store.purge(types).await?;
        rollup_log::info!(types = ?types, "purged rollup store");
        Ok(())
    }
}

fn chunk_failed(table: &'static str, err: &StoreError) {
    rollup_log::error!(
        error = err as &dyn Error,
        table,
        "failed to write chunk to the rollup store"
    );
    metric!(counter(RollupCounters::ChunkFailed) += 1, table = table);
}
