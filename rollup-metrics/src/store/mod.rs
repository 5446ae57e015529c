//! Persistent storage of raw entries, raw values and bucketed aggregates.
//!
//! The [`RollupStore`] trait is the contract between the digest and query code and a storage
//! engine. Every implementation must preserve the row shapes below and the aggregate uniqueness
//! key `(bucket, period, type, aggregate_kind, key_hash)`.

use std::fmt;

use async_trait::async_trait;
use enumset::EnumSet;
use rollup_common::UnixTimestamp;

use crate::bucket::Period;
use crate::protocol::{AggregateKind, Entry, Value};

mod dialect;
mod memory;
mod sql;

pub use self::dialect::*;
pub use self::memory::*;
pub use self::sql::*;

/// A persisted raw entry.
#[derive(Clone, Debug, PartialEq)]
pub struct RawEntryRow {
    /// When the sample was taken.
    pub timestamp: UnixTimestamp,
    /// Sample type.
    pub ty: String,
    /// Sample key.
    pub key: String,
    /// Digest of the key.
    pub key_hash: String,
    /// The sample value, if any.
    pub value: Option<i64>,
}

impl From<&Entry> for RawEntryRow {
    fn from(entry: &Entry) -> Self {
        Self {
            timestamp: entry.timestamp,
            ty: entry.ty.clone(),
            key: entry.key.clone(),
            key_hash: entry.key_hash(),
            value: entry.value,
        }
    }
}

/// A persisted latest-wins value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawValueRow {
    /// When the value was set.
    pub timestamp: UnixTimestamp,
    /// Sample type.
    pub ty: String,
    /// Sample key.
    pub key: String,
    /// Digest of the key.
    pub key_hash: String,
    /// The payload.
    pub value: String,
}

impl From<RawValueRow> for Value {
    fn from(row: RawValueRow) -> Self {
        Value {
            timestamp: row.timestamp,
            ty: row.ty,
            key: row.key,
            value: row.value,
        }
    }
}

impl From<&Value> for RawValueRow {
    fn from(value: &Value) -> Self {
        Self {
            timestamp: value.timestamp,
            ty: value.ty.clone(),
            key: value.key.clone(),
            key_hash: value.key_hash(),
            value: value.value.clone(),
        }
    }
}

/// A persisted aggregate bucket.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateRow {
    /// Start of the bucket, aligned to the bucket width of the period.
    pub bucket: UnixTimestamp,
    /// The period this bucket belongs to.
    pub period: Period,
    /// Sample type.
    pub ty: String,
    /// Sample key.
    pub key: String,
    /// Digest of the key.
    pub key_hash: String,
    /// The aggregation kind, stored in the `aggregate_kind` column.
    pub kind: AggregateKind,
    /// The aggregated value.
    pub value: f64,
    /// The number of samples merged into this row, tracked for every kind.
    pub count: u64,
}

/// Selects aggregate buckets of a single period.
#[derive(Clone, Debug)]
pub struct BucketFilter {
    /// The period to read.
    pub period: Period,
    /// Sample types to read.
    pub types: Vec<String>,
    /// Aggregation kinds to read.
    pub kinds: EnumSet<AggregateKind>,
    /// Earliest bucket, inclusive.
    pub from: UnixTimestamp,
}

impl BucketFilter {
    /// Returns `true` if the row is selected by this filter.
    pub fn matches(&self, row: &AggregateRow) -> bool {
        row.period == self.period
            && row.bucket >= self.from
            && self.kinds.contains(row.kind)
            && self.types.iter().any(|ty| *ty == row.ty)
    }
}

/// Selects raw entries within a half-open time range.
#[derive(Clone, Debug)]
pub struct EntryFilter {
    /// Sample types to read.
    pub types: Vec<String>,
    /// Earliest timestamp, inclusive.
    pub from: UnixTimestamp,
    /// Latest timestamp, exclusive.
    pub until: UnixTimestamp,
}

impl EntryFilter {
    /// Returns `true` if the row is selected by this filter.
    pub fn matches(&self, row: &RawEntryRow) -> bool {
        row.timestamp >= self.from
            && row.timestamp < self.until
            && self.types.iter().any(|ty| *ty == row.ty)
    }
}

/// The deletion thresholds of a retention sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrimCutoffs {
    /// The time of the sweep.
    pub now: UnixTimestamp,
    /// Raw rows at or before this timestamp are deleted. `None` keeps all raw rows.
    pub raw: Option<UnixTimestamp>,
}

impl TrimCutoffs {
    /// Returns the cutoff for buckets of the given period.
    ///
    /// A bucket is deleted once it has aged out of its period's window, that is when
    /// `bucket + window <= now`.
    pub fn aggregates(&self, period: Period) -> Option<UnixTimestamp> {
        self.now.checked_sub_secs(period.window())
    }
}

/// Number of rows deleted by a retention sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrimStats {
    /// Deleted raw entries.
    pub entries: u64,
    /// Deleted raw values.
    pub values: u64,
    /// Deleted aggregate buckets.
    pub aggregates: u64,
}

/// An error returned by a [`RollupStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connecting to the database or creating the schema failed.
    #[error("failed to set up the rollup store: {0}")]
    Setup(#[source] sqlx::Error),

    /// A write statement failed.
    #[error("failed to write to the rollup store: {0}")]
    Write(#[source] sqlx::Error),

    /// A read statement failed.
    #[error("failed to read from the rollup store: {0}")]
    Read(#[source] sqlx::Error),

    /// A row read from the database could not be decoded.
    #[error("invalid row in {table}: {reason}")]
    InvalidRow {
        /// The table the row was read from.
        table: &'static str,
        /// What was wrong with the row.
        reason: String,
    },
}

/// Storage for the three persisted row shapes.
///
/// All writes of aggregates must be atomic per uniqueness key, so that concurrent digests
/// merging into the same bucket never lose an update.
#[async_trait]
pub trait RollupStore: fmt::Debug + Send + Sync {
    /// Appends raw entries.
    async fn insert_entries(&self, rows: &[RawEntryRow]) -> Result<(), StoreError>;

    /// Inserts or replaces values, keeping the row with the latest timestamp per type and key.
    async fn upsert_values(&self, rows: &[RawValueRow]) -> Result<(), StoreError>;

    /// Inserts aggregate rows of one kind or merges them into existing buckets.
    async fn upsert_aggregates(
        &self,
        kind: AggregateKind,
        rows: &[AggregateRow],
    ) -> Result<(), StoreError>;

    /// Reads the aggregate buckets selected by the filter.
    async fn aggregates(&self, filter: &BucketFilter) -> Result<Vec<AggregateRow>, StoreError>;

    /// Reads the raw entries selected by the filter.
    async fn entries(&self, filter: &EntryFilter) -> Result<Vec<RawEntryRow>, StoreError>;

    /// Reads the values of a type, optionally restricted to some keys.
    async fn values(
        &self,
        ty: &str,
        keys: Option<&[String]>,
    ) -> Result<Vec<RawValueRow>, StoreError>;

    /// Deletes expired raw rows and aggregate buckets in one transaction.
    async fn trim(&self, cutoffs: &TrimCutoffs) -> Result<TrimStats, StoreError>;

    /// Deletes all rows, or only those of the given types, in one transaction.
    async fn purge(&self, types: Option<&[String]>) -> Result<(), StoreError>;
}
