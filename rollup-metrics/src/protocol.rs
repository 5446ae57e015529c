use std::fmt;

use enumset::{EnumSet, EnumSetType};
use rollup_common::UnixTimestamp;
use serde::{Deserialize, Serialize};

/// The rollup function applied to a group of samples.
#[derive(Debug, Hash, PartialOrd, Ord, EnumSetType, Serialize, Deserialize)]
#[enumset(serialize_repr = "list")]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    /// Number of samples.
    Count,
    /// Smallest sample value.
    Min,
    /// Largest sample value.
    Max,
    /// Sum of all sample values.
    Sum,
    /// Arithmetic mean of all sample values.
    Avg,
}

impl AggregateKind {
    /// Returns the name stored in the `aggregate_kind` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Avg => "avg",
        }
    }

    /// Returns `true` if samples need a value to contribute to this aggregate.
    pub fn requires_value(&self) -> bool {
        !matches!(self, Self::Count)
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error returned when parsing an unknown [`AggregateKind`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown aggregate kind `{0}`, expected one of count, min, max, sum, avg")]
pub struct ParseAggregateKindError(String);

impl std::str::FromStr for AggregateKind {
    type Err = ParseAggregateKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "count" => Self::Count,
            "min" => Self::Min,
            "max" => Self::Max,
            "sum" => Self::Sum,
            "avg" => Self::Avg,
            other => return Err(ParseAggregateKindError(other.to_owned())),
        })
    }
}

/// An entry that violates the sample invariants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidEntry {
    /// A value-based aggregation was requested for an entry without a value.
    #[error("the {0} aggregation requires the entry to carry a value")]
    MissingValue(AggregateKind),
}

/// Returns the digest of a key used for indexed lookups.
///
/// This is the lowercase hex md5 of the key, always 32 characters long.
pub fn key_hash(key: &str) -> String {
    format!("{:x}", md5::compute(key.as_bytes()))
}

/// A numeric sample feeding raw storage and aggregates.
///
/// Entries are built with [`Entry::new`] and the aggregation methods, and recorded through the
/// [`Recorder`](crate::Recorder):
///
/// ```
/// use rollup_metrics::Entry;
///
/// let entry = Entry::new("slow_query", "select * from users", Some(1250))
///     .count()
///     .max();
///
/// assert_eq!(entry.aggregations.len(), 2);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// When the sample was taken.
    pub timestamp: UnixTimestamp,
    /// The sample type, for example `slow_request`.
    #[serde(rename = "type")]
    pub ty: String,
    /// The key within the type, for example the route.
    pub key: String,
    /// The measured value. Required for every aggregation other than count.
    pub value: Option<i64>,
    /// The aggregations this entry feeds. Empty means the recorder's defaults.
    #[serde(default)]
    pub aggregations: EnumSet<AggregateKind>,
    /// Only feed aggregates, never write this entry to raw storage.
    #[serde(default)]
    pub only_buckets: bool,
}

impl Entry {
    /// Creates an entry taken now without aggregations.
    pub fn new(ty: impl Into<String>, key: impl Into<String>, value: Option<i64>) -> Self {
        Self {
            timestamp: UnixTimestamp::now(),
            ty: ty.into(),
            key: key.into(),
            value,
            aggregations: EnumSet::empty(),
            only_buckets: false,
        }
    }

    /// Sets the time the sample was taken.
    pub fn at(mut self, timestamp: UnixTimestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Adds an aggregation.
    pub fn aggregate(mut self, kind: AggregateKind) -> Self {
        self.aggregations.insert(kind);
        self
    }

    /// Feeds the count aggregate.
    pub fn count(self) -> Self {
        self.aggregate(AggregateKind::Count)
    }

    /// Feeds the min aggregate.
    pub fn min(self) -> Self {
        self.aggregate(AggregateKind::Min)
    }

    /// Feeds the max aggregate.
    pub fn max(self) -> Self {
        self.aggregate(AggregateKind::Max)
    }

    /// Feeds the sum aggregate.
    pub fn sum(self) -> Self {
        self.aggregate(AggregateKind::Sum)
    }

    /// Feeds the avg aggregate.
    pub fn avg(self) -> Self {
        self.aggregate(AggregateKind::Avg)
    }

    /// Keeps the entry out of raw storage.
    pub fn only_buckets(mut self) -> Self {
        self.only_buckets = true;
        self
    }

    /// Checks that every requested aggregation can be computed.
    pub fn validate(&self) -> Result<(), InvalidEntry> {
        if self.value.is_some() {
            return Ok(());
        }

        match self.aggregations.iter().find(AggregateKind::requires_value) {
            Some(kind) => Err(InvalidEntry::MissingValue(kind)),
            None => Ok(()),
        }
    }

    /// Returns the digest of this entry's key.
    pub fn key_hash(&self) -> String {
        key_hash(&self.key)
    }
}

/// A string sample of which only the latest per type and key is kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// When the value was set.
    pub timestamp: UnixTimestamp,
    /// The sample type, for example `system`.
    #[serde(rename = "type")]
    pub ty: String,
    /// The key within the type, for example the server name.
    pub key: String,
    /// The payload, often serialized JSON.
    pub value: String,
}

impl Value {
    /// Creates a value set now.
    pub fn new(ty: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            timestamp: UnixTimestamp::now(),
            ty: ty.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Sets the time the value was set.
    pub fn at(mut self, timestamp: UnixTimestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns the digest of this value's key.
    pub fn key_hash(&self) -> String {
        key_hash(&self.key)
    }
}

/// A buffered or queued sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sample", rename_all = "lowercase")]
pub enum Sample {
    /// A numeric sample.
    Entry(Entry),
    /// A latest-wins string sample.
    Value(Value),
}

impl Sample {
    /// Returns the sample type.
    pub fn ty(&self) -> &str {
        match self {
            Self::Entry(entry) => &entry.ty,
            Self::Value(value) => &value.ty,
        }
    }

    /// Returns the key within the type.
    pub fn key(&self) -> &str {
        match self {
            Self::Entry(entry) => &entry.key,
            Self::Value(value) => &value.key,
        }
    }

    /// Returns when the sample was taken.
    pub fn timestamp(&self) -> UnixTimestamp {
        match self {
            Self::Entry(entry) => entry.timestamp,
            Self::Value(value) => value.timestamp,
        }
    }
}

impl From<Entry> for Sample {
    fn from(entry: Entry) -> Self {
        Self::Entry(entry)
    }
}

impl From<Value> for Sample {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}
