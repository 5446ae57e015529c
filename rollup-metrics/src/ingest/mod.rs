//! The hand-off queue between recorders and the digest.
//!
//! Recorders [`push`](Ingest::push) samples, the [`Digester`](crate::Digester) drains them with
//! [`pop_batch`](Ingest::pop_batch). Popped samples stay in the queue until the batch is
//! [acknowledged](Ingest::ack) after it was stored, which makes delivery at-least-once: a digest
//! that fails between pop and ack sees the same batch again on a later run. The
//! [`MemoryIngest`] leases popped samples so concurrent pops get disjoint batches. The
//! Redis stream queue does not, and two digests running against the same stream may both store a
//! batch.

use std::fmt;

use async_trait::async_trait;
use rollup_common::UnixTimestamp;

use crate::protocol::Sample;

mod memory;
mod null;
#[cfg(feature = "redis")]
mod redis;
mod storage;

pub use self::memory::*;
pub use self::null::*;
#[cfg(feature = "redis")]
pub use self::redis::*;
pub use self::storage::*;

/// The default name of the Redis stream backing the ingest queue.
pub const DEFAULT_STREAM: &str = "rollup:ingest";

/// An error returned by an [`Ingest`] queue.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// A sample could not be serialized for the queue.
    #[error("failed to serialize sample: {0}")]
    Serialize(#[source] serde_json::Error),

    /// A queued item could not be decoded.
    #[error("failed to decode queue item {id}: {source}")]
    Decode {
        /// The identifier of the item within the queue.
        id: String,
        /// The decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// The queue item has an unexpected shape.
    #[error("malformed queue item {0}")]
    Malformed(String),

    /// Communication with Redis failed.
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] rollup_redis::RedisError),
}

#[cfg(feature = "redis")]
impl From<rollup_redis::redis::RedisError> for IngestError {
    fn from(err: rollup_redis::redis::RedisError) -> Self {
        Self::Redis(err.into())
    }
}

/// Identifies the items of a popped [`Batch`] for acknowledgement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Receipt {
    /// Nothing to acknowledge.
    #[default]
    Empty,
    /// Sequence numbers in a [`MemoryIngest`].
    Memory(Vec<u64>),
    /// Stream entry identifiers in a [`RedisIngest`].
    #[cfg(feature = "redis")]
    Redis(Vec<String>),
}

impl Receipt {
    /// Returns the number of queue items acknowledged by this receipt.
    ///
    /// This can exceed the number of samples in the batch if the queue skipped items it could
    /// not decode.
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Memory(seqs) => seqs.len(),
            #[cfg(feature = "redis")]
            Self::Redis(ids) => ids.len(),
        }
    }

    /// Returns `true` if this receipt acknowledges nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The oldest samples of a queue together with the receipt acknowledging them.
#[derive(Debug, Default)]
pub struct Batch {
    /// The popped samples, oldest first.
    pub samples: Vec<Sample>,
    /// Pass to [`Ingest::ack`] once the samples are stored.
    pub receipt: Receipt,
}

impl Batch {
    /// Returns the number of samples in this batch.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if this batch carries no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A durable or in-process queue of samples.
#[async_trait]
pub trait Ingest: fmt::Debug + Send + Sync {
    /// Appends samples to the queue.
    async fn push(&self, samples: Vec<Sample>) -> Result<(), IngestError>;

    /// Returns up to `max` of the oldest samples without removing them.
    ///
    /// The samples remain queued until their receipt is acknowledged.
    async fn pop_batch(&self, max: usize) -> Result<Batch, IngestError>;

    /// Removes the samples of a popped batch.
    async fn ack(&self, receipt: Receipt) -> Result<(), IngestError>;

    /// Removes all samples enqueued before `older_than`, returning how many were removed if
    /// the queue knows.
    async fn trim(&self, older_than: UnixTimestamp) -> Result<u64, IngestError>;
}
