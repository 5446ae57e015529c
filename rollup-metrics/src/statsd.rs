use rollup_statsd::{CounterMetric, DistributionMetric, GaugeMetric, TimerMetric};

/// Counter metrics for the rollup pipeline.
pub enum RollupCounters {
    /// Incremented for every sample handed to the ingest queue by the recorder.
    SamplesIngested,

    /// Incremented for every sample dropped because the ingest queue failed.
    SamplesLost,

    /// Incremented for every sample discarded by [`Recorder::flush`](crate::Recorder::flush).
    SamplesFlushed,

    /// Incremented for every lazy producer that resolved to an error or panicked.
    LazyFailed,

    /// Incremented for every queue item that could not be decoded and was dropped.
    QueueItemsDropped,

    /// Incremented for every batch popped from the ingest queue by the digest.
    DigestBatches,

    /// Incremented for every sample processed by the digest.
    DigestSamples,

    /// Incremented for every row written to the rollup store.
    ///
    /// Tagged by `table`.
    RowsWritten,

    /// Incremented for every chunk that failed to be written to the rollup store.
    ///
    /// Tagged by `table`.
    ChunkFailed,

    /// Incremented for every row deleted by the retention sweep.
    ///
    /// Tagged by `table`.
    RowsTrimmed,
}

impl CounterMetric for RollupCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::SamplesIngested => "recorder.ingested",
            Self::SamplesLost => "recorder.lost",
            Self::SamplesFlushed => "recorder.flushed",
            Self::LazyFailed => "recorder.lazy_failed",
            Self::QueueItemsDropped => "ingest.dropped",
            Self::DigestBatches => "digest.batches",
            Self::DigestSamples => "digest.samples",
            Self::RowsWritten => "storage.rows_written",
            Self::ChunkFailed => "storage.chunk_failed",
            Self::RowsTrimmed => "retention.rows_trimmed",
        }
    }
}

/// Timer metrics for the rollup pipeline.
pub enum RollupTimers {
    /// Time spent in a full digest run, from the first pop to the last acknowledgement.
    DigestDuration,

    /// Time spent in a single retention sweep.
    TrimDuration,

    /// Time spent composing the result of a query.
    ///
    /// Tagged by `query`: `aggregate`, `aggregate_types`, `total` or `graph`.
    QueryDuration,
}

impl TimerMetric for RollupTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::DigestDuration => "digest.duration",
            Self::TrimDuration => "retention.duration",
            Self::QueryDuration => "query.duration",
        }
    }
}

/// Distribution metrics for the rollup pipeline.
pub enum RollupDistributions {
    /// The number of samples handed off by a single [`Recorder::ingest`](crate::Recorder::ingest).
    IngestBatchSize,

    /// The number of tail entries read from raw storage to complete a query window.
    QueryTailEntries,
}

impl DistributionMetric for RollupDistributions {
    fn name(&self) -> &'static str {
        match *self {
            Self::IngestBatchSize => "recorder.batch_size",
            Self::QueryTailEntries => "query.tail_entries",
        }
    }
}

/// Gauge metrics for the rollup pipeline.
pub enum RollupGauges {
    /// The number of buffered samples and lazy producers after a record.
    BufferSize,
}

impl GaugeMetric for RollupGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::BufferSize => "recorder.buffer_size",
        }
    }
}
