use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use rollup_common::UnixTimestamp;
use rollup_statsd::metric;
use serde::{Deserialize, Serialize};

use crate::ingest::{Ingest, IngestError};
use crate::statsd::{RollupCounters, RollupTimers};
use crate::storage::{Storage, StoreStats};

/// Configuration of the [`Digester`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    /// Maximum number of samples popped from the ingest queue at once.
    pub batch_size: usize,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

/// Drains the ingest queue into the rollup store.
///
/// Each batch is popped, stored and acknowledged in this order. If storing a batch is
/// interrupted, the batch stays queued and is stored again by the next digest.
#[derive(Clone, Debug)]
pub struct Digester {
    ingest: Arc<dyn Ingest>,
    storage: Storage,
    config: DigestConfig,
}

impl Digester {
    /// Creates a digester moving samples from `ingest` to `storage`.
    pub fn new(ingest: Arc<dyn Ingest>, storage: Storage, config: DigestConfig) -> Self {
        Self {
            ingest,
            storage,
            config,
        }
    }

    /// Digests the queue at the current time.
    pub async fn digest(&self) -> Result<u64, IngestError> {
        self.digest_at(UnixTimestamp::now()).await
    }

    /// Digests the queue, computing bucket coverage as of `now`.
    ///
    /// Stops once a batch comes back with fewer items than the batch size. Returns the number of
    /// rows written across all tables. Failures to store a chunk are logged and do not stop the
    /// digest, failures of the queue do.
    pub async fn digest_at(&self, now: UnixTimestamp) -> Result<u64, IngestError> {
        let start = Instant::now();
        let batch_size = self.config.batch_size.max(1);
        let mut stats = StoreStats::default();
        let mut batches = 0;

        let result = loop {
            let batch = match self.ingest.pop_batch(batch_size).await {
                Ok(batch) => batch,
                Err(err) => break Err(err),
            };

            // A batch may carry fewer samples than items if the queue dropped some of them.
            let popped = batch.receipt.len();
            if popped == 0 {
                break Ok(());
            }

            batches += 1;
            metric!(counter(RollupCounters::DigestBatches) += 1);
            metric!(counter(RollupCounters::DigestSamples) += batch.len() as i64);

            let written = self.storage.store(&batch.samples, now).await;
            stats.entries += written.entries;
            stats.values += written.values;
            stats.aggregates += written.aggregates;

            if let Err(err) = self.ingest.ack(batch.receipt).await {
                break Err(err);
            }

            if popped < batch_size {
                break Ok(());
            }
        };

        metric!(timer(RollupTimers::DigestDuration) = start.elapsed());

        match result {
            Ok(()) => {
                rollup_log::debug!(
                    batches,
                    entries = stats.entries,
                    values = stats.values,
                    aggregates = stats.aggregates,
                    "digested ingest queue"
                );
                Ok(stats.total())
            }
            Err(err) => {
                rollup_log::error!(
                    error = &err as &dyn Error,
                    batches,
                    "failed to digest ingest queue"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use enumset::EnumSet;

    use super::*;
    use crate::bucket::Period;
    use crate::ingest::{Batch, MemoryIngest, Receipt};
    use crate::protocol::{AggregateKind, Entry, Sample, Value};
    use crate::recorder::{Recorder, RecorderConfig};
    use crate::retention::RetentionConfig;
    use crate::storage::StorageConfig;
    use crate::store::{AggregateRow, MemoryStore, RollupStore};

    fn ts(secs: u64) -> UnixTimestamp {
        UnixTimestamp::from_secs(secs)
    }

    struct Setup {
        queue: MemoryIngest,
        store: Arc<MemoryStore>,
        recorder: Recorder,
        digester: Digester,
    }

    fn setup(periods: &[u32], batch_size: usize) -> Setup {
        let queue = MemoryIngest::new();
        let store = Arc::new(MemoryStore::new());
        let storage = Storage::new(
            store.clone(),
            StorageConfig {
                chunk_size: 1000,
                periods: periods.iter().copied().map(Period::from_minutes).collect(),
            },
            RetentionConfig::default(),
        );

        let recorder = Recorder::new(RecorderConfig::default(), Arc::new(queue.clone()));
        let digester = Digester::new(
            Arc::new(queue.clone()),
            storage,
            DigestConfig { batch_size },
        );

        Setup {
            queue,
            store,
            recorder,
            digester,
        }
    }

    fn rows_of(store: &MemoryStore, kind: AggregateKind) -> Vec<AggregateRow> {
        store
            .all_aggregates()
            .into_iter()
            .filter(|row| row.kind == kind)
            .collect()
    }

    #[tokio::test]
    async fn test_count_sums_equal_recorded() {
        let setup = setup(&[60, 1440], 7);

        for i in 0..25u64 {
            let key = if i % 3 == 0 { "GET /a" } else { "GET /b" };
            let entry = Entry::new("slow_request", key, Some(i as i64)).at(ts(1000 + i * 10));
            setup.recorder.record(entry).await.unwrap();
        }
        setup.recorder.ingest().await;

        setup.digester.digest_at(ts(1300)).await.unwrap();
        assert!(setup.queue.is_empty());

        let mut totals = BTreeMap::new();
        for row in rows_of(&setup.store, AggregateKind::Count) {
            *totals.entry(row.period).or_insert(0.0) += row.value;
        }

        assert_eq!(totals[&Period::from_minutes(60)], 25.0);
        assert_eq!(totals[&Period::from_minutes(1440)], 25.0);
    }

    #[tokio::test]
    async fn test_avg_across_batches() {
        // A batch size of one merges every sample into the stored bucket separately.
        let setup = setup(&[60], 1);
        let values = [12, 3, 40, 7, 18];

        for value in values {
            let entry = Entry::new("slow_query", "select 1", Some(value))
                .at(ts(120))
                .avg();
            setup.recorder.record(entry).await.unwrap();
        }
        setup.recorder.ingest().await;
        setup.digester.digest_at(ts(200)).await.unwrap();

        let rows = rows_of(&setup.store, AggregateKind::Avg);
        assert_eq!(rows.len(), 1);
        assert!((rows[0].value - 16.0).abs() < 1e-9);
        assert_eq!(rows[0].count, 5);
    }

    #[tokio::test]
    async fn test_only_buckets() {
        let setup = setup(&[60], 1000);

        for _ in 0..5 {
            let entry = Entry::new("cache", "users", None).at(ts(30)).only_buckets();
            setup.recorder.record(entry).await.unwrap();
        }
        setup.recorder.ingest().await;

        let written = setup.digester.digest_at(ts(60)).await.unwrap();
        assert_eq!(written, 1);
        assert_eq!(setup.store.len(), (0, 0, 1));

        let rows = rows_of(&setup.store, AggregateKind::Count);
        assert_eq!((rows[0].value, rows[0].count), (5.0, 5));
    }

    #[tokio::test]
    async fn test_value_latest_wins() {
        let setup = setup(&[60], 1);

        setup
            .recorder
            .set(Value::new("system", "web-1", "a").at(ts(10)))
            .await;
        setup
            .recorder
            .set(Value::new("system", "web-1", "b").at(ts(11)))
            .await;
        setup.recorder.ingest().await;
        setup.digester.digest_at(ts(20)).await.unwrap();

        let values = setup.store.values("system", None).await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, "b");
    }

    #[tokio::test]
    async fn test_trim_scenario() {
        let setup = setup(&[60], 1000);

        for timestamp in [59, 60] {
            let entry = Entry::new("slow_request", "GET /", None).at(ts(timestamp));
            setup.recorder.record(entry).await.unwrap();
        }
        setup.recorder.ingest().await;
        setup.digester.digest_at(ts(60)).await.unwrap();

        let storage = setup.digester.storage.clone();
        let buckets = || {
            rows_of(&setup.store, AggregateKind::Count)
                .iter()
                .map(|row| row.bucket.as_secs())
                .collect::<Vec<_>>()
        };

        assert_eq!(buckets(), [0, 60]);

        storage.trim(ts(3599)).await.unwrap();
        assert_eq!(buckets(), [0, 60]);

        storage.trim(ts(3600)).await.unwrap();
        assert_eq!(buckets(), [60]);
    }

    #[tokio::test]
    async fn test_stops_on_short_batch() {
        let setup = setup(&[60], 2);

        let samples: Vec<Sample> = (0..5)
            .map(|i| {
                Entry::new("cache", format!("key-{i}"), None)
                    .at(ts(10))
                    .aggregate(AggregateKind::Count)
                    .into()
            })
            .collect();
        setup.queue.push(samples).await.unwrap();

        // Three batches: two full ones and a short one.
        let written = setup.digester.digest_at(ts(20)).await.unwrap();
        assert_eq!(written, 10);
        assert!(setup.queue.is_empty());
        assert_eq!(
            setup
                .store
                .all_aggregates()
                .iter()
                .map(|row| row.kind)
                .collect::<EnumSet<_>>(),
            EnumSet::only(AggregateKind::Count)
        );
    }

    /// Drops samples with a `corrupt` key on pop but still hands out their receipt.
    #[derive(Debug)]
    struct DroppingIngest(MemoryIngest);

    #[async_trait]
    impl Ingest for DroppingIngest {
        async fn push(&self, samples: Vec<Sample>) -> Result<(), IngestError> {
            self.0.push(samples).await
        }

        async fn pop_batch(&self, max: usize) -> Result<Batch, IngestError> {
            let mut batch = self.0.pop_batch(max).await?;
            batch
                .samples
                .retain(|sample| !sample.key().starts_with("corrupt"));
            Ok(batch)
        }

        async fn ack(&self, receipt: Receipt) -> Result<(), IngestError> {
            self.0.ack(receipt).await
        }

        async fn trim(&self, older_than: UnixTimestamp) -> Result<u64, IngestError> {
            self.0.trim(older_than).await
        }
    }

    #[tokio::test]
    async fn test_continues_past_dropped_batch() {
        let queue = MemoryIngest::new();
        let store = Arc::new(MemoryStore::new());
        let storage = Storage::new(
            store.clone(),
            StorageConfig {
                chunk_size: 1000,
                periods: vec![Period::from_minutes(60)],
            },
            RetentionConfig::default(),
        );
        let digester = Digester::new(
            Arc::new(DroppingIngest(queue.clone())),
            storage,
            DigestConfig { batch_size: 2 },
        );

        let samples: Vec<Sample> = ["corrupt-1", "corrupt-2", "users"]
            .into_iter()
            .map(|key| Entry::new("cache", key, None).at(ts(10)).count().into())
            .collect();
        queue.push(samples).await.unwrap();

        digester.digest_at(ts(20)).await.unwrap();

        assert!(queue.is_empty());
        let keys: Vec<_> = rows_of(&store, AggregateKind::Count)
            .into_iter()
            .map(|row| row.key)
            .collect();
        assert_eq!(keys, ["users"]);
    }
}
