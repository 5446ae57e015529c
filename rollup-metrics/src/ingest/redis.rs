use std::error::Error;

use async_trait::async_trait;
use rollup_common::UnixTimestamp;
use rollup_redis::redis::streams::{StreamId, StreamRangeReply};
use rollup_redis::redis::{self, Cmd};
use rollup_redis::RedisPool;
use rollup_statsd::metric;

use crate::ingest::{Batch, Ingest, IngestError, Receipt};
use crate::protocol::Sample;
use crate::statsd::RollupCounters;

/// The stream field carrying the JSON encoded sample.
const DATA_FIELD: &str = "data";

/// A queue backed by a Redis stream.
///
/// Any number of processes may push concurrently. Stream entry identifiers start with the
/// millisecond timestamp assigned by Redis, which is what [`Ingest::trim`] compares against.
///
/// Popping does not lease entries, so concurrent pops return the same oldest entries. Entries
/// that cannot be decoded are logged and skipped, and their identifiers stay in the receipt so
/// that acknowledging the batch removes them.
#[derive(Clone, Debug)]
pub struct RedisIngest {
    pool: RedisPool,
    stream: String,
}

impl RedisIngest {
    /// Creates a queue on the given stream.
    pub fn new(pool: RedisPool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }

    /// Returns the name of the stream.
    pub fn stream(&self) -> &str {
        &self.stream
    }
}

#[async_trait]
impl Ingest for RedisIngest {
    async fn push(&self, samples: Vec<Sample>) -> Result<(), IngestError> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for sample in &samples {
            let payload = serde_json::to_string(sample).map_err(IngestError::Serialize)?;
            pipe.xadd(&self.stream, "*", &[(DATA_FIELD, payload)])
                .ignore();
        }

        let mut connection = self.pool.get_connection().await?;
        pipe.query_async::<()>(&mut connection).await?;
        Ok(())
    }

    async fn pop_batch(&self, max: usize) -> Result<Batch, IngestError> {
        if max == 0 {
            return Ok(Batch::default());
        }

        let mut connection = self.pool.get_connection().await?;
        let reply: StreamRangeReply = Cmd::xrange_count(&self.stream, "-", "+", max)
            .query_async(&mut connection)
            .await?;

        Ok(decode_entries(reply.ids))
    }

    async fn ack(&self, receipt: Receipt) -> Result<(), IngestError> {
        let Receipt::Redis(ids) = receipt else {
            return Ok(());
        };
        if ids.is_empty() {
            return Ok(());
        }

        let mut connection = self.pool.get_connection().await?;
        Cmd::xdel(&self.stream, &ids)
            .query_async::<u64>(&mut connection)
            .await?;

        Ok(())
    }

    async fn trim(&self, older_than: UnixTimestamp) -> Result<u64, IngestError> {
        let min_id = format!("{}-0", older_than.as_millis());

        let mut connection = self.pool.get_connection().await?;
        let removed = redis::cmd("XTRIM")
            .arg(&self.stream)
            .arg("MINID")
            .arg(min_id)
            .query_async::<u64>(&mut connection)
            .await?;

        Ok(removed)
    }
}

fn decode_entry(entry: &StreamId) -> Result<Sample, IngestError> {
    let payload = entry
        .get::<String>(DATA_FIELD)
        .ok_or_else(|| IngestError::Malformed(entry.id.clone()))?;

    serde_json::from_str(&payload).map_err(|source| IngestError::Decode {
        id: entry.id.clone(),
        source,
    })
}

/// Decodes stream entries into a batch acknowledging all of them.
fn decode_entries(entries: Vec<StreamId>) -> Batch {
    let mut samples = Vec::with_capacity(entries.len());
    let mut ids = Vec::with_capacity(entries.len());

    for entry in entries {
        match decode_entry(&entry) {
            Ok(sample) => samples.push(sample),
            Err(err) => {
                rollup_log::error!(error = &err as &dyn Error, "dropping undecodable queue item");
                metric!(counter(RollupCounters::QueueItemsDropped) += 1);
            }
        }
        ids.push(entry.id);
    }

    Batch {
        samples,
        receipt: Receipt::Redis(ids),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rollup_redis::RedisConfig;

    use super::*;
    use crate::protocol::{Entry, Value};

    fn stream_entry(id: &str, field: &str, payload: &str) -> StreamId {
        StreamId {
            id: id.to_owned(),
            map: HashMap::from([(
                field.to_owned(),
                redis::Value::BulkString(payload.as_bytes().to_vec()),
            )]),
        }
    }

    /// Returns a queue on a unique stream, or `None` if no Redis server is reachable.
    async fn ingest(name: &str) -> Option<RedisIngest> {
        let url = std::env::var("ROLLUP_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_owned());
        let pool = RedisPool::new(&RedisConfig::Single(url)).ok()?;
        let mut connection = pool.get_connection().await.ok()?;

        let stream = format!("rollup:test:{name}");
        redis::cmd("DEL")
            .arg(&stream)
            .query_async::<()>(&mut connection)
            .await
            .ok()?;

        Some(RedisIngest::new(pool, stream))
    }

    #[test]
    fn test_undecodable_entries_are_skipped_and_acknowledged() {
        let sample: Sample = Entry::new("cache", "users", None).count().into();
        let payload = serde_json::to_string(&sample).unwrap();

        let batch = decode_entries(vec![
            stream_entry("1-0", DATA_FIELD, "not json"),
            stream_entry("2-0", "other", &payload),
            stream_entry("3-0", DATA_FIELD, &payload),
        ]);

        assert_eq!(batch.samples, vec![sample]);
        assert_eq!(
            batch.receipt,
            Receipt::Redis(vec!["1-0".to_owned(), "2-0".to_owned(), "3-0".to_owned()])
        );
    }

    #[tokio::test]
    async fn test_undecodable_entry_does_not_block_queue() {
        let Some(ingest) = ingest("undecodable").await else {
            return;
        };

        let mut connection = ingest.pool.get_connection().await.unwrap();
        redis::cmd("XADD")
            .arg(ingest.stream())
            .arg("*")
            .arg(DATA_FIELD)
            .arg("{")
            .query_async::<String>(&mut connection)
            .await
            .unwrap();

        let sample: Sample = Value::new("system", "web-1", "{}").into();
        ingest.push(vec![sample.clone()]).await.unwrap();

        let batch = ingest.pop_batch(10).await.unwrap();
        assert_eq!(batch.samples, vec![sample]);

        ingest.ack(batch.receipt).await.unwrap();
        assert_eq!(ingest.pop_batch(10).await.unwrap().receipt.len(), 0);
    }

    #[tokio::test]
    async fn test_push_pop_ack() {
        let Some(ingest) = ingest("push_pop_ack").await else {
            return;
        };

        let samples: Vec<Sample> = vec![
            Entry::new("slow_request", "GET /", Some(250)).max().into(),
            Value::new("system", "web-1", "{}").into(),
        ];
        ingest.push(samples.clone()).await.unwrap();

        let batch = ingest.pop_batch(10).await.unwrap();
        assert_eq!(batch.samples, samples);

        ingest.ack(batch.receipt).await.unwrap();
        assert!(ingest.pop_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trim() {
        let Some(ingest) = ingest("trim").await else {
            return;
        };

        ingest
            .push(vec![Entry::new("cache", "users", None).count().into()])
            .await
            .unwrap();

        let removed = ingest.trim(UnixTimestamp::now().add_secs(60)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(ingest.pop_batch(10).await.unwrap().is_empty());
    }
}
