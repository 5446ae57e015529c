use std::sync::Arc;

use anyhow::{Context, Result};
use rollup_common::UnixTimestamp;
use rollup_config::{Config, IngestDriver, StoreDriver};
use rollup_metrics::{
    Digester, Ingest, IngestError, MemoryIngest, MemoryStore, NullIngest, Query, Recorder,
    RollupStore, SqlStore, Storage, StorageIngest, TrimStats,
};

/// Rows removed by [`Pipeline::trim`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrimReport {
    /// Rows deleted from the rollup store.
    pub store: TrimStats,
    /// Undigested samples dropped from the ingest queue.
    pub queue: u64,
}

/// All stages of the rollup pipeline, connected as configured.
///
/// Cloning is cheap, all clones operate on the same queue and store.
#[derive(Clone, Debug)]
pub struct Pipeline {
    ingest: Arc<dyn Ingest>,
    storage: Storage,
    recorder: Recorder,
    digester: Digester,
    query: Query,
    ingest_keep: u64,
}

impl Pipeline {
    /// Validates the configuration and connects the queue and store.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let store = create_store(config).await?;
        let storage = Storage::new(store, config.storage().clone(), config.retention());

        let ingest: Arc<dyn Ingest> = match config.ingest_driver() {
            IngestDriver::Null => Arc::new(NullIngest),
            IngestDriver::Storage => Arc::new(StorageIngest::new(storage.clone())),
            IngestDriver::Memory => Arc::new(MemoryIngest::new()),
            IngestDriver::Redis => create_redis_ingest(config)?,
        };

        let recorder = Recorder::new(config.recorder().clone(), ingest.clone());
        let digester = Digester::new(ingest.clone(), storage.clone(), config.digest());
        let query = Query::new(storage.clone(), config.query());

        Ok(Self {
            ingest,
            storage,
            recorder,
            digester,
            query,
            ingest_keep: config.ingest_keep(),
        })
    }

    /// Returns the recorder producers record samples into.
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Returns the digester draining the ingest queue.
    pub fn digester(&self) -> &Digester {
        &self.digester
    }

    /// Returns the query composer.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns the storage facade of the rollup store.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Drains the ingest queue into the rollup store.
    pub async fn digest(&self) -> Result<u64, IngestError> {
        self.digester.digest().await
    }

    /// Applies retention to the rollup store and the ingest queue.
    pub async fn trim(&self) -> Result<TrimReport> {
        self.trim_at(UnixTimestamp::now()).await
    }

    /// Applies retention as of `now`.
    pub async fn trim_at(&self, now: UnixTimestamp) -> Result<TrimReport> {
        let store = self
            .storage
            .trim(now)
            .await
            .context("failed to trim the rollup store")?;

        let queue = self
            .ingest
            .trim(now.saturating_sub_secs(self.ingest_keep))
            .await
            .context("failed to trim the ingest queue")?;

        if queue > 0 {
            rollup_log::warn!(samples = queue, "dropped undigested samples from the ingest queue");
        }

        Ok(TrimReport { store, queue })
    }
}

async fn create_store(config: &Config) -> Result<Arc<dyn RollupStore>> {
    let store = config.store();

    Ok(match store.driver {
        StoreDriver::Memory => Arc::new(MemoryStore::new()),
        StoreDriver::Sql => {
            let sql = SqlStore::connect(&store.url, store.dialect, store.max_connections)
                .await
                .context("failed to connect to the rollup store")?;
            Arc::new(sql)
        }
    })
}

#[cfg(feature = "redis")]
fn create_redis_ingest(config: &Config) -> Result<Arc<dyn Ingest>> {
    use rollup_metrics::RedisIngest;
    use rollup_redis::RedisPool;

    let redis = config
        .redis()
        .context("the redis ingest driver requires redis configuration")?;
    let pool = RedisPool::new(redis).context("failed to create the redis pool")?;

    Ok(Arc::new(RedisIngest::new(pool, config.ingest_stream())))
}

#[cfg(not(feature = "redis"))]
fn create_redis_ingest(_config: &Config) -> Result<Arc<dyn Ingest>> {
    anyhow::bail!("the redis ingest driver requires the `redis` feature")
}

#[cfg(test)]
mod tests {
    use rollup_metrics::{AggregateKind, AggregateQuery, Entry, Value};

    use super::*;

    async fn pipeline(value: serde_json::Value) -> Pipeline {
        rollup_test::setup();
        let config = Config::from_json_value(value).unwrap();
        Pipeline::from_config(&config).await.unwrap()
    }

    async fn record_requests(pipeline: &Pipeline) {
        for duration in [120, 80, 400] {
            let entry = Entry::new("slow_request", "GET /users", Some(duration)).max();
            pipeline.recorder().record(entry).await.unwrap();
        }
        pipeline.recorder().ingest().await;
    }

    #[tokio::test]
    async fn test_memory_queue() {
        let pipeline = pipeline(serde_json::json!({"ingest": {"driver": "memory"}})).await;
        record_requests(&pipeline).await;

        let query = AggregateQuery::new("slow_request", AggregateKind::Max, 60);
        assert!(pipeline.query().aggregate(&query).await.unwrap().is_empty());

        // One raw row per entry plus one bucket per default period.
        assert_eq!(pipeline.digest().await.unwrap(), 3 + 4);

        let results = pipeline.query().aggregate(&query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].values[&AggregateKind::Max], 400.0);
    }

    #[tokio::test]
    async fn test_storage_queue_writes_through() {
        let pipeline = pipeline(serde_json::json!({})).await;
        record_requests(&pipeline).await;

        assert_eq!(pipeline.digest().await.unwrap(), 0);

        let query = AggregateQuery::new("slow_request", AggregateKind::Max, 60);
        let results = pipeline.query().aggregate(&query).await.unwrap();
        assert_eq!(results[0].values[&AggregateKind::Max], 400.0);
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let pipeline = pipeline(serde_json::json!({
            "ingest": {"driver": "memory"},
            "store": {"driver": "sql", "dialect": "sqlite", "url": "sqlite::memory:"},
        }))
        .await;

        pipeline
            .recorder()
            .set(Value::new("system", "web-1", r#"{"load":0.5}"#))
            .await;
        pipeline.recorder().ingest().await;
        pipeline.digest().await.unwrap();

        let values = pipeline.query().values("system", None).await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, r#"{"load":0.5}"#);
    }

    #[tokio::test]
    async fn test_trim_drops_stale_queue_items() {
        let pipeline = pipeline(serde_json::json!({
            "ingest": {"driver": "memory", "keep": 60},
        }))
        .await;
        record_requests(&pipeline).await;

        let report = pipeline.trim_at(UnixTimestamp::now()).await.unwrap();
        assert_eq!(report.queue, 0);

        let report = pipeline
            .trim_at(UnixTimestamp::now().add_secs(120))
            .await
            .unwrap();
        assert_eq!(report.queue, 3);
        assert_eq!(pipeline.digest().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let config = Config::from_json_value(serde_json::json!({
            "storage": {"periods": []},
        }))
        .unwrap();

        assert!(Pipeline::from_config(&config).await.is_err());
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_redis_requires_feature() {
        let config = Config::from_json_value(serde_json::json!({
            "ingest": {"driver": "redis", "redis": "redis://127.0.0.1:6379"},
        }))
        .unwrap();

        let error = Pipeline::from_config(&config).await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "the redis ingest driver requires the `redis` feature"
        );
    }
}
