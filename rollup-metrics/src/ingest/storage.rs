use async_trait::async_trait;
use rollup_common::UnixTimestamp;

use crate::ingest::{Batch, Ingest, IngestError, Receipt};
use crate::protocol::Sample;
use crate::storage::Storage;

/// A transparent queue writing samples straight to the rollup store.
///
/// Every push is digested on the spot at the current time, so there is never anything to pop.
/// Failed writes are logged by [`Storage::store`] and do not fail the push.
#[derive(Clone, Debug)]
pub struct StorageIngest {
    storage: Storage,
}

impl StorageIngest {
    /// Creates a queue writing to `storage`.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Ingest for StorageIngest {
    async fn push(&self, samples: Vec<Sample>) -> Result<(), IngestError> {
        self.storage.store(&samples, UnixTimestamp::now()).await;
        Ok(())
    }

    async fn pop_batch(&self, _max: usize) -> Result<Batch, IngestError> {
        Ok(Batch::default())
    }

    async fn ack(&self, _receipt: Receipt) -> Result<(), IngestError> {
        Ok(())
    }

    async fn trim(&self, _older_than: UnixTimestamp) -> Result<u64, IngestError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::{Entry, Value};
    use crate::retention::RetentionConfig;
    use crate::storage::StorageConfig;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_push_stores_immediately() {
        let store = Arc::new(MemoryStore::new());
        let storage = Storage::new(
            store.clone(),
            StorageConfig::default(),
            RetentionConfig::default(),
        );
        let ingest = StorageIngest::new(storage);

        ingest
            .push(vec![
                Entry::new("slow_request", "GET /", Some(120)).count().into(),
                Value::new("system", "web-1", "{}").into(),
            ])
            .await
            .unwrap();

        // One raw entry, one value and a count bucket in each of the four periods.
        assert_eq!(store.len(), (1, 1, 4));
        assert!(ingest.pop_batch(10).await.unwrap().is_empty());
    }
}
