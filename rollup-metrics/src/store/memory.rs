use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::aggregation::{AggregateKey, Partial};
use crate::protocol::AggregateKind;
use crate::store::{
    AggregateRow, BucketFilter, EntryFilter, RawEntryRow, RawValueRow, RollupStore, StoreError,
    TrimCutoffs, TrimStats,
};

#[derive(Debug, Default)]
struct Tables {
    entries: Vec<RawEntryRow>,
    values: HashMap<(String, String), RawValueRow>,
    aggregates: BTreeMap<AggregateKey, AggregateRow>,
}

/// A [`RollupStore`] keeping all tables in process memory.
///
/// Writes are serialized by a single lock, which makes every upsert atomic. Suitable for tests
/// and single-process deployments that do not need to survive restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of rows in each table: entries, values and aggregates.
    pub fn len(&self) -> (usize, usize, usize) {
        let tables = self.tables.lock();
        (
            tables.entries.len(),
            tables.values.len(),
            tables.aggregates.len(),
        )
    }

    /// Returns `true` if all tables are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == (0, 0, 0)
    }

    /// Returns a copy of all aggregate rows, ordered by their uniqueness key.
    pub fn all_aggregates(&self) -> Vec<AggregateRow> {
        self.tables.lock().aggregates.values().cloned().collect()
    }
}

#[async_trait]
impl RollupStore for MemoryStore {
    async fn insert_entries(&self, rows: &[RawEntryRow]) -> Result<(), StoreError> {
        self.tables.lock().entries.extend_from_slice(rows);
        Ok(())
    }

    async fn upsert_values(&self, rows: &[RawValueRow]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();

        for row in rows {
            let key = (row.ty.clone(), row.key_hash.clone());
            match tables.values.get_mut(&key) {
                Some(existing) if existing.timestamp > row.timestamp => (),
                Some(existing) => *existing = row.clone(),
                None => {
                    tables.values.insert(key, row.clone());
                }
            }
        }

        Ok(())
    }

    async fn upsert_aggregates(
        &self,
        kind: AggregateKind,
        rows: &[AggregateRow],
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();

        for row in rows.iter().filter(|row| row.kind == kind) {
            let incoming = Partial::new(row.value, row.count);
            tables
                .aggregates
                .entry(AggregateKey::of(row))
                .and_modify(|existing| {
                    let merged = Partial::new(existing.value, existing.count).merge(kind, incoming);
                    existing.value = merged.value;
                    existing.count = merged.count;
                })
                .or_insert_with(|| row.clone());
        }

        Ok(())
    }

    async fn aggregates(&self, filter: &BucketFilter) -> Result<Vec<AggregateRow>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .aggregates
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    async fn entries(&self, filter: &EntryFilter) -> Result<Vec<RawEntryRow>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .entries
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    async fn values(
        &self,
        ty: &str,
        keys: Option<&[String]>,
    ) -> Result<Vec<RawValueRow>, StoreError> {
        let tables = self.tables.lock();
        let mut rows: Vec<_> = tables
            .values
            .values()
            .filter(|row| row.ty == ty)
            .filter(|row| keys.is_none_or(|keys| keys.contains(&row.key)))
            .cloned()
            .collect();

        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }

    async fn trim(&self, cutoffs: &TrimCutoffs) -> Result<TrimStats, StoreError> {
        let mut tables = self.tables.lock();
        let mut stats = TrimStats::default();

        if let Some(cutoff) = cutoffs.raw {
            let before = tables.entries.len();
            tables.entries.retain(|row| row.timestamp > cutoff);
            stats.entries = (before - tables.entries.len()) as u64;

            let before = tables.values.len();
            tables.values.retain(|_, row| row.timestamp > cutoff);
            stats.values = (before - tables.values.len()) as u64;
        }

        let before = tables.aggregates.len();
        tables
            .aggregates
            .retain(|key, _| match cutoffs.aggregates(key.period) {
                Some(cutoff) => key.bucket > cutoff,
                None => true,
            });
        stats.aggregates = (before - tables.aggregates.len()) as u64;

        Ok(stats)
    }

    async fn purge(&self, types: Option<&[String]>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();

        match types {
            None => *tables = Tables::default(),
            Some(types) => {
                tables.entries.retain(|row| !types.contains(&row.ty));
                tables.values.retain(|_, row| !types.contains(&row.ty));
                tables.aggregates.retain(|key, _| !types.contains(&key.ty));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rollup_common::UnixTimestamp;

    use super::*;
    use crate::bucket::Period;

    fn ts(secs: u64) -> UnixTimestamp {
        UnixTimestamp::from_secs(secs)
    }

    fn aggregate(bucket: u64, kind: AggregateKind, value: f64, count: u64) -> AggregateRow {
        AggregateRow {
            bucket: ts(bucket),
            period: Period::from_minutes(60),
            ty: "slow_query".to_owned(),
            key: "select 1".to_owned(),
            key_hash: crate::protocol::key_hash("select 1"),
            kind,
            value,
            count,
        }
    }

    fn value(timestamp: u64, payload: &str) -> RawValueRow {
        RawValueRow {
            timestamp: ts(timestamp),
            ty: "system".to_owned(),
            key: "web-1".to_owned(),
            key_hash: crate::protocol::key_hash("web-1"),
            value: payload.to_owned(),
        }
    }

    #[tokio::test]
    async fn test_upsert_merges_avg() {
        let store = MemoryStore::new();
        store
            .upsert_aggregates(AggregateKind::Avg, &[aggregate(0, AggregateKind::Avg, 2.0, 2)])
            .await
            .unwrap();
        store
            .upsert_aggregates(AggregateKind::Avg, &[aggregate(0, AggregateKind::Avg, 8.0, 1)])
            .await
            .unwrap();

        let rows = store.all_aggregates();
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].value, rows[0].count), (4.0, 3));
    }

    #[tokio::test]
    async fn test_upsert_zero_count_is_identity() {
        let store = MemoryStore::new();
        let kind = AggregateKind::Sum;

        store
            .upsert_aggregates(kind, &[aggregate(0, kind, 5.0, 2)])
            .await
            .unwrap();
        store
            .upsert_aggregates(kind, &[aggregate(0, kind, 5.0, 0)])
            .await
            .unwrap();

        assert_eq!(store.all_aggregates(), vec![aggregate(0, kind, 5.0, 2)]);
    }

    #[tokio::test]
    async fn test_values_latest_wins() {
        let store = MemoryStore::new();
        store.upsert_values(&[value(20, "b")]).await.unwrap();
        store.upsert_values(&[value(10, "a")]).await.unwrap();

        let rows = store.values("system", None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, "b");

        store.upsert_values(&[value(20, "c")]).await.unwrap();
        let rows = store.values("system", Some(&["web-1".to_owned()])).await.unwrap();
        assert_eq!(rows[0].value, "c");
    }

    #[tokio::test]
    async fn test_purge_types() {
        let store = MemoryStore::new();
        store
            .upsert_aggregates(AggregateKind::Count, &[aggregate(0, AggregateKind::Count, 1.0, 1)])
            .await
            .unwrap();
        store.upsert_values(&[value(1, "a")]).await.unwrap();

        store.purge(Some(&["system".to_owned()])).await.unwrap();
        assert_eq!(store.len(), (0, 0, 1));

        store.purge(None).await.unwrap();
        assert!(store.is_empty());
    }
}
