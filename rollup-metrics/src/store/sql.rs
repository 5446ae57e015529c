use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};

use rollup_common::UnixTimestamp;

use crate::bucket::Period;
use crate::protocol::AggregateKind;
use crate::store::{
    AggregateRow, BucketFilter, Dialect, EntryFilter, RawEntryRow, RawValueRow, RollupStore,
    StoreError, TrimCutoffs, TrimStats, AGGREGATES_TABLE, ENTRIES_TABLE, VALUES_TABLE,
};

/// A bind parameter of a dynamically built statement.
#[derive(Clone, Debug)]
enum Param {
    Int(i64),
    NullableInt(Option<i64>),
    Float(f64),
    Text(String),
}

fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: Vec<Param>,
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            Param::Int(value) => query.bind(value),
            Param::NullableInt(value) => query.bind(value),
            Param::Float(value) => query.bind(value),
            Param::Text(value) => query.bind(value),
        };
    }
    query
}

fn secs(timestamp: UnixTimestamp) -> Param {
    Param::Int(i64::try_from(timestamp.as_secs()).unwrap_or(i64::MAX))
}

fn invalid(table: &'static str, reason: impl ToString) -> StoreError {
    StoreError::InvalidRow {
        table,
        reason: reason.to_string(),
    }
}

fn get_timestamp(row: &AnyRow, table: &'static str, column: &str) -> Result<UnixTimestamp, StoreError> {
    let secs: i64 = row.try_get(column).map_err(StoreError::Read)?;
    let secs = u64::try_from(secs).map_err(|_| invalid(table, format!("negative {column}")))?;
    Ok(UnixTimestamp::from_secs(secs))
}

fn get_period(row: &AnyRow, table: &'static str) -> Result<Period, StoreError> {
    let minutes: i64 = row.try_get("period").map_err(StoreError::Read)?;
    let minutes = u32::try_from(minutes).map_err(|_| invalid(table, "period out of range"))?;
    Ok(Period::from_minutes(minutes))
}

fn decode_entry(row: &AnyRow) -> Result<RawEntryRow, StoreError> {
    Ok(RawEntryRow {
        timestamp: get_timestamp(row, ENTRIES_TABLE, "timestamp")?,
        ty: row.try_get("type").map_err(StoreError::Read)?,
        key: row.try_get("key").map_err(StoreError::Read)?,
        key_hash: row.try_get("key_hash").map_err(StoreError::Read)?,
        value: row.try_get("value").map_err(StoreError::Read)?,
    })
}

fn decode_value(row: &AnyRow) -> Result<RawValueRow, StoreError> {
    Ok(RawValueRow {
        timestamp: get_timestamp(row, VALUES_TABLE, "timestamp")?,
        ty: row.try_get("type").map_err(StoreError::Read)?,
        key: row.try_get("key").map_err(StoreError::Read)?,
        key_hash: row.try_get("key_hash").map_err(StoreError::Read)?,
        value: row.try_get("value").map_err(StoreError::Read)?,
    })
}

fn decode_aggregate(row: &AnyRow) -> Result<AggregateRow, StoreError> {
    let kind: String = row.try_get("aggregate_kind").map_err(StoreError::Read)?;
    let count: i64 = row.try_get("count").map_err(StoreError::Read)?;

    Ok(AggregateRow {
        bucket: get_timestamp(row, AGGREGATES_TABLE, "bucket")?,
        period: get_period(row, AGGREGATES_TABLE)?,
        ty: row.try_get("type").map_err(StoreError::Read)?,
        key: row.try_get("key").map_err(StoreError::Read)?,
        key_hash: row.try_get("key_hash").map_err(StoreError::Read)?,
        kind: kind
            .parse()
            .map_err(|err| invalid(AGGREGATES_TABLE, err))?,
        value: row.try_get("value").map_err(StoreError::Read)?,
        count: u64::try_from(count).map_err(|_| invalid(AGGREGATES_TABLE, "negative count"))?,
    })
}

/// A [`RollupStore`] backed by a relational database.
///
/// Connects through the sqlx `Any` driver, the [`Dialect`] decides which SQL is issued. Merges
/// of aggregates and values are single upsert statements, so any number of digesters may write
/// concurrently.
#[derive(Clone, Debug)]
pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlStore {
    /// Connects to the database at `url` and creates the schema if needed.
    ///
    /// Every connection to an in-memory SQLite database opens a separate database, so for those
    /// the pool is limited to a single connection that is never closed.
    pub async fn connect(
        url: &str,
        dialect: Dialect,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let options = if dialect == Dialect::Sqlite && url.contains(":memory:") {
            AnyPoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            AnyPoolOptions::new().max_connections(max_connections)
        };

        Self::connect_with(options, url, dialect).await
    }

    /// Connects with custom pool options and creates the schema if needed.
    pub async fn connect_with(
        options: AnyPoolOptions,
        url: &str,
        dialect: Dialect,
    ) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();

        let pool = options.connect(url).await.map_err(StoreError::Setup)?;
        let store = Self { pool, dialect };
        store.setup().await?;

        rollup_log::debug!(dialect = %dialect, "rollup store connected");
        Ok(store)
    }

    async fn setup(&self) -> Result<(), StoreError> {
        for statement in self.dialect.schema() {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::Setup)?;
        }

        Ok(())
    }

    /// Returns the dialect of this store.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&self, sql: String, params: Vec<Param>) -> Result<u64, StoreError> {
        let result = bind_all(sqlx::query(&sql), params)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Write)?;

        Ok(result.rows_affected())
    }

    async fn fetch(&self, sql: String, params: Vec<Param>) -> Result<Vec<AnyRow>, StoreError> {
        bind_all(sqlx::query(&sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Read)
    }
}

#[async_trait]
impl RollupStore for SqlStore {
    async fn insert_entries(&self, rows: &[RawEntryRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut params = Vec::with_capacity(rows.len() * 5);
        for row in rows {
            params.extend([
                secs(row.timestamp),
                Param::Text(row.ty.clone()),
                Param::Text(row.key.clone()),
                Param::Text(row.key_hash.clone()),
                Param::NullableInt(row.value),
            ]);
        }

        self.execute(self.dialect.insert_entries(rows.len()), params)
            .await?;
        Ok(())
    }

    async fn upsert_values(&self, rows: &[RawValueRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut params = Vec::with_capacity(rows.len() * 5);
        for row in rows {
            params.extend([
                secs(row.timestamp),
                Param::Text(row.ty.clone()),
                Param::Text(row.key.clone()),
                Param::Text(row.key_hash.clone()),
                Param::Text(row.value.clone()),
            ]);
        }

        self.execute(self.dialect.upsert_values(rows.len()), params)
            .await?;
        Ok(())
    }

    async fn upsert_aggregates(
        &self,
        kind: AggregateKind,
        rows: &[AggregateRow],
    ) -> Result<(), StoreError> {
        let mut params = Vec::with_capacity(rows.len() * 8);
        let mut count = 0;

        for row in rows.iter().filter(|row| row.kind == kind) {
            params.extend([
                secs(row.bucket),
                Param::Int(row.period.as_minutes().into()),
                Param::Text(row.ty.clone()),
                Param::Text(row.key.clone()),
                Param::Text(row.key_hash.clone()),
                Param::Text(kind.as_str().to_owned()),
                Param::Float(row.value),
                Param::Int(i64::try_from(row.count).unwrap_or(i64::MAX)),
            ]);
            count += 1;
        }

        if count == 0 {
            return Ok(());
        }

        self.execute(self.dialect.upsert_aggregates(kind, count), params)
            .await?;
        Ok(())
    }

    async fn aggregates(&self, filter: &BucketFilter) -> Result<Vec<AggregateRow>, StoreError> {
        if filter.types.is_empty() || filter.kinds.is_empty() {
            return Ok(Vec::new());
        }

        let mut params = vec![
            Param::Int(filter.period.as_minutes().into()),
            secs(filter.from),
        ];
        params.extend(filter.types.iter().cloned().map(Param::Text));
        params.extend(
            filter
                .kinds
                .iter()
                .map(|kind| Param::Text(kind.as_str().to_owned())),
        );

        let sql = self
            .dialect
            .select_aggregates(filter.types.len(), filter.kinds.len());

        self.fetch(sql, params)
            .await?
            .iter()
            .map(decode_aggregate)
            .collect()
    }

    async fn entries(&self, filter: &EntryFilter) -> Result<Vec<RawEntryRow>, StoreError> {
        if filter.types.is_empty() || filter.from >= filter.until {
            return Ok(Vec::new());
        }

        let mut params: Vec<_> = filter.types.iter().cloned().map(Param::Text).collect();
        params.extend([secs(filter.from), secs(filter.until)]);

        let sql = self.dialect.select_entries(filter.types.len());
        self.fetch(sql, params)
            .await?
            .iter()
            .map(decode_entry)
            .collect()
    }

    async fn values(
        &self,
        ty: &str,
        keys: Option<&[String]>,
    ) -> Result<Vec<RawValueRow>, StoreError> {
        if keys.is_some_and(|keys| keys.is_empty()) {
            return Ok(Vec::new());
        }

        let mut params = vec![Param::Text(ty.to_owned())];
        if let Some(keys) = keys {
            params.extend(
                keys.iter()
                    .map(|key| Param::Text(crate::protocol::key_hash(key))),
            );
        }

        let sql = self.dialect.select_values(keys.map(<[_]>::len));
        self.fetch(sql, params)
            .await?
            .iter()
            .map(decode_value)
            .collect()
    }

    async fn trim(&self, cutoffs: &TrimCutoffs) -> Result<TrimStats, StoreError> {
        let mut stats = TrimStats::default();
        let mut tx = self.pool.begin().await.map_err(StoreError::Write)?;

        if let Some(raw) = cutoffs.raw {
            stats.entries = sqlx::query(&self.dialect.delete_raw_before(ENTRIES_TABLE))
                .bind(i64::try_from(raw.as_secs()).unwrap_or(i64::MAX))
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Write)?
                .rows_affected();

            stats.values = sqlx::query(&self.dialect.delete_raw_before(VALUES_TABLE))
                .bind(i64::try_from(raw.as_secs()).unwrap_or(i64::MAX))
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Write)?
                .rows_affected();
        }

        let periods = sqlx::query(&self.dialect.select_periods())
            .fetch_all(&mut *tx)
            .await
            .map_err(StoreError::Read)?;

        for row in &periods {
            let period = get_period(row, AGGREGATES_TABLE)?;
            let Some(cutoff) = cutoffs.aggregates(period) else {
                continue;
            };

            stats.aggregates += sqlx::query(&self.dialect.delete_buckets_before())
                .bind(i64::from(period.as_minutes()))
                .bind(i64::try_from(cutoff.as_secs()).unwrap_or(i64::MAX))
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Write)?
                .rows_affected();
        }

        tx.commit().await.map_err(StoreError::Write)?;
        Ok(stats)
    }

    async fn purge(&self, types: Option<&[String]>) -> Result<(), StoreError> {
        if types.is_some_and(|types| types.is_empty()) {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(StoreError::Write)?;

        for table in [ENTRIES_TABLE, VALUES_TABLE, AGGREGATES_TABLE] {
            let sql = self.dialect.purge(table, types.map(<[_]>::len));
            let params = types
                .unwrap_or_default()
                .iter()
                .cloned()
                .map(Param::Text)
                .collect();

            bind_all(sqlx::query(&sql), params)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Write)?;
        }

        tx.commit().await.map_err(StoreError::Write)
    }
}
