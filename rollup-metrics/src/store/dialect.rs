use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::AggregateKind;

/// Name of the raw entries table.
pub const ENTRIES_TABLE: &str = "rollup_entries";
/// Name of the latest-wins values table.
pub const VALUES_TABLE: &str = "rollup_values";
/// Name of the aggregate buckets table.
pub const AGGREGATES_TABLE: &str = "rollup_aggregates";

const SQLITE_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS rollup_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        type TEXT NOT NULL,
        "key" TEXT NOT NULL,
        key_hash TEXT NOT NULL,
        value INTEGER
    )"#,
    "CREATE INDEX IF NOT EXISTS rollup_entries_timestamp ON rollup_entries (timestamp)",
    "CREATE INDEX IF NOT EXISTS rollup_entries_type_timestamp ON rollup_entries (type, timestamp)",
    "CREATE INDEX IF NOT EXISTS rollup_entries_key_hash ON rollup_entries (key_hash)",
    r#"CREATE TABLE IF NOT EXISTS rollup_values (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        type TEXT NOT NULL,
        "key" TEXT NOT NULL,
        key_hash TEXT NOT NULL,
        value TEXT NOT NULL,
        UNIQUE (type, key_hash)
    )"#,
    "CREATE INDEX IF NOT EXISTS rollup_values_timestamp ON rollup_values (timestamp)",
    r#"CREATE TABLE IF NOT EXISTS rollup_aggregates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        bucket INTEGER NOT NULL,
        period INTEGER NOT NULL,
        type TEXT NOT NULL,
        "key" TEXT NOT NULL,
        key_hash TEXT NOT NULL,
        aggregate_kind TEXT NOT NULL,
        value REAL NOT NULL,
        count INTEGER NOT NULL,
        UNIQUE (bucket, period, type, aggregate_kind, key_hash)
    )"#,
    "CREATE INDEX IF NOT EXISTS rollup_aggregates_period_bucket ON rollup_aggregates (period, bucket)",
    "CREATE INDEX IF NOT EXISTS rollup_aggregates_type ON rollup_aggregates (type)",
];

const POSTGRES_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS rollup_entries (
        id BIGSERIAL PRIMARY KEY,
        timestamp BIGINT NOT NULL,
        type VARCHAR(255) NOT NULL,
        "key" TEXT NOT NULL,
        key_hash VARCHAR(32) NOT NULL,
        value BIGINT
    )"#,
    "CREATE INDEX IF NOT EXISTS rollup_entries_timestamp ON rollup_entries (timestamp)",
    "CREATE INDEX IF NOT EXISTS rollup_entries_type_timestamp ON rollup_entries (type, timestamp)",
    "CREATE INDEX IF NOT EXISTS rollup_entries_key_hash ON rollup_entries (key_hash)",
    r#"CREATE TABLE IF NOT EXISTS rollup_values (
        id BIGSERIAL PRIMARY KEY,
        timestamp BIGINT NOT NULL,
        type VARCHAR(255) NOT NULL,
        "key" TEXT NOT NULL,
        key_hash VARCHAR(32) NOT NULL,
        value TEXT NOT NULL,
        UNIQUE (type, key_hash)
    )"#,
    "CREATE INDEX IF NOT EXISTS rollup_values_timestamp ON rollup_values (timestamp)",
    r#"CREATE TABLE IF NOT EXISTS rollup_aggregates (
        id BIGSERIAL PRIMARY KEY,
        bucket BIGINT NOT NULL,
        period BIGINT NOT NULL,
        type VARCHAR(255) NOT NULL,
        "key" TEXT NOT NULL,
        key_hash VARCHAR(32) NOT NULL,
        aggregate_kind VARCHAR(16) NOT NULL,
        value DOUBLE PRECISION NOT NULL,
        count BIGINT NOT NULL,
        UNIQUE (bucket, period, type, aggregate_kind, key_hash)
    )"#,
    "CREATE INDEX IF NOT EXISTS rollup_aggregates_period_bucket ON rollup_aggregates (period, bucket)",
    "CREATE INDEX IF NOT EXISTS rollup_aggregates_type ON rollup_aggregates (type)",
];

// MySQL has no `CREATE INDEX IF NOT EXISTS`, so indexes are declared inline. Text columns are
// VARCHAR since the `Any` driver decodes TEXT columns as blobs.
const MYSQL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS rollup_entries (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        timestamp BIGINT NOT NULL,
        type VARCHAR(255) NOT NULL,
        `key` VARCHAR(2048) NOT NULL,
        key_hash VARCHAR(32) NOT NULL,
        value BIGINT NULL,
        KEY rollup_entries_timestamp (timestamp),
        KEY rollup_entries_type_timestamp (type, timestamp),
        KEY rollup_entries_key_hash (key_hash)
    ) DEFAULT CHARSET = utf8mb4",
    "CREATE TABLE IF NOT EXISTS rollup_values (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        timestamp BIGINT NOT NULL,
        type VARCHAR(255) NOT NULL,
        `key` VARCHAR(2048) NOT NULL,
        key_hash VARCHAR(32) NOT NULL,
        value VARCHAR(8192) NOT NULL,
        UNIQUE KEY rollup_values_type_key_hash (type, key_hash),
        KEY rollup_values_timestamp (timestamp)
    ) DEFAULT CHARSET = utf8mb4",
    "CREATE TABLE IF NOT EXISTS rollup_aggregates (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        bucket BIGINT NOT NULL,
        period BIGINT NOT NULL,
        type VARCHAR(255) NOT NULL,
        `key` VARCHAR(2048) NOT NULL,
        key_hash VARCHAR(32) NOT NULL,
        aggregate_kind VARCHAR(16) NOT NULL,
        value DOUBLE NOT NULL,
        count BIGINT NOT NULL,
        UNIQUE KEY rollup_aggregates_unique (bucket, period, type, aggregate_kind, key_hash),
        KEY rollup_aggregates_period_bucket (period, bucket),
        KEY rollup_aggregates_type (type)
    ) DEFAULT CHARSET = utf8mb4",
];

/// The SQL flavor of a storage engine.
///
/// Every statement issued by the [`SqlStore`](super::SqlStore) is rendered by the dialect, which
/// owns the differences between engines: schema types, identifier quoting, placeholders and the
/// atomic upsert statements.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// SQLite 3.24 or later.
    #[default]
    Sqlite,
    /// PostgreSQL 9.5 or later.
    Postgres,
    /// MySQL 5.7 or later, and MariaDB.
    Mysql,
}

impl Dialect {
    /// Returns the name of this dialect.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    /// Returns the statements creating all tables and indexes if they do not exist.
    pub fn schema(&self) -> &'static [&'static str] {
        match self {
            Self::Sqlite => SQLITE_SCHEMA,
            Self::Postgres => POSTGRES_SCHEMA,
            Self::Mysql => MYSQL_SCHEMA,
        }
    }

    /// The quoted `key` column, which is reserved in some engines.
    fn key(&self) -> &'static str {
        match self {
            Self::Sqlite | Self::Postgres => "\"key\"",
            Self::Mysql => "`key`",
        }
    }

    /// Rewrites `?` placeholders to the engine's bind parameter syntax.
    fn render(&self, sql: String) -> String {
        match self {
            Self::Sqlite | Self::Mysql => sql,
            Self::Postgres => {
                let mut rendered = String::with_capacity(sql.len() + 16);
                let mut index = 0;
                for c in sql.chars() {
                    if c == '?' {
                        index += 1;
                        rendered.push_str(&format!("${index}"));
                    } else {
                        rendered.push(c);
                    }
                }
                rendered
            }
        }
    }

    /// Inserts `rows` raw entries.
    pub fn insert_entries(&self, rows: usize) -> String {
        self.render(format!(
            "INSERT INTO {ENTRIES_TABLE} (timestamp, type, {key}, key_hash, value) VALUES {values}",
            key = self.key(),
            values = tuples(5, rows),
        ))
    }

    /// Inserts `rows` values, replacing existing rows that are not newer.
    pub fn upsert_values(&self, rows: usize) -> String {
        let conflict = match self {
            Self::Sqlite | Self::Postgres => format!(
                "ON CONFLICT (type, key_hash) DO UPDATE SET timestamp = excluded.timestamp, \
                 value = excluded.value WHERE excluded.timestamp >= {VALUES_TABLE}.timestamp"
            ),
            // Assignments are evaluated in order, so `value` must see the old timestamp.
            Self::Mysql => "ON DUPLICATE KEY UPDATE \
                 value = IF(VALUES(timestamp) >= timestamp, VALUES(value), value), \
                 timestamp = GREATEST(timestamp, VALUES(timestamp))"
                .to_owned(),
        };

        self.render(format!(
            "INSERT INTO {VALUES_TABLE} (timestamp, type, {key}, key_hash, value) VALUES {values} {conflict}",
            key = self.key(),
            values = tuples(5, rows),
        ))
    }

    /// Inserts `rows` aggregate rows of one kind, merging into existing buckets.
    ///
    /// The merge happens inside the statement, so concurrent writers never interleave a read and
    /// a write of the same bucket. A side with a count of zero is the identity of the merge and
    /// leaves the other side's value untouched.
    pub fn upsert_aggregates(&self, kind: AggregateKind, rows: usize) -> String {
        let (old_value, old_count, new_value, new_count) = match self {
            Self::Sqlite | Self::Postgres => (
                "rollup_aggregates.value",
                "rollup_aggregates.count",
                "excluded.value",
                "excluded.count",
            ),
            Self::Mysql => ("value", "count", "VALUES(value)", "VALUES(count)"),
        };

        let merged = match (kind, self) {
            (AggregateKind::Count | AggregateKind::Sum, _) => format!("{old_value} + {new_value}"),
            (AggregateKind::Min, Self::Sqlite) => format!("MIN({old_value}, {new_value})"),
            (AggregateKind::Min, _) => format!("LEAST({old_value}, {new_value})"),
            (AggregateKind::Max, Self::Sqlite) => format!("MAX({old_value}, {new_value})"),
            (AggregateKind::Max, _) => format!("GREATEST({old_value}, {new_value})"),
            (AggregateKind::Avg, _) => format!(
                "({old_value} * {old_count} + {new_value} * {new_count}) / ({old_count} + {new_count})"
            ),
        };

        let value = format!(
            "CASE WHEN {new_count} = 0 THEN {old_value} WHEN {old_count} = 0 THEN {new_value} \
             ELSE {merged} END"
        );
        let count = format!("{old_count} + {new_count}");

        let conflict = match self {
            Self::Sqlite | Self::Postgres => format!(
                "ON CONFLICT (bucket, period, type, aggregate_kind, key_hash) DO UPDATE SET \
                 value = {value}, count = {count}"
            ),
            // `value` must be assigned first, it reads the old `count`.
            Self::Mysql => format!("ON DUPLICATE KEY UPDATE value = {value}, count = {count}"),
        };

        self.render(format!(
            "INSERT INTO {AGGREGATES_TABLE} (bucket, period, type, {key}, key_hash, aggregate_kind, value, count) \
             VALUES {values} {conflict}",
            key = self.key(),
            values = tuples(8, rows),
        ))
    }

    /// Selects buckets of one period for some types and kinds.
    pub fn select_aggregates(&self, types: usize, kinds: usize) -> String {
        self.render(format!(
            "SELECT bucket, period, type, {key}, key_hash, aggregate_kind, value, count \
             FROM {AGGREGATES_TABLE} WHERE period = ? AND bucket >= ? \
             AND type IN ({types}) AND aggregate_kind IN ({kinds}) ORDER BY bucket, id",
            key = self.key(),
            types = list(types),
            kinds = list(kinds),
        ))
    }

    /// Selects raw entries of some types within a half-open time range.
    pub fn select_entries(&self, types: usize) -> String {
        self.render(format!(
            "SELECT timestamp, type, {key}, key_hash, value FROM {ENTRIES_TABLE} \
             WHERE type IN ({types}) AND timestamp >= ? AND timestamp < ? ORDER BY timestamp, id",
            key = self.key(),
            types = list(types),
        ))
    }

    /// Selects the values of a type, optionally restricted to some key hashes.
    pub fn select_values(&self, keys: Option<usize>) -> String {
        let keys = match keys {
            Some(keys) => format!(" AND key_hash IN ({})", list(keys)),
            None => String::new(),
        };

        self.render(format!(
            "SELECT timestamp, type, {key}, key_hash, value FROM {VALUES_TABLE} \
             WHERE type = ?{keys} ORDER BY {key}",
            key = self.key(),
        ))
    }

    /// Deletes raw rows of `table` at or before a timestamp.
    pub fn delete_raw_before(&self, table: &str) -> String {
        self.render(format!("DELETE FROM {table} WHERE timestamp <= ?"))
    }

    /// Selects all periods present in the aggregates table.
    pub fn select_periods(&self) -> String {
        format!("SELECT DISTINCT period FROM {AGGREGATES_TABLE}")
    }

    /// Deletes buckets of one period at or before a bucket start.
    pub fn delete_buckets_before(&self) -> String {
        self.render(format!(
            "DELETE FROM {AGGREGATES_TABLE} WHERE period = ? AND bucket <= ?"
        ))
    }

    /// Deletes all rows of `table`, optionally restricted to `types` sample types.
    pub fn purge(&self, table: &str, types: Option<usize>) -> String {
        match types {
            Some(types) => self.render(format!(
                "DELETE FROM {table} WHERE type IN ({})",
                list(types)
            )),
            None => format!("DELETE FROM {table}"),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns `count` comma separated placeholders.
fn list(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Returns `rows` comma separated tuples of `width` placeholders.
fn tuples(width: usize, rows: usize) -> String {
    vec![format!("({})", list(width)); rows].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_placeholders() {
        insta::assert_snapshot!(
            Dialect::Postgres.insert_entries(2),
            @r#"INSERT INTO rollup_entries (timestamp, type, "key", key_hash, value) VALUES ($1, $2, $3, $4, $5), ($6, $7, $8, $9, $10)"#
        );
    }

    #[test]
    fn test_sqlite_upsert_min() {
        insta::assert_snapshot!(
            Dialect::Sqlite.upsert_aggregates(AggregateKind::Min, 1),
            @r#"INSERT INTO rollup_aggregates (bucket, period, type, "key", key_hash, aggregate_kind, value, count) VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (bucket, period, type, aggregate_kind, key_hash) DO UPDATE SET value = CASE WHEN excluded.count = 0 THEN rollup_aggregates.value WHEN rollup_aggregates.count = 0 THEN excluded.value ELSE MIN(rollup_aggregates.value, excluded.value) END, count = rollup_aggregates.count + excluded.count"#
        );
    }

    #[test]
    fn test_postgres_upsert_avg() {
        insta::assert_snapshot!(
            Dialect::Postgres.upsert_aggregates(AggregateKind::Avg, 1),
            @r#"INSERT INTO rollup_aggregates (bucket, period, type, "key", key_hash, aggregate_kind, value, count) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (bucket, period, type, aggregate_kind, key_hash) DO UPDATE SET value = CASE WHEN excluded.count = 0 THEN rollup_aggregates.value WHEN rollup_aggregates.count = 0 THEN excluded.value ELSE (rollup_aggregates.value * rollup_aggregates.count + excluded.value * excluded.count) / (rollup_aggregates.count + excluded.count) END, count = rollup_aggregates.count + excluded.count"#
        );
    }

    #[test]
    fn test_mysql_upsert_max() {
        insta::assert_snapshot!(
            Dialect::Mysql.upsert_aggregates(AggregateKind::Max, 1),
            @"INSERT INTO rollup_aggregates (bucket, period, type, `key`, key_hash, aggregate_kind, value, count) VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON DUPLICATE KEY UPDATE value = CASE WHEN VALUES(count) = 0 THEN value WHEN count = 0 THEN VALUES(value) ELSE GREATEST(value, VALUES(value)) END, count = count + VALUES(count)"
        );
    }

    #[test]
    fn test_mysql_upsert_values() {
        insta::assert_snapshot!(
            Dialect::Mysql.upsert_values(1),
            @"INSERT INTO rollup_values (timestamp, type, `key`, key_hash, value) VALUES (?, ?, ?, ?, ?) ON DUPLICATE KEY UPDATE value = IF(VALUES(timestamp) >= timestamp, VALUES(value), value), timestamp = GREATEST(timestamp, VALUES(timestamp))"
        );
    }

    #[test]
    fn test_select_values_by_key() {
        insta::assert_snapshot!(
            Dialect::Postgres.select_values(Some(2)),
            @r#"SELECT timestamp, type, "key", key_hash, value FROM rollup_values WHERE type = $1 AND key_hash IN ($2, $3) ORDER BY "key""#
        );
    }

    #[test]
    fn test_dialect_from_config() {
        let dialect: Dialect = serde_json::from_str(r#""postgres""#).unwrap();
        assert_eq!(dialect, Dialect::Postgres);
        assert!(serde_json::from_str::<Dialect>(r#""oracle""#).is_err());
    }
}
