use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt, fs, io};

use rollup_log::LogConfig;
use rollup_metrics::{
    DigestConfig, Dialect, QueryConfig, RecorderConfig, RetentionConfig, StorageConfig,
    DEFAULT_STREAM, MAX_KEEP,
};
use rollup_redis::RedisConfig;
use serde::{Deserialize, Serialize};

/// The name of the configuration file within the configuration directory.
const CONFIG_FILE: &str = "config.yml";

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override or a validated field.
    Field(&'static str),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    kind: ConfigErrorKind,
    source: ConfigErrorSource,
    cause: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            kind,
            source: ConfigErrorSource::None,
            cause: None,
        }
    }

    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            cause: Some(Box::new(cause)),
            ..Self::new(kind)
        }
    }

    fn for_field<E>(cause: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    fn invalid(field: &'static str) -> Self {
        Self::new(ConfigErrorKind::InvalidValue).field(field)
    }

    fn file(mut self, path: &Path) -> Self {
        self.source = ConfigErrorSource::File(path.to_path_buf());
        self
    }

    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::Field(name);
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => write!(f, "{}", self.kind),
            ConfigErrorSource::File(path) => write!(f, "{} (file {})", self.kind, path.display()),
            ConfigErrorSource::Field(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_ref().map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

/// The kind of a [`ConfigError`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to serialize the configuration.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// Error returned when parsing an unknown [`IngestDriver`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown ingest driver `{0}`")]
pub struct ParseIngestDriverError(String);

/// Selects the queue between recorders and the digest.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestDriver {
    /// Drops all samples.
    Null,
    /// Writes samples to the store immediately, without a queue.
    #[default]
    Storage,
    /// Queues samples in process until they are digested.
    Memory,
    /// Queues samples in a Redis stream.
    Redis,
}

impl FromStr for IngestDriver {
    type Err = ParseIngestDriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "null" => Ok(Self::Null),
            "storage" => Ok(Self::Storage),
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(ParseIngestDriverError(other.to_owned())),
        }
    }
}

/// Selects the engine persisting rollups.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    /// In-process tables, lost on restart.
    #[default]
    Memory,
    /// A SQL database reached through [`Store::url`].
    Sql,
}

/// Controls internal statsd metrics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// Host and port of the statsd server. Metrics are disabled if not set.
    pub statsd: Option<String>,
    /// Prefix prepended to all metric names.
    pub prefix: String,
    /// Tags added to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Size of the UDP send buffer in bytes.
    pub buffer_size: Option<usize>,
    /// Sample rate between 0.0 and 1.0.
    pub sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "rollup".to_owned(),
            default_tags: BTreeMap::new(),
            buffer_size: None,
            sample_rate: 1.0,
        }
    }
}

/// Controls the ingest queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ingest {
    /// The queue implementation.
    pub driver: IngestDriver,
    /// Redis connection for the `redis` driver.
    pub redis: Option<RedisConfig>,
    /// Name of the Redis stream.
    pub stream: String,
    /// Seconds after which undigested samples are trimmed from the queue.
    pub keep: u64,
}

impl Default for Ingest {
    fn default() -> Self {
        Self {
            driver: IngestDriver::default(),
            redis: None,
            stream: DEFAULT_STREAM.to_owned(),
            keep: MAX_KEEP,
        }
    }
}

/// Controls the rollup store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Store {
    /// The storage engine.
    pub driver: StoreDriver,
    /// The SQL dialect of the `sql` driver.
    pub dialect: Dialect,
    /// The database URL of the `sql` driver.
    pub url: String,
    /// Maximum number of pooled database connections.
    pub max_connections: u32,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            driver: StoreDriver::default(),
            dialect: Dialect::default(),
            url: "sqlite::memory:".to_owned(),
            max_connections: 5,
        }
    }
}

/// Structure used to hold information about configuration overrides via environment variables.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The ingest driver, from `ROLLUP_INGEST_DRIVER`.
    pub ingest_driver: Option<String>,
    /// A Redis URL for the ingest queue, from `ROLLUP_REDIS_URL`.
    pub redis_url: Option<String>,
    /// A database URL selecting the SQL store, from `ROLLUP_DATABASE_URL`.
    pub database_url: Option<String>,
}

impl OverridableConfig {
    /// Reads overrides from the environment. Unset and empty variables are ignored.
    pub fn from_env() -> Self {
        let var = |name: &str| env::var(name).ok().filter(|value| !value.is_empty());

        Self {
            ingest_driver: var("ROLLUP_INGEST_DRIVER"),
            redis_url: var("ROLLUP_REDIS_URL"),
            database_url: var("ROLLUP_DATABASE_URL"),
        }
    }
}

/// The raw sections of `config.yml`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigValues {
    logging: LogConfig,
    metrics: Metrics,
    recorder: RecorderConfig,
    ingest: Ingest,
    store: Store,
    storage: StorageConfig,
    digest: DigestConfig,
    retention: RetentionConfig,
    query: QueryConfig,
}

impl ConfigValues {
    fn path(base: &Path) -> PathBuf {
        base.join(CONFIG_FILE)
    }

    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let file = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        serde_yaml::from_reader(io::BufReader::new(file))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path))
    }
}

/// Infers the SQL dialect from the scheme of a database URL.
fn dialect_for_url(url: &str) -> Option<Dialect> {
    let (scheme, _) = url.split_once(':')?;
    match scheme {
        "sqlite" => Some(Dialect::Sqlite),
        "postgres" | "postgresql" => Some(Dialect::Postgres),
        "mysql" | "mariadb" => Some(Dialect::Mysql),
        _ => None,
    }
}

/// Configuration of the rollup pipeline.
#[derive(Clone, Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// The loaded values are not validated, call [`validate`](Self::validate) once all overrides
    /// have been applied.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        Ok(Config {
            values: ConfigValues::load(&path)?,
            path,
        })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        Ok(Config {
            values: serde_json::from_value(value)
                .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        })
    }

    /// Checks if a config file exists in the given folder.
    pub fn config_exists<P: AsRef<Path>>(path: P) -> bool {
        fs::metadata(ConfigValues::path(path.as_ref())).is_ok()
    }

    /// Override configuration with values coming from the environment.
    ///
    /// A database URL switches the store to the `sql` driver and, if the URL scheme is known,
    /// selects the matching dialect.
    pub fn apply_override(&mut self, overrides: OverridableConfig) -> Result<&mut Self, ConfigError> {
        let ingest = &mut self.values.ingest;

        if let Some(driver) = overrides.ingest_driver {
            ingest.driver = driver
                .parse()
                .map_err(|err| ConfigError::for_field(err, "ingest_driver"))?;
        }

        if let Some(redis) = overrides.redis_url {
            ingest.redis = Some(RedisConfig::Single(redis));
        }

        let store = &mut self.values.store;
        if let Some(url) = overrides.database_url {
            store.driver = StoreDriver::Sql;
            if let Some(dialect) = dialect_for_url(&url) {
                store.dialect = dialect;
            }
            store.url = url;
        }

        Ok(self)
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let values = &self.values;

        let periods = &values.storage.periods;
        if periods.is_empty() || periods.iter().any(|period| period.as_minutes() == 0) {
            return Err(ConfigError::invalid("storage.periods"));
        }

        if values.storage.chunk_size == 0 {
            return Err(ConfigError::invalid("storage.chunk_size"));
        }

        if values.digest.batch_size == 0 {
            return Err(ConfigError::invalid("digest.batch_size"));
        }

        if values.query.graph_points == 0 {
            return Err(ConfigError::invalid("query.graph_points"));
        }

        if values.ingest.driver == IngestDriver::Redis && values.ingest.redis.is_none() {
            return Err(ConfigError::invalid("ingest.redis"));
        }

        if !(0.0..=1.0).contains(&values.metrics.sample_rate) {
            return Err(ConfigError::invalid("metrics.sample_rate"));
        }

        Ok(())
    }

    /// Returns the path of the config folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the address of the statsd server, if metrics are enabled.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Returns the prefix of internal metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the tags added to all internal metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the UDP send buffer size of the statsd client.
    pub fn metrics_buffer_size(&self) -> Option<usize> {
        self.values.metrics.buffer_size
    }

    /// Returns the sample rate of internal metrics.
    pub fn metrics_sample_rate(&self) -> f64 {
        self.values.metrics.sample_rate
    }

    /// Returns the recorder configuration.
    pub fn recorder(&self) -> &RecorderConfig {
        &self.values.recorder
    }

    /// Returns the ingest queue implementation.
    pub fn ingest_driver(&self) -> IngestDriver {
        self.values.ingest.driver
    }

    /// Returns the Redis connection of the ingest queue.
    pub fn redis(&self) -> Option<&RedisConfig> {
        self.values.ingest.redis.as_ref()
    }

    /// Returns the name of the Redis stream.
    pub fn ingest_stream(&self) -> &str {
        &self.values.ingest.stream
    }

    /// Returns the number of seconds undigested samples are kept in the queue.
    pub fn ingest_keep(&self) -> u64 {
        self.values.ingest.keep
    }

    /// Returns the rollup store configuration.
    pub fn store(&self) -> &Store {
        &self.values.store
    }

    /// Returns how samples are persisted.
    pub fn storage(&self) -> &StorageConfig {
        &self.values.storage
    }

    /// Returns the digest configuration.
    pub fn digest(&self) -> DigestConfig {
        self.values.digest
    }

    /// Returns the retention of raw rows.
    pub fn retention(&self) -> RetentionConfig {
        self.values.retention
    }

    /// Returns the query configuration.
    pub fn query(&self) -> QueryConfig {
        self.values.query
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rollup_metrics::{AggregateKind, Period};

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_json_value(serde_json::json!({})).unwrap();

        assert_eq!(config.ingest_driver(), IngestDriver::Storage);
        assert_eq!(config.ingest_stream(), "rollup:ingest");
        assert_eq!(config.ingest_keep(), 604_800);
        assert_eq!(config.store().driver, StoreDriver::Memory);
        assert_eq!(config.store().max_connections, 5);
        assert_eq!(config.storage().chunk_size, 1000);
        assert_eq!(config.digest().batch_size, 1000);
        assert_eq!(config.query().graph_points, 60);
        assert_eq!(config.metrics_prefix(), "rollup");
        assert_eq!(config.statsd_addr(), None);
        assert_eq!(config.recorder().buffer, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("config.yml")).unwrap();
        file.write_all(
            br#"
recorder:
  buffer: 10
  default_aggregations: [count, max]
store:
  driver: sql
  dialect: postgres
  url: postgres://rollup@localhost/rollup
storage:
  periods: [60, 1440]
retention:
  keep: 3600
"#,
        )
        .unwrap();

        assert!(Config::config_exists(dir.path()));
        let config = Config::from_path(dir.path()).unwrap();

        assert_eq!(config.recorder().buffer, 10);
        assert_eq!(
            config.recorder().default_aggregations,
            AggregateKind::Count | AggregateKind::Max
        );
        similar_asserts::assert_eq!(
            config.store(),
            &Store {
                driver: StoreDriver::Sql,
                dialect: Dialect::Postgres,
                url: "postgres://rollup@localhost/rollup".to_owned(),
                max_connections: 5,
            }
        );
        assert_eq!(
            config.storage().periods,
            [Period::from_minutes(60), Period::from_minutes(1440)]
        );
        assert_eq!(config.retention().keep, 3600);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();

        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::CouldNotOpenFile);
        assert!(error.source().is_some());
    }

    #[test]
    fn test_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yml"), "ingest: [").unwrap();

        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
        assert!(error.to_string().starts_with("could not parse yaml config file (file "));
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();

        config
            .apply_override(OverridableConfig {
                ingest_driver: Some("redis".to_owned()),
                redis_url: Some("redis://127.0.0.1:6379".to_owned()),
                database_url: Some("mysql://rollup@localhost/rollup".to_owned()),
            })
            .unwrap();

        assert_eq!(config.ingest_driver(), IngestDriver::Redis);
        assert_eq!(
            config.redis(),
            Some(&RedisConfig::Single("redis://127.0.0.1:6379".to_owned()))
        );
        assert_eq!(config.store().driver, StoreDriver::Sql);
        assert_eq!(config.store().dialect, Dialect::Mysql);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_override() {
        let mut config = Config::default();

        let error = config
            .apply_override(OverridableConfig {
                ingest_driver: Some("kafka".to_owned()),
                ..Default::default()
            })
            .unwrap_err();

        insta::assert_snapshot!(error, @"invalid config value (field ingest_driver)");
        insta::assert_snapshot!(error.source().unwrap(), @"unknown ingest driver `kafka`");
    }

    #[test]
    fn test_validate() {
        let invalid = |value: serde_json::Value| {
            let config = Config::from_json_value(value).unwrap();
            config.validate().unwrap_err().to_string()
        };

        insta::assert_snapshot!(
            invalid(serde_json::json!({"storage": {"periods": []}})),
            @"invalid config value (field storage.periods)"
        );
        insta::assert_snapshot!(
            invalid(serde_json::json!({"digest": {"batch_size": 0}})),
            @"invalid config value (field digest.batch_size)"
        );
        insta::assert_snapshot!(
            invalid(serde_json::json!({"ingest": {"driver": "redis"}})),
            @"invalid config value (field ingest.redis)"
        );
    }

    #[test]
    fn test_yaml_dump_loads_again() {
        let config = Config::from_json_value(serde_json::json!({
            "ingest": {"driver": "memory", "keep": 60},
            "query": {"graph_points": 30},
        }))
        .unwrap();

        let yaml = config.to_yaml_string().unwrap();
        let values: ConfigValues = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(values.ingest, config.values.ingest);
        assert_eq!(values.query, config.values.query);
        assert_eq!(values.storage, config.values.storage);
    }
}
