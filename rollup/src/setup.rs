use anyhow::Result;
use rollup_config::Config;
use rollup_statsd::MetricsConfig;

/// Initializes the global logger from the `logging` section.
pub fn init_logging(config: &Config) {
    rollup_log::init(config.logging());
    dump_spawn_infos(config);
}

/// Prints the effective pipeline setup to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        rollup_log::info!("launching rollup without config folder");
    } else {
        rollup_log::info!(
            "launching rollup from config folder {}",
            config.path().display()
        );
    }

    rollup_log::info!("  ingest driver: {:?}", config.ingest_driver());
    rollup_log::info!("  store driver: {:?}", config.store().driver);
    rollup_log::info!("  log level: {}", config.logging().level);
}

/// Initializes the statsd client if a statsd server is configured.
pub fn init_metrics(config: &Config) -> Result<()> {
    let Some(host) = config.statsd_addr() else {
        return Ok(());
    };

    rollup_statsd::init(MetricsConfig {
        prefix: config.metrics_prefix().to_owned(),
        host: host.to_owned(),
        buffer_size: config.metrics_buffer_size(),
        default_tags: config.metrics_default_tags().clone(),
        sample_rate: config.metrics_sample_rate(),
    })?;

    Ok(())
}
