//! StatsD reporting for the rollup pipeline, built on cadence.
//!
//! Metric names are declared by implementing one of [`CounterMetric`], [`TimerMetric`],
//! [`GaugeMetric`] or [`DistributionMetric`] on an enum, and emitted with the [`metric!`] macro.
//! Until [`init`] is called, emitting a metric does nothing.
//!
//! ```
//! use rollup_statsd::{metric, CounterMetric};
//!
//! struct SamplesPushed;
//!
//! impl CounterMetric for SamplesPushed {
//!     fn name(&self) -> &'static str {
//!         "ingest.pushed"
//!     }
//! }
//!
//! metric!(counter(SamplesPushed) += 1, driver = "memory");
//! ```
use std::collections::BTreeMap;
use std::net::UdpSocket;
use std::ops::Deref;
use std::sync::Arc;

use cadence::{
    BufferedUdpMetricSink, Metric, MetricBuilder, MetricError, QueuingMetricSink, StatsdClient,
};
use parking_lot::RwLock;
use rand::distr::StandardUniform;
use rand::Rng;

/// Metrics queued beyond this are dropped.
const METRICS_MAX_QUEUE_SIZE: usize = 100_000;

/// Configuration passed to [`init`].
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Prefix of all metric names.
    pub prefix: String,
    /// Host and port of the statsd server.
    pub host: String,
    /// Size of the UDP send buffer in bytes, cadence's default when `None`.
    pub buffer_size: Option<usize>,
    /// Tags added to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Fraction of metrics sent, clamped to `0.0..=1.0`.
    pub sample_rate: f64,
}

/// The installed statsd client with its default tags and sample rate.
#[derive(Debug)]
pub struct MetricsClient {
    statsd_client: StatsdClient,
    default_tags: BTreeMap<String, String>,
    sample_rate: f64,
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &StatsdClient {
        &self.statsd_client
    }
}

impl MetricsClient {
    /// Sends a metric with the default tags, subject to the sample rate.
    #[doc(hidden)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        if !should_send(self.sample_rate) {
            return;
        }

        for (k, v) in &self.default_tags {
            metric = metric.with_tag(k, v);
        }

        if self.sample_rate < 1.0 {
            metric = metric.with_sampling_rate(self.sample_rate);
        }

        if let Err(error) = metric.try_send() {
            rollup_log::error!(
                error = &error as &dyn std::error::Error,
                maximum_capacity = METRICS_MAX_QUEUE_SIZE,
                "error sending a metric",
            );
        }
    }
}

fn should_send(sample_rate: f64) -> bool {
    if sample_rate <= 0.0 {
        false
    } else if sample_rate >= 1.0 {
        true
    } else {
        rand::rng().sample::<f64, _>(StandardUniform) <= sample_rate
    }
}

static METRICS_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    static CURRENT_CLIENT: std::cell::RefCell<Option<Arc<MetricsClient>>> = METRICS_CLIENT.read().clone().into();
}

/// Internal prelude for the macro.
#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

fn set_client(client: MetricsClient) {
    *METRICS_CLIENT.write() = Some(Arc::new(client));
    CURRENT_CLIENT.with(|cell| cell.replace(METRICS_CLIENT.read().clone()));
}

/// Captures the metrics emitted by `f` on the current thread as statsd lines.
#[cfg(any(test, feature = "test"))]
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = cadence::SpyMetricSink::new();
    let test_client = MetricsClient {
        statsd_client: StatsdClient::from_sink("", sink),
        default_tags: BTreeMap::new(),
        sample_rate: 1.0,
    };

    CURRENT_CLIENT.with(|cell| {
        let old_client = cell.replace(Some(Arc::new(test_client)));
        f();
        cell.replace(old_client);
    });

    rx.iter()
        .map(|x| String::from_utf8_lossy(&x).into_owned())
        .collect()
}

/// Starts reporting metrics to statsd.
///
/// Metrics are buffered into UDP packets and sent from a background thread. Once the queue is
/// full, metrics are dropped.
pub fn init(config: MetricsConfig) -> Result<(), MetricError> {
    let sample_rate = config.sample_rate.clamp(0.0, 1.0);
    rollup_log::info!(sample_rate, "reporting metrics to statsd at {}", config.host);

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;

    let udp_sink = match config.buffer_size {
        Some(size) => BufferedUdpMetricSink::with_capacity(config.host.as_str(), socket, size)?,
        None => BufferedUdpMetricSink::from(config.host.as_str(), socket)?,
    };
    let queuing_sink = QueuingMetricSink::with_capacity(udp_sink, METRICS_MAX_QUEUE_SIZE);

    set_client(MetricsClient {
        statsd_client: StatsdClient::from_sink(&config.prefix, queuing_sink),
        default_tags: config.default_tags,
        sample_rate,
    });

    Ok(())
}

/// Invokes `f` with the current client, or returns the default if none is installed.
#[doc(hidden)]
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CURRENT_CLIENT.with(|client| match client.borrow().as_deref() {
        Some(client) => f(client),
        None => R::default(),
    })
}

/// A timer, reported as a distribution in milliseconds.
///
/// ```
/// use rollup_statsd::{metric, TimerMetric};
///
/// struct DigestDuration;
///
/// impl TimerMetric for DigestDuration {
///     fn name(&self) -> &'static str {
///         "digest.duration"
///     }
/// }
///
/// # fn digest() {}
/// let start = std::time::Instant::now();
/// digest();
/// metric!(timer(DigestDuration) = start.elapsed());
///
/// // Times the enclosed block.
/// metric!(timer(DigestDuration), driver = "memory", {
///     digest();
/// });
/// ```
pub trait TimerMetric {
    /// The metric name sent to statsd.
    fn name(&self) -> &'static str;
}

/// A counter. Zero increments are not sent.
pub trait CounterMetric {
    /// The metric name sent to statsd.
    fn name(&self) -> &'static str;
}

/// A distribution of values, such as batch sizes.
pub trait DistributionMetric {
    /// The metric name sent to statsd.
    fn name(&self) -> &'static str;
}

/// A gauge holding the last value set.
pub trait GaugeMetric {
    /// The metric name sent to statsd.
    fn name(&self) -> &'static str;
}

/// Emits a metric.
///
/// See [crate-level documentation](self) for examples.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        match $value {
            value if value != 0 => {
                $crate::with_client(|client| {
                    use $crate::_pred::*;
                    client.send_metric(
                        client.count_with_tags(&$crate::CounterMetric::name(&$id), value)
                            $(.with_tag(stringify!($($k).*), $v))*
                    )
                })
            },
            _ => {},
        };
    };

    (gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.gauge_with_tags(&$crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (distribution($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.distribution_with_tags(&$crate::DistributionMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.distribution_with_tags(&$crate::TimerMetric::name(&$id), $value.as_nanos() as f64 / 1e6)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    (timer($id:expr), $($($k:ident).* = $v:expr,)* $block:block) => {{
        let now = std::time::Instant::now();
        let rv = {$block};
        $crate::metric!(timer($id) = now.elapsed() $(, $($k).* = $v)*);
        rv
    }};
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct BufferSize;

    impl GaugeMetric for BufferSize {
        fn name(&self) -> &'static str {
            "recorder.buffer_size"
        }
    }

    struct RowsWritten;

    impl CounterMetric for RowsWritten {
        fn name(&self) -> &'static str {
            "storage.rows_written"
        }
    }

    struct BatchSize;

    impl DistributionMetric for BatchSize {
        fn name(&self) -> &'static str {
            "ingest.batch_size"
        }
    }

    struct DigestDuration;

    impl TimerMetric for DigestDuration {
        fn name(&self) -> &'static str {
            "digest.duration"
        }
    }

    #[test]
    fn test_no_client_is_noop() {
        assert!(!with_client(|_| true));
        metric!(counter(RowsWritten) += 1);
    }

    #[test]
    fn test_gauge_and_distribution() {
        let captures = with_capturing_test_client(|| {
            metric!(gauge(BufferSize) = 12);
            metric!(distribution(BatchSize) = 250, driver = "redis");
        });

        assert_eq!(
            captures,
            ["recorder.buffer_size:12|g", "ingest.batch_size:250|d|#driver:redis"]
        );
    }

    #[test]
    fn test_counter_skips_zero() {
        let captures = with_capturing_test_client(|| {
            metric!(counter(RowsWritten) += 0, table = "entries");
            metric!(counter(RowsWritten) += 10, table = "entries");
        });
        assert_eq!(captures, ["storage.rows_written:10|c|#table:entries"]);
    }

    #[test]
    fn test_timer_in_milliseconds() {
        let captures = with_capturing_test_client(|| {
            metric!(timer(DigestDuration) = Duration::from_secs(2), driver = "memory");
        });
        assert_eq!(captures, ["digest.duration:2000|d|#driver:memory"]);
    }

    #[test]
    fn test_timed_block() {
        let captures = with_capturing_test_client(|| {
            let value = metric!(timer(DigestDuration), driver = "memory", { 7 });
            assert_eq!(value, 7);
        });
        assert!(captures[0].ends_with("|d|#driver:memory"));
    }

    #[test]
    fn test_sample_rate_bounds() {
        assert!(!should_send(0.0));
        assert!(should_send(1.0));
    }
}
