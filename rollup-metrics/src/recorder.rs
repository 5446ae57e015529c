use std::error::Error;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use enumset::EnumSet;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rollup_statsd::metric;
use serde::{Deserialize, Serialize};

use crate::ingest::{Ingest, IngestError};
use crate::protocol::{AggregateKind, Entry, InvalidEntry, Sample, Value};
use crate::statsd::{RollupCounters, RollupDistributions, RollupGauges};

/// The error type of lazy sample producers.
pub type LazyError = Box<dyn Error + Send + Sync>;

type LazyProducer = BoxFuture<'static, Result<(), LazyError>>;
type Filter = Box<dyn Fn(&Sample) -> bool + Send + Sync>;
type ErrorSink = Box<dyn Fn(&IngestError) + Send + Sync>;

/// Configuration of the [`Recorder`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Whether the recorder starts out recording.
    pub enabled: bool,
    /// Number of buffered samples and lazy producers above which the buffer is ingested.
    pub buffer: usize,
    /// Aggregations applied to entries that do not request any.
    pub default_aggregations: EnumSet<AggregateKind>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer: 5000,
            default_aggregations: AggregateKind::Count.into(),
        }
    }
}

#[derive(Default)]
struct State {
    samples: Vec<Sample>,
    lazy: Vec<LazyProducer>,
}

impl State {
    fn len(&self) -> usize {
        self.samples.len() + self.lazy.len()
    }
}

struct Inner {
    config: RecorderConfig,
    ingest: Arc<dyn Ingest>,
    state: Mutex<State>,
    recording: AtomicBool,
    ingesting: AtomicBool,
    filters: RwLock<Vec<Filter>>,
    error_sink: RwLock<Option<ErrorSink>>,
}

/// Sets a flag for as long as it is alive and restores the previous value when dropped.
struct FlagGuard<'a> {
    flag: &'a AtomicBool,
    previous: bool,
}

impl<'a> FlagGuard<'a> {
    fn set(flag: &'a AtomicBool, value: bool) -> Self {
        let previous = flag.swap(value, Ordering::SeqCst);
        Self { flag, previous }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::SeqCst);
    }
}

/// The in-process buffer that producers record samples into.
///
/// The recorder is a cheap handle, clones share the same buffer. Samples are kept in memory until
/// the buffer grows beyond [`RecorderConfig::buffer`] or [`ingest`](Self::ingest) is called, at
/// which point they are handed to the [`Ingest`] queue in a single push.
///
/// ```
/// # async fn run() {
/// use std::sync::Arc;
///
/// use rollup_metrics::{Entry, MemoryIngest, Recorder, RecorderConfig};
///
/// let queue = MemoryIngest::new();
/// let recorder = Recorder::new(RecorderConfig::default(), Arc::new(queue.clone()));
///
/// recorder
///     .record(Entry::new("slow_request", "GET /users", Some(1250)).max())
///     .await
///     .unwrap();
///
/// assert_eq!(recorder.ingest().await, 1);
/// assert_eq!(queue.len(), 1);
/// # }
/// ```
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<Inner>,
}

impl Recorder {
    /// Creates a recorder handing samples to `ingest`.
    pub fn new(config: RecorderConfig, ingest: Arc<dyn Ingest>) -> Self {
        let recording = config.enabled;

        Self {
            inner: Arc::new(Inner {
                config,
                ingest,
                state: Mutex::new(State::default()),
                recording: AtomicBool::new(recording),
                ingesting: AtomicBool::new(false),
                filters: RwLock::new(Vec::new()),
                error_sink: RwLock::new(None),
            }),
        }
    }

    /// Records a numeric sample.
    ///
    /// Entries without aggregations receive the configured defaults. The entry is validated even
    /// when recording is paused, so producers learn about invalid entries right away.
    pub async fn record(&self, mut entry: Entry) -> Result<(), InvalidEntry> {
        if entry.aggregations.is_empty() {
            entry.aggregations = self.inner.config.default_aggregations;
        }

        entry.validate()?;

        if self.is_recording() {
            let size = self.append(|state| state.samples.push(entry.into()));
            self.maybe_ingest(size).await;
        }

        Ok(())
    }

    /// Records a string sample of which only the latest per type and key is kept.
    pub async fn set(&self, value: Value) {
        if self.is_recording() {
            let size = self.append(|state| state.samples.push(value.into()));
            self.maybe_ingest(size).await;
        }
    }

    /// Queues a producer that is only awaited when the buffer is ingested.
    ///
    /// Lazy producers typically capture a clone of the recorder and record the results of
    /// expensive measurements. A producer resolving to an error is logged and skipped.
    pub async fn lazy<F>(&self, producer: F)
    where
        F: Future<Output = Result<(), LazyError>> + Send + 'static,
    {
        if self.is_recording() {
            let size = self.append(|state| state.lazy.push(producer.boxed()));
            self.maybe_ingest(size).await;
        }
    }

    /// Adds a predicate that samples must pass to be ingested.
    ///
    /// All filters must accept a sample, they are evaluated in the order they were added.
    pub fn filter<F>(&self, predicate: F)
    where
        F: Fn(&Sample) -> bool + Send + Sync + 'static,
    {
        self.inner.filters.write().push(Box::new(predicate));
    }

    /// Reports errors of the ingest queue to `sink` in addition to logging them.
    pub fn report_errors_with<F>(&self, sink: F)
    where
        F: Fn(&IngestError) + Send + Sync + 'static,
    {
        *self.inner.error_sink.write() = Some(Box::new(sink));
    }

    /// Resumes recording.
    pub fn start_recording(&self) {
        self.inner.recording.store(true, Ordering::SeqCst);
    }

    /// Pauses recording. Samples recorded while paused are dropped.
    pub fn stop_recording(&self) {
        self.inner.recording.store(false, Ordering::SeqCst);
    }

    /// Returns `true` if samples are currently recorded.
    pub fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::SeqCst)
    }

    /// Runs `future` with recording paused and restores the previous state afterwards.
    pub async fn ignore<F: Future>(&self, future: F) -> F::Output {
        let _guard = FlagGuard::set(&self.inner.recording, false);
        future.await
    }

    /// Returns the number of buffered samples and lazy producers.
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().len()
    }

    /// Discards everything buffered without ingesting it.
    ///
    /// Returns the number of discarded samples. Lazy producers are dropped without being awaited.
    pub fn flush(&self) -> usize {
        let state = std::mem::take(&mut *self.inner.state.lock());
        let discarded = state.samples.len();

        metric!(counter(RollupCounters::SamplesFlushed) += discarded as i64);
        discarded
    }

    /// Hands all buffered samples to the ingest queue.
    ///
    /// Lazy producers are awaited first, including producers queued by other producers, then the
    /// filters are applied. Returns the number of samples pushed, which is zero when nothing was
    /// buffered or the queue failed. Queue failures lose the batch.
    pub async fn ingest(&self) -> usize {
        let _guard = FlagGuard::set(&self.inner.ingesting, true);

        loop {
            let producers = std::mem::take(&mut self.inner.state.lock().lazy);
            if producers.is_empty() {
                break;
            }

            for producer in producers {
                match AssertUnwindSafe(producer).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        rollup_log::debug!(
                            error = &*err as &dyn Error,
                            "lazy sample producer failed"
                        );
                        metric!(counter(RollupCounters::LazyFailed) += 1);
                    }
                    Err(_) => {
                        rollup_log::debug!("lazy sample producer panicked");
                        metric!(counter(RollupCounters::LazyFailed) += 1);
                    }
                }
            }
        }

        let samples = std::mem::take(&mut self.inner.state.lock().samples);
        let samples: Vec<_> = {
            let filters = self.inner.filters.read();
            samples
                .into_iter()
                .filter(|sample| filters.iter().all(|filter| filter(sample)))
                .collect()
        };

        if samples.is_empty() {
            return 0;
        }

        let count = samples.len();
        match self.inner.ingest.push(samples).await {
            Ok(()) => {
                metric!(counter(RollupCounters::SamplesIngested) += count as i64);
                metric!(distribution(RollupDistributions::IngestBatchSize) = count as u64);
                count
            }
            Err(err) => {
                rollup_log::error!(
                    error = &err as &dyn Error,
                    samples = count,
                    "failed to push samples to the ingest queue"
                );
                metric!(counter(RollupCounters::SamplesLost) += count as i64);

                if let Some(sink) = self.inner.error_sink.read().as_ref() {
                    sink(&err);
                }

                0
            }
        }
    }

    /// Applies `append` to the buffer and returns the new buffer size.
    fn append(&self, append: impl FnOnce(&mut State)) -> usize {
        let mut state = self.inner.state.lock();
        append(&mut state);
        state.len()
    }

    async fn maybe_ingest(&self, size: usize) {
        metric!(gauge(RollupGauges::BufferSize) = size as u64);

        if size > self.inner.config.buffer && !self.inner.ingesting.load(Ordering::SeqCst) {
            self.ingest().await;
        }
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("config", &self.inner.config)
            .field("ingest", &self.inner.ingest)
            .field("recording", &self.is_recording())
            .field("buffered", &self.buffered())
            .finish_non_exhaustive()
    }
}
