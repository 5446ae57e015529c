//! Buffered metric samples rolled up into time buckets.
//!
//! Samples flow through four stages:
//!
//!  1. A [`Recorder`] buffers [`Entry`] and [`Value`] samples in process.
//!  2. The buffer is pushed to an [`Ingest`] queue, either when it grows beyond its configured
//!     size or when [`Recorder::ingest`] is called explicitly.
//!  3. A [`Digester`] pops batches off the queue and hands them to [`Storage`], which writes raw
//!     rows and merges pre-aggregated [buckets](Period) into a [`RollupStore`].
//!  4. [`Query`] answers windowed questions by stitching buckets together with the raw entries
//!     at the start of the window.
//!
//! Expired rows are removed by [`Storage::trim`] according to the [`RetentionConfig`].
//!
//! # Feature Flags
//!
//!  - `redis`: Enables [`RedisIngest`], a queue backed by a Redis stream.
#![warn(missing_docs)]

mod aggregation;
mod bucket;
mod digest;
mod ingest;
mod protocol;
mod query;
mod recorder;
mod retention;
mod statsd;
mod storage;
mod store;

pub use self::aggregation::*;
pub use self::bucket::*;
pub use self::digest::*;
pub use self::ingest::*;
pub use self::protocol::*;
pub use self::query::*;
pub use self::recorder::*;
pub use self::retention::*;
pub use self::storage::*;
pub use self::store::*;
