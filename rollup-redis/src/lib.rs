//! Abstraction over Redis connections used by the rollup ingest queue.
//!
//! By default, this library only exposes the configuration types. With the `impl` feature, the
//! connection pool for single instances and clusters is available.
#![warn(missing_docs)]

mod config;
pub use self::config::*;

#[cfg(feature = "impl")]
mod real;
#[cfg(feature = "impl")]
pub use self::real::*;
