//! Common functionality for the rollup crates.
#![warn(missing_docs)]

mod time;

pub use crate::time::*;
