//! Logging facade for the rollup pipeline.
//!
//! All crates in this workspace log through the macros re-exported here, which are the plain
//! [`tracing`] macros. Structured fields are supported:
//!
//! ```
//! let error = std::io::Error::other("disk full");
//! rollup_log::error!(error = &error as &dyn std::error::Error, "failed to write chunk");
//! ```
//!
//! The `init` feature enables [`init`], which installs the global subscriber from a [`LogConfig`].
//! The `test` feature enables [`init_test!`], which installs a subscriber that writes into the
//! output captured by the test harness.
#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
mod test;
#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

// Expose the minimal log facade.
#[doc(inline)]
pub use tracing::{debug, enabled, error, info, trace, warn, Level};
