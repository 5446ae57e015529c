//! Helpers for testing the rollup pipeline.
//!
//! In every test that logs, call [`setup`]. This sets up the logger so that all console output
//! is captured by the test runner. All logs emitted with [`rollup_log`] will show up for test
//! failures or when run with `--nocapture`.
//!
//! # Example
//!
//! ```no_run
//! #[test]
//! fn my_test() {
//!     rollup_test::setup();
//!
//!     rollup_log::debug!("hello, world!");
//! }
//! ```

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the calling crate and the metrics core
///    and mutes all other logs.
pub fn setup() {
    rollup_log::init_test!();
}
