//! Configuration for the rollup pipeline.
//!
//! The configuration is read from a `config.yml` file in a configuration directory with
//! [`Config::from_path`]. All sections are optional and fall back to their defaults. Selected
//! values can be overridden from the environment with [`OverridableConfig::from_env`] and
//! [`Config::apply_override`].
#![warn(missing_docs)]

mod config;

pub use self::config::*;
