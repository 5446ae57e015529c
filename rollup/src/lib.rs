//! The rollup pipeline.
//!
//! This crate wires a [`Config`](rollup_config::Config) into a running [`Pipeline`]: it selects
//! the ingest queue and rollup store, and hands out the recorder, digester and query composer
//! operating on them. Scheduling periodic digest and trim runs is left to the embedding
//! application.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use rollup_config::{Config, OverridableConfig};
//!
//! let mut config = Config::from_path(".rollup")?;
//! config.apply_override(OverridableConfig::from_env())?;
//!
//! rollup::init_logging(&config);
//! rollup::init_metrics(&config)?;
//!
//! let pipeline = rollup::Pipeline::from_config(&config).await?;
//! pipeline.digest().await?;
//! pipeline.trim().await?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]

mod pipeline;
mod setup;

pub use self::pipeline::*;
pub use self::setup::*;
