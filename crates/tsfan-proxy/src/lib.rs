//! TSK proxy internals.
//!
//! The binary (`tsk-proxy`) wires a Kafka consumer to the [`Ingest`] state
//! machine: TSK frames come off the bus, get demultiplexed by channel,
//! filtered by key prefix, accumulated into a per-timestamp key package
//! and flushed into a downstream timeseries backend whenever the
//! timestamp advances. A second key package self-reports operational
//! statistics.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod config;
pub mod error;
pub mod ingest;
pub mod stats;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use ingest::Ingest;
pub use stats::Stats;
