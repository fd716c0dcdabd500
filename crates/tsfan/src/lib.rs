//! # tsfan
//!
//! Time-series write fan-out. Producers describe metrics symbolically —
//! string key, u64 value, u32 Unix timestamp — and the library distributes
//! each observation to every enabled backend (plain text, a binary TSK
//! Kafka producer, an aggregated DBATS-style store) without the producer
//! knowing wire formats, batching rules, or connection handling.
//!
//! The central structure is the [`KeyPackage`]: an ordered, reusable set of
//! `(key, value, enabled)` rows flushed together with one timestamp. Key
//! resolution (slow, per backend) happens once and is cached in the
//! package; value updates (fast) happen every tick.
//!
//! ```no_run
//! use tsfan::{BackendId, KeyPackage, ResetMode, Timeseries};
//!
//! # fn main() -> tsfan::Result<()> {
//! let mut ts = Timeseries::new();
//! ts.enable_backend(BackendId::Ascii, "-f metrics.gz")?;
//!
//! let mut kp = KeyPackage::new(ResetMode::Reset);
//! let requests = kp.add_key("frontend.requests");
//! let errors = kp.add_key("frontend.errors");
//!
//! // every tick:
//! kp.set(requests, 1312);
//! kp.set(errors, 4);
//! kp.flush(&mut ts, 1_600_000_000)?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod backend;
pub mod backends;
pub mod codec;
pub mod error;
pub mod kp;
pub mod opts;
mod registry;

pub use backend::{Backend, BackendId, BackendOps, ResolvedKeys};
pub use error::{Error, Result};
pub use kp::{KeyInfo, KeyPackage, ResetMode};
pub use registry::Timeseries;
