//! The per-message ingest state machine.
//!
//! [`Ingest`] re-accumulates the `(key, value)` pairs of consumed TSK
//! frames into a DISABLE-mode key package held for exactly one timestamp.
//! A frame with a different timestamp (or a force flush when the consumer
//! goes idle or shuts down) flushes the package downstream first.
//!
//! Malformed frames, unknown channels and unparseable records are logged
//! and skipped; the consumer keeps going. Only downstream flush failures
//! escape.

use tracing::{error, info};
use tsfan::codec::Batch;
use tsfan::{KeyPackage, ResetMode, Timeseries};

use crate::error::Result;
use crate::stats::Stats;

/// Downstream accumulator; see the module docs.
pub struct Ingest {
    ts: Timeseries,
    kp: KeyPackage,
    channel: Vec<u8>,
    filters: Vec<String>,
    stats: Option<Stats>,
    current_time: u32,
}

impl Ingest {
    /// Creates the accumulator; `ts` must have its backend enabled.
    #[must_use]
    pub fn new(
        ts: Timeseries,
        channel: &str,
        filters: Vec<String>,
        stats: Option<Stats>,
    ) -> Self {
        Self {
            ts,
            kp: KeyPackage::new(ResetMode::Disable),
            channel: channel.as_bytes().to_vec(),
            filters,
            stats,
            current_time: 0,
        }
    }

    /// The timestamp the key package currently accumulates for (0 before
    /// the first frame).
    #[must_use]
    pub fn current_time(&self) -> u32 {
        self.current_time
    }

    /// The downstream key package.
    #[must_use]
    pub fn kp(&self) -> &KeyPackage {
        &self.kp
    }

    /// Processes one consumed frame.
    ///
    /// # Errors
    ///
    /// Only a downstream flush failure; anything wrong with the frame
    /// itself is logged and skipped.
    pub fn handle_message(&mut self, payload: &[u8]) -> Result<()> {
        let batch = match Batch::decode(payload) {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, len = payload.len(), "skipping malformed message");
                return Ok(());
            }
        };

        // compare over the shorter of the two channel names
        let n = batch.channel.len().min(self.channel.len());
        if batch.channel[..n] != self.channel[..n] {
            error!(
                expected = %String::from_utf8_lossy(&self.channel),
                got = %String::from_utf8_lossy(batch.channel),
                "skipping message for unknown channel"
            );
            return Ok(());
        }

        self.maybe_flush(Some(batch.time))?;

        if let Some(stats) = &mut self.stats {
            stats.inc("messages_cnt", 1);
            stats.inc("messages_bytes", payload.len() as u64);
        }

        for record in batch.records() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    error!(error = %e, "skipping rest of truncated message");
                    return Ok(());
                }
            };

            let Ok(key) = std::str::from_utf8(record.key) else {
                error!("skipping record with non-UTF-8 key");
                continue;
            };

            if !self.filters.is_empty()
                && !self.filters.iter().any(|f| key.starts_with(f.as_str()))
            {
                continue;
            }

            let idx = match self.kp.get_key(key) {
                Some(idx) => {
                    self.kp.enable_key(idx);
                    idx
                }
                None => self.kp.add_key(key),
            };
            self.kp.set(idx, record.value);
        }

        Ok(())
    }

    /// Flushes the key package if the timeline moved.
    ///
    /// `Some(t)` is a frame timestamp: a flush happens only when `t`
    /// differs from the accumulating timestamp. `None` forces a flush of
    /// whatever is buffered (idle consumer, shutdown).
    ///
    /// # Errors
    ///
    /// A downstream flush failure; the package is preserved for retry.
    pub fn maybe_flush(&mut self, flush_time: Option<u32>) -> Result<()> {
        let force = flush_time.is_none();
        let flush_time = flush_time.unwrap_or(0);

        if self.current_time == 0 {
            self.current_time = flush_time;
        } else if force || flush_time != self.current_time {
            if self.kp.enabled_size() > 0 {
                info!(
                    force,
                    time = self.current_time,
                    enabled = self.kp.enabled_size(),
                    total = self.kp.size(),
                    "flushing key package"
                );
                if let Some(stats) = &mut self.stats {
                    stats.inc("flush_cnt", 1);
                    stats.inc("flushed_key_cnt", self.kp.enabled_size() as u64);
                }
                self.kp.flush(&mut self.ts, self.current_time)?;
            }
            self.current_time = flush_time;
        }

        Ok(())
    }

    /// Flushes the statistics package if its interval elapsed.
    pub fn maybe_flush_stats(&mut self) {
        if let Some(stats) = &mut self.stats {
            stats.maybe_flush();
        }
    }
}
