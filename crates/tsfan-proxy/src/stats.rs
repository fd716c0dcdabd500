//! Self-reporting statistics.
//!
//! The proxy accounts for its own work in a second, RESET-mode key
//! package: counters accumulate between flushes and zero afterwards.
//! Flushes happen on wall-clock boundaries aligned to the configured
//! interval, so every proxy instance reporting at the same interval lands
//! on the same timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error};
use tsfan::{KeyPackage, ResetMode, Timeseries};

/// Interval-aligned statistics writer.
pub struct Stats {
    ts: Timeseries,
    kp: KeyPackage,
    prefix: String,
    interval: u32,
    stats_time: u32,
}

impl Stats {
    /// Creates the writer; `ts` must already have its backend enabled.
    /// A zero `interval` is treated as one second.
    #[must_use]
    pub fn new(ts: Timeseries, prefix: String, interval: u32) -> Self {
        let interval = interval.max(1);
        let stats_time = align(unix_now(), interval);
        Self {
            ts,
            kp: KeyPackage::new(ResetMode::Reset),
            prefix,
            interval,
            stats_time,
        }
    }

    /// Adds `value` to the counter named `<prefix>.<suffix>`.
    pub fn inc(&mut self, suffix: &str, value: u64) {
        let key = format!("{}.{suffix}", self.prefix);
        let idx = match self.kp.get_key(&key) {
            Some(idx) => idx,
            None => self.kp.add_key(&key),
        };
        self.kp.set(idx, self.kp.get(idx) + value);
    }

    /// Flushes the counters if an interval boundary has passed.
    pub fn maybe_flush(&mut self) {
        self.maybe_flush_at(unix_now());
    }

    fn maybe_flush_at(&mut self, now: u32) {
        let now = align(now, self.interval);
        if now >= self.stats_time + self.interval {
            debug!(time = self.stats_time, "flushing stats");
            if let Err(e) = self.kp.flush(&mut self.ts, self.stats_time) {
                error!(error = %e, "could not flush stats key package");
                return;
            }
            self.stats_time = now;
        }
    }
}

fn align(now: u32, interval: u32) -> u32 {
    (now / interval) * interval
}

fn unix_now() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    u32::try_from(secs).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsfan::BackendId;

    fn ascii_stats(path: &std::path::Path, interval: u32) -> Stats {
        let mut ts = Timeseries::new();
        ts.enable_backend(BackendId::Ascii, &format!("-f {}", path.display()))
            .unwrap();
        Stats::new(ts, "systems.services.tsk.g.p.c".to_owned(), interval)
    }

    #[test]
    fn test_inc_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = ascii_stats(&dir.path().join("s.txt"), 60);
        stats.inc("messages_cnt", 1);
        stats.inc("messages_cnt", 1);
        stats.inc("messages_bytes", 30);

        let idx = stats
            .kp
            .get_key("systems.services.tsk.g.p.c.messages_cnt")
            .unwrap();
        assert_eq!(stats.kp.get(idx), 2);
    }

    #[test]
    fn test_flush_waits_for_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.txt");
        let mut stats = ascii_stats(&path, 60);
        stats.stats_time = 1200;
        stats.inc("flush_cnt", 1);

        // still inside the interval
        stats.maybe_flush_at(1259);
        assert_eq!(stats.stats_time, 1200);

        // boundary crossed: flush at the old aligned time
        stats.maybe_flush_at(1261);
        assert_eq!(stats.stats_time, 1260);
        drop(stats);

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "systems.services.tsk.g.p.c.flush_cnt 1 1200\n"
        );
    }

    #[test]
    fn test_counters_reset_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = ascii_stats(&dir.path().join("s.txt"), 60);
        stats.stats_time = 1200;
        stats.inc("flush_cnt", 5);
        stats.maybe_flush_at(1300);

        let idx = stats
            .kp
            .get_key("systems.services.tsk.g.p.c.flush_cnt")
            .unwrap();
        assert_eq!(stats.kp.get(idx), 0);

        // accumulation restarts from zero
        stats.inc("flush_cnt", 2);
        assert_eq!(stats.kp.get(idx), 2);
    }
}
