//! Key packages: reusable columnar write buffers.
//!
//! A [`KeyPackage`] holds an ordered set of `(key, value, enabled)` rows
//! that are flushed together with one timestamp. It hands producers a
//! stable integer handle per key, so the slow part (resolving a key to a
//! backend-private id) happens once while the fast part (setting a value)
//! happens every tick. Rows keep one resolved-id slot per backend; slots
//! are filled lazily at flush time via
//! [`BackendOps::kp_ki_update`](crate::backend::BackendOps::kp_ki_update).

use ahash::AHashMap;
use tracing::warn;

use crate::backend::BackendId;
use crate::error::{Error, Result};
use crate::registry::Timeseries;

/// What happens to the rows after a fully successful flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Zero every value, leave enabled-flags untouched.
    Reset,
    /// Clear every enabled-flag, leave values. A later
    /// [`set`](KeyPackage::set) re-enables the row.
    Disable,
    /// Touch nothing; the producer rewrites every row each tick.
    Leave,
}

/// One row of a key package.
#[derive(Debug)]
pub struct KeyInfo {
    key: String,
    value: u64,
    enabled: bool,
    backend_keys: [Option<Box<[u8]>>; BackendId::COUNT],
}

impl KeyInfo {
    /// The key string, immutable after [`KeyPackage::add_key`].
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The current value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Whether the next flush includes this row.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The resolved id under `backend`, if resolution has happened.
    #[must_use]
    pub fn backend_key(&self, backend: BackendId) -> Option<&[u8]> {
        self.backend_keys[backend.index()].as_deref()
    }
}

/// An ordered, reusable set of keyed values flushed at a common timestamp.
///
/// Insertion order is preserved and defines both the stable index returned
/// by [`add_key`](KeyPackage::add_key) and the order every backend sees at
/// flush time. Keys are unique (exact match); adding a duplicate returns
/// the existing index.
#[derive(Debug)]
pub struct KeyPackage {
    infos: Vec<KeyInfo>,
    index: AHashMap<String, usize>,
    enabled_cnt: usize,
    reset: ResetMode,
    /// Per-backend flag: keys were added since this backend last resolved.
    dirty: [bool; BackendId::COUNT],
}

impl KeyPackage {
    /// Creates an empty package with the given post-flush behavior.
    #[must_use]
    pub fn new(reset: ResetMode) -> Self {
        Self {
            infos: Vec::new(),
            index: AHashMap::new(),
            enabled_cnt: 0,
            reset,
            dirty: [false; BackendId::COUNT],
        }
    }

    /// The post-flush behavior chosen at construction.
    #[must_use]
    pub fn reset_mode(&self) -> ResetMode {
        self.reset
    }

    /// Appends `key` and returns its index; returns the existing index if
    /// the key is already present (no duplicate row is created).
    ///
    /// New rows start enabled with value 0. Adding a key marks the package
    /// dirty for every backend so the next flush re-runs id resolution.
    pub fn add_key(&mut self, key: &str) -> usize {
        if let Some(&idx) = self.index.get(key) {
            return idx;
        }

        let idx = self.infos.len();
        self.infos.push(KeyInfo {
            key: key.to_owned(),
            value: 0,
            enabled: true,
            backend_keys: Default::default(),
        });
        self.index.insert(key.to_owned(), idx);
        self.enabled_cnt += 1;
        self.dirty = [true; BackendId::COUNT];
        idx
    }

    /// Looks up the index of `key`.
    #[must_use]
    pub fn get_key(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Stores `value` at row `index`.
    ///
    /// In [`ResetMode::Disable`] packages this also re-enables the row, so
    /// a producer that sets a value after a flush automatically opts the
    /// key back into the next one.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set(&mut self, index: usize, value: u64) {
        let info = &mut self.infos[index];
        info.value = value;
        if self.reset == ResetMode::Disable && !info.enabled {
            info.enabled = true;
            self.enabled_cnt += 1;
        }
    }

    /// Reads the current value at row `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn get(&self, index: usize) -> u64 {
        self.infos[index].value
    }

    /// The key string at row `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn key(&self, index: usize) -> &str {
        &self.infos[index].key
    }

    /// Includes row `index` in the next flush.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn enable_key(&mut self, index: usize) {
        let info = &mut self.infos[index];
        if !info.enabled {
            info.enabled = true;
            self.enabled_cnt += 1;
        }
    }

    /// Excludes row `index` from the next flush.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn disable_key(&mut self, index: usize) {
        let info = &mut self.infos[index];
        if info.enabled {
            info.enabled = false;
            self.enabled_cnt -= 1;
        }
    }

    /// Whether row `index` is included in the next flush.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn is_key_enabled(&self, index: usize) -> bool {
        self.infos[index].enabled
    }

    /// Total number of rows.
    #[must_use]
    pub fn size(&self) -> usize {
        self.infos.len()
    }

    /// Number of rows the next flush will include.
    #[must_use]
    pub fn enabled_size(&self) -> usize {
        self.enabled_cnt
    }

    /// Iterates all rows in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyInfo> {
        self.infos.iter()
    }

    /// Iterates the enabled rows in insertion order.
    pub fn enabled_iter(&self) -> impl Iterator<Item = &KeyInfo> {
        self.infos.iter().filter(|ki| ki.enabled)
    }

    /// Indices of rows that have no resolved id under `backend` yet.
    #[must_use]
    pub fn unresolved(&self, backend: BackendId) -> Vec<usize> {
        self.infos
            .iter()
            .enumerate()
            .filter(|(_, ki)| ki.backend_keys[backend.index()].is_none())
            .map(|(i, _)| i)
            .collect()
    }

    /// Stores the resolved id for row `index` under `backend`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set_backend_key(&mut self, index: usize, backend: BackendId, id: Box<[u8]>) {
        self.infos[index].backend_keys[backend.index()] = Some(id);
    }

    /// Flushes every enabled row to every enabled backend at `time`.
    ///
    /// For each enabled backend: first runs its id-resolution hook if keys
    /// were added since that backend last resolved, then hands it the
    /// package. After all backends ran successfully the
    /// [`ResetMode`] policy is applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartialFlush`] naming the first backend that
    /// failed. Writes to other backends are not rolled back, the reset
    /// policy is not applied, and the package stays valid and retryable.
    pub fn flush(&mut self, timeseries: &mut Timeseries, time: u32) -> Result<()> {
        let mut failure: Option<Error> = None;

        for id in BackendId::ALL {
            let backend = timeseries.backend_mut(id);
            if !backend.is_enabled() {
                continue;
            }
            let ops = backend.ops_mut();

            if self.dirty[id.index()] {
                if let Err(e) = ops.kp_ki_update(self) {
                    warn!(backend = ops.name(), error = %e, "key id resolution failed");
                    failure.get_or_insert(Error::PartialFlush {
                        backend: ops.name(),
                        source: Box::new(e),
                    });
                    continue;
                }
                self.dirty[id.index()] = false;
            }

            if let Err(e) = ops.kp_flush(self, time) {
                warn!(backend = ops.name(), error = %e, "key package flush failed");
                failure.get_or_insert(Error::PartialFlush {
                    backend: ops.name(),
                    source: Box::new(e),
                });
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        match self.reset {
            ResetMode::Reset => {
                for info in &mut self.infos {
                    info.value = 0;
                }
            }
            ResetMode::Disable => {
                for info in &mut self.infos {
                    info.enabled = false;
                }
                self.enabled_cnt = 0;
            }
            ResetMode::Leave => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_key_only_after_add() {
        let mut kp = KeyPackage::new(ResetMode::Leave);
        assert_eq!(kp.get_key("a"), None);
        let idx = kp.add_key("a");
        assert_eq!(kp.get_key("a"), Some(idx));
        assert_eq!(kp.get_key("b"), None);
    }

    #[test]
    fn test_duplicate_add_returns_same_index() {
        let mut kp = KeyPackage::new(ResetMode::Leave);
        let a = kp.add_key("k");
        let b = kp.add_key("k");
        assert_eq!(a, b);
        assert_eq!(kp.size(), 1);
    }

    #[test]
    fn test_indices_follow_insertion_order() {
        let mut kp = KeyPackage::new(ResetMode::Leave);
        assert_eq!(kp.add_key("first"), 0);
        assert_eq!(kp.add_key("second"), 1);
        assert_eq!(kp.add_key("third"), 2);

        let keys: Vec<_> = kp.iter().map(KeyInfo::key).collect();
        assert_eq!(keys, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_set_and_get() {
        let mut kp = KeyPackage::new(ResetMode::Leave);
        let idx = kp.add_key("k");
        assert_eq!(kp.get(idx), 0);
        kp.set(idx, 99);
        assert_eq!(kp.get(idx), 99);
    }

    #[test]
    fn test_enabled_size_tracks_toggles() {
        let mut kp = KeyPackage::new(ResetMode::Leave);
        let a = kp.add_key("a");
        let b = kp.add_key("b");
        assert_eq!(kp.enabled_size(), 2);

        kp.disable_key(a);
        assert_eq!(kp.enabled_size(), 1);
        assert!(!kp.is_key_enabled(a));
        assert!(kp.is_key_enabled(b));

        // double disable must not underflow
        kp.disable_key(a);
        assert_eq!(kp.enabled_size(), 1);

        kp.enable_key(a);
        kp.enable_key(a);
        assert_eq!(kp.enabled_size(), 2);
    }

    #[test]
    fn test_enabled_size_never_exceeds_size() {
        let mut kp = KeyPackage::new(ResetMode::Disable);
        for i in 0..16 {
            kp.add_key(&format!("k{i}"));
            assert!(kp.enabled_size() <= kp.size());
        }
    }

    #[test]
    fn test_set_reenables_in_disable_mode() {
        let mut kp = KeyPackage::new(ResetMode::Disable);
        let idx = kp.add_key("k");
        kp.disable_key(idx);
        assert_eq!(kp.enabled_size(), 0);

        kp.set(idx, 3);
        assert!(kp.is_key_enabled(idx));
        assert_eq!(kp.enabled_size(), 1);
    }

    #[test]
    fn test_set_does_not_reenable_in_leave_mode() {
        let mut kp = KeyPackage::new(ResetMode::Leave);
        let idx = kp.add_key("k");
        kp.disable_key(idx);
        kp.set(idx, 3);
        assert!(!kp.is_key_enabled(idx));
    }

    #[test]
    fn test_enabled_iter_skips_disabled() {
        let mut kp = KeyPackage::new(ResetMode::Leave);
        kp.add_key("a");
        let b = kp.add_key("b");
        kp.add_key("c");
        kp.disable_key(b);

        let keys: Vec<_> = kp.enabled_iter().map(KeyInfo::key).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn test_unresolved_tracks_backend_keys() {
        let mut kp = KeyPackage::new(ResetMode::Leave);
        kp.add_key("a");
        kp.add_key("b");
        assert_eq!(kp.unresolved(BackendId::Dbats), vec![0, 1]);

        kp.set_backend_key(0, BackendId::Dbats, vec![0, 0, 0, 7].into_boxed_slice());
        assert_eq!(kp.unresolved(BackendId::Dbats), vec![1]);
        // other backends are unaffected
        assert_eq!(kp.unresolved(BackendId::Ascii), vec![0, 1]);
    }

    #[test]
    fn test_flush_with_no_enabled_backends_applies_reset() {
        let mut ts = Timeseries::new();
        let mut kp = KeyPackage::new(ResetMode::Reset);
        let idx = kp.add_key("k");
        kp.set(idx, 9);
        kp.flush(&mut ts, 10).unwrap();
        assert_eq!(kp.get(idx), 0);
    }

    #[test]
    fn test_flush_disable_mode_clears_enabled() {
        let mut ts = Timeseries::new();
        let mut kp = KeyPackage::new(ResetMode::Disable);
        let idx = kp.add_key("k");
        kp.set(idx, 9);
        kp.flush(&mut ts, 10).unwrap();
        assert_eq!(kp.enabled_size(), 0);
        // value survives a DISABLE flush
        assert_eq!(kp.get(idx), 9);
    }
}
