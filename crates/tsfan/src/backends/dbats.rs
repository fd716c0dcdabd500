//! Aggregated time-series store backend.
//!
//! The storage engine lives behind the [`DbatsStore`] trait: it resolves
//! key strings to dense numeric ids and accepts snapshot-style bulk writes
//! (all values of one timestamp set together). This backend is the glue
//! between that contract and the key-package machinery: it batch-resolves
//! ids lazily at flush time, caches them in the package as 4-byte
//! big-endian blobs, and drives the bulk write path on every flush.
//!
//! [`MemStore`] is the default engine, an in-process id map plus
//! last-value table. Embedders with a real store inject it through
//! [`Timeseries::set_dbats_store`](crate::Timeseries::set_dbats_store)
//! before enabling the backend.

use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use clap::Parser;
use tracing::debug;

use crate::backend::{BackendId, BackendOps, ResolvedKeys};
use crate::error::{Error, Result};
use crate::kp::KeyPackage;

const BACKEND_NAME: &str = "dbats";

/// Width in bytes of a resolved key id.
pub const KEY_ID_WIDTH: usize = 4;

#[derive(Parser, Debug)]
#[command(name = BACKEND_NAME)]
struct DbatsArgs {
    /// Location of the database to open
    #[arg(short = 'p', value_name = "path")]
    path: Option<String>,
}

/// The engine contract the backend drives.
///
/// Implementations must support bulk key resolution to dense u32 ids and
/// snapshot-style writes: [`begin_snapshot`](DbatsStore::begin_snapshot),
/// then one [`set_by_id`](DbatsStore::set_by_id) per key, then
/// [`commit_snapshot`](DbatsStore::commit_snapshot).
pub trait DbatsStore: Send {
    /// Connects to the engine; `path` comes from the `-p` option.
    ///
    /// # Errors
    ///
    /// Fails if the database cannot be opened.
    fn open(&mut self, path: Option<&str>) -> Result<()>;

    /// Resolves every key to its id, creating ids for unknown keys.
    ///
    /// # Errors
    ///
    /// Fails if any key cannot be resolved; no partial result is returned.
    fn resolve_ids(&mut self, keys: &[&str]) -> Result<Vec<u32>>;

    /// Opens a write snapshot at `time`.
    ///
    /// # Errors
    ///
    /// Fails if a snapshot is already open.
    fn begin_snapshot(&mut self, time: u32) -> Result<()>;

    /// Sets one value inside the open snapshot.
    ///
    /// # Errors
    ///
    /// Fails if no snapshot is open.
    fn set_by_id(&mut self, id: u32, value: u64) -> Result<()>;

    /// Commits the open snapshot.
    ///
    /// # Errors
    ///
    /// Fails if no snapshot is open.
    fn commit_snapshot(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemStoreInner {
    ids: AHashMap<String, u32>,
    values: AHashMap<u32, u64>,
    snapshot_time: Option<u32>,
    resolve_calls: usize,
}

/// In-memory default engine: dense id map plus last-value table.
///
/// Clones share the same underlying state, so an embedder (or a test) can
/// keep a handle for inspection while the backend owns another.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<MemStoreInner>>,
}

impl MemStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value written for `key`, if the key has ever been set.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<u64> {
        let inner = self.inner.lock().expect("mem store poisoned");
        let id = inner.ids.get(key)?;
        inner.values.get(id).copied()
    }

    /// Number of distinct keys ever resolved.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.inner.lock().expect("mem store poisoned").ids.len()
    }

    /// Number of [`DbatsStore::resolve_ids`] calls served.
    #[must_use]
    pub fn resolve_calls(&self) -> usize {
        self.inner.lock().expect("mem store poisoned").resolve_calls
    }
}

impl DbatsStore for MemStore {
    fn open(&mut self, path: Option<&str>) -> Result<()> {
        if let Some(path) = path {
            debug!(path = %path, "mem store ignores database path");
        }
        Ok(())
    }

    fn resolve_ids(&mut self, keys: &[&str]) -> Result<Vec<u32>> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        inner.resolve_calls += 1;
        let mut ids = Vec::with_capacity(keys.len());
        for &key in keys {
            let next = u32::try_from(inner.ids.len()).map_err(|_| Error::Resolve {
                backend: BACKEND_NAME,
                detail: "key id space exhausted".into(),
            })?;
            let id = *inner.ids.entry(key.to_owned()).or_insert(next);
            ids.push(id);
        }
        Ok(ids)
    }

    fn begin_snapshot(&mut self, time: u32) -> Result<()> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        if inner.snapshot_time.is_some() {
            return Err(Error::Config("snapshot already open".into()));
        }
        inner.snapshot_time = Some(time);
        Ok(())
    }

    fn set_by_id(&mut self, id: u32, value: u64) -> Result<()> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        if inner.snapshot_time.is_none() {
            return Err(Error::Config("no snapshot open".into()));
        }
        inner.values.insert(id, value);
        Ok(())
    }

    fn commit_snapshot(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        if inner.snapshot_time.take().is_none() {
            return Err(Error::Config("no snapshot open".into()));
        }
        Ok(())
    }
}

/// Backend bridging key packages to a [`DbatsStore`] engine.
pub struct DbatsBackend {
    enabled: bool,
    store: Box<dyn DbatsStore>,
    bulk_cnt: u32,
    bulk_expect: u32,
}

impl DbatsBackend {
    /// Creates the backend disabled, with the in-memory default engine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: false,
            store: Box::new(MemStore::new()),
            bulk_cnt: 0,
            bulk_expect: 0,
        }
    }

    /// Replaces the engine. Must happen before [`BackendOps::init`].
    ///
    /// # Errors
    ///
    /// Fails if the backend is already enabled.
    pub fn set_store(&mut self, store: Box<dyn DbatsStore>) -> Result<()> {
        if self.enabled {
            return Err(Error::Config(
                "dbats store cannot be replaced on an enabled backend".into(),
            ));
        }
        self.store = store;
        Ok(())
    }

    fn parse_id(id: &[u8]) -> Result<u32> {
        let bytes: [u8; KEY_ID_WIDTH] = id.try_into().map_err(|_| Error::Resolve {
            backend: BACKEND_NAME,
            detail: format!("malformed key id of {} bytes", id.len()),
        })?;
        Ok(u32::from_be_bytes(bytes))
    }
}

impl Default for DbatsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendOps for DbatsBackend {
    fn id(&self) -> BackendId {
        BackendId::Dbats
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn init(&mut self, args: &[String]) -> Result<()> {
        let parsed = DbatsArgs::try_parse_from(
            std::iter::once(BACKEND_NAME.to_owned()).chain(args.iter().cloned()),
        )
        .map_err(|e| Error::Config(e.to_string()))?;

        self.store.open(parsed.path.as_deref())?;
        self.enabled = true;
        Ok(())
    }

    fn set_single(&mut self, key: &str, value: u64, time: u32) -> Result<()> {
        let ids = self.store.resolve_ids(&[key])?;
        let id = *ids.first().ok_or_else(|| Error::Resolve {
            backend: BACKEND_NAME,
            detail: format!("store returned no id for '{key}'"),
        })?;
        self.store.begin_snapshot(time)?;
        self.store.set_by_id(id, value)?;
        self.store.commit_snapshot()
    }

    fn resolve_key(&mut self, key: &str) -> Result<Box<[u8]>> {
        let ids = self.store.resolve_ids(&[key])?;
        let id = *ids.first().ok_or_else(|| Error::Resolve {
            backend: BACKEND_NAME,
            detail: format!("store returned no id for '{key}'"),
        })?;
        Ok(id.to_be_bytes().to_vec().into_boxed_slice())
    }

    fn resolve_key_bulk(&mut self, keys: &[&str]) -> Result<ResolvedKeys> {
        let ids = self.store.resolve_ids(keys)?;
        if ids.len() != keys.len() {
            return Err(Error::Resolve {
                backend: BACKEND_NAME,
                detail: format!("store resolved {} of {} keys", ids.len(), keys.len()),
            });
        }
        let mut blob = Vec::with_capacity(ids.len() * KEY_ID_WIDTH);
        for id in ids {
            blob.extend_from_slice(&id.to_be_bytes());
        }
        Ok(ResolvedKeys::Contiguous {
            blob,
            width: KEY_ID_WIDTH,
        })
    }

    fn set_single_by_id(&mut self, id: &[u8], value: u64, time: u32) -> Result<()> {
        let id = Self::parse_id(id)?;
        self.store.begin_snapshot(time)?;
        self.store.set_by_id(id, value)?;
        self.store.commit_snapshot()
    }

    fn set_bulk_init(&mut self, key_cnt: u32, time: u32) -> Result<()> {
        if self.bulk_expect != 0 {
            return Err(Error::Config("bulk write already in progress".into()));
        }
        self.store.begin_snapshot(time)?;
        self.bulk_expect = key_cnt;
        self.bulk_cnt = 0;
        Ok(())
    }

    fn set_bulk_by_id(&mut self, id: &[u8], value: u64) -> Result<()> {
        if self.bulk_expect == 0 {
            return Err(Error::Config("no bulk write in progress".into()));
        }
        let id = Self::parse_id(id)?;
        self.store.set_by_id(id, value)?;

        self.bulk_cnt += 1;
        if self.bulk_cnt == self.bulk_expect {
            self.bulk_cnt = 0;
            self.bulk_expect = 0;
            self.store.commit_snapshot()?;
        }
        Ok(())
    }

    fn kp_ki_update(&mut self, kp: &mut KeyPackage) -> Result<()> {
        let missing = kp.unresolved(BackendId::Dbats);
        if missing.is_empty() {
            return Ok(());
        }

        let keys: Vec<&str> = missing.iter().map(|&i| kp.key(i)).collect();
        debug!(new_keys = keys.len(), "resolving key ids");
        let resolved = self.resolve_key_bulk(&keys)?;

        for (slot, &index) in missing.iter().enumerate() {
            kp.set_backend_key(
                index,
                BackendId::Dbats,
                resolved.get(slot).to_vec().into_boxed_slice(),
            );
        }
        Ok(())
    }

    fn kp_flush(&mut self, kp: &KeyPackage, time: u32) -> Result<()> {
        let cnt = u32::try_from(kp.enabled_size()).map_err(|_| Error::Resolve {
            backend: BACKEND_NAME,
            detail: "enabled key count exceeds u32".into(),
        })?;
        if cnt == 0 {
            return Ok(());
        }

        // verify every row resolved before opening the snapshot
        let mut writes = Vec::with_capacity(kp.enabled_size());
        for ki in kp.enabled_iter() {
            let id = ki.backend_key(BackendId::Dbats).ok_or_else(|| Error::Resolve {
                backend: BACKEND_NAME,
                detail: format!("no resolved id for key '{}'", ki.key()),
            })?;
            writes.push((id, ki.value()));
        }

        self.set_bulk_init(cnt, time)?;
        for (id, value) in writes {
            if let Err(e) = self.set_bulk_by_id(id, value) {
                // close the half-written snapshot so the package stays
                // retryable
                self.bulk_cnt = 0;
                self.bulk_expect = 0;
                let _ = self.store.commit_snapshot();
                return Err(e);
            }
        }
        Ok(())
    }
}
