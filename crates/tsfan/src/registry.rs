//! The backend table and its lifecycle.

use tracing::{debug, info};

use crate::backend::{Backend, BackendId};
use crate::backends::ascii::AsciiBackend;
use crate::backends::dbats::{DbatsBackend, DbatsStore};
use crate::backends::kafka::KafkaBackend;
use crate::error::{Error, Result};
use crate::opts;

/// Handle owning one instance of every backend.
///
/// All backends are constructed disabled at init time and configured at
/// most once through [`enable_backend`](Timeseries::enable_backend).
/// Internal loops iterate [`BackendId::ALL`] and skip disabled slots.
pub struct Timeseries {
    backends: [Backend; BackendId::COUNT],
}

impl Timeseries {
    /// Creates the handle with every backend allocated and disabled.
    #[must_use]
    pub fn new() -> Self {
        debug!("initializing timeseries backend table");
        Self {
            backends: [
                Backend::Ascii(AsciiBackend::new()),
                Backend::Dbats(DbatsBackend::new()),
                Backend::Kafka(KafkaBackend::new()),
            ],
        }
    }

    /// Borrows the backend in slot `id`.
    #[must_use]
    pub fn backend(&self, id: BackendId) -> &Backend {
        &self.backends[id.index()]
    }

    /// Mutably borrows the backend in slot `id`.
    pub fn backend_mut(&mut self, id: BackendId) -> &mut Backend {
        &mut self.backends[id.index()]
    }

    /// Finds a backend whose name is a case-insensitive prefix of `name`.
    ///
    /// `"ascii"`, `"ASCII"` and `"ascii-v2"` all match the ASCII backend;
    /// `"asc"` matches nothing.
    #[must_use]
    pub fn backend_by_name(&self, name: &str) -> Option<BackendId> {
        BackendId::ALL.into_iter().find(|&id| {
            let bname = self.backend(id).name().as_bytes();
            let name = name.as_bytes();
            name.len() >= bname.len() && name[..bname.len()].eq_ignore_ascii_case(bname)
        })
    }

    /// Identifiers of the currently enabled backends, in table order.
    pub fn enabled_backends(&self) -> impl Iterator<Item = BackendId> + '_ {
        BackendId::ALL
            .into_iter()
            .filter(|&id| self.backend(id).is_enabled())
    }

    /// Tokenises `options` and initialises the backend in slot `id`.
    ///
    /// # Errors
    ///
    /// Fails on a malformed option string, on a backend that is already
    /// enabled, or on any init failure (which leaves the backend disabled).
    pub fn enable_backend(&mut self, id: BackendId, options: &str) -> Result<()> {
        let backend = self.backend_mut(id);
        info!(backend = backend.name(), "enabling backend");

        if backend.is_enabled() {
            return Err(Error::Config(format!(
                "backend '{}' is already enabled",
                backend.name()
            )));
        }

        let args = opts::tokenize(options)?;
        backend.ops_mut().init(&args)
    }

    /// Immediately writes one value through the backend in slot `id`.
    ///
    /// # Errors
    ///
    /// Fails if the backend is not enabled, or on the write itself.
    pub fn set_single(&mut self, id: BackendId, key: &str, value: u64, time: u32) -> Result<()> {
        let backend = self.backend_mut(id);
        if !backend.is_enabled() {
            return Err(Error::Config(format!(
                "backend '{}' is not enabled",
                backend.name()
            )));
        }
        backend.ops_mut().set_single(key, value, time)
    }

    /// Replaces the engine driven by the DBATS backend.
    ///
    /// Must be called before the backend is enabled; embedders use this to
    /// plug a real aggregated store in place of the in-memory default.
    ///
    /// # Errors
    ///
    /// Fails if the DBATS backend is already enabled.
    pub fn set_dbats_store(&mut self, store: Box<dyn DbatsStore>) -> Result<()> {
        match self.backend_mut(BackendId::Dbats) {
            Backend::Dbats(b) => b.set_store(store),
            _ => unreachable!("dbats slot holds the dbats backend"),
        }
    }
}

impl Default for Timeseries {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Timeseries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let enabled: Vec<_> = self
            .enabled_backends()
            .map(|id| self.backend(id).name())
            .collect();
        f.debug_struct("Timeseries")
            .field("enabled", &enabled)
            .finish()
    }
}
