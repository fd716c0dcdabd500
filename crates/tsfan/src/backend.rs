//! Backend identifiers and the polymorphic write contract.
//!
//! Every write destination implements [`BackendOps`]; the closed set of
//! destinations is the [`Backend`] enum, one variant per [`BackendId`].
//! Dispatch goes through the trait object returned by [`Backend::ops`] /
//! [`Backend::ops_mut`], so internal loops stay polymorphic while the set
//! of backends stays sealed.

use crate::backends::ascii::AsciiBackend;
use crate::backends::dbats::DbatsBackend;
use crate::backends::kafka::KafkaBackend;
use crate::error::Result;
use crate::kp::KeyPackage;

/// Identifier of a write destination.
///
/// A small dense integer used to index the backend table and to tag
/// per-key resolved-id slots inside a key package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum BackendId {
    /// Plain-text sink (stdout or file).
    Ascii = 0,
    /// Aggregated time-series store.
    Dbats = 1,
    /// Kafka producer speaking TSK (or ASCII) frames.
    Kafka = 2,
}

impl BackendId {
    /// Number of backend identifiers.
    pub const COUNT: usize = 3;

    /// All identifiers in table order; internal loops iterate this.
    pub const ALL: [BackendId; Self::COUNT] = [Self::Ascii, Self::Dbats, Self::Kafka];

    /// The table slot this identifier occupies.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Resolved backend-private key identifiers for a batch of keys.
///
/// Bulk resolution either returns one contiguous blob of fixed-width ids
/// (the store allocated them as a block) or one independently-allocated
/// blob per key. Callers index both forms uniformly via [`ResolvedKeys::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedKeys {
    /// `len` ids of `width` bytes each, packed back to back.
    Contiguous {
        /// The packed id bytes, `len * width` long.
        blob: Vec<u8>,
        /// Width of a single id in bytes.
        width: usize,
    },
    /// One id blob per key, in key order.
    Individual(Vec<Box<[u8]>>),
}

impl ResolvedKeys {
    /// Number of resolved ids.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Contiguous { blob, width } => {
                if *width == 0 {
                    0
                } else {
                    blob.len() / width
                }
            }
            Self::Individual(ids) => ids.len(),
        }
    }

    /// True if no ids were resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The id bytes for key `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.len()`.
    #[must_use]
    pub fn get(&self, i: usize) -> &[u8] {
        match self {
            Self::Contiguous { blob, width } => &blob[i * width..(i + 1) * width],
            Self::Individual(ids) => &ids[i],
        }
    }
}

/// The operation surface every backend implements.
///
/// Lifecycle: a backend is constructed disabled, configured exactly once by
/// [`init`](BackendOps::init) (which flips `enabled` on success and fully
/// reverts on failure), and releases its resources on drop.
pub trait BackendOps {
    /// This backend's identifier.
    fn id(&self) -> BackendId;

    /// Short lowercase name, also argv\[0\] of the option grammar.
    fn name(&self) -> &'static str;

    /// Whether [`init`](BackendOps::init) has succeeded.
    fn is_enabled(&self) -> bool;

    /// Parses backend-specific flags, allocates state and opens resources.
    ///
    /// # Errors
    ///
    /// Any failure fully reverts and leaves the backend disabled.
    fn init(&mut self, args: &[String]) -> Result<()>;

    /// Immediately writes a single value.
    ///
    /// # Errors
    ///
    /// Surfaces the backend's write failure.
    fn set_single(&mut self, key: &str, value: u64, time: u32) -> Result<()>;

    /// Translates a key into this backend's private identifier.
    ///
    /// # Errors
    ///
    /// [`Error::NotImplemented`](crate::Error::NotImplemented) when the
    /// backend has no id concept, or a resolve failure.
    fn resolve_key(&mut self, key: &str) -> Result<Box<[u8]>>;

    /// Translates a batch of keys at once.
    ///
    /// # Errors
    ///
    /// Fails if any single key cannot be resolved.
    fn resolve_key_bulk(&mut self, keys: &[&str]) -> Result<ResolvedKeys> {
        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            ids.push(self.resolve_key(key)?);
        }
        Ok(ResolvedKeys::Individual(ids))
    }

    /// Writes a single value using a pre-resolved id.
    ///
    /// # Errors
    ///
    /// May be unsupported
    /// ([`Error::NotImplemented`](crate::Error::NotImplemented)).
    fn set_single_by_id(&mut self, id: &[u8], value: u64, time: u32) -> Result<()>;

    /// Opens a batched write of exactly `key_cnt` values at `time`.
    ///
    /// The caller promises `key_cnt` subsequent
    /// [`set_bulk_by_id`](BackendOps::set_bulk_by_id) calls; the backend
    /// ends the batch on the last one.
    ///
    /// # Errors
    ///
    /// May be unsupported.
    fn set_bulk_init(&mut self, key_cnt: u32, time: u32) -> Result<()>;

    /// Writes one value of the current batch.
    ///
    /// # Errors
    ///
    /// May be unsupported; fails if no batch is open.
    fn set_bulk_by_id(&mut self, id: &[u8], value: u64) -> Result<()>;

    /// Resolves ids for key-package records that do not have one yet.
    ///
    /// Called lazily the first time a key package flushes under this
    /// backend after new keys were added. The default is a no-op for
    /// backends that write raw key strings.
    ///
    /// # Errors
    ///
    /// Surfaces resolve failures.
    fn kp_ki_update(&mut self, _kp: &mut KeyPackage) -> Result<()> {
        Ok(())
    }

    /// Writes every enabled record of `kp` at `time`.
    ///
    /// The backend picks its cheapest path (bulk-by-id, single-by-id, or
    /// raw strings); records are visited in insertion order.
    ///
    /// # Errors
    ///
    /// Surfaces the first write failure; earlier writes are not rolled
    /// back.
    fn kp_flush(&mut self, kp: &KeyPackage, time: u32) -> Result<()>;
}

/// A backend instance; one variant per [`BackendId`].
#[allow(clippy::large_enum_variant)]
pub enum Backend {
    /// Plain-text sink.
    Ascii(AsciiBackend),
    /// Aggregated time-series store.
    Dbats(DbatsBackend),
    /// Kafka TSK producer.
    Kafka(KafkaBackend),
}

impl Backend {
    /// Borrows the operation surface.
    #[must_use]
    pub fn ops(&self) -> &dyn BackendOps {
        match self {
            Self::Ascii(b) => b,
            Self::Dbats(b) => b,
            Self::Kafka(b) => b,
        }
    }

    /// Mutably borrows the operation surface.
    pub fn ops_mut(&mut self) -> &mut dyn BackendOps {
        match self {
            Self::Ascii(b) => b,
            Self::Dbats(b) => b,
            Self::Kafka(b) => b,
        }
    }

    /// This backend's identifier.
    #[must_use]
    pub fn id(&self) -> BackendId {
        self.ops().id()
    }

    /// Short lowercase name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.ops().name()
    }

    /// Whether the backend has been enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.ops().is_enabled()
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name())
            .field("id", &self.id())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
