//! Error types for the fan-out library.

use thiserror::Error;

use crate::codec::CodecError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by library operations.
///
/// Backends report transport problems through the two bus variants:
/// [`Error::TransientBus`] failures are retried in place by the caller (or
/// by the backend itself, bounded), while [`Error::FatalBus`] is latched by
/// the backend and every subsequent operation fails fast.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A backend could not map a key to a backend-private identifier.
    #[error("key resolution failed on backend '{backend}': {detail}")]
    Resolve {
        /// Name of the backend that failed.
        backend: &'static str,
        /// What could not be resolved.
        detail: String,
    },

    /// Recoverable bus error (queue full, broker temporarily unreachable).
    #[error("transient bus error: {0}")]
    TransientBus(String),

    /// Unrecoverable bus error (bad compression codec, unresolvable
    /// brokers). Latched by the backend.
    #[error("fatal bus error: {0}")]
    FatalBus(String),

    /// Malformed TSK frame or truncated header.
    #[error(transparent)]
    Parse(#[from] CodecError),

    /// One backend failed while others succeeded; the key package is
    /// preserved and retryable.
    #[error("flush failed on backend '{backend}': {source}")]
    PartialFlush {
        /// Name of the backend whose flush failed.
        backend: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Operation not supported by this backend.
    #[error("operation not implemented by backend '{0}'")]
    NotImplemented(&'static str),

    /// I/O failure in a file-writing backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by the Kafka client.
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}
