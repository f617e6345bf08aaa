//! Fetch error types

use crate::registry::RegistryError;
use thiserror::Error;

/// Fetch result type
pub type FetchResult<T> = Result<T, FetchError>;

/// Errors that can occur while downloading a module
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Network link is down; no I/O was attempted
    #[error("network transport unavailable")]
    TransportUnavailable,
    /// Response declared no usable length
    #[error("invalid content length: {0:?}")]
    InvalidContentLength(Option<u64>),
    /// Buffer for the declared length could not be allocated
    #[error("cannot allocate {requested} bytes (limit {limit})")]
    AllocationFailure { requested: u64, limit: usize },
    /// Connection ended before the declared length arrived
    #[error("incomplete transfer: {received} of {expected} bytes")]
    IncompleteTransfer { received: usize, expected: usize },
    /// Server answered with a non-success status
    #[error("remote error: HTTP {0}")]
    RemoteError(u16),
    /// Deadline passed before the transfer finished
    #[error("transfer timed out after {received} bytes")]
    Timeout { received: usize },
    /// Request could not be sent (DNS, refused connection, bad URI)
    #[error("transport error: {0}")]
    Transport(String),
    /// Module has no source to fetch from
    #[error("module {0} has no source URI")]
    MissingSource(usize),
    /// Target slot is invalid or busy
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
