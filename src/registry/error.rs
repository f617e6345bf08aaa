//! Registry error types

use thiserror::Error;

/// Registry result type
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors returned by [`ModuleRegistry`](super::ModuleRegistry) operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Name is empty or contains the persistence separator
    #[error("invalid module name: {0:?}")]
    InvalidName(String),
    /// Same (name, source URI) pair is already registered
    #[error("module already registered: {name} ({source_uri})")]
    DuplicateModule { name: String, source_uri: String },
    /// Every slot is occupied
    #[error("registry full ({capacity} slots)")]
    RegistryFull { capacity: usize },
    /// Index out of range or slot empty
    #[error("invalid module index: {0}")]
    InvalidIndex(usize),
    /// Slot is in use by the running module
    #[error("module {0} is running")]
    ModuleBusy(usize),
}
