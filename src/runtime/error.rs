//! Error types for the execution supervisor
//!
//! [`RuntimeError`] is what `start` returns and what a faulted run records.
//! [`HostTrap`] is raised from inside host functions and travels through the
//! engine as the cause of a trap.

use thiserror::Error;

/// Result type for supervisor operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur while starting or running a module
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Slot is empty or has no bytecode
    #[error("module {0} is not registered or not downloaded")]
    InvalidModule(usize),

    /// Bytecode is not a well-formed module
    #[error("parse error: {0}")]
    ParseError(String),

    /// Engine rejected the module (validation, limits, imports)
    #[error("load error: {0}")]
    LoadError(String),

    /// Module called an import nothing was linked to
    #[error("unresolved import: {module}::{name}")]
    UnresolvedImport { module: String, name: String },

    /// Entry export is missing or has the wrong type
    #[error("entry point not found: {0}")]
    EntryPointNotFound(String),

    /// Interpreter fault while running
    #[error("trap: {0}")]
    Trap(String),

    /// Engine could not be configured
    #[error("engine error: {0}")]
    Engine(String),

    /// Execution thread could not be created
    #[error("cannot spawn execution unit: {0}")]
    Spawn(String),
}

/// Faults raised by host functions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostTrap {
    #[error("cancelled")]
    Cancelled,

    #[error("unresolved import {module}::{name} called")]
    Unresolved { module: String, name: String },

    #[error("module has no `memory` export")]
    MissingMemory,

    #[error("memory access out of bounds: address {address}, memory size {memory_size}")]
    OutOfBounds { address: u32, memory_size: usize },
}

/// How a module run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Entry point returned
    Stopped,
    /// Ended by `stop`
    Cancelled,
    /// Trapped or failed mid-run
    Faulted(RuntimeError),
}

impl RunOutcome {
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }
}
