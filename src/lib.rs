//! modvisor - dynamic WASM module host for small devices
//!
//! Keeps a bounded registry of named modules, downloads their bytecode over
//! the network, and runs one of them at a time against a fixed table of host
//! capabilities.
//!
//! Design principles:
//! - Bounded: fixed slot count, size-capped downloads, one resident module
//! - Failure is data: every step returns a typed error; nothing half-loaded survives
//! - Stop always works: a running module can be reclaimed without a reboot
//!
//! ```text
//! add ──▶ ModuleRegistry ◀── install ── ModuleFetcher ◀── Transport
//!               │
//!              run ──▶ ExecutionSupervisor ──▶ execution unit (thread)
//!                            ▲                        │
//!                          stop               HostFunctionTable
//! ```

pub mod config;
pub mod controller;
pub mod fetch;
pub mod persist;
pub mod registry;
pub mod runtime;

pub use config::Config;
pub use controller::{ControlError, ControlResult, Controller, StatusSnapshot};
pub use fetch::{FetchError, HttpTransport, ModuleFetcher, NetworkLink, Transport};
pub use registry::{ModuleRegistry, RegistryError};
pub use runtime::{ExecutionSupervisor, HostFunctionTable, RunOutcome, RuntimeError};

use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber used by the binaries.
///
/// `RUST_LOG` takes precedence over `default_filter`. Calling it twice is
/// harmless.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
