//! Module runtime
//!
//! Parses, links and runs one downloaded module at a time.
//!
//! # Lifecycle
//!
//! ```text
//!            start(i)                    prepare ok
//!   Idle ─────────────────▶ Starting ──────────────────▶ Running
//!    ▲                         │                            │
//!    │      parse/load/link    │                            │ _start returns,
//!    ├─────────── error ◀──────┘                            │ traps, or stop()
//!    └──────────────────────────────────────────────────────┘
//! ```
//!
//! `start` always stops the current unit first, so at most one module is
//! resident. Each unit gets a fresh engine and store sized by
//! [`RuntimeConfig`](crate::config::RuntimeConfig): the store limiter caps
//! linear memory and the engine caps the native stack used by guest frames.
//!
//! # Module ABI
//!
//! | Export    | Type       | Description                     |
//! |-----------|------------|---------------------------------|
//! | `_start`  | `() -> ()` | Entry point, required           |
//! | `memory`  | Memory     | Needed by pointer-taking calls  |
//!
//! Host capabilities live in the `env` namespace:
//!
//! ```text
//! delay(ms: i32)        sleep, wakes early on stop
//! print(ptr: i32)       write the NUL-terminated string at ptr
//! millis() -> i32       milliseconds since the module started
//! ```
//!
//! `arduino_delay` and `arduino_print` are accepted as aliases of `delay`
//! and `print`. The `delay` argument is read as unsigned.
//!
//! # Stopping
//!
//! Stop is cooperative. The cancel flag is checked on every host call and
//! wakes a sleeping `delay`; an epoch bump interrupts guest code that never
//! calls out. The supervisor then waits for the unit to report, for at most
//! the configured grace period.

mod abi;
mod error;
mod host;
mod parser;
mod supervisor;

pub use abi::*;
pub use error::*;
pub use host::*;
pub use parser::*;
pub use supervisor::*;

#[cfg(test)]
mod tests;
