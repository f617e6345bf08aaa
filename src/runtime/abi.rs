//! Module ABI constants
//!
//! The stable interface between the device and a module.

/// Entry point every module must export, type `() -> ()`
pub const ENTRY_POINT: &str = "_start";

/// Linear memory export read by pointer-taking capabilities
pub const MEMORY_EXPORT: &str = "memory";

/// Namespace host capabilities are linked under
pub const IMPORT_NAMESPACE: &str = "env";

/// Capability names and their signatures.
///
/// Signatures use the compact `ret(params)` notation: `v` = no result,
/// `i` = i32, `I` = i64, `f` = f32, `F` = f64, `*` = i32 pointer into linear
/// memory.
pub mod capabilities {
    /// Sleep for the given milliseconds
    pub const DELAY: &str = "delay";
    pub const DELAY_SIG: &str = "v(i)";

    /// Emit a NUL-terminated string
    pub const PRINT: &str = "print";
    pub const PRINT_SIG: &str = "v(*)";

    /// Milliseconds since the module started
    pub const MILLIS: &str = "millis";
    pub const MILLIS_SIG: &str = "i()";

    /// Firmware-era name for `delay`, same signature
    pub const ARDUINO_DELAY: &str = "arduino_delay";

    /// Firmware-era name for `print`, same signature
    pub const ARDUINO_PRINT: &str = "arduino_print";
}

/// Longest string `print` will read before giving up on a terminator
pub const MAX_PRINT_LEN: usize = 4096;

/// WASM magic number: \0asm
pub const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// WASM version 1
pub const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
