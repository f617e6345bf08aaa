//! Host capability table
//!
//! Native functions a module may import from the `env` namespace. Each entry
//! is keyed by name and compact signature and carries a plain callback.
//!
//! Linking is best-effort. Every entry gets its own [`BindStatus`]; a failure
//! is logged and skipped. Function imports that nothing satisfies are bound
//! to stubs that trap with [`HostTrap::Unresolved`] when called, so the
//! module still loads and the gap is visible in the [`LinkReport`] before it
//! ever runs.
//!
//! Every call into a host function is a cancellation point.

use super::abi::{IMPORT_NAMESPACE, MAX_PRINT_LEN, MEMORY_EXPORT, capabilities};
use super::error::{HostTrap, RuntimeError, RuntimeResult};
use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wasmtime::{Caller, Engine, Extern, ExternType, FuncType, Linker, Module, StoreLimits, Val, ValType};

/// Native side of a capability
pub type HostCallback = fn(&mut Caller<'_, HostContext>, &[Val], &mut [Val]) -> wasmtime::Result<()>;

/// Where `print` output goes
pub trait OutputSink: Send + Sync {
    fn emit(&self, module: &str, text: &str);
}

/// Writes module output straight to stdout
#[derive(Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn emit(&self, _module: &str, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}

/// Collects module output in memory
#[derive(Debug, Default)]
pub struct BufferSink {
    buffer: Mutex<String>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OutputSink for BufferSink {
    fn emit(&self, _module: &str, text: &str) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }
}

/// Cooperative cancellation flag shared by the supervisor and a running unit
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<(Mutex<bool>, Condvar)>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wake) = &*self.0;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `duration`. Returns true if woken by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, wake) = &*self.0;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = wake
            .wait_timeout_while(guard, duration, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Per-run state reachable from host functions
pub struct HostContext {
    module_name: String,
    cancel: CancelToken,
    output: Arc<dyn OutputSink>,
    started: Instant,
    pub(crate) limits: StoreLimits,
}

impl HostContext {
    pub fn new(
        module_name: &str,
        cancel: CancelToken,
        output: Arc<dyn OutputSink>,
        limits: StoreLimits,
    ) -> Self {
        Self {
            module_name: module_name.to_string(),
            cancel,
            output,
            started: Instant::now(),
            limits,
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// One capability
#[derive(Clone, Copy)]
pub struct HostFunction {
    pub name: &'static str,
    pub signature: &'static str,
    pub callback: HostCallback,
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.signature)
    }
}

/// Result of binding one table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindStatus {
    Linked,
    /// Module does not import it
    NotImported,
    /// Module imports it with another signature
    SignatureMismatch { imported: String },
    /// Engine refused the definition
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub name: &'static str,
    pub signature: &'static str,
    pub status: BindStatus,
}

/// Per-entry outcome of linking the table into one module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub entries: Vec<LinkEntry>,
    /// `module::name` of function imports bound to trapping stubs
    pub unresolved: Vec<String>,
}

impl LinkReport {
    pub fn linked(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.status == BindStatus::Linked)
            .count()
    }

    pub fn status(&self, name: &str) -> Option<&BindStatus> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.status)
    }
}

/// The fixed capability catalog
#[derive(Debug, Clone)]
pub struct HostFunctionTable {
    entries: Vec<HostFunction>,
}

impl HostFunctionTable {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// delay, print and millis, plus `arduino_delay` and `arduino_print`
    /// for modules built against the older firmware names
    pub fn standard() -> Self {
        Self::empty()
            .with(HostFunction {
                name: capabilities::DELAY,
                signature: capabilities::DELAY_SIG,
                callback: host_delay,
            })
            .with(HostFunction {
                name: capabilities::PRINT,
                signature: capabilities::PRINT_SIG,
                callback: host_print,
            })
            .with(HostFunction {
                name: capabilities::MILLIS,
                signature: capabilities::MILLIS_SIG,
                callback: host_millis,
            })
            .with(HostFunction {
                name: capabilities::ARDUINO_DELAY,
                signature: capabilities::DELAY_SIG,
                callback: host_delay,
            })
            .with(HostFunction {
                name: capabilities::ARDUINO_PRINT,
                signature: capabilities::PRINT_SIG,
                callback: host_print,
            })
    }

    /// Add an entry, replacing one with the same name and signature
    pub fn with(mut self, function: HostFunction) -> Self {
        self.entries
            .retain(|entry| !(entry.name == function.name && entry.signature == function.signature));
        self.entries.push(function);
        self
    }

    pub fn get(&self, name: &str, signature: &str) -> Option<&HostFunction> {
        self.entries
            .iter()
            .find(|entry| entry.name == name && entry.signature == signature)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostFunction> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bind the table into `linker` for the imports `module` declares
    pub fn link(&self, linker: &mut Linker<HostContext>, engine: &Engine, module: &Module) -> LinkReport {
        let mut report = LinkReport::default();
        let mut bound: HashSet<(&str, &str)> = HashSet::new();

        for function in &self.entries {
            let import = module
                .imports()
                .find(|import| import.module() == IMPORT_NAMESPACE && import.name() == function.name);

            let status = match import.map(|import| import.ty()) {
                None => BindStatus::NotImported,
                Some(ExternType::Func(ty)) => {
                    let imported = compact_signature(&ty);
                    if signatures_match(&imported, function.signature) {
                        match bind(linker, engine, function) {
                            Ok(()) => {
                                bound.insert((IMPORT_NAMESPACE, function.name));
                                BindStatus::Linked
                            }
                            Err(e) => BindStatus::Failed(e.to_string()),
                        }
                    } else {
                        BindStatus::SignatureMismatch { imported }
                    }
                }
                Some(_) => BindStatus::SignatureMismatch {
                    imported: "non-function".to_string(),
                },
            };

            match &status {
                BindStatus::Linked => debug!(name = function.name, sig = function.signature, "linked"),
                BindStatus::NotImported => {}
                failed => warn!(name = function.name, sig = function.signature, status = ?failed, "link failed"),
            }

            report.entries.push(LinkEntry {
                name: function.name,
                signature: function.signature,
                status,
            });
        }

        for import in module.imports() {
            let ExternType::Func(ty) = import.ty() else {
                // Memories, tables and globals are never provided; instantiation refuses them
                continue;
            };
            if !bound.insert((import.module(), import.name())) {
                continue;
            }

            let qualified = format!("{}::{}", import.module(), import.name());
            let (owner, name) = (import.module().to_string(), import.name().to_string());
            let stubbed = linker.func_new(import.module(), import.name(), ty, move |_caller, _params, _results| {
                Err(wasmtime::Error::new(HostTrap::Unresolved {
                    module: owner.clone(),
                    name: name.clone(),
                }))
            });
            match stubbed {
                Ok(_) => {
                    warn!(import = %qualified, "unresolved import");
                    report.unresolved.push(qualified);
                }
                Err(e) => warn!(import = %qualified, error = %e, "cannot stub import"),
            }
        }

        report
    }
}

impl Default for HostFunctionTable {
    fn default() -> Self {
        Self::standard()
    }
}

fn bind(linker: &mut Linker<HostContext>, engine: &Engine, function: &HostFunction) -> wasmtime::Result<()> {
    let ty = signature_type(engine, function.signature).map_err(wasmtime::Error::new)?;
    let callback = function.callback;
    linker.func_new(IMPORT_NAMESPACE, function.name, ty, move |mut caller, params, results| {
        if caller.data().cancel.is_cancelled() {
            return Err(wasmtime::Error::new(HostTrap::Cancelled));
        }
        callback(&mut caller, params, results)
    })?;
    Ok(())
}

/// Pointers are i32 on the wire
fn signatures_match(a: &str, b: &str) -> bool {
    a.replace('*', "i") == b.replace('*', "i")
}

fn value_type(c: char) -> Option<ValType> {
    match c {
        'i' | '*' => Some(ValType::I32),
        'I' => Some(ValType::I64),
        'f' => Some(ValType::F32),
        'F' => Some(ValType::F64),
        'V' => Some(ValType::V128),
        _ => None,
    }
}

fn value_code(ty: &ValType) -> char {
    match ty {
        ValType::I32 => 'i',
        ValType::I64 => 'I',
        ValType::F32 => 'f',
        ValType::F64 => 'F',
        ValType::V128 => 'V',
        ValType::Ref(_) => 'r',
    }
}

/// Render an engine function type in compact `ret(params)` notation
pub fn compact_signature(ty: &FuncType) -> String {
    let params: String = ty.params().map(|param| value_code(&param)).collect();
    let results: String = ty.results().map(|result| value_code(&result)).collect();
    let ret = if results.is_empty() { "v".to_string() } else { results };
    format!("{ret}({params})")
}

/// Build an engine function type from compact `ret(params)` notation
pub fn signature_type(engine: &Engine, signature: &str) -> RuntimeResult<FuncType> {
    let invalid = || RuntimeError::LoadError(format!("unsupported signature {signature:?}"));

    let open = signature.find('(').ok_or_else(invalid)?;
    let params = signature[open + 1..].strip_suffix(')').ok_or_else(invalid)?;
    let results = match &signature[..open] {
        "v" => "",
        other => other,
    };

    let params = params.chars().map(value_type).collect::<Option<Vec<_>>>().ok_or_else(invalid)?;
    let results = results.chars().map(value_type).collect::<Option<Vec<_>>>().ok_or_else(invalid)?;
    Ok(FuncType::new(engine, params, results))
}

fn host_delay(caller: &mut Caller<'_, HostContext>, params: &[Val], _results: &mut [Val]) -> wasmtime::Result<()> {
    // Unsigned on the wire: -1 is u32::MAX milliseconds, not zero
    let ms = params.first().and_then(Val::i32).unwrap_or(0) as u32 as u64;
    if caller.data().cancel.sleep(Duration::from_millis(ms)) {
        return Err(wasmtime::Error::new(HostTrap::Cancelled));
    }
    Ok(())
}

fn host_print(caller: &mut Caller<'_, HostContext>, params: &[Val], _results: &mut [Val]) -> wasmtime::Result<()> {
    let address = params.first().and_then(Val::i32).unwrap_or(0) as u32;
    let memory = caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::new(HostTrap::MissingMemory))?;

    let text = read_cstring(memory.data(&*caller), address)?;
    let ctx = caller.data();
    ctx.output.emit(&ctx.module_name, &text);
    Ok(())
}

fn host_millis(caller: &mut Caller<'_, HostContext>, _params: &[Val], results: &mut [Val]) -> wasmtime::Result<()> {
    let elapsed = caller.data().started.elapsed().as_millis();
    if let Some(slot) = results.first_mut() {
        *slot = Val::I32(elapsed as i32);
    }
    Ok(())
}

/// Read a NUL-terminated string, capped at [`MAX_PRINT_LEN`]
fn read_cstring(data: &[u8], address: u32) -> Result<String, HostTrap> {
    let start = address as usize;
    if start >= data.len() {
        return Err(HostTrap::OutOfBounds {
            address,
            memory_size: data.len(),
        });
    }

    let max_end = std::cmp::min(start + MAX_PRINT_LEN, data.len());
    let end = data[start..max_end]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(max_end);

    Ok(String::from_utf8_lossy(&data[start..end]).into_owned())
}
