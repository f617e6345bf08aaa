//! Tests for the execution supervisor
//!
//! Modules are written in text format and assembled with `wat`.

use super::*;
use crate::config::RuntimeConfig;
use crate::registry::{Bytecode, ModuleRegistry};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use wasmtime::{Caller, Val};

// =============================================================================
// Fixtures
// =============================================================================

const HELLO: &str = r#"(module
    (import "env" "print" (func $print (param i32)))
    (memory (export "memory") 1)
    (data (i32.const 16) "hello\n\00")
    (func (export "_start") (call $print (i32.const 16))))"#;

const SPIN: &str = r#"(module
    (func (export "_start") (loop $forever (br $forever))))"#;

const BLINK: &str = r#"(module
    (import "env" "delay" (func $delay (param i32)))
    (func (export "_start")
        (loop $forever
            (call $delay (i32.const 10))
            (br $forever))))"#;

const UNREACHABLE: &str = r#"(module
    (func (export "_start") unreachable))"#;

const CALLS_MISSING: &str = r#"(module
    (import "env" "blink" (func $blink))
    (func (export "_start") (call $blink)))"#;

const WRONG_DELAY: &str = r#"(module
    (import "env" "delay" (func $delay (param i64)))
    (func (export "_start") (call $delay (i64.const 1))))"#;

const ARDUINO_HELLO: &str = r#"(module
    (import "env" "arduino_delay" (func $delay (param i32)))
    (import "env" "arduino_print" (func $print (param i32)))
    (memory (export "memory") 1)
    (data (i32.const 0) "legacy\n\00")
    (func (export "_start")
        (call $delay (i32.const 1))
        (call $print (i32.const 0))))"#;

const NEGATIVE_DELAY: &str = r#"(module
    (import "env" "delay" (func $delay (param i32)))
    (func (export "_start") (call $delay (i32.const -1))))"#;

const NO_ENTRY: &str = r#"(module
    (func (export "main")))"#;

const BAD_BODY: &str = r#"(module
    (func (export "_start") i32.add))"#;

const BIG_MEMORY: &str = r#"(module
    (memory (export "memory") 3)
    (func (export "_start")))"#;

const PRINT_OOB: &str = r#"(module
    (import "env" "print" (func $print (param i32)))
    (memory (export "memory") 1)
    (func (export "_start") (call $print (i32.const 70000))))"#;

const TIMED: &str = r#"(module
    (import "env" "delay" (func $delay (param i32)))
    (import "env" "millis" (func $millis (result i32)))
    (func (export "_start")
        (call $delay (i32.const 20))
        (if (i32.lt_s (call $millis) (i32.const 20))
            (then unreachable))))"#;

fn registry_with(modules: &[(&str, &str)]) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new(8);
    for (name, wat) in modules {
        let index = registry.add(name, "").unwrap();
        let wasm = wat::parse_str(wat).unwrap();
        registry.install(index, Bytecode::from(wasm)).unwrap();
    }
    registry
}

fn new_supervisor(config: RuntimeConfig) -> (ExecutionSupervisor, Arc<BufferSink>) {
    let sink = Arc::new(BufferSink::new());
    let output: Arc<dyn OutputSink> = sink.clone();
    let supervisor = ExecutionSupervisor::new(config, Arc::new(HostFunctionTable::standard()), output);
    (supervisor, sink)
}

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Runs to completion
// =============================================================================

#[test]
fn test_hello_runs_to_completion() {
    let registry = registry_with(&[("hello", HELLO)]);
    let (mut supervisor, sink) = new_supervisor(RuntimeConfig::default());

    let report = supervisor.start(&registry, 0).unwrap();
    assert_eq!(report.slot, 0);
    assert_eq!(report.link.status("print"), Some(&BindStatus::Linked));
    assert_eq!(report.link.status("delay"), Some(&BindStatus::NotImported));
    assert!(report.link.unresolved.is_empty());

    assert_eq!(supervisor.wait(WAIT), Some(RunOutcome::Stopped));
    assert_eq!(sink.contents(), "hello\n");
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert_eq!(supervisor.last_outcome(), Some(RunOutcome::Stopped));
}

#[test]
fn test_millis_counts_from_start() {
    let registry = registry_with(&[("timed", TIMED)]);
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    supervisor.start(&registry, 0).unwrap();
    assert_eq!(supervisor.wait(WAIT), Some(RunOutcome::Stopped));
}

#[test]
fn test_firmware_names_link_to_same_capabilities() {
    let registry = registry_with(&[("legacy", ARDUINO_HELLO)]);
    let (mut supervisor, sink) = new_supervisor(RuntimeConfig::default());

    let report = supervisor.start(&registry, 0).unwrap();
    assert_eq!(report.link.status("arduino_delay"), Some(&BindStatus::Linked));
    assert_eq!(report.link.status("arduino_print"), Some(&BindStatus::Linked));
    assert_eq!(report.link.status("print"), Some(&BindStatus::NotImported));
    assert!(report.link.unresolved.is_empty());

    assert_eq!(supervisor.wait(WAIT), Some(RunOutcome::Stopped));
    assert_eq!(sink.contents(), "legacy\n");
}

// =============================================================================
// Stop
// =============================================================================

#[test]
fn test_stop_interrupts_busy_loop() {
    let registry = registry_with(&[("spin", SPIN)]);
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    supervisor.start(&registry, 0).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(supervisor.state(), SupervisorState::Running { slot: 0 });
    assert_eq!(supervisor.active_name(), Some("spin"));

    assert_eq!(
        supervisor.stop(),
        StopOutcome::Finished {
            slot: 0,
            outcome: RunOutcome::Cancelled
        }
    );
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert_eq!(supervisor.active_slot(), None);
    assert_eq!(supervisor.last_outcome(), Some(RunOutcome::Cancelled));
}

#[test]
fn test_stop_wakes_delay() {
    let registry = registry_with(&[("blink", BLINK)]);
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    supervisor.start(&registry, 0).unwrap();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    assert!(matches!(
        supervisor.stop(),
        StopOutcome::Finished {
            outcome: RunOutcome::Cancelled,
            ..
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_negative_delay_sleeps_long() {
    let registry = registry_with(&[("forever", NEGATIVE_DELAY)]);
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    supervisor.start(&registry, 0).unwrap();
    // -1 reads as u32::MAX milliseconds
    assert_eq!(supervisor.wait(Duration::from_millis(100)), None);
    assert_eq!(supervisor.state(), SupervisorState::Running { slot: 0 });

    assert_eq!(
        supervisor.stop(),
        StopOutcome::Finished {
            slot: 0,
            outcome: RunOutcome::Cancelled
        }
    );
}

#[test]
fn test_stop_when_idle_is_noop() {
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());
    assert_eq!(supervisor.stop(), StopOutcome::NothingRunning);
    assert_eq!(supervisor.stop(), StopOutcome::NothingRunning);
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[test]
fn test_stop_after_natural_finish_is_noop() {
    let registry = registry_with(&[("hello", HELLO)]);
    let (mut supervisor, sink) = new_supervisor(RuntimeConfig::default());

    supervisor.start(&registry, 0).unwrap();
    let deadline = Instant::now() + WAIT;
    while supervisor.state() != SupervisorState::Idle && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(supervisor.state(), SupervisorState::Idle);

    assert_eq!(supervisor.stop(), StopOutcome::NothingRunning);
    assert_eq!(supervisor.last_outcome(), Some(RunOutcome::Stopped));
    assert_eq!(sink.contents(), "hello\n");
    assert_eq!(supervisor.stop(), StopOutcome::NothingRunning);
}

fn block_uninterruptibly(_caller: &mut Caller<'_, HostContext>, _params: &[Val], _results: &mut [Val]) -> wasmtime::Result<()> {
    thread::sleep(Duration::from_millis(400));
    Ok(())
}

#[test]
fn test_unit_past_grace_is_detached() {
    let registry = registry_with(&[(
        "stubborn",
        r#"(module
            (import "env" "block" (func $block))
            (func (export "_start") (loop $forever (call $block) (br $forever))))"#,
    )]);
    let table = HostFunctionTable::standard().with(HostFunction {
        name: "block",
        signature: "v()",
        callback: block_uninterruptibly,
    });
    let config = RuntimeConfig {
        stop_grace_ms: 50,
        ..RuntimeConfig::default()
    };
    let mut supervisor = ExecutionSupervisor::new(config, Arc::new(table), Arc::new(BufferSink::new()));

    supervisor.start(&registry, 0).unwrap();
    thread::sleep(Duration::from_millis(50));

    assert_eq!(supervisor.stop(), StopOutcome::Detached { slot: 0 });
    assert_eq!(supervisor.state(), SupervisorState::Idle);

    // The abandoned unit's late report must not clobber the record
    thread::sleep(Duration::from_millis(500));
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert_eq!(supervisor.last_outcome(), Some(RunOutcome::Cancelled));
}

// =============================================================================
// Replacement
// =============================================================================

#[test]
fn test_start_replaces_running_module() {
    let registry = registry_with(&[("a", SPIN), ("b", SPIN)]);
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    supervisor.start(&registry, 0).unwrap();
    supervisor.start(&registry, 1).unwrap();
    assert_eq!(supervisor.active_slot(), Some(1));
    assert_eq!(supervisor.active_name(), Some("b"));
    // The first unit was cancelled, not left running
    assert_eq!(supervisor.last_outcome(), Some(RunOutcome::Cancelled));

    assert_eq!(
        supervisor.stop(),
        StopOutcome::Finished {
            slot: 1,
            outcome: RunOutcome::Cancelled
        }
    );
}

#[test]
fn test_failed_start_still_stops_previous() {
    let mut registry = registry_with(&[("spin", SPIN)]);
    let junk = registry.add("junk", "").unwrap();
    registry.install(junk, Bytecode::from(b"garbage!!".to_vec())).unwrap();
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    supervisor.start(&registry, 0).unwrap();
    assert!(matches!(supervisor.start(&registry, junk), Err(RuntimeError::ParseError(_))));
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert_eq!(supervisor.last_outcome(), Some(RunOutcome::Cancelled));
}

// =============================================================================
// Start failures
// =============================================================================

#[test]
fn test_start_requires_loaded_slot() {
    let mut registry = ModuleRegistry::new(4);
    let index = registry.add("later", "http://device.local/later.wasm").unwrap();
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    assert_eq!(supervisor.start(&registry, index), Err(RuntimeError::InvalidModule(index)));
    assert_eq!(supervisor.start(&registry, 3), Err(RuntimeError::InvalidModule(3)));
    assert_eq!(supervisor.start(&registry, 99), Err(RuntimeError::InvalidModule(99)));
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[test]
fn test_garbage_is_parse_error() {
    let mut registry = ModuleRegistry::new(4);
    let index = registry.add("junk", "").unwrap();
    registry.install(index, Bytecode::from(vec![0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0, 1])).unwrap();
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    assert!(matches!(supervisor.start(&registry, index), Err(RuntimeError::ParseError(_))));
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[test]
fn test_invalid_body_is_load_error() {
    let registry = registry_with(&[("bad", BAD_BODY)]);
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    assert!(matches!(supervisor.start(&registry, 0), Err(RuntimeError::LoadError(_))));
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[test]
fn test_memory_over_budget_is_load_error() {
    let registry = registry_with(&[("big", BIG_MEMORY)]);
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    assert!(matches!(supervisor.start(&registry, 0), Err(RuntimeError::LoadError(_))));

    // Same module fits a larger budget
    let (mut roomy, _) = supervisor_with_memory(4 * 65536);
    roomy.start(&registry, 0).unwrap();
    assert_eq!(roomy.wait(WAIT), Some(RunOutcome::Stopped));
}

fn supervisor_with_memory(max_memory_bytes: usize) -> (ExecutionSupervisor, Arc<BufferSink>) {
    new_supervisor(RuntimeConfig {
        max_memory_bytes,
        ..RuntimeConfig::default()
    })
}

#[test]
fn test_missing_entry_point() {
    let registry = registry_with(&[("lib", NO_ENTRY)]);
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    assert_eq!(
        supervisor.start(&registry, 0),
        Err(RuntimeError::EntryPointNotFound("_start".to_string()))
    );
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

// =============================================================================
// Faults
// =============================================================================

#[test]
fn test_trap_is_recorded() {
    let registry = registry_with(&[("crash", UNREACHABLE)]);
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    supervisor.start(&registry, 0).unwrap();
    let outcome = supervisor.wait(WAIT).unwrap();
    assert!(matches!(outcome, RunOutcome::Faulted(RuntimeError::Trap(_))));
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert_eq!(supervisor.last_outcome(), Some(outcome));
}

#[test]
fn test_unresolved_import_loads_then_faults_on_call() {
    let registry = registry_with(&[("missing", CALLS_MISSING)]);
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    let report = supervisor.start(&registry, 0).unwrap();
    assert_eq!(report.link.unresolved, vec!["env::blink".to_string()]);

    assert_eq!(
        supervisor.wait(WAIT),
        Some(RunOutcome::Faulted(RuntimeError::UnresolvedImport {
            module: "env".to_string(),
            name: "blink".to_string(),
        }))
    );
}

#[test]
fn test_signature_mismatch_is_reported() {
    let registry = registry_with(&[("wrong", WRONG_DELAY)]);
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    let report = supervisor.start(&registry, 0).unwrap();
    assert_eq!(
        report.link.status("delay"),
        Some(&BindStatus::SignatureMismatch {
            imported: "v(I)".to_string()
        })
    );
    assert_eq!(report.link.linked(), 0);
    assert_eq!(report.link.unresolved, vec!["env::delay".to_string()]);
    assert!(matches!(
        supervisor.wait(WAIT),
        Some(RunOutcome::Faulted(RuntimeError::UnresolvedImport { .. }))
    ));
}

#[test]
fn test_non_function_import_is_mismatch() {
    let registry = registry_with(&[(
        "global",
        r#"(module
            (import "env" "millis" (global i32))
            (func (export "_start")))"#,
    )]);
    let (mut supervisor, _) = new_supervisor(RuntimeConfig::default());

    // Nothing provides the global, so the engine refuses to instantiate
    assert!(matches!(supervisor.start(&registry, 0), Err(RuntimeError::LoadError(_))));
    assert_eq!(supervisor.state(), SupervisorState::Idle);

    let engine = wasmtime::Engine::default();
    let mut linker = wasmtime::Linker::new(&engine);
    let wasm = wat::parse_str(r#"(module (import "env" "millis" (global i32)))"#).unwrap();
    let module = wasmtime::Module::new(&engine, &wasm).unwrap();
    let report = HostFunctionTable::standard().link(&mut linker, &engine, &module);
    assert_eq!(
        report.status("millis"),
        Some(&BindStatus::SignatureMismatch {
            imported: "non-function".to_string()
        })
    );
    assert!(report.unresolved.is_empty());
}

#[test]
fn test_print_out_of_bounds_faults() {
    let registry = registry_with(&[("oob", PRINT_OOB)]);
    let (mut supervisor, sink) = new_supervisor(RuntimeConfig::default());

    supervisor.start(&registry, 0).unwrap();
    match supervisor.wait(WAIT) {
        Some(RunOutcome::Faulted(RuntimeError::Trap(reason))) => assert!(reason.contains("out of bounds")),
        other => panic!("expected trap, got {other:?}"),
    }
    assert!(sink.contents().is_empty());
}
