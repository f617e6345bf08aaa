//! Execution supervisor
//!
//! Owns at most one execution unit. A unit is a dedicated thread running one
//! module instance to completion in its own store.

use super::abi::ENTRY_POINT;
use super::error::{HostTrap, RunOutcome, RuntimeError, RuntimeResult};
use super::host::{CancelToken, HostContext, HostFunctionTable, LinkReport, OutputSink};
use super::parser::ModuleInfo;
use crate::config::RuntimeConfig;
use crate::registry::ModuleRegistry;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use wasmtime::{Engine, Linker, Module, Store, StoreLimitsBuilder, TypedFunc};

/// What the supervisor is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    /// Parsing, loading and linking. Never observed once `start` returns.
    Starting { slot: usize },
    Running { slot: usize },
}

impl SupervisorState {
    pub fn slot(&self) -> Option<usize> {
        match *self {
            Self::Idle => None,
            Self::Starting { slot } | Self::Running { slot } => Some(slot),
        }
    }
}

/// Result of [`ExecutionSupervisor::stop`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NothingRunning,
    /// Unit ended and its thread was joined
    Finished { slot: usize, outcome: RunOutcome },
    /// Unit ignored cancellation past the grace period and was abandoned
    Detached { slot: usize },
}

/// Returned by a successful start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub slot: usize,
    pub link: LinkReport,
}

struct Shared {
    generation: u64,
    state: SupervisorState,
    last_outcome: Option<RunOutcome>,
}

struct ActiveUnit {
    slot: usize,
    name: String,
    cancel: CancelToken,
    engine: Engine,
    done: Receiver<RunOutcome>,
    handle: JoinHandle<()>,
}

/// A module instance ready to enter
struct Prepared {
    engine: Engine,
    store: Store<HostContext>,
    entry: TypedFunc<(), ()>,
    cancel: CancelToken,
    link: LinkReport,
}

pub struct ExecutionSupervisor {
    config: RuntimeConfig,
    host: Arc<HostFunctionTable>,
    output: Arc<dyn OutputSink>,
    shared: Arc<Mutex<Shared>>,
    active: Option<ActiveUnit>,
}

impl ExecutionSupervisor {
    pub fn new(config: RuntimeConfig, host: Arc<HostFunctionTable>, output: Arc<dyn OutputSink>) -> Self {
        Self {
            config,
            host,
            output,
            shared: Arc::new(Mutex::new(Shared {
                generation: 0,
                state: SupervisorState::Idle,
                last_outcome: None,
            })),
            active: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn host_functions(&self) -> &HostFunctionTable {
        &self.host
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SupervisorState {
        self.shared().state
    }

    /// Slot of the running module, if any
    pub fn active_slot(&self) -> Option<usize> {
        self.state().slot()
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active_slot()?;
        self.active.as_ref().map(|unit| unit.name.as_str())
    }

    /// How the most recent unit ended
    pub fn last_outcome(&self) -> Option<RunOutcome> {
        self.shared().last_outcome.clone()
    }

    /// Start the module in `index`, stopping whatever is running first.
    ///
    /// On error the supervisor is Idle.
    #[instrument(skip(self, registry), fields(slot = index))]
    pub fn start(&mut self, registry: &ModuleRegistry, index: usize) -> RuntimeResult<StartReport> {
        self.stop();

        let descriptor = registry.get(index).ok_or(RuntimeError::InvalidModule(index))?;
        let bytecode = descriptor.bytecode().ok_or(RuntimeError::InvalidModule(index))?;
        let name = descriptor.name().to_string();

        let generation = {
            let mut shared = self.shared();
            shared.generation += 1;
            shared.state = SupervisorState::Starting { slot: index };
            shared.generation
        };

        let prepared = match self.prepare(&name, bytecode) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(module = %name, error = %e, "start failed");
                self.shared().state = SupervisorState::Idle;
                return Err(e);
            }
        };

        let Prepared {
            engine,
            mut store,
            entry,
            cancel,
            link,
        } = prepared;

        // Running before the thread exists so a fast finisher cannot be overwritten
        self.shared().state = SupervisorState::Running { slot: index };

        let (done_tx, done_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let unit_cancel = cancel.clone();
        let unit_name = name.clone();

        let spawned = thread::Builder::new()
            .name(format!("unit-{name}"))
            .stack_size(self.config.unit_stack_size)
            .spawn(move || {
                debug!(module = %unit_name, "entering {}", ENTRY_POINT);
                let result = entry.call(&mut store, ());
                let outcome = classify(result, &unit_cancel);
                // Instance memory is released before anyone hears about the outcome
                drop(store);

                match &outcome {
                    RunOutcome::Faulted(e) => warn!(module = %unit_name, error = %e, "module faulted"),
                    other => info!(module = %unit_name, outcome = ?other, "module ended"),
                }

                {
                    let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
                    if shared.generation == generation {
                        shared.state = SupervisorState::Idle;
                        shared.last_outcome = Some(outcome.clone());
                    }
                }
                let _ = done_tx.send(outcome);
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared().state = SupervisorState::Idle;
                return Err(RuntimeError::Spawn(e.to_string()));
            }
        };

        info!(module = %name, linked = link.linked(), unresolved = link.unresolved.len(), "module started");

        self.active = Some(ActiveUnit {
            slot: index,
            name,
            cancel,
            engine,
            done: done_rx,
            handle,
        });

        Ok(StartReport { slot: index, link })
    }

    fn prepare(&self, name: &str, bytecode: &[u8]) -> RuntimeResult<Prepared> {
        let info = ModuleInfo::parse(bytecode)?;
        debug!(module = %name, sections = info.sections.len(), "module framing ok");

        let mut engine_config = wasmtime::Config::new();
        engine_config
            .epoch_interruption(true)
            .max_wasm_stack(self.config.stack_budget);
        let engine = Engine::new(&engine_config).map_err(|e| RuntimeError::Engine(e.to_string()))?;

        let module = Module::new(&engine, bytecode).map_err(|e| RuntimeError::LoadError(format!("{e:#}")))?;

        let cancel = CancelToken::new();
        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.max_memory_bytes)
            .instances(1)
            .build();
        let context = HostContext::new(name, cancel.clone(), Arc::clone(&self.output), limits);

        let mut store = Store::new(&engine, context);
        store.limiter(|ctx| &mut ctx.limits);
        store.set_epoch_deadline(1);
        store.epoch_deadline_trap();

        let mut linker = Linker::new(&engine);
        let link = self.host.link(&mut linker, &engine, &module);

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| RuntimeError::LoadError(format!("{e:#}")))?;

        let entry = instance
            .get_typed_func::<(), ()>(&mut store, ENTRY_POINT)
            .map_err(|_| RuntimeError::EntryPointNotFound(ENTRY_POINT.to_string()))?;

        Ok(Prepared {
            engine,
            store,
            entry,
            cancel,
            link,
        })
    }

    /// Stop the running module and reclaim its unit.
    ///
    /// Raises the cancel flag, interrupts guest code and waits up to the
    /// configured grace period. A unit still running after that is detached.
    /// A unit that already ended on its own is only joined, and the call
    /// reports [`StopOutcome::NothingRunning`].
    #[instrument(skip(self))]
    pub fn stop(&mut self) -> StopOutcome {
        let Some(unit) = self.active.take() else {
            return StopOutcome::NothingRunning;
        };

        // Idle with a unit on hand means it already recorded its outcome
        if self.state() == SupervisorState::Idle {
            let outcome = unit.done.recv_timeout(self.config.stop_grace()).ok();
            let _ = unit.handle.join();
            debug!(slot = unit.slot, outcome = ?outcome, "finished unit reaped");
            return StopOutcome::NothingRunning;
        }

        unit.cancel.cancel();
        unit.engine.increment_epoch();

        match unit.done.recv_timeout(self.config.stop_grace()) {
            Ok(outcome) => {
                let _ = unit.handle.join();
                debug!(slot = unit.slot, outcome = ?outcome, "unit reclaimed");
                StopOutcome::Finished {
                    slot: unit.slot,
                    outcome,
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                // The unit died without reporting
                let _ = unit.handle.join();
                let outcome = RunOutcome::Faulted(RuntimeError::Trap("execution unit panicked".to_string()));
                self.settle(Some(outcome.clone()));
                warn!(slot = unit.slot, "execution unit panicked");
                StopOutcome::Finished {
                    slot: unit.slot,
                    outcome,
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(slot = unit.slot, module = %unit.name, "unit ignored stop; detaching");
                self.settle(Some(RunOutcome::Cancelled));
                StopOutcome::Detached { slot: unit.slot }
            }
        }
    }

    /// Force Idle and orphan any late report from the current unit
    fn settle(&self, outcome: Option<RunOutcome>) {
        let mut shared = self.shared();
        shared.generation += 1;
        shared.state = SupervisorState::Idle;
        shared.last_outcome = outcome;
    }

    /// Wait for the running module to end on its own.
    ///
    /// Returns None if nothing is running or it is still running at the
    /// deadline.
    pub fn wait(&mut self, timeout: Duration) -> Option<RunOutcome> {
        let outcome = self.active.as_ref()?.done.recv_timeout(timeout).ok()?;
        if let Some(unit) = self.active.take() {
            let _ = unit.handle.join();
        }
        Some(outcome)
    }
}

impl Drop for ExecutionSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn classify(result: wasmtime::Result<()>, cancel: &CancelToken) -> RunOutcome {
    let err = match result {
        Ok(()) => return RunOutcome::Stopped,
        Err(err) => err,
    };

    if cancel.is_cancelled() {
        return RunOutcome::Cancelled;
    }

    if let Some(trap) = err.downcast_ref::<HostTrap>() {
        return match trap {
            HostTrap::Cancelled => RunOutcome::Cancelled,
            HostTrap::Unresolved { module, name } => RunOutcome::Faulted(RuntimeError::UnresolvedImport {
                module: module.clone(),
                name: name.clone(),
            }),
            other => RunOutcome::Faulted(RuntimeError::Trap(other.to_string())),
        };
    }

    let reason = match err.downcast_ref::<wasmtime::Trap>() {
        Some(trap) => trap.to_string(),
        None => err.root_cause().to_string(),
    };
    RunOutcome::Faulted(RuntimeError::Trap(reason))
}
