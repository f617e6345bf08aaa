//! Operator facade
//!
//! Ties the registry, fetcher and supervisor together behind the verbs a
//! console or menu needs. Every verb returns a structured result; nothing
//! here prints.
//!
//! The controller also enforces the cross-component rule that the running
//! module's slot cannot be removed or re-downloaded.

use crate::config::Config;
use crate::fetch::{FetchError, FetchProgress, HttpTransport, ModuleFetcher, NetworkLink, Transport};
use crate::persist::{self, JsonFileStore, KeyValueStore, LoadReport, PersistError};
use crate::registry::{ModuleRegistry, ModuleSummary, RegistryError};
use crate::runtime::{
    ExecutionSupervisor, HostFunctionTable, OutputSink, RunOutcome, RuntimeError, StartReport, StopOutcome,
    SupervisorState,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("no persistent store configured")]
    NoStore,
}

pub type ControlResult<T> = Result<T, ControlError>;

/// Point-in-time view for a status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub registered: usize,
    pub capacity: usize,
    pub state: SupervisorState,
    pub active: Option<String>,
    pub last_outcome: Option<RunOutcome>,
}

pub struct Controller<T: Transport> {
    registry: ModuleRegistry,
    fetcher: ModuleFetcher<T>,
    supervisor: ExecutionSupervisor,
    store: Option<Box<dyn KeyValueStore>>,
    autosave: bool,
    fetch_timeout: Duration,
}

impl Controller<HttpTransport> {
    /// Build an HTTP-backed controller from `config`.
    ///
    /// Opens the configured store, if any, and restores the saved registry
    /// from it.
    pub fn boot(config: &Config, link: NetworkLink, output: Arc<dyn OutputSink>) -> ControlResult<(Self, Option<LoadReport>)> {
        let transport = HttpTransport::new(link).with_chunk_size(config.fetch.chunk_size);
        let mut controller = Self::new(config, transport, HostFunctionTable::standard(), output);

        let Some(path) = &config.store_path else {
            return Ok((controller, None));
        };
        controller.store = Some(Box::new(JsonFileStore::open(path)?));
        let report = controller.load()?;
        info!(restored = report.restored, skipped = report.skipped, "registry restored");
        Ok((controller, Some(report)))
    }
}

impl<T: Transport> Controller<T> {
    pub fn new(config: &Config, transport: T, host: HostFunctionTable, output: Arc<dyn OutputSink>) -> Self {
        Self {
            registry: ModuleRegistry::new(config.registry.capacity),
            fetcher: ModuleFetcher::new(transport, config.fetch.clone()),
            supervisor: ExecutionSupervisor::new(config.runtime.clone(), Arc::new(host), output),
            store: None,
            autosave: config.autosave,
            fetch_timeout: config.fetch.timeout(),
        }
    }

    /// Attach a store. Autosave only applies when one is attached.
    pub fn with_store(mut self, store: Box<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &ExecutionSupervisor {
        &self.supervisor
    }

    pub fn transport(&self) -> &T {
        self.fetcher.transport()
    }

    pub fn add(&mut self, name: &str, source_uri: &str) -> ControlResult<usize> {
        let index = self.registry.add(name, source_uri)?;
        info!(index, name, "module registered");
        self.autosave();
        Ok(index)
    }

    pub fn remove(&mut self, index: usize) -> ControlResult<()> {
        self.ensure_idle_slot(index)?;
        self.registry.remove(index)?;
        info!(index, "module removed");
        self.autosave();
        Ok(())
    }

    /// Download a module using the configured timeout
    pub fn download(&mut self, index: usize) -> ControlResult<usize> {
        self.download_with_progress(index, &mut |_: FetchProgress| {})
    }

    pub fn download_with_progress(
        &mut self,
        index: usize,
        progress: &mut dyn FnMut(FetchProgress),
    ) -> ControlResult<usize> {
        self.ensure_idle_slot(index)?;
        let timeout = self.fetch_timeout;
        Ok(self.fetcher.fetch(&mut self.registry, index, timeout, progress)?)
    }

    pub fn start(&mut self, index: usize) -> ControlResult<StartReport> {
        Ok(self.supervisor.start(&self.registry, index)?)
    }

    pub fn stop(&mut self) -> StopOutcome {
        self.supervisor.stop()
    }

    /// Wait for the running module to end on its own
    pub fn wait(&mut self, timeout: Duration) -> Option<RunOutcome> {
        self.supervisor.wait(timeout)
    }

    pub fn list(&self) -> Vec<ModuleSummary> {
        self.registry.list()
    }

    /// Stop whatever is running, then empty the registry
    pub fn clear_all(&mut self) {
        self.supervisor.stop();
        self.registry.clear_all();
        info!("registry cleared");
        self.autosave();
    }

    pub fn save(&mut self) -> ControlResult<usize> {
        let store = self.store.as_deref_mut().ok_or(ControlError::NoStore)?;
        Ok(persist::save_registry(&self.registry, store)?)
    }

    /// Merge saved modules into the registry
    pub fn load(&mut self) -> ControlResult<LoadReport> {
        let store = self.store.as_deref().ok_or(ControlError::NoStore)?;
        Ok(persist::load_registry(&mut self.registry, store)?)
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            registered: self.registry.count(),
            capacity: self.registry.capacity(),
            state: self.supervisor.state(),
            active: self.supervisor.active_name().map(str::to_string),
            last_outcome: self.supervisor.last_outcome(),
        }
    }

    fn ensure_idle_slot(&self, index: usize) -> ControlResult<()> {
        if self.supervisor.active_slot() == Some(index) {
            return Err(RegistryError::ModuleBusy(index).into());
        }
        Ok(())
    }

    fn autosave(&mut self) {
        if !self.autosave || self.store.is_none() {
            return;
        }
        if let Err(e) = self.save() {
            warn!(error = %e, "autosave failed");
        }
    }
}
