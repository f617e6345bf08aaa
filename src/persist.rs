//! Registry persistence
//!
//! Saves the list of registered modules (name and source URI, never
//! bytecode) to a key-value store and restores it on boot.
//!
//! Layout:
//!
//! ```text
//! count = "2"
//! mod0  = "blink|http://10.0.0.2:8000/blink.wasm"
//! mod1  = "hello|http://10.0.0.2:8000/hello.wasm"
//! ```
//!
//! Restored modules come back unloaded and keep their slot order, but not
//! necessarily their slot numbers. Entries that don't parse or that the
//! registry rejects are skipped.

use crate::registry::{ModuleRegistry, NAME_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const COUNT_KEY: &str = "count";
const ENTRY_PREFIX: &str = "mod";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// String key-value storage
pub trait KeyValueStore {
    fn get(&self, key: &str) -> PersistResult<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> PersistResult<()>;
    fn remove(&mut self, key: &str) -> PersistResult<()>;
}

/// Volatile store, mostly for tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> PersistResult<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> PersistResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> PersistResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    entries: BTreeMap<String, String>,
}

/// Store backed by a single JSON file.
///
/// Every write rewrites the whole file through a temporary sibling and a
/// rename, so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    snapshot: Snapshot,
}

impl JsonFileStore {
    /// Open `path`, starting empty if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> PersistResult<Self> {
        let path = path.into();
        let snapshot = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Snapshot::default(),
            Err(source) => return Err(PersistError::Io { path, source }),
        };
        debug!(path = %path.display(), entries = snapshot.entries.len(), "store opened");
        Ok(Self { path, snapshot })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> PersistResult<()> {
        let io_err = |source| PersistError::Io {
            path: self.path.clone(),
            source,
        };
        let data = serde_json::to_vec_pretty(&self.snapshot)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> PersistResult<Option<String>> {
        Ok(self.snapshot.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> PersistResult<()> {
        self.snapshot.entries.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn remove(&mut self, key: &str) -> PersistResult<()> {
        if self.snapshot.entries.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

fn entry_key(n: usize) -> String {
    format!("{ENTRY_PREFIX}{n}")
}

/// What [`load_registry`] did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub restored: usize,
    pub skipped: usize,
}

/// Write every registered module to `store`
pub fn save_registry(registry: &ModuleRegistry, store: &mut dyn KeyValueStore) -> PersistResult<usize> {
    let previous = read_count(store)?;

    let mut written = 0;
    for (_, descriptor) in registry.iter() {
        let value = format!("{}{NAME_SEPARATOR}{}", descriptor.name(), descriptor.source_uri());
        store.set(&entry_key(written), &value)?;
        written += 1;
    }
    for stale in written..previous {
        store.remove(&entry_key(stale))?;
    }
    store.set(COUNT_KEY, &written.to_string())?;

    debug!(written, "registry saved");
    Ok(written)
}

/// Re-register every saved module into `registry`
pub fn load_registry(registry: &mut ModuleRegistry, store: &dyn KeyValueStore) -> PersistResult<LoadReport> {
    let mut report = LoadReport::default();

    for n in 0..read_count(store)? {
        let Some(value) = store.get(&entry_key(n))? else {
            report.skipped += 1;
            continue;
        };
        let Some((name, uri)) = value.split_once(NAME_SEPARATOR) else {
            warn!(entry = n, %value, "malformed entry skipped");
            report.skipped += 1;
            continue;
        };
        match registry.add(name, uri) {
            Ok(_) => report.restored += 1,
            Err(e) => {
                warn!(entry = n, error = %e, "entry not restored");
                report.skipped += 1;
            }
        }
    }

    debug!(restored = report.restored, skipped = report.skipped, "registry loaded");
    Ok(report)
}

fn read_count(store: &dyn KeyValueStore) -> PersistResult<usize> {
    Ok(store
        .get(COUNT_KEY)?
        .and_then(|count| count.trim().parse().ok())
        .unwrap_or(0))
}
