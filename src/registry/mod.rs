//! Module registry
//!
//! A fixed-capacity table of module descriptors. Each slot is either empty or
//! holds one descriptor: display name, source URI and, once downloaded, the
//! module's bytecode.
//!
//! # Ownership
//!
//! Bytecode lives in a [`Bytecode`] buffer owned by exactly one slot. It is
//! released when the slot is removed, when a new buffer is installed over it,
//! when a download is re-attempted, or when the registry is dropped. There is
//! no way to hand out a second owner.
//!
//! # Slot rules
//!
//! ```text
//! add     -> first empty slot, ascending index, loaded = false
//! install -> loaded = true, size = buffer length
//! unload  -> loaded = false, size = 0, metadata kept
//! remove  -> slot empty again, index reusable
//! ```
//!
//! The `(name, source_uri)` pair is unique among occupied slots.

mod error;

pub use error::*;

use std::fmt;
use std::ops::Deref;

/// Character separating name and URI in persisted entries
pub const NAME_SEPARATOR: char = '|';

/// Default number of registry slots
pub const DEFAULT_CAPACITY: usize = 8;

/// An owned bytecode buffer
///
/// Not `Clone`: a buffer has a single owner for its whole life.
#[derive(PartialEq, Eq)]
pub struct Bytecode(Box<[u8]>);

impl Bytecode {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes.into_boxed_slice())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Bytecode {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Bytecode {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytecode({} bytes)", self.0.len())
    }
}

/// One registered module
#[derive(Debug)]
pub struct ModuleDescriptor {
    name: String,
    source_uri: String,
    bytecode: Option<Bytecode>,
}

impl ModuleDescriptor {
    fn new(name: &str, source_uri: &str) -> Self {
        Self {
            name: name.to_string(),
            source_uri: source_uri.to_string(),
            bytecode: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    /// Installed bytecode, present iff the module is loaded
    pub fn bytecode(&self) -> Option<&Bytecode> {
        self.bytecode.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.bytecode.is_some()
    }

    /// Size of the installed bytecode, 0 when not loaded
    pub fn size(&self) -> usize {
        self.bytecode.as_ref().map_or(0, Bytecode::len)
    }

    fn matches(&self, name: &str, source_uri: &str) -> bool {
        self.name == name && self.source_uri == source_uri
    }
}

/// Row returned by [`ModuleRegistry::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSummary {
    pub index: usize,
    pub name: String,
    pub source_uri: String,
    pub loaded: bool,
    pub size: usize,
}

/// Fixed-capacity module table
#[derive(Debug)]
pub struct ModuleRegistry {
    slots: Vec<Option<ModuleDescriptor>>,
    /// Display counter, bumped on add and dropped on remove
    registered: usize,
}

impl ModuleRegistry {
    /// Create a registry with `capacity` empty slots
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            registered: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of registered modules
    pub fn count(&self) -> usize {
        self.registered
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Register a module in the first empty slot
    pub fn add(&mut self, name: &str, source_uri: &str) -> RegistryResult<usize> {
        if name.is_empty() || name.contains(NAME_SEPARATOR) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }

        if self.find(name, source_uri).is_some() {
            return Err(RegistryError::DuplicateModule {
                name: name.to_string(),
                source_uri: source_uri.to_string(),
            });
        }

        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::RegistryFull {
                capacity: self.capacity(),
            })?;

        self.slots[index] = Some(ModuleDescriptor::new(name, source_uri));
        self.registered += 1;
        Ok(index)
    }

    /// Empty a slot, releasing its bytecode
    pub fn remove(&mut self, index: usize) -> RegistryResult<()> {
        match self.slots.get_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.registered -= 1;
                Ok(())
            }
            _ => Err(RegistryError::InvalidIndex(index)),
        }
    }

    /// Install bytecode into an occupied slot, replacing any previous buffer
    pub fn install(&mut self, index: usize, bytecode: Bytecode) -> RegistryResult<()> {
        let descriptor = self.get_mut(index)?;
        // Old buffer is dropped before the new one takes its place
        descriptor.bytecode.take();
        descriptor.bytecode = Some(bytecode);
        Ok(())
    }

    /// Release a slot's bytecode but keep its metadata
    pub fn unload(&mut self, index: usize) -> RegistryResult<()> {
        self.get_mut(index)?.bytecode = None;
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&ModuleDescriptor> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, index: usize) -> RegistryResult<&mut ModuleDescriptor> {
        self.slots
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(RegistryError::InvalidIndex(index))
    }

    /// Find the slot holding an exact (name, source_uri) pair
    pub fn find(&self, name: &str, source_uri: &str) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|descriptor| descriptor.matches(name, source_uri))
        })
    }

    /// Occupied slots in ascending index order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ModuleDescriptor)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|descriptor| (index, descriptor)))
    }

    /// Display rows for every occupied slot
    pub fn list(&self) -> Vec<ModuleSummary> {
        self.iter()
            .map(|(index, descriptor)| ModuleSummary {
                index,
                name: descriptor.name.clone(),
                source_uri: descriptor.source_uri.clone(),
                loaded: descriptor.is_loaded(),
                size: descriptor.size(),
            })
            .collect()
    }

    /// Release every buffer and empty every slot
    pub fn clear_all(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.registered = 0;
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
