//! Process-wide registry of I/O priority classes.
//!
//! A priority class is a named, shares-weighted category of requests. The
//! registry maps small integer ids to `(name, shares)` and is shared by every
//! queue and shard in the process. Slots are claimed in order and never
//! released, so ids stay stable for the registry's lifetime.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{IoQueueError, IoQueueResult};

/// Maximum number of priority classes in a registry.
pub const MAX_PRIORITY_CLASSES: usize = 2048;

/// Identifier of a registered priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PriorityClassId(u32);

impl PriorityClassId {
    /// Raw slot index.
    #[inline]
    pub fn id(&self) -> u32 {
        self.0
    }

    #[inline]
    fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PriorityClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name and shares of a registered class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Display name, used for metrics labels.
    pub name: String,
    /// Weight at registration time. Queues may change it later per class handle.
    pub shares: u32,
}

/// Fixed-capacity table of priority classes.
pub struct PriorityClassRegistry {
    slots: Mutex<Vec<Option<RegistryEntry>>>,
}

impl PriorityClassRegistry {
    /// Creates a registry with [`MAX_PRIORITY_CLASSES`] slots.
    pub fn new() -> Self {
        Self::with_capacity(MAX_PRIORITY_CLASSES)
    }

    /// Creates a registry with `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    /// Registers `name` with `shares`, or returns the id it already has.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered with different shares.
    pub fn register(&self, name: impl Into<String>, shares: u32) -> IoQueueResult<PriorityClassId> {
        let name = name.into();
        if shares == 0 {
            return Err(IoQueueError::InvalidShares { name });
        }

        let mut slots = self.slots.lock();
        let capacity = slots.len();
        for (i, slot) in slots.iter_mut().enumerate() {
            match slot {
                None => {
                    info!("Registered I/O priority class {}: name={}, shares={}", i, name, shares);
                    *slot = Some(RegistryEntry { name, shares });
                    return Ok(PriorityClassId(i as u32));
                }
                Some(entry) if entry.name == name => {
                    // shares may change later through the class handle, but
                    // every registration of a name must agree on the initial value
                    assert_eq!(
                        entry.shares, shares,
                        "I/O priority class {} re-registered with {} shares, previously {}",
                        name, shares, entry.shares
                    );
                    return Ok(PriorityClassId(i as u32));
                }
                Some(_) => continue,
            }
        }

        Err(IoQueueError::ResourceExhausted { max: capacity })
    }

    /// Renames class `id` to `new_name`.
    ///
    /// Returns `Ok(false)` if the class already has that name.
    pub fn rename(&self, id: PriorityClassId, new_name: impl Into<String>) -> IoQueueResult<bool> {
        let new_name = new_name.into();
        let mut slots = self.slots.lock();

        for (i, slot) in slots.iter().enumerate() {
            let Some(entry) = slot else { break };
            if entry.name == new_name {
                if i == id.index() {
                    return Ok(false);
                }
                return Err(IoQueueError::NameCollision { name: new_name });
            }
        }

        match slots.get_mut(id.index()) {
            Some(Some(entry)) => {
                info!(
                    "Renamed I/O priority class {}: {} -> {}",
                    id, entry.name, new_name
                );
                entry.name = new_name;
                Ok(true)
            }
            _ => Err(IoQueueError::UnknownPriorityClass { id: id.id() }),
        }
    }

    /// Snapshot of the entry for `id`.
    pub fn get(&self, id: PriorityClassId) -> Option<RegistryEntry> {
        self.slots.lock().get(id.index()).cloned().flatten()
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.slots.lock().iter().take_while(|s| s.is_some()).count()
    }

    /// Returns true if no class is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Default for PriorityClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<PriorityClassRegistry>> = OnceLock::new();

/// The process-wide registry, created on first use.
pub fn global_registry() -> Arc<PriorityClassRegistry> {
    Arc::clone(GLOBAL_REGISTRY.get_or_init(|| Arc::new(PriorityClassRegistry::new())))
}

/// Registers a class in the process-wide registry.
pub fn register_one_priority_class(
    name: impl Into<String>,
    shares: u32,
) -> IoQueueResult<PriorityClassId> {
    global_registry().register(name, shares)
}

/// Renames a class in the process-wide registry.
pub fn rename_one_priority_class(
    id: PriorityClassId,
    new_name: impl Into<String>,
) -> IoQueueResult<bool> {
    global_registry().rename(id, new_name)
}
