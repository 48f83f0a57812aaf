//! Metadata pool management

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::meta::{Metadata, MetadataHandle};
use crate::target::{SeqId, TargetId};
use crate::{Error, Result};

/// Default metadata pool capacity
pub const DEFAULT_CAPACITY: usize = 64;

/// Source of metadata objects for metadata targets.
///
/// Implementations must be thread-safe.
pub trait MetadataManager: Send + Sync {
    /// Get a metadata object for `client_id` at `seq_id`, `None` if exhausted
    fn get(&self, client_id: TargetId, seq_id: SeqId) -> Option<MetadataHandle>;

    /// Return a metadata object obtained from `get`
    fn release(&self, metadata: &MetadataHandle) -> Result<()>;
}

struct PoolState {
    free: Vec<MetadataHandle>,
    in_use: HashSet<u32>,
    next_slot: u32,
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed-capacity pool of recycled metadata objects
pub struct MetadataPool {
    id: u64,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl MetadataPool {
    /// Create a new pool
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new pool with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                in_use: HashSet::new(),
                next_slot: 0,
            }),
        }
    }

    /// Get capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Objects currently handed out
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use.len()
    }
}

impl Default for MetadataPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataManager for MetadataPool {
    fn get(&self, client_id: TargetId, seq_id: SeqId) -> Option<MetadataHandle> {
        let mut state = self.state.lock();

        let handle = match state.free.pop() {
            Some(handle) => handle,
            None if (state.next_slot as usize) < self.capacity => {
                let slot = state.next_slot;
                state.next_slot += 1;
                MetadataHandle::new(Metadata::new(slot, self.id))
            }
            None => {
                warn!(capacity = self.capacity, client_id, seq_id, "metadata pool full");
                return None;
            }
        };

        handle.reset(client_id, seq_id);
        state.in_use.insert(handle.slot());
        debug!(slot = handle.slot(), client_id, seq_id, "metadata acquired");
        Some(handle)
    }

    fn release(&self, metadata: &MetadataHandle) -> Result<()> {
        if metadata.pool_id() != self.id {
            return Err(Error::InvalidArg(format!(
                "metadata slot {} does not belong to this pool",
                metadata.slot()
            )));
        }

        let mut state = self.state.lock();
        if !state.in_use.remove(&metadata.slot()) {
            return Err(Error::Failed(format!(
                "metadata slot {} released twice",
                metadata.slot()
            )));
        }
        state.free.push(metadata.clone());
        Ok(())
    }
}
