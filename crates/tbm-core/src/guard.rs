//! Record handles and RAII leases

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use tracing::warn;

use crate::manager::{Shared, TargetBufferManager};
use crate::record::TargetPayload;
use crate::target::{SeqId, TargetId, TargetStatus};
use crate::Result;

/// Non-owning reference to one record of a manager.
///
/// A handle outliving its record (or its manager) is stale; operations on it
/// fail instead of touching a recycled record with the same seqId.
#[derive(Clone)]
pub struct TargetBufferHandle {
    pub(crate) manager: Weak<Shared>,
    pub(crate) seq_id: SeqId,
    pub(crate) record_id: u64,
}

impl TargetBufferHandle {
    pub(crate) fn new(manager: &Arc<Shared>, seq_id: SeqId, record_id: u64) -> Self {
        Self {
            manager: Arc::downgrade(manager),
            seq_id,
            record_id,
        }
    }

    pub fn seq_id(&self) -> SeqId {
        self.seq_id
    }

    /// Owning manager, `None` once it has been dropped
    pub fn manager(&self) -> Option<TargetBufferManager> {
        self.manager.upgrade().map(TargetBufferManager::from_shared)
    }

    /// Payload of `target_id`, `None` if stale or not populated
    pub fn target(&self, target_id: TargetId) -> Option<TargetPayload> {
        self.manager()?.get_target(self, target_id)
    }

    /// Aggregate record status; stale handles report `Error`
    pub fn status(&self) -> TargetStatus {
        match self.manager() {
            Some(tbm) => tbm.target_buffer_status(self),
            None => TargetStatus::Error,
        }
    }
}

impl PartialEq for TargetBufferHandle {
    fn eq(&self, other: &Self) -> bool {
        self.record_id == other.record_id && Weak::ptr_eq(&self.manager, &other.manager)
    }
}

impl Eq for TargetBufferHandle {}

impl fmt::Debug for TargetBufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetBufferHandle")
            .field("seq_id", &self.seq_id)
            .field("record_id", &self.record_id)
            .finish()
    }
}

/// Counted reference on a record; dropping it releases the reference
pub struct TargetBufferLease {
    handle: TargetBufferHandle,
    /// Whether this lease still owns the release responsibility
    should_release: bool,
}

impl TargetBufferLease {
    /// Wrap a reference the manager already counted
    pub(crate) fn new(handle: TargetBufferHandle) -> Self {
        Self {
            handle,
            should_release: true,
        }
    }

    /// Adopt a reference previously detached with [`forget`](Self::forget)
    pub fn from_forgotten(handle: TargetBufferHandle) -> Self {
        Self::new(handle)
    }

    pub fn handle(&self) -> &TargetBufferHandle {
        &self.handle
    }

    /// Release the reference now, reporting any error
    pub fn release(mut self) -> Result<()> {
        self.should_release = false;
        match self.handle.manager() {
            Some(tbm) => tbm.release_target_buffer(&self.handle),
            None => Ok(()),
        }
    }

    /// Keep the reference counted but stop tracking it here.
    /// Used when the reference is handed to another owner.
    pub fn forget(mut self) -> TargetBufferHandle {
        self.should_release = false;
        self.handle.clone()
    }
}

impl Deref for TargetBufferLease {
    type Target = TargetBufferHandle;

    fn deref(&self) -> &TargetBufferHandle {
        &self.handle
    }
}

impl fmt::Debug for TargetBufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TargetBufferLease").field(&self.handle).finish()
    }
}

impl Drop for TargetBufferLease {
    fn drop(&mut self) {
        if !self.should_release {
            return;
        }
        if let Some(tbm) = self.handle.manager() {
            if let Err(e) = tbm.release_target_buffer(&self.handle) {
                warn!(tbm = %tbm.name(), seq_id = self.handle.seq_id, error = %e, "lease release failed");
            }
        }
    }
}
