//! Release/acquire fences for buffer targets

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::{Error, Result};

/// Opaque fence handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(u64);

impl FenceHandle {
    /// Wrap a fence id handed over by the framework
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Who owns the underlying fence object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceType {
    /// Created by this process through a [`FenceService`]
    Internal,
    /// Supplied by the framework, never released here
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    Success,
    Failed,
    /// Unknown or already released fence
    Invalid,
}

impl FenceStatus {
    pub const fn is_signaled(&self) -> bool {
        matches!(self, FenceStatus::Success | FenceStatus::Failed)
    }
}

/// Fence attached to one stream buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceInfo {
    pub handle: FenceHandle,
    pub kind: FenceType,
}

impl FenceInfo {
    pub fn internal(handle: FenceHandle) -> Self {
        Self {
            handle,
            kind: FenceType::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FenceCreateParams<'a> {
    pub kind: FenceType,
    /// Debug name, e.g. `"{manager}_{seq_id}_{target}"`
    pub name: &'a str,
}

/// Fence primitives the target buffer manager relies on
pub trait FenceService: Send + Sync {
    fn create_fence(&self, params: &FenceCreateParams<'_>) -> Result<FenceHandle>;

    fn fence_status(&self, fence: FenceHandle) -> FenceStatus;

    /// Signal with a terminal status (`Success` or `Failed`)
    fn signal_fence(&self, fence: FenceHandle, status: FenceStatus) -> Result<()>;

    fn release_fence(&self, fence: FenceHandle) -> Result<()>;

    /// Block until the fence is signaled or `timeout` elapses, returning the
    /// status observed last
    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<FenceStatus>;
}

/// In-process fence service
pub struct LocalFenceService {
    next_id: AtomicU64,
    fences: Mutex<HashMap<u64, FenceStatus>>,
    signaled: Condvar,
}

impl LocalFenceService {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            fences: Mutex::new(HashMap::new()),
            signaled: Condvar::new(),
        }
    }

    /// Fences created and not yet released
    pub fn live_count(&self) -> usize {
        self.fences.lock().len()
    }
}

impl Default for LocalFenceService {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceService for LocalFenceService {
    fn create_fence(&self, params: &FenceCreateParams<'_>) -> Result<FenceHandle> {
        if params.kind != FenceType::Internal {
            return Err(Error::Fence(format!(
                "{}: only internal fences can be created",
                params.name
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.fences.lock().insert(id, FenceStatus::Pending);
        trace!(fence = id, name = params.name, "fence created");
        Ok(FenceHandle(id))
    }

    fn fence_status(&self, fence: FenceHandle) -> FenceStatus {
        self.fences
            .lock()
            .get(&fence.0)
            .copied()
            .unwrap_or(FenceStatus::Invalid)
    }

    fn signal_fence(&self, fence: FenceHandle, status: FenceStatus) -> Result<()> {
        if !status.is_signaled() {
            return Err(Error::Fence(format!(
                "fence {} cannot be signaled with {:?}",
                fence.0, status
            )));
        }
        let mut fences = self.fences.lock();
        let slot = fences
            .get_mut(&fence.0)
            .ok_or_else(|| Error::Fence(format!("unknown fence {}", fence.0)))?;
        *slot = status;
        self.signaled.notify_all();
        Ok(())
    }

    fn release_fence(&self, fence: FenceHandle) -> Result<()> {
        let mut fences = self.fences.lock();
        if fences.remove(&fence.0).is_none() {
            return Err(Error::Fence(format!("unknown fence {}", fence.0)));
        }
        // Waiters on a released fence observe Invalid
        self.signaled.notify_all();
        Ok(())
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<FenceStatus> {
        let deadline = Instant::now() + timeout;
        let mut fences = self.fences.lock();
        loop {
            let status = fences
                .get(&fence.0)
                .copied()
                .unwrap_or(FenceStatus::Invalid);
            if status != FenceStatus::Pending {
                return Ok(status);
            }
            if self.signaled.wait_until(&mut fences, deadline).timed_out() {
                return Ok(fences
                    .get(&fence.0)
                    .copied()
                    .unwrap_or(FenceStatus::Invalid));
            }
        }
    }
}
