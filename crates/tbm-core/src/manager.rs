//! Target buffer manager

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::config::TargetBufferManagerConfig;
use crate::fence::{FenceCreateParams, FenceInfo, FenceService, FenceStatus, FenceType, LocalFenceService};
use crate::guard::{TargetBufferHandle, TargetBufferLease};
use crate::meta_pool::MetadataManager;
use crate::pool::{BufferManager, BufferManagerFactory, PoolFactory};
use crate::record::{RecordState, StreamBuffer, TargetCallback, TargetPayload, TargetRecord};
use crate::registry::Registry;
use crate::target::{ListSelector, SeqId, TargetId, TargetKind, TargetStatus, MAX_TARGETS};
use crate::{Error, Result};

/// Record bound used when no target defines one
pub const DEFAULT_MAX_NODE: u32 = 32;

/// External services a manager draws payloads and fences from
#[derive(Clone)]
pub struct Collaborators {
    /// Required when metadata targets are configured
    pub metadata_manager: Option<Arc<dyn MetadataManager>>,
    pub buffer_factory: Arc<dyn BufferManagerFactory>,
    /// Used when fences are enabled; an in-process service is created if unset
    pub fence_service: Option<Arc<dyn FenceService>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            metadata_manager: None,
            buffer_factory: Arc::new(PoolFactory),
            fence_service: None,
        }
    }
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata_manager(mut self, manager: Arc<dyn MetadataManager>) -> Self {
        self.metadata_manager = Some(manager);
        self
    }

    pub fn with_buffer_factory(mut self, factory: Arc<dyn BufferManagerFactory>) -> Self {
        self.buffer_factory = factory;
        self
    }

    pub fn with_fence_service(mut self, service: Arc<dyn FenceService>) -> Self {
        self.fence_service = Some(service);
        self
    }
}

/// Record counts and bounds of one manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TbmStats {
    pub producer: usize,
    pub consumer: usize,
    pub import: usize,
    /// Setups currently populating their record
    pub in_flight: usize,
    pub min: u32,
    pub max: u32,
}

struct TargetSlot {
    id: TargetId,
    kind: TargetKind,
    /// Set for internal-buffer targets
    pool: Option<Arc<dyn BufferManager>>,
}

pub(crate) struct Shared {
    name: String,
    /// Target table, indices are stable for the manager's lifetime
    targets: Vec<TargetSlot>,
    metadata_manager: Option<Arc<dyn MetadataManager>>,
    /// Some iff fences are enabled
    fences: Option<Arc<dyn FenceService>>,
    min: u32,
    max: u32,
    wait_timeout: Duration,
    registry: Mutex<Registry>,
    /// Notified on every producer to consumer migration
    ready: Condvar,
}

/// Callback taken out of a record, fired once the lock is dropped
struct PendingCallback {
    callback: TargetCallback,
    handle: TargetBufferHandle,
}

impl PendingCallback {
    fn invoke(self) {
        (self.callback)(TargetBufferLease::new(self.handle));
    }
}

/// Manager of reference-counted multi-target records keyed by seqId.
///
/// Cloning is cheap and every clone refers to the same manager. All records
/// live in one registry guarded by one mutex; blocking consumers wait on one
/// condition variable.
///
/// A callback that captures a clone of its own manager keeps the manager
/// alive until the callback has fired or been removed.
#[derive(Clone)]
pub struct TargetBufferManager {
    shared: Arc<Shared>,
}

impl TargetBufferManager {
    /// Create a manager from `config`
    pub fn create(config: &TargetBufferManagerConfig, collaborators: Collaborators) -> Result<Self> {
        let name = config.name.as_str();
        if name.is_empty() {
            return Err(Error::InvalidArg("empty manager name".to_string()));
        }
        let num_targets = config.num_targets();
        if num_targets == 0 || num_targets > MAX_TARGETS {
            error!(tbm = %name, num_targets, "invalid number of targets");
            return Err(Error::InvalidArg(format!(
                "[{}] {} targets, expected 1..={}",
                name, num_targets, MAX_TARGETS
            )));
        }
        if !config.metadata_ids.is_empty() && collaborators.metadata_manager.is_none() {
            return Err(Error::InvalidArg(format!(
                "[{}] metadata targets need a metadata manager",
                name
            )));
        }

        let mut targets = Vec::with_capacity(num_targets);
        if let Err(e) = Self::build_targets(config, &collaborators, &mut targets) {
            for slot in &targets {
                if let Some(pool) = &slot.pool {
                    pool.destroy();
                }
            }
            return Err(e);
        }

        let (min, max) = Self::bounds(config, &targets);
        let fences = if config.fence_enabled {
            Some(
                collaborators
                    .fence_service
                    .unwrap_or_else(|| Arc::new(LocalFenceService::new())),
            )
        } else {
            None
        };

        info!(
            tbm = %name,
            num_targets,
            min,
            max,
            fences = fences.is_some(),
            "target buffer manager created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                targets,
                metadata_manager: collaborators.metadata_manager,
                fences,
                min,
                max,
                wait_timeout: Duration::from_millis(config.wait_timeout_ms),
                registry: Mutex::new(Registry::new()),
                ready: Condvar::new(),
            }),
        })
    }

    fn build_targets(
        config: &TargetBufferManagerConfig,
        collaborators: &Collaborators,
        targets: &mut Vec<TargetSlot>,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        let mut check = |id: TargetId| {
            if seen.insert(id) {
                Ok(())
            } else {
                error!(tbm = %config.name, target = id, "duplicate target id");
                Err(Error::InvalidArg(format!(
                    "[{}] duplicate target id {}",
                    config.name, id
                )))
            }
        };

        for &id in &config.metadata_ids {
            check(id)?;
            targets.push(TargetSlot {
                id,
                kind: TargetKind::Metadata,
                pool: None,
            });
        }

        let mut shared_max = None;
        for stream in &config.internal_streams {
            check(stream.id)?;
            let pool = collaborators
                .buffer_factory
                .create(&stream.buffer_manager_name, &stream.create_data)
                .map_err(|e| {
                    Error::Resource(format!(
                        "[{}] buffer manager {}: {}",
                        config.name, stream.buffer_manager_name, e
                    ))
                })?;
            let max = pool.max_buffer_count();
            targets.push(TargetSlot {
                id: stream.id,
                kind: TargetKind::InternalBuffer,
                pool: Some(pool),
            });
            match shared_max {
                Some(expected) if expected != max => {
                    error!(tbm = %config.name, expected, max, "max buffer count mismatch");
                    return Err(Error::InvalidArg(format!(
                        "[{}] buffer manager {} max {} != {}",
                        config.name, stream.buffer_manager_name, max, expected
                    )));
                }
                _ => shared_max = Some(max),
            }
        }

        for &id in &config.external_stream_ids {
            check(id)?;
            targets.push(TargetSlot {
                id,
                kind: TargetKind::ExternalBuffer,
                pool: None,
            });
        }
        Ok(())
    }

    fn bounds(config: &TargetBufferManagerConfig, targets: &[TargetSlot]) -> (u32, u32) {
        let mut min = 0;
        let mut max = 0;

        if !config.metadata_ids.is_empty() {
            min = config.min_meta_buffer_count;
        }
        if let Some(pool) = targets.iter().find_map(|t| t.pool.as_ref()) {
            min = pool.min_buffer_count();
            max = pool.max_buffer_count();
        } else if !config.external_stream_ids.is_empty() {
            max = config.max_external_buffer_count;
            min = match config.min_external_buffer_count {
                0 => max,
                n => n,
            };
        }

        if max == 0 {
            if min == 0 {
                min = DEFAULT_MAX_NODE;
            }
            max = DEFAULT_MAX_NODE;
        }
        if min > max {
            max = min;
        }
        (min, max)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Manager owning `handle`, `None` once it has been dropped
    pub fn from_handle(handle: &TargetBufferHandle) -> Option<Self> {
        handle.manager()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether both values refer to the same manager
    pub fn same_manager(&self, other: &TargetBufferManager) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn min_buffer_count(&self) -> u32 {
        self.shared.min
    }

    pub fn max_buffer_count(&self) -> u32 {
        self.shared.max
    }

    pub fn num_targets(&self) -> usize {
        self.shared.targets.len()
    }

    /// Configured target ids in index order
    pub fn target_ids(&self) -> Vec<TargetId> {
        self.shared.targets.iter().map(|t| t.id).collect()
    }

    pub fn target_kind(&self, target_id: TargetId) -> Option<TargetKind> {
        self.target_index(target_id)
            .map(|idx| self.shared.targets[idx].kind)
    }

    /// Fence service in use, `None` when fences are disabled
    pub fn fence_service(&self) -> Option<Arc<dyn FenceService>> {
        self.shared.fences.clone()
    }

    /// Buffer manager backing an internal-buffer target
    pub fn buffer_manager(&self, target_id: TargetId) -> Option<Arc<dyn BufferManager>> {
        let idx = self.target_index(target_id)?;
        self.shared.targets[idx].pool.clone()
    }

    pub fn stats(&self) -> TbmStats {
        let reg = self.shared.registry.lock();
        TbmStats {
            producer: reg.count(RecordState::Producing),
            consumer: reg.count(RecordState::Consuming),
            import: reg.count(RecordState::Importing),
            in_flight: reg.in_flight_count(),
            min: self.shared.min,
            max: self.shared.max,
        }
    }

    fn target_index(&self, target_id: TargetId) -> Option<usize> {
        self.shared.targets.iter().position(|t| t.id == target_id)
    }

    fn handle(&self, seq_id: SeqId, record_id: u64) -> TargetBufferHandle {
        TargetBufferHandle::new(&self.shared, seq_id, record_id)
    }

    fn owns(&self, handle: &TargetBufferHandle) -> bool {
        std::ptr::eq(handle.manager.as_ptr(), Arc::as_ptr(&self.shared))
    }

    /// Reserve a record for `seq_id` and populate every target.
    ///
    /// `seq_id` must exceed every seqId set up before. The returned handle
    /// carries the setup reference, which is dropped when the record becomes
    /// ready.
    pub fn setup_target_buffer(&self, seq_id: SeqId) -> Result<TargetBufferHandle> {
        let shared = &self.shared;

        let mut record = {
            let mut reg = shared.registry.lock();

            if let Some(floor) = reg.setup_floor() {
                if seq_id <= floor {
                    error!(tbm = %shared.name, seq_id, last = floor, "setup out of order");
                    return Err(Error::Failed(format!(
                        "[{}] setup seqId {} is not after {}",
                        shared.name, seq_id, floor
                    )));
                }
            }

            shared.recycle(&mut reg);

            let live = reg.live_count() + reg.in_flight_count();
            if live >= shared.max as usize {
                error!(
                    tbm = %shared.name,
                    seq_id,
                    producer = reg.count(RecordState::Producing),
                    consumer = reg.count(RecordState::Consuming),
                    max = shared.max,
                    "max number of records reached"
                );
                return Err(Error::NoMore {
                    live,
                    max: shared.max,
                });
            }

            let imported = if reg.get(seq_id, ListSelector::Import).is_some() {
                reg.remove(seq_id)
            } else {
                None
            };
            let record = match imported {
                Some(mut record) => {
                    record.state = RecordState::Producing;
                    record.ref_count = 1;
                    record
                }
                None => {
                    let record_id = reg.next_record_id();
                    TargetRecord::new(
                        seq_id,
                        record_id,
                        shared.targets.len(),
                        RecordState::Producing,
                    )
                }
            };
            reg.begin_setup(seq_id);
            record
        };

        // Pools may block while exhausted, so the record is populated unlocked
        let populated = self.populate(&mut record);

        let mut reg = shared.registry.lock();
        match populated {
            Ok(()) => {
                reg.end_setup(seq_id, true);
                let handle = self.handle(seq_id, record.record_id);
                debug!(
                    tbm = %shared.name,
                    seq_id,
                    imported = record.is_imported,
                    "target buffer set up"
                );
                reg.insert(record);
                Ok(handle)
            }
            Err(e) => {
                reg.end_setup(seq_id, false);
                drop(reg);
                error!(tbm = %shared.name, seq_id, error = %e, "setup failed, rolling back");
                shared.dispose(record);
                Err(e)
            }
        }
    }

    fn populate(&self, record: &mut TargetRecord) -> Result<()> {
        let shared = &self.shared;
        let seq_id = record.seq_id;

        for (idx, slot) in shared.targets.iter().enumerate() {
            if record.payloads[idx].is_none() {
                let payload = match slot.kind {
                    TargetKind::Metadata => {
                        let metadata = shared
                            .metadata_manager
                            .as_ref()
                            .and_then(|mm| mm.get(slot.id, seq_id))
                            .ok_or_else(|| {
                                Error::NoMemory(format!(
                                    "[{}] no metadata for target {} seqId {}",
                                    shared.name, slot.id, seq_id
                                ))
                            })?;
                        TargetPayload::Metadata(metadata)
                    }
                    TargetKind::InternalBuffer => {
                        let buffer = slot
                            .pool
                            .as_ref()
                            .and_then(|pool| pool.image_buffer())
                            .ok_or_else(|| {
                                Error::NoMemory(format!(
                                    "[{}] no image buffer for target {} seqId {}",
                                    shared.name, slot.id, seq_id
                                ))
                            })?;
                        TargetPayload::Stream(StreamBuffer::new(buffer))
                    }
                    TargetKind::ExternalBuffer => {
                        return Err(Error::Failed(format!(
                            "[{}] external target {} not imported for seqId {}",
                            shared.name, slot.id, seq_id
                        )));
                    }
                };
                record.payloads[idx] = Some(payload);
            }

            if let (Some(fences), Some(TargetPayload::Stream(stream))) =
                (&shared.fences, record.payloads[idx].as_mut())
            {
                if stream.release_fence.is_none() {
                    let name = format!("{}_{}_{}", shared.name, seq_id, slot.id);
                    let fence = fences
                        .create_fence(&FenceCreateParams {
                            kind: FenceType::Internal,
                            name: &name,
                        })
                        .map_err(|e| {
                            Error::Resource(format!("[{}] release fence {}: {}", shared.name, name, e))
                        })?;
                    stream.release_fence = Some(FenceInfo::internal(fence));
                    stream.acquire_fence = stream.release_fence;
                }
            }
        }
        Ok(())
    }

    /// Non-owning handle of a record still being produced
    pub fn get_handle(&self, seq_id: SeqId, target_id: TargetId) -> Result<TargetBufferHandle> {
        self.target_index(target_id)
            .ok_or(Error::UnknownTarget(target_id))?;
        let reg = self.shared.registry.lock();
        reg.get(seq_id, ListSelector::Producer)
            .map(|record| self.handle(seq_id, record.record_id))
            .ok_or_else(|| {
                Error::Failed(format!(
                    "[{}] seqId {} is not being produced",
                    self.shared.name, seq_id
                ))
            })
    }

    /// Report the result of one target of a producing record.
    ///
    /// `payload` must be the payload the record already holds for that target
    /// and may only be `None` for an `Error` status. With `want_handle` the
    /// caller receives a lease on the record once it became consumable.
    pub fn update_target(
        &self,
        seq_id: SeqId,
        target_id: TargetId,
        payload: Option<&TargetPayload>,
        status: TargetStatus,
        want_handle: bool,
    ) -> Result<Option<TargetBufferLease>> {
        let shared = &self.shared;
        let idx = self.target_index(target_id).ok_or_else(|| {
            error!(tbm = %shared.name, seq_id, target = target_id, "update of unknown target");
            Error::UnknownTarget(target_id)
        })?;
        if payload.is_none() && status != TargetStatus::Error {
            error!(tbm = %shared.name, seq_id, target = target_id, ?status, "missing payload");
            return Err(Error::InvalidArg(format!(
                "[{}] seqId {} target {}: payload required for {:?}",
                shared.name, seq_id, target_id, status
            )));
        }

        let mut reg = shared.registry.lock();
        let record = match reg.get_mut(seq_id, ListSelector::Producer) {
            Some(record) => record,
            None => {
                warn!(tbm = %shared.name, seq_id, "target buffer not found in producer list");
                return Err(Error::NoSuch(seq_id));
            }
        };

        if let Some(payload) = payload {
            let matches = record.payloads[idx]
                .as_ref()
                .is_some_and(|held| held.same_target(payload));
            if !matches {
                error!(
                    tbm = %shared.name,
                    seq_id,
                    target = target_id,
                    held = ?record.payloads[idx],
                    given = ?payload,
                    "update payload mismatch"
                );
                return Err(Error::InvalidArg(format!(
                    "[{}] seqId {} target {}: payload does not match",
                    shared.name, seq_id, target_id
                )));
            }
        }

        record.statuses[idx] = status;
        trace!(
            tbm = %shared.name,
            seq_id,
            target = target_id,
            ?status,
            ref_count = record.ref_count,
            "target updated"
        );

        let pending = self.try_move(&mut reg, seq_id);

        let handle = if want_handle {
            reg.get_mut(seq_id, ListSelector::Consumer).map(|record| {
                record.ref_count += 1;
                self.handle(seq_id, record.record_id)
            })
        } else {
            None
        };
        drop(reg);

        if let Some(pending) = pending {
            pending.invoke();
        }

        match handle {
            None if want_handle => {
                debug!(tbm = %shared.name, seq_id, "record not consumable yet, no handle");
                Err(Error::NoSuch(seq_id))
            }
            handle => Ok(handle.map(TargetBufferLease::new)),
        }
    }

    /// Migrate a producing record whose targets have all reported
    fn try_move(&self, reg: &mut Registry, seq_id: SeqId) -> Option<PendingCallback> {
        let shared = &self.shared;
        let record = reg.get_mut(seq_id, ListSelector::Producer)?;

        let pending = match record.status() {
            TargetStatus::NotReady => return None,
            TargetStatus::Ready if record.ref_count > 0 => {
                record.ref_count -= 1;
                shared.signal_release_fences(record, FenceStatus::Success);
                let record_id = record.record_id;
                debug!(tbm = %shared.name, seq_id, ref_count = record.ref_count, "target buffer ready");
                record.callback.take().map(|callback| PendingCallback {
                    callback,
                    handle: self.handle(seq_id, record_id),
                })
            }
            TargetStatus::Ready => {
                debug!(tbm = %shared.name, seq_id, "target buffer ready without references");
                None
            }
            TargetStatus::Error => {
                record.ref_count = record.ref_count.saturating_sub(1);
                // The callback will never fire; drop the reference it held
                if record.callback.take().is_some() {
                    record.ref_count = record.ref_count.saturating_sub(1);
                }
                shared.signal_release_fences(record, FenceStatus::Failed);
                warn!(tbm = %shared.name, seq_id, ref_count = record.ref_count, "target buffer in error");
                None
            }
        };

        reg.transition(seq_id, RecordState::Consuming);
        shared.ready.notify_all();
        pending
    }

    /// Take references on `count` contiguous records starting at `start`.
    ///
    /// When no such run starts at `start`, the first run after it is used.
    /// The call blocks until the run is consumable if `wait` is set or the
    /// records cannot be handed off through fences. With a `callback`, it
    /// never blocks: records still being produced get the callback instead
    /// and come back as `None`.
    pub fn get_target_buffers(
        &self,
        start: SeqId,
        count: u32,
        wait: bool,
        callback: Option<TargetCallback>,
    ) -> Result<Vec<Option<TargetBufferLease>>> {
        let shared = &self.shared;
        if count == 0 || count > shared.max {
            error!(tbm = %shared.name, start, count, max = shared.max, "invalid buffer count");
            return Err(Error::InvalidArg(format!(
                "[{}] count {} outside 1..={}",
                shared.name, count, shared.max
            )));
        }

        let mut reg = shared.registry.lock();
        if reg.live_count() == 0 {
            error!(tbm = %shared.name, start, count, "no target buffers");
            return Err(Error::Failed(format!("[{}] no target buffers", shared.name)));
        }

        let run_start = if reg.has_run(start, count) {
            start
        } else {
            match reg.next_run_after(start, count) {
                Some(anchor) => anchor,
                None => {
                    error!(
                        tbm = %shared.name,
                        start,
                        count,
                        last = ?reg.max_live_seq(),
                        "no contiguous target buffers"
                    );
                    return Err(Error::Failed(format!(
                        "[{}] no {} contiguous target buffers from seqId {}",
                        shared.name, count, start
                    )));
                }
            }
        };
        if run_start == start {
            debug!(tbm = %shared.name, start, count, "exact match");
        } else {
            warn!(tbm = %shared.name, start = run_start, requested = start, count, "suboptimal match");
        }

        let seqs: Vec<SeqId> = (0..count).map(|i| run_start + i).collect();
        for &seq_id in &seqs {
            if let Some(record) = reg.get_mut(seq_id, ListSelector::ProducerAndConsumer) {
                record.ref_count += 1;
            }
        }

        let blocking = wait || !self.handoff_capable(&reg, &seqs);
        let mut registered = Vec::new();
        match self.collect_run(&mut reg, &seqs, blocking, callback, &mut registered) {
            Ok(handles) => {
                drop(reg);
                Ok(handles
                    .into_iter()
                    .map(|handle| handle.map(TargetBufferLease::new))
                    .collect())
            }
            Err(e) => {
                let mut unreferenced = false;
                for &seq_id in &seqs {
                    if let Some(record) = reg.get_mut(seq_id, ListSelector::ProducerAndConsumer) {
                        record.ref_count = record.ref_count.saturating_sub(1);
                        if registered.contains(&seq_id) {
                            record.callback = None;
                        }
                        unreferenced |= record.ref_count == 0;
                    }
                }
                if unreferenced {
                    shared.recycle(&mut reg);
                }
                Err(e)
            }
        }
    }

    /// Whether every target of every record can be consumed through its
    /// acquire fence before it is ready
    fn handoff_capable(&self, reg: &Registry, seqs: &[SeqId]) -> bool {
        let fences = match &self.shared.fences {
            Some(fences) => fences,
            None => return false,
        };
        seqs.iter().all(|&seq_id| {
            reg.get(seq_id, ListSelector::ProducerAndConsumer)
                .is_some_and(|record| {
                    self.shared
                        .targets
                        .iter()
                        .zip(&record.payloads)
                        .all(|(slot, payload)| match payload {
                            Some(TargetPayload::Stream(StreamBuffer {
                                release_fence: Some(fence),
                                ..
                            })) => {
                                slot.kind.is_buffer()
                                    && fences.fence_status(fence.handle) != FenceStatus::Invalid
                            }
                            _ => false,
                        })
                })
        })
    }

    fn collect_run(
        &self,
        reg: &mut MutexGuard<'_, Registry>,
        seqs: &[SeqId],
        blocking: bool,
        callback: Option<TargetCallback>,
        registered: &mut Vec<SeqId>,
    ) -> Result<Vec<Option<TargetBufferHandle>>> {
        let shared = &self.shared;
        if blocking && callback.is_none() {
            self.wait_consumable(reg, seqs)?;
        }

        let mut handles = Vec::with_capacity(seqs.len());
        for &seq_id in seqs {
            let record = reg
                .get_mut(seq_id, ListSelector::ProducerAndConsumer)
                .ok_or_else(|| {
                    error!(tbm = %shared.name, seq_id, "target buffer vanished");
                    Error::NoSuch(seq_id)
                })?;

            if blocking && record.state == RecordState::Producing {
                let callback = callback.as_ref().ok_or(Error::Timeout(seq_id))?;
                if record.callback.is_some() {
                    error!(tbm = %shared.name, seq_id, "callback already registered");
                    return Err(Error::Failed(format!(
                        "[{}] seqId {} already has a callback",
                        shared.name, seq_id
                    )));
                }
                record.callback = Some(callback.clone());
                registered.push(seq_id);
                info!(tbm = %shared.name, seq_id, "registered callback");
                handles.push(None);
            } else {
                handles.push(Some(self.handle(seq_id, record.record_id)));
            }
        }
        Ok(handles)
    }

    fn wait_consumable(&self, reg: &mut MutexGuard<'_, Registry>, seqs: &[SeqId]) -> Result<()> {
        let shared = &self.shared;
        let first_pending = |reg: &Registry| {
            seqs.iter()
                .copied()
                .find(|&seq_id| reg.get(seq_id, ListSelector::Producer).is_some())
        };

        while let Some(seq_id) = first_pending(&**reg) {
            trace!(tbm = %shared.name, seq_id, "waiting for target buffer");
            if shared.ready.wait_for(reg, shared.wait_timeout).timed_out() {
                if let Some(seq_id) = first_pending(&**reg) {
                    error!(
                        tbm = %shared.name,
                        seq_id,
                        timeout_ms = shared.wait_timeout.as_millis() as u64,
                        "wait for target buffer timed out"
                    );
                    return Err(Error::Timeout(seq_id));
                }
            }
        }
        Ok(())
    }

    /// Drop one reference; at zero a recycling sweep runs
    pub fn release_target_buffer(&self, handle: &TargetBufferHandle) -> Result<()> {
        let shared = &self.shared;
        if !self.owns(handle) {
            return Err(Error::StaleHandle(handle.seq_id));
        }

        let mut reg = shared.registry.lock();
        let record = match reg
            .get_mut(handle.seq_id, ListSelector::ProducerAndConsumer)
            .filter(|record| record.record_id == handle.record_id)
        {
            Some(record) => record,
            None => {
                warn!(tbm = %shared.name, seq_id = handle.seq_id, "release of unknown target buffer");
                return Err(Error::NoSuch(handle.seq_id));
            }
        };

        if record.ref_count == 0 {
            warn!(tbm = %shared.name, seq_id = handle.seq_id, "release without reference");
            return Err(Error::Failed(format!(
                "[{}] seqId {} has no reference left",
                shared.name, handle.seq_id
            )));
        }
        record.ref_count -= 1;
        trace!(
            tbm = %shared.name,
            seq_id = handle.seq_id,
            ref_count = record.ref_count,
            "target buffer released"
        );

        if record.ref_count == 0 {
            shared.recycle(&mut reg);
        }
        Ok(())
    }

    /// Register an externally owned payload for a seqId not set up yet.
    ///
    /// The whole record is then treated as imported and none of its payloads
    /// are released by this manager. A foreign release fence is not kept.
    pub fn import_external_target_buffer(
        &self,
        seq_id: SeqId,
        target_id: TargetId,
        payload: TargetPayload,
    ) -> Result<()> {
        let shared = &self.shared;
        let idx = self.target_index(target_id).ok_or_else(|| {
            error!(tbm = %shared.name, seq_id, target = target_id, "import of unknown target");
            Error::UnknownTarget(target_id)
        })?;
        let kind = shared.targets[idx].kind;
        if !payload.fits(kind) {
            error!(tbm = %shared.name, seq_id, target = target_id, ?kind, "import payload kind mismatch");
            return Err(Error::InvalidArg(format!(
                "[{}] target {} is {:?}",
                shared.name, target_id, kind
            )));
        }

        let mut reg = shared.registry.lock();
        if reg.setup_floor().is_some_and(|floor| seq_id <= floor) {
            error!(tbm = %shared.name, seq_id, "import after setup");
            return Err(Error::Failed(format!(
                "[{}] seqId {} already set up",
                shared.name, seq_id
            )));
        }

        let populated = reg
            .get(seq_id, ListSelector::Import)
            .map(|record| record.payloads[idx].is_some());
        match populated {
            Some(true) => {
                error!(tbm = %shared.name, seq_id, target = target_id, "target already imported");
                return Err(Error::Failed(format!(
                    "[{}] seqId {} target {} already imported",
                    shared.name, seq_id, target_id
                )));
            }
            Some(false) => {}
            None => {
                let record_id = reg.next_record_id();
                reg.insert(TargetRecord::new(
                    seq_id,
                    record_id,
                    shared.targets.len(),
                    RecordState::Importing,
                ));
            }
        }

        let payload = match payload {
            TargetPayload::Stream(mut stream) => {
                stream.release_fence = None;
                TargetPayload::Stream(stream)
            }
            metadata => metadata,
        };

        let record = reg
            .get_mut(seq_id, ListSelector::Import)
            .ok_or(Error::NoSuch(seq_id))?;
        record.is_imported = true;
        record.payloads[idx] = Some(payload);
        debug!(tbm = %shared.name, seq_id, target = target_id, "target imported");
        Ok(())
    }

    /// Remove a producer or consumer record regardless of references
    pub fn remove_target_buffer(&self, seq_id: SeqId) -> Result<()> {
        let shared = &self.shared;
        let mut reg = shared.registry.lock();
        let record = if reg.get(seq_id, ListSelector::ProducerAndConsumer).is_some() {
            reg.remove(seq_id)
        } else {
            None
        };
        let record = record.ok_or_else(|| {
            Error::Failed(format!("[{}] seqId {} not found", shared.name, seq_id))
        })?;

        if record.ref_count > 0 {
            warn!(
                tbm = %shared.name,
                seq_id,
                ref_count = record.ref_count,
                "removing target buffer with references"
            );
        }
        shared.dispose(record);
        // Blocked consumers must observe the removal
        shared.ready.notify_all();
        Ok(())
    }

    /// Clear a registered callback; the reference taken with it stays held
    pub fn remove_callback(&self, seq_id: SeqId) -> bool {
        let mut reg = self.shared.registry.lock();
        reg.get_mut(seq_id, ListSelector::ProducerAndConsumer)
            .and_then(|record| record.callback.take())
            .is_some()
    }

    /// Payload of `target_id` in the record behind `handle`
    pub fn get_target(&self, handle: &TargetBufferHandle, target_id: TargetId) -> Option<TargetPayload> {
        if !self.owns(handle) {
            return None;
        }
        let idx = self.target_index(target_id)?;
        let reg = self.shared.registry.lock();
        reg.get(handle.seq_id, ListSelector::ProducerAndConsumer)
            .filter(|record| record.record_id == handle.record_id)
            .and_then(|record| record.payloads[idx].clone())
    }

    /// Aggregate status of the record behind `handle`, `Error` if it is gone
    pub fn target_buffer_status(&self, handle: &TargetBufferHandle) -> TargetStatus {
        if !self.owns(handle) {
            return TargetStatus::Error;
        }
        let reg = self.shared.registry.lock();
        reg.get(handle.seq_id, ListSelector::ProducerAndConsumer)
            .filter(|record| record.record_id == handle.record_id)
            .map_or(TargetStatus::Error, |record| record.status())
    }

    /// Oldest consumable seqId
    pub fn first_ready_sequence_id(&self) -> Option<SeqId> {
        self.shared.registry.lock().head(RecordState::Consuming)
    }

    /// Most recently consumable seqId
    pub fn last_ready_sequence_id(&self) -> Option<SeqId> {
        self.shared.registry.lock().tail(RecordState::Consuming)
    }

    pub fn all_sequence_ids(&self, selector: ListSelector) -> Vec<SeqId> {
        self.shared.registry.lock().ids(selector)
    }
}

impl Shared {
    /// Evict the oldest unreferenced consumer record once `min` is reached
    fn recycle(&self, reg: &mut Registry) {
        if reg.live_count() < self.min as usize {
            return;
        }
        if let Some(seq_id) = reg.first_recyclable() {
            if let Some(record) = reg.remove(seq_id) {
                trace!(tbm = %self.name, seq_id, "recycled target buffer");
                self.dispose(record);
            }
        }
    }

    fn signal_release_fences(&self, record: &TargetRecord, status: FenceStatus) {
        let fences = match &self.fences {
            Some(fences) => fences,
            None => return,
        };
        for payload in record.payloads.iter().flatten() {
            if let TargetPayload::Stream(StreamBuffer {
                release_fence: Some(fence),
                ..
            }) = payload
            {
                match fences.fence_status(fence.handle) {
                    FenceStatus::Pending => {
                        if let Err(e) = fences.signal_fence(fence.handle, status) {
                            warn!(tbm = %self.name, seq_id = record.seq_id, error = %e, "signal release fence failed");
                        }
                    }
                    FenceStatus::Invalid => {}
                    signaled => {
                        trace!(tbm = %self.name, seq_id = record.seq_id, ?signaled, "release fence already signaled");
                    }
                }
            }
        }
    }

    fn release_fence(&self, fence: Option<FenceInfo>) {
        if let (Some(fences), Some(fence)) = (&self.fences, fence) {
            if fence.kind == FenceType::Internal && fences.fence_status(fence.handle) != FenceStatus::Invalid {
                if let Err(e) = fences.release_fence(fence.handle) {
                    warn!(tbm = %self.name, fence = fence.handle.raw(), error = %e, "release fence failed");
                }
            }
        }
    }

    /// Give every payload back to its owner unless the record was imported
    fn dispose(&self, record: TargetRecord) {
        let owned = !record.is_imported;
        for (slot, payload) in self.targets.iter().zip(record.payloads) {
            match payload {
                Some(TargetPayload::Metadata(metadata)) => {
                    if let (true, Some(mm)) = (owned, &self.metadata_manager) {
                        if let Err(e) = mm.release(&metadata) {
                            warn!(tbm = %self.name, seq_id = record.seq_id, error = %e, "metadata release failed");
                        }
                    }
                }
                Some(TargetPayload::Stream(stream)) => {
                    if let (true, Some(pool)) = (owned, &slot.pool) {
                        if let Err(e) = pool.release_reference(&stream.buffer) {
                            warn!(tbm = %self.name, seq_id = record.seq_id, error = %e, "buffer release failed");
                        }
                    }
                    self.release_fence(stream.release_fence);
                }
                None => {}
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let records = self.registry.get_mut().drain();
        let referenced = records.iter().filter(|r| r.ref_count > 0).count();
        for record in records {
            self.dispose(record);
        }
        for slot in &self.targets {
            if let Some(pool) = &slot.pool {
                pool.destroy();
            }
        }
        info!(tbm = %self.name, referenced, "target buffer manager destroyed");
    }
}

impl fmt::Debug for TargetBufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetBufferManager")
            .field("name", &self.shared.name)
            .field("num_targets", &self.shared.targets.len())
            .field("min", &self.shared.min)
            .field("max", &self.shared.max)
            .field("fences", &self.shared.fences.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferHandle;
    use crate::config::BufferManagerCreateData;
    use crate::fence::FenceHandle;
    use crate::format::PixelFormat;
    use crate::meta::MetadataHandle;
    use crate::meta_pool::MetadataPool;
    use crate::pool::ImageBufferPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const META: TargetId = 1;
    const RDI: TargetId = 2;
    const FWK: TargetId = 3;

    #[derive(Default)]
    struct TrackingFactory {
        pools: Mutex<Vec<Arc<ImageBufferPool>>>,
    }

    impl BufferManagerFactory for TrackingFactory {
        fn create(&self, name: &str, data: &BufferManagerCreateData) -> Result<Arc<dyn BufferManager>> {
            let pool = Arc::new(ImageBufferPool::create(name, data.clone())?);
            self.pools.lock().push(pool.clone());
            Ok(pool)
        }
    }

    struct Fixture {
        tbm: TargetBufferManager,
        meta: Arc<MetadataPool>,
        pool: Arc<ImageBufferPool>,
    }

    fn rdi_data(min: u32, max: u32) -> BufferManagerCreateData {
        BufferManagerCreateData::new(64, 1, PixelFormat::Blob)
            .with_counts(min, max)
            .with_acquire_timeout_ms(20)
    }

    fn fixture_with(config: TargetBufferManagerConfig) -> Fixture {
        let meta = Arc::new(MetadataPool::with_capacity(64));
        let factory = Arc::new(TrackingFactory::default());
        let tbm = TargetBufferManager::create(
            &config,
            Collaborators::new()
                .with_metadata_manager(meta.clone())
                .with_buffer_factory(factory.clone()),
        )
        .unwrap();
        let pool = factory.pools.lock()[0].clone();
        Fixture { tbm, meta, pool }
    }

    /// One metadata target plus one internal buffer target
    fn fixture(min: u32, max: u32) -> Fixture {
        fixture_with(
            TargetBufferManagerConfig::new("test")
                .with_metadata(META)
                .with_internal_stream(RDI, "rdi", rdi_data(min, max))
                .with_wait_timeout_ms(100),
        )
    }

    fn payload(tbm: &TargetBufferManager, handle: &TargetBufferHandle, target: TargetId) -> TargetPayload {
        tbm.get_target(handle, target).unwrap()
    }

    fn mark_ready(tbm: &TargetBufferManager, handle: &TargetBufferHandle, target: TargetId) {
        let p = payload(tbm, handle, target);
        tbm.update_target(handle.seq_id(), target, Some(&p), TargetStatus::Ready, false)
            .unwrap();
    }

    fn complete(tbm: &TargetBufferManager, seq_id: SeqId) -> TargetBufferHandle {
        let handle = tbm.setup_target_buffer(seq_id).unwrap();
        for target in tbm.target_ids() {
            mark_ready(tbm, &handle, target);
        }
        handle
    }

    #[test]
    fn test_record_migrates_when_all_targets_ready() {
        let f = fixture(0, 4);
        let h = f.tbm.setup_target_buffer(0).unwrap();
        assert_eq!(f.tbm.target_buffer_status(&h), TargetStatus::NotReady);

        mark_ready(&f.tbm, &h, META);
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Producer), vec![0]);
        assert!(f.tbm.all_sequence_ids(ListSelector::Consumer).is_empty());

        mark_ready(&f.tbm, &h, RDI);
        assert!(f.tbm.all_sequence_ids(ListSelector::Producer).is_empty());
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Consumer), vec![0]);
        assert_eq!(f.tbm.target_buffer_status(&h), TargetStatus::Ready);
        assert_eq!(f.tbm.first_ready_sequence_id(), Some(0));
        assert_eq!(f.tbm.last_ready_sequence_id(), Some(0));
    }

    #[test]
    fn test_setup_order() {
        let f = fixture(8, 8);
        f.tbm.setup_target_buffer(3).unwrap();
        f.tbm.setup_target_buffer(5).unwrap();
        assert!(matches!(f.tbm.setup_target_buffer(5), Err(Error::Failed(_))));
        assert!(matches!(f.tbm.setup_target_buffer(4), Err(Error::Failed(_))));
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Producer), vec![3, 5]);
    }

    #[test]
    fn test_out_of_order_after_completion() {
        let f = fixture(8, 8);
        complete(&f.tbm, 2);
        assert!(f.tbm.setup_target_buffer(2).is_err());
        assert!(f.tbm.setup_target_buffer(1).is_err());
        f.tbm.setup_target_buffer(3).unwrap();
    }

    #[test]
    fn test_capacity_back_pressure() {
        let f = fixture(0, 4);
        for seq in 0..4 {
            f.tbm.setup_target_buffer(seq).unwrap();
        }
        assert!(matches!(
            f.tbm.setup_target_buffer(4),
            Err(Error::NoMore { live: 4, max: 4 })
        ));
        // A failed admission does not consume the seqId
        f.tbm.remove_target_buffer(0).unwrap();
        f.tbm.setup_target_buffer(4).unwrap();
    }

    #[test]
    fn test_recycles_oldest_released_record() {
        let f = fixture(2, 4);
        complete(&f.tbm, 0);
        complete(&f.tbm, 1);
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Consumer), vec![0, 1]);

        complete(&f.tbm, 2);
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Consumer), vec![1, 2]);
        assert_eq!(f.pool.lent_count(), 2);
    }

    #[test]
    fn test_referenced_record_is_not_recycled() {
        let f = fixture(1, 4);
        complete(&f.tbm, 0);
        let held = f.tbm.get_target_buffers(0, 1, true, None).unwrap();
        complete(&f.tbm, 1);
        complete(&f.tbm, 2);
        // 0 is held, so 1 went first
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Consumer), vec![0, 2]);
        drop(held);
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Consumer), vec![2]);
    }

    #[test]
    fn test_error_target_moves_record_to_consumer() {
        let f = fixture(0, 4);
        let h = f.tbm.setup_target_buffer(0).unwrap();
        f.tbm
            .update_target(0, META, None, TargetStatus::Error, false)
            .unwrap();
        mark_ready(&f.tbm, &h, RDI);

        assert_eq!(f.tbm.target_buffer_status(&h), TargetStatus::Error);
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Consumer), vec![0]);

        let mut leases = f.tbm.get_target_buffers(0, 1, true, None).unwrap();
        let lease = leases.remove(0).unwrap();
        assert_eq!(lease.status(), TargetStatus::Error);
        lease.release().unwrap();

        assert!(f.tbm.all_sequence_ids(ListSelector::Consumer).is_empty());
        assert_eq!(f.pool.lent_count(), 0);
        assert_eq!(f.meta.in_use(), 0);
    }

    #[test]
    fn test_update_rejects_bad_calls() {
        let f = fixture(0, 4);
        let h = f.tbm.setup_target_buffer(0).unwrap();

        let foreign = TargetPayload::Stream(StreamBuffer::new(BufferHandle::external(
            64,
            1,
            PixelFormat::Blob,
        )));
        assert!(matches!(
            f.tbm.update_target(0, RDI, Some(&foreign), TargetStatus::Ready, false),
            Err(Error::InvalidArg(_))
        ));
        let meta = payload(&f.tbm, &h, META);
        assert!(matches!(
            f.tbm.update_target(0, RDI, Some(&meta), TargetStatus::Ready, false),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            f.tbm.update_target(0, RDI, None, TargetStatus::Ready, false),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            f.tbm.update_target(0, 99, Some(&meta), TargetStatus::Ready, false),
            Err(Error::UnknownTarget(99))
        ));
        assert!(matches!(
            f.tbm.update_target(7, META, Some(&meta), TargetStatus::Ready, false),
            Err(Error::NoSuch(7))
        ));
        assert_eq!(f.tbm.target_buffer_status(&h), TargetStatus::NotReady);
    }

    #[test]
    fn test_update_hands_out_lease() {
        let f = fixture(0, 4);
        let h = f.tbm.setup_target_buffer(0).unwrap();
        let meta = payload(&f.tbm, &h, META);
        assert!(matches!(
            f.tbm.update_target(0, META, Some(&meta), TargetStatus::Ready, true),
            Err(Error::NoSuch(0))
        ));

        let rdi = payload(&f.tbm, &h, RDI);
        let lease = f
            .tbm
            .update_target(0, RDI, Some(&rdi), TargetStatus::Ready, true)
            .unwrap()
            .unwrap();
        assert_eq!(lease.seq_id(), 0);
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Consumer), vec![0]);

        drop(lease);
        assert!(f.tbm.all_sequence_ids(ListSelector::Consumer).is_empty());
    }

    #[test]
    fn test_get_target_buffers_reanchors() {
        let f = fixture(8, 8);
        for seq in [10, 12, 13, 14] {
            complete(&f.tbm, seq);
        }
        let leases = f.tbm.get_target_buffers(10, 3, true, None).unwrap();
        let seqs: Vec<SeqId> = leases.iter().flatten().map(|l| l.seq_id()).collect();
        assert_eq!(seqs, vec![12, 13, 14]);

        assert!(matches!(
            f.tbm.get_target_buffers(10, 4, true, None),
            Err(Error::Failed(_))
        ));
    }

    #[test]
    fn test_get_target_buffers_argument_errors() {
        let f = fixture(2, 4);
        assert!(matches!(
            f.tbm.get_target_buffers(0, 1, true, None),
            Err(Error::Failed(_))
        ));
        complete(&f.tbm, 0);
        assert!(matches!(
            f.tbm.get_target_buffers(0, 0, true, None),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            f.tbm.get_target_buffers(0, 5, true, None),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn test_blocking_get_waits_for_producer() {
        let f = fixture(0, 4);
        let h = f.tbm.setup_target_buffer(0).unwrap();

        let producer = std::thread::spawn({
            let tbm = f.tbm.clone();
            move || {
                std::thread::sleep(Duration::from_millis(30));
                mark_ready(&tbm, &h, META);
                mark_ready(&tbm, &h, RDI);
            }
        });

        let mut leases = f.tbm.get_target_buffers(0, 1, true, None).unwrap();
        let lease = leases.remove(0).unwrap();
        assert_eq!(lease.status(), TargetStatus::Ready);
        producer.join().unwrap();
    }

    #[test]
    fn test_blocking_get_times_out_and_rolls_back() {
        let f = fixture(0, 4);
        let h = f.tbm.setup_target_buffer(0).unwrap();
        assert!(matches!(
            f.tbm.get_target_buffers(0, 1, true, None),
            Err(Error::Timeout(0))
        ));

        // Only the setup reference is left, so readiness drops it to zero
        mark_ready(&f.tbm, &h, META);
        mark_ready(&f.tbm, &h, RDI);
        f.tbm.setup_target_buffer(1).unwrap();
        assert!(f.tbm.all_sequence_ids(ListSelector::Consumer).is_empty());
    }

    #[test]
    fn test_callback_fires_once_on_ready() {
        let f = fixture(0, 4);
        let h = f.tbm.setup_target_buffer(0).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let callback: TargetCallback = {
            let fired = fired.clone();
            Arc::new(move |lease: TargetBufferLease| {
                assert_eq!(lease.seq_id(), 0);
                assert_eq!(lease.status(), TargetStatus::Ready);
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };

        let slots = f
            .tbm
            .get_target_buffers(0, 1, false, Some(callback.clone()))
            .unwrap();
        assert!(slots[0].is_none());
        assert!(matches!(
            f.tbm.get_target_buffers(0, 1, false, Some(callback)),
            Err(Error::Failed(_))
        ));

        mark_ready(&f.tbm, &h, META);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        mark_ready(&f.tbm, &h, RDI);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // The callback's lease was its last reference
        assert!(f.tbm.all_sequence_ids(ListSelector::Consumer).is_empty());
    }

    #[test]
    fn test_callback_on_error_record_is_dropped() {
        let f = fixture(0, 4);
        let h = f.tbm.setup_target_buffer(0).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let callback: TargetCallback = {
            let fired = fired.clone();
            Arc::new(move |_lease: TargetBufferLease| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        f.tbm.get_target_buffers(0, 1, false, Some(callback)).unwrap();

        f.tbm.update_target(0, META, None, TargetStatus::Error, false).unwrap();
        mark_ready(&f.tbm, &h, RDI);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        f.tbm.setup_target_buffer(1).unwrap();
        assert!(f.tbm.all_sequence_ids(ListSelector::Consumer).is_empty());
    }

    #[test]
    fn test_remove_callback_keeps_reference() {
        let f = fixture(0, 4);
        let h = f.tbm.setup_target_buffer(0).unwrap();
        let callback: TargetCallback = Arc::new(|_lease: TargetBufferLease| panic!("callback was removed"));
        f.tbm.get_target_buffers(0, 1, false, Some(callback)).unwrap();
        assert!(f.tbm.remove_callback(0));
        assert!(!f.tbm.remove_callback(0));

        mark_ready(&f.tbm, &h, META);
        mark_ready(&f.tbm, &h, RDI);
        f.tbm.setup_target_buffer(1).unwrap();
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Consumer), vec![0]);
    }

    #[test]
    fn test_fenced_handoff_is_non_blocking() {
        let f = fixture_with(
            TargetBufferManagerConfig::new("fenced")
                .with_internal_stream(RDI, "rdi", rdi_data(0, 4))
                .with_fences(true),
        );
        let fences = f.tbm.fence_service().unwrap();
        let h = f.tbm.setup_target_buffer(0).unwrap();

        let mut leases = f.tbm.get_target_buffers(0, 1, false, None).unwrap();
        let lease = leases.remove(0).unwrap();
        assert_eq!(lease.status(), TargetStatus::NotReady);

        let stream = match lease.target(RDI) {
            Some(TargetPayload::Stream(stream)) => stream,
            other => panic!("unexpected payload {:?}", other),
        };
        let fence = stream.release_fence.unwrap();
        assert_eq!(stream.acquire_fence, Some(fence));
        assert_eq!(fences.fence_status(fence.handle), FenceStatus::Pending);

        mark_ready(&f.tbm, &h, RDI);
        assert_eq!(fences.fence_status(fence.handle), FenceStatus::Success);

        drop(lease);
        assert_eq!(fences.fence_status(fence.handle), FenceStatus::Invalid);
    }

    #[test]
    fn test_error_signals_release_fence_failed() {
        let f = fixture_with(
            TargetBufferManagerConfig::new("fenced")
                .with_internal_stream(RDI, "rdi", rdi_data(4, 4))
                .with_fences(true),
        );
        let fences = f.tbm.fence_service().unwrap();
        let h = f.tbm.setup_target_buffer(0).unwrap();
        let fence = match payload(&f.tbm, &h, RDI) {
            TargetPayload::Stream(stream) => stream.release_fence.unwrap(),
            other => panic!("unexpected payload {:?}", other),
        };
        f.tbm.update_target(0, RDI, None, TargetStatus::Error, false).unwrap();
        assert_eq!(fences.fence_status(fence.handle), FenceStatus::Failed);
    }

    #[test]
    fn test_release_errors() {
        let f = fixture(4, 4);
        let h = complete(&f.tbm, 0);
        assert!(matches!(f.tbm.release_target_buffer(&h), Err(Error::Failed(_))));

        f.tbm.remove_target_buffer(0).unwrap();
        assert!(matches!(f.tbm.release_target_buffer(&h), Err(Error::NoSuch(0))));
        assert!(matches!(f.tbm.remove_target_buffer(0), Err(Error::Failed(_))));

        let other = fixture(4, 4);
        let foreign = other.tbm.setup_target_buffer(1).unwrap();
        assert!(matches!(
            f.tbm.release_target_buffer(&foreign),
            Err(Error::StaleHandle(1))
        ));
        assert!(f.tbm.get_target(&foreign, RDI).is_none());
    }

    #[test]
    fn test_get_handle_only_for_producing() {
        let f = fixture(4, 4);
        let h = f.tbm.setup_target_buffer(0).unwrap();
        assert_eq!(f.tbm.get_handle(0, RDI).unwrap(), h);
        assert!(matches!(f.tbm.get_handle(0, 42), Err(Error::UnknownTarget(42))));
        mark_ready(&f.tbm, &h, META);
        mark_ready(&f.tbm, &h, RDI);
        assert!(matches!(f.tbm.get_handle(0, RDI), Err(Error::Failed(_))));
        let tbm = TargetBufferManager::from_handle(&h).unwrap();
        assert_eq!(tbm.name(), "test");
    }

    fn import_fixture() -> Fixture {
        fixture_with(
            TargetBufferManagerConfig::new("import")
                .with_internal_stream(RDI, "rdi", rdi_data(4, 4))
                .with_external_stream(FWK),
        )
    }

    #[test]
    fn test_import_then_setup_reuses_payload() {
        let f = import_fixture();
        let buffer = BufferHandle::external(64, 1, PixelFormat::Blob);
        let stream = StreamBuffer {
            buffer: buffer.clone(),
            acquire_fence: None,
            release_fence: Some(FenceInfo {
                handle: FenceHandle::from_raw(0xdead),
                kind: FenceType::External,
            }),
        };
        f.tbm
            .import_external_target_buffer(7, FWK, TargetPayload::Stream(stream.clone()))
            .unwrap();
        assert!(matches!(
            f.tbm.import_external_target_buffer(7, FWK, TargetPayload::Stream(stream)),
            Err(Error::Failed(_))
        ));
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Import), vec![7]);

        let h = f.tbm.setup_target_buffer(7).unwrap();
        assert!(f.tbm.all_sequence_ids(ListSelector::Import).is_empty());
        match payload(&f.tbm, &h, FWK) {
            TargetPayload::Stream(s) => {
                assert_eq!(s.buffer, buffer);
                assert_eq!(s.release_fence, None);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        // The whole record counts as imported: the pool buffer is not returned
        f.tbm.remove_target_buffer(7).unwrap();
        assert_eq!(f.pool.lent_count(), 1);
    }

    #[test]
    fn test_import_rejections() {
        let f = import_fixture();
        let meta = TargetPayload::Metadata(MetadataHandle::detached(FWK, 0));
        assert!(matches!(
            f.tbm.import_external_target_buffer(0, FWK, meta),
            Err(Error::InvalidArg(_))
        ));
        let stream = TargetPayload::Stream(StreamBuffer::new(BufferHandle::external(
            64,
            1,
            PixelFormat::Blob,
        )));
        assert!(matches!(
            f.tbm.import_external_target_buffer(0, 9, stream.clone()),
            Err(Error::UnknownTarget(9))
        ));

        // External target without import fails and rolls back the pool buffer
        assert!(matches!(f.tbm.setup_target_buffer(3), Err(Error::Failed(_))));
        assert_eq!(f.pool.lent_count(), 0);
        f.tbm.import_external_target_buffer(3, FWK, stream.clone()).unwrap();
        f.tbm.setup_target_buffer(3).unwrap();
        assert!(matches!(
            f.tbm.import_external_target_buffer(3, FWK, stream),
            Err(Error::Failed(_))
        ));
    }

    #[test]
    fn test_create_validation() {
        let meta: Arc<dyn MetadataManager> = Arc::new(MetadataPool::new());
        let with_meta = || Collaborators::new().with_metadata_manager(meta.clone());

        let empty = TargetBufferManagerConfig::new("empty");
        assert!(TargetBufferManager::create(&empty, with_meta()).is_err());

        let unnamed = TargetBufferManagerConfig::new("").with_metadata(META);
        assert!(TargetBufferManager::create(&unnamed, with_meta()).is_err());

        let dup = TargetBufferManagerConfig::new("dup")
            .with_metadata(META)
            .with_external_stream(META);
        assert!(matches!(
            TargetBufferManager::create(&dup, with_meta()),
            Err(Error::InvalidArg(_))
        ));

        let no_mm = TargetBufferManagerConfig::new("no_mm").with_metadata(META);
        assert!(TargetBufferManager::create(&no_mm, Collaborators::new()).is_err());

        let mut many = TargetBufferManagerConfig::new("many");
        for id in 0..=MAX_TARGETS as TargetId {
            many = many.with_external_stream(id);
        }
        assert!(TargetBufferManager::create(&many, Collaborators::new()).is_err());

        let mismatch = TargetBufferManagerConfig::new("mismatch")
            .with_internal_stream(1, "a", rdi_data(0, 4))
            .with_internal_stream(2, "b", rdi_data(0, 6));
        assert!(matches!(
            TargetBufferManager::create(&mismatch, Collaborators::new()),
            Err(Error::InvalidArg(_))
        ));

        let bad_pool = TargetBufferManagerConfig::new("bad_pool")
            .with_internal_stream(1, "a", rdi_data(5, 4));
        assert!(matches!(
            TargetBufferManager::create(&bad_pool, Collaborators::new()),
            Err(Error::Resource(_))
        ));
    }

    #[test]
    fn test_bounds_derivation() {
        let meta: Arc<dyn MetadataManager> = Arc::new(MetadataPool::new());

        let config = TargetBufferManagerConfig::new("meta")
            .with_metadata(META)
            .with_min_meta_buffer_count(3);
        let tbm = TargetBufferManager::create(
            &config,
            Collaborators::new().with_metadata_manager(meta.clone()),
        )
        .unwrap();
        assert_eq!((tbm.min_buffer_count(), tbm.max_buffer_count()), (3, DEFAULT_MAX_NODE));

        let config = TargetBufferManagerConfig::new("meta_default").with_metadata(META);
        let tbm = TargetBufferManager::create(
            &config,
            Collaborators::new().with_metadata_manager(meta),
        )
        .unwrap();
        assert_eq!(
            (tbm.min_buffer_count(), tbm.max_buffer_count()),
            (DEFAULT_MAX_NODE, DEFAULT_MAX_NODE)
        );

        let config = TargetBufferManagerConfig::new("ext")
            .with_external_stream(FWK)
            .with_external_counts(0, 6);
        let tbm = TargetBufferManager::create(&config, Collaborators::new()).unwrap();
        assert_eq!((tbm.min_buffer_count(), tbm.max_buffer_count()), (6, 6));

        let config = TargetBufferManagerConfig::new("ext_raised")
            .with_external_stream(FWK)
            .with_external_counts(40, 0);
        let tbm = TargetBufferManager::create(&config, Collaborators::new()).unwrap();
        assert_eq!((tbm.min_buffer_count(), tbm.max_buffer_count()), (40, 40));

        let f = fixture(2, 5);
        assert_eq!((f.tbm.min_buffer_count(), f.tbm.max_buffer_count()), (2, 5));
    }

    #[test]
    fn test_drop_returns_payloads() {
        let f = fixture(4, 4);
        complete(&f.tbm, 0);
        f.tbm.setup_target_buffer(1).unwrap();
        let stale = f.tbm.get_target_buffers(0, 1, true, None).unwrap();
        assert_eq!(f.pool.lent_count(), 2);

        let Fixture { tbm, meta, pool } = f;
        drop(tbm);
        assert_eq!(pool.lent_count(), 0);
        assert_eq!(meta.in_use(), 0);
        assert!(pool.image_buffer().is_none());
        // Leases outliving the manager release nothing
        drop(stale);
    }

    #[test]
    fn test_stats() {
        let f = fixture(4, 4);
        complete(&f.tbm, 0);
        f.tbm.setup_target_buffer(1).unwrap();
        let stats = f.tbm.stats();
        assert_eq!(
            stats,
            TbmStats {
                producer: 1,
                consumer: 1,
                import: 0,
                in_flight: 0,
                min: 4,
                max: 4,
            }
        );
    }

    #[test]
    fn test_timed_out_batch_recycles_released_record() {
        let f = fixture(0, 4);
        let h0 = f.tbm.setup_target_buffer(0).unwrap();
        f.tbm.setup_target_buffer(1).unwrap();
        mark_ready(&f.tbm, &h0, META);
        mark_ready(&f.tbm, &h0, RDI);
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Consumer), vec![0]);

        assert!(matches!(
            f.tbm.get_target_buffers(0, 2, true, None),
            Err(Error::Timeout(1))
        ));
        // 0 dropped back to zero references during the rollback
        assert!(f.tbm.all_sequence_ids(ListSelector::Consumer).is_empty());
        assert_eq!(f.tbm.all_sequence_ids(ListSelector::Producer), vec![1]);
        assert_eq!(f.pool.lent_count(), 1);
    }

    /// Hands the pool's buffers out, except that the first request waits for `open`
    struct GatedPool {
        inner: ImageBufferPool,
        gate: Mutex<(bool, bool)>,
        opened: Condvar,
    }

    impl GatedPool {
        fn new(data: BufferManagerCreateData) -> Self {
            Self {
                inner: ImageBufferPool::create("gated", data).unwrap(),
                gate: Mutex::new((false, false)),
                opened: Condvar::new(),
            }
        }

        fn open(&self) {
            self.gate.lock().1 = true;
            self.opened.notify_all();
        }
    }

    impl BufferManager for GatedPool {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn min_buffer_count(&self) -> u32 {
            self.inner.min_buffer_count()
        }

        fn max_buffer_count(&self) -> u32 {
            self.inner.max_buffer_count()
        }

        fn image_buffer(&self) -> Option<BufferHandle> {
            let mut gate = self.gate.lock();
            if !gate.0 {
                gate.0 = true;
                while !gate.1 {
                    self.opened.wait(&mut gate);
                }
            }
            drop(gate);
            self.inner.image_buffer()
        }

        fn release_reference(&self, buffer: &BufferHandle) -> Result<()> {
            self.inner.release_reference(buffer)
        }

        fn destroy(&self) {
            self.inner.destroy()
        }
    }

    /// Never has a buffer to give
    struct EmptyPool;

    impl BufferManager for EmptyPool {
        fn name(&self) -> &str {
            "empty"
        }

        fn min_buffer_count(&self) -> u32 {
            0
        }

        fn max_buffer_count(&self) -> u32 {
            4
        }

        fn image_buffer(&self) -> Option<BufferHandle> {
            None
        }

        fn release_reference(&self, _buffer: &BufferHandle) -> Result<()> {
            Err(Error::InvalidArg("nothing lent".to_string()))
        }

        fn destroy(&self) {}
    }

    struct SharedFactory(Arc<dyn BufferManager>);

    impl BufferManagerFactory for SharedFactory {
        fn create(&self, _name: &str, _data: &BufferManagerCreateData) -> Result<Arc<dyn BufferManager>> {
            Ok(self.0.clone())
        }
    }

    struct FailingFences;

    impl FenceService for FailingFences {
        fn create_fence(&self, _params: &FenceCreateParams<'_>) -> Result<FenceHandle> {
            Err(Error::Fence("no fence available".to_string()))
        }

        fn fence_status(&self, _fence: FenceHandle) -> FenceStatus {
            FenceStatus::Invalid
        }

        fn signal_fence(&self, _fence: FenceHandle, _status: FenceStatus) -> Result<()> {
            Ok(())
        }

        fn release_fence(&self, _fence: FenceHandle) -> Result<()> {
            Ok(())
        }

        fn wait_fence(&self, _fence: FenceHandle, _timeout: Duration) -> Result<FenceStatus> {
            Ok(FenceStatus::Invalid)
        }
    }

    #[test]
    fn test_overlapping_setups() {
        let pool = Arc::new(GatedPool::new(rdi_data(0, 2)));
        let config = TargetBufferManagerConfig::new("overlap")
            .with_metadata(META)
            .with_internal_stream(RDI, "gated", rdi_data(0, 2));
        let meta = Arc::new(MetadataPool::with_capacity(8));
        let tbm = TargetBufferManager::create(
            &config,
            Collaborators::new()
                .with_metadata_manager(meta.clone())
                .with_buffer_factory(Arc::new(SharedFactory(pool.clone()))),
        )
        .unwrap();

        let blocked = std::thread::spawn({
            let tbm = tbm.clone();
            move || tbm.setup_target_buffer(1)
        });
        let mut waited = 0;
        while tbm.stats().in_flight == 0 {
            assert!(waited < 2000, "setup of seqId 1 never started");
            std::thread::sleep(Duration::from_millis(1));
            waited += 1;
        }

        // The in-flight seqId already raises the floor
        assert!(matches!(tbm.setup_target_buffer(0), Err(Error::Failed(_))));
        assert!(matches!(tbm.setup_target_buffer(1), Err(Error::Failed(_))));
        tbm.setup_target_buffer(2).unwrap();
        assert_eq!(tbm.all_sequence_ids(ListSelector::Producer), vec![2]);

        // One live record plus one in flight fill max
        assert!(matches!(
            tbm.setup_target_buffer(3),
            Err(Error::NoMore { live: 2, max: 2 })
        ));

        pool.open();
        blocked.join().unwrap().unwrap();
        assert_eq!(tbm.all_sequence_ids(ListSelector::Producer), vec![1, 2]);
        assert_eq!(tbm.stats().in_flight, 0);
        assert_eq!(meta.in_use(), 2);
    }

    #[test]
    fn test_setup_rolls_back_drawn_metadata() {
        let config = TargetBufferManagerConfig::new("nomem")
            .with_metadata(META)
            .with_internal_stream(RDI, "empty", rdi_data(0, 4));
        let meta = Arc::new(MetadataPool::with_capacity(8));
        let tbm = TargetBufferManager::create(
            &config,
            Collaborators::new()
                .with_metadata_manager(meta.clone())
                .with_buffer_factory(Arc::new(SharedFactory(Arc::new(EmptyPool)))),
        )
        .unwrap();

        assert!(matches!(tbm.setup_target_buffer(0), Err(Error::NoMemory(_))));
        assert_eq!(meta.in_use(), 0);
        assert_eq!(tbm.stats().in_flight, 0);
        assert!(tbm.all_sequence_ids(ListSelector::ProducerAndConsumer).is_empty());
        // The failed seqId can be set up again
        assert!(matches!(tbm.setup_target_buffer(0), Err(Error::NoMemory(_))));
    }

    #[test]
    fn test_setup_rolls_back_on_fence_failure() {
        let meta = Arc::new(MetadataPool::with_capacity(8));
        let factory = Arc::new(TrackingFactory::default());
        let config = TargetBufferManagerConfig::new("nofence")
            .with_metadata(META)
            .with_internal_stream(RDI, "rdi", rdi_data(0, 4))
            .with_fences(true);
        let tbm = TargetBufferManager::create(
            &config,
            Collaborators::new()
                .with_metadata_manager(meta.clone())
                .with_buffer_factory(factory.clone())
                .with_fence_service(Arc::new(FailingFences)),
        )
        .unwrap();
        let pool = factory.pools.lock()[0].clone();

        assert!(matches!(tbm.setup_target_buffer(0), Err(Error::Resource(_))));
        assert_eq!(pool.lent_count(), 0);
        assert_eq!(meta.in_use(), 0);
        assert_eq!(tbm.stats().producer, 0);
    }
}
