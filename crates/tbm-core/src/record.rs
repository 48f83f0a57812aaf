//! Per-sequence-id target record

use std::fmt;
use std::sync::Arc;

use crate::buffer::BufferHandle;
use crate::fence::FenceInfo;
use crate::guard::TargetBufferLease;
use crate::meta::MetadataHandle;
use crate::target::{SeqId, TargetKind, TargetStatus};

/// Completion callback, invoked once with a lease on the ready record
pub type TargetCallback = Arc<dyn Fn(TargetBufferLease) + Send + Sync>;

/// Staging area a record currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordState {
    Importing,
    Producing,
    Consuming,
}

impl RecordState {
    pub(crate) const fn index(&self) -> usize {
        match self {
            RecordState::Importing => 0,
            RecordState::Producing => 1,
            RecordState::Consuming => 2,
        }
    }
}

/// Image buffer of a stream target with its fences.
///
/// When fences are enabled the acquire fence is a copy of the release fence,
/// both naming the same underlying fence.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBuffer {
    pub buffer: BufferHandle,
    pub acquire_fence: Option<FenceInfo>,
    pub release_fence: Option<FenceInfo>,
}

impl StreamBuffer {
    pub fn new(buffer: BufferHandle) -> Self {
        Self {
            buffer,
            acquire_fence: None,
            release_fence: None,
        }
    }
}

/// Payload of one target
#[derive(Debug, Clone, PartialEq)]
pub enum TargetPayload {
    Metadata(MetadataHandle),
    Stream(StreamBuffer),
}

impl TargetPayload {
    pub fn as_metadata(&self) -> Option<&MetadataHandle> {
        match self {
            TargetPayload::Metadata(m) => Some(m),
            TargetPayload::Stream(_) => None,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamBuffer> {
        match self {
            TargetPayload::Stream(s) => Some(s),
            TargetPayload::Metadata(_) => None,
        }
    }

    /// Identity check used by `update_target`: same metadata object or same
    /// image buffer, fences ignored
    pub fn same_target(&self, other: &TargetPayload) -> bool {
        match (self, other) {
            (TargetPayload::Metadata(a), TargetPayload::Metadata(b)) => a == b,
            (TargetPayload::Stream(a), TargetPayload::Stream(b)) => a.buffer == b.buffer,
            _ => false,
        }
    }

    pub(crate) fn fits(&self, kind: TargetKind) -> bool {
        match self {
            TargetPayload::Metadata(_) => kind == TargetKind::Metadata,
            TargetPayload::Stream(_) => kind.is_buffer(),
        }
    }
}

pub(crate) struct TargetRecord {
    pub seq_id: SeqId,
    /// Unique per allocated record, lets handles detect reuse of a seqId
    pub record_id: u64,
    pub ref_count: u32,
    pub state: RecordState,
    pub statuses: Vec<TargetStatus>,
    pub payloads: Vec<Option<TargetPayload>>,
    /// Suppresses payload release at removal, for every target
    pub is_imported: bool,
    pub callback: Option<TargetCallback>,
}

impl TargetRecord {
    pub fn new(seq_id: SeqId, record_id: u64, num_targets: usize, state: RecordState) -> Self {
        Self {
            seq_id,
            record_id,
            ref_count: 1,
            state,
            statuses: vec![TargetStatus::NotReady; num_targets],
            payloads: vec![None; num_targets],
            is_imported: false,
            callback: None,
        }
    }

    pub fn status(&self) -> TargetStatus {
        TargetStatus::aggregate(self.statuses.iter().copied())
    }
}

impl fmt::Debug for TargetRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetRecord")
            .field("seq_id", &self.seq_id)
            .field("record_id", &self.record_id)
            .field("ref_count", &self.ref_count)
            .field("state", &self.state)
            .field("statuses", &self.statuses)
            .field("is_imported", &self.is_imported)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;

    #[test]
    fn test_same_target_ignores_fences() {
        let buf = BufferHandle::external(4, 1, PixelFormat::Blob);
        let plain = TargetPayload::Stream(StreamBuffer::new(buf.clone()));
        let mut fenced = StreamBuffer::new(buf);
        fenced.release_fence = Some(FenceInfo::internal(crate::fence::FenceHandle::from_raw(3)));
        assert!(plain.same_target(&TargetPayload::Stream(fenced)));

        let other = TargetPayload::Stream(StreamBuffer::new(BufferHandle::external(
            4,
            1,
            PixelFormat::Blob,
        )));
        assert!(!plain.same_target(&other));
        let meta = TargetPayload::Metadata(MetadataHandle::detached(1, 0));
        assert!(!plain.same_target(&meta));
        assert!(meta.fits(TargetKind::Metadata));
        assert!(!meta.fits(TargetKind::ExternalBuffer));
    }
}
