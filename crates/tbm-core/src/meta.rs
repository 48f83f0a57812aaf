//! Metadata object handed out for metadata targets

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::target::{SeqId, TargetId};

/// Maximum payload of one metadata tag
pub const MAX_TAG_SIZE: usize = 4096;

/// Per-request metadata.
///
/// Identity fields are atomics so a reader never needs the tag lock to learn
/// which request the object currently belongs to.
pub struct Metadata {
    /// Slot index inside the owning pool, `u32::MAX` when detached
    slot: u32,
    /// Id of the owning pool, 0 when detached
    pool_id: u64,
    /// Metadata client id (the target id it was requested for)
    client_id: AtomicU64,
    /// Sequence id of the current owner
    seq_id: AtomicU32,
    /// Sensor timestamp in nanoseconds
    timestamp: AtomicU64,
    /// Tag payloads
    tags: RwLock<BTreeMap<u32, Vec<u8>>>,
}

impl Metadata {
    pub(crate) fn new(slot: u32, pool_id: u64) -> Self {
        Self {
            slot,
            pool_id,
            client_id: AtomicU64::new(0),
            seq_id: AtomicU32::new(0),
            timestamp: AtomicU64::new(0),
            tags: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn reset(&self, client_id: TargetId, seq_id: SeqId) {
        self.client_id.store(client_id, Ordering::SeqCst);
        self.seq_id.store(seq_id, Ordering::SeqCst);
        self.timestamp.store(0, Ordering::SeqCst);
        self.tags.write().clear();
    }
}

/// Shared handle to a [`Metadata`] object; equality is object identity
#[derive(Clone)]
pub struct MetadataHandle(Arc<Metadata>);

impl MetadataHandle {
    pub(crate) fn new(meta: Metadata) -> Self {
        Self(Arc::new(meta))
    }

    /// Metadata that does not belong to any pool, e.g. framework settings
    /// imported into a manager
    pub fn detached(client_id: TargetId, seq_id: SeqId) -> Self {
        let meta = Metadata::new(u32::MAX, 0);
        meta.reset(client_id, seq_id);
        Self::new(meta)
    }

    pub(crate) fn reset(&self, client_id: TargetId, seq_id: SeqId) {
        self.0.reset(client_id, seq_id);
    }

    pub(crate) fn slot(&self) -> u32 {
        self.0.slot
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.0.pool_id
    }

    pub fn client_id(&self) -> TargetId {
        self.0.client_id.load(Ordering::SeqCst)
    }

    pub fn seq_id(&self) -> SeqId {
        self.0.seq_id.load(Ordering::SeqCst)
    }

    pub fn timestamp(&self) -> u64 {
        self.0.timestamp.load(Ordering::SeqCst)
    }

    pub fn set_timestamp(&self, ns: u64) {
        self.0.timestamp.store(ns, Ordering::SeqCst);
    }

    /// Set a tag, returning false if the payload is too large
    pub fn set_tag(&self, tag: u32, value: &[u8]) -> bool {
        if value.len() > MAX_TAG_SIZE {
            return false;
        }
        self.0.tags.write().insert(tag, value.to_vec());
        true
    }

    pub fn tag(&self, tag: u32) -> Option<Vec<u8>> {
        self.0.tags.read().get(&tag).cloned()
    }

    pub fn tag_count(&self) -> usize {
        self.0.tags.read().len()
    }

    /// Copy every tag of `other` into this object
    pub fn merge_from(&self, other: &MetadataHandle) {
        if self == other {
            return;
        }
        let src = other.0.tags.read();
        let mut dst = self.0.tags.write();
        for (tag, value) in src.iter() {
            dst.insert(*tag, value.clone());
        }
    }
}

impl PartialEq for MetadataHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for MetadataHandle {}

impl fmt::Debug for MetadataHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataHandle")
            .field("slot", &self.0.slot)
            .field("client_id", &self.client_id())
            .field("seq_id", &self.seq_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_and_merge() {
        let a = MetadataHandle::detached(1, 10);
        let b = MetadataHandle::detached(1, 10);
        assert!(a.set_tag(0x8001, &[1, 2, 3]));
        assert!(!a.set_tag(0x8002, &vec![0; MAX_TAG_SIZE + 1]));
        b.merge_from(&a);
        assert_eq!(b.tag(0x8001), Some(vec![1, 2, 3]));
        assert_eq!(b.tag_count(), 1);
        assert_ne!(a, b);
        a.merge_from(&a.clone());
        assert_eq!(a.tag_count(), 1);
    }
}
