//! POSIX shared memory backing for image buffers

use crate::{Error, Result};
use shared_memory::{Shmem, ShmemConf};

/// Owned shared memory segment holding one image buffer
pub struct ShmRegion {
    inner: Shmem,
    os_id: String,
    len: usize,
}

// Safety: the mapping is only reached through `&self`/`&mut self`, and buffer
// access is serialized by the `Mutex` around `BufferData`.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create and zero a new segment; the segment is unlinked when dropped
    pub fn create(os_id: &str, len: usize) -> Result<Self> {
        let inner = ShmemConf::new()
            .size(len.max(1))
            .os_id(os_id)
            .create()
            .map_err(|e| Error::SharedMemory(format!("{}: {}", os_id, e)))?;

        let mut region = Self {
            inner,
            os_id: os_id.to_string(),
            len,
        };
        region.as_mut_slice().fill(0);
        Ok(region)
    }

    /// OS identifier of the segment
    pub fn os_id(&self) -> &str {
        &self.os_id
    }

    /// Usable length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.inner.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.inner.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("os_id", &self.os_id)
            .field("len", &self.len)
            .finish()
    }
}
