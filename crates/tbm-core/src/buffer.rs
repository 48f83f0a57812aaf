//! Image buffer handle and storage

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::format::PixelFormat;
#[cfg(feature = "shm")]
use crate::shm::ShmRegion;
use crate::storage::StorageType;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Buffer bytes
pub enum BufferData {
    Heap(Vec<u8>),
    #[cfg(feature = "shm")]
    Shm(ShmRegion),
}

impl BufferData {
    /// Get storage type
    pub fn storage_type(&self) -> StorageType {
        match self {
            BufferData::Heap(_) => StorageType::Heap,
            #[cfg(feature = "shm")]
            BufferData::Shm(_) => StorageType::Shm,
        }
    }

    /// Get size in bytes
    pub fn size(&self) -> usize {
        match self {
            BufferData::Heap(v) => v.len(),
            #[cfg(feature = "shm")]
            BufferData::Shm(shm) => shm.len(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            BufferData::Heap(v) => v,
            #[cfg(feature = "shm")]
            BufferData::Shm(shm) => shm.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            BufferData::Heap(v) => v,
            #[cfg(feature = "shm")]
            BufferData::Shm(shm) => shm.as_mut_slice(),
        }
    }
}

/// One image buffer, shared between the pool that owns it and the records
/// that reference it.
pub struct ImageBuffer {
    id: u64,
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Mutex<BufferData>,
}

/// Cheap, clonable handle to an [`ImageBuffer`].
///
/// Two handles compare equal only when they point at the same buffer.
#[derive(Clone)]
pub struct BufferHandle(Arc<ImageBuffer>);

impl BufferHandle {
    pub(crate) fn from_data(width: u32, height: u32, format: PixelFormat, data: BufferData) -> Self {
        Self(Arc::new(ImageBuffer {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            format,
            data: Mutex::new(data),
        }))
    }

    /// Allocate a heap buffer outside of any pool, e.g. a framework buffer
    /// that will be imported into a manager
    pub fn external(width: u32, height: u32, format: PixelFormat) -> Self {
        let size = format.frame_size(width, height);
        Self::from_data(width, height, format, BufferData::Heap(vec![0; size]))
    }

    /// Process-unique buffer id
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn width(&self) -> u32 {
        self.0.width
    }

    pub fn height(&self) -> u32 {
        self.0.height
    }

    pub fn format(&self) -> PixelFormat {
        self.0.format
    }

    pub fn size(&self) -> usize {
        self.0.data.lock().size()
    }

    pub fn storage_type(&self) -> StorageType {
        self.0.data.lock().storage_type()
    }

    /// Lock the buffer bytes
    pub fn lock(&self) -> MutexGuard<'_, BufferData> {
        self.0.data.lock()
    }

    /// Copy `bytes` into the start of the buffer, returning the count copied
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut data = self.0.data.lock();
        let dst = data.as_mut_slice();
        let n = dst.len().min(bytes.len());
        dst[..n].copy_from_slice(&bytes[..n]);
        n
    }
}

impl PartialEq for BufferHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for BufferHandle {}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.0.id)
            .field("width", &self.0.width)
            .field("height", &self.0.height)
            .field("format", &self.0.format)
            .finish()
    }
}
