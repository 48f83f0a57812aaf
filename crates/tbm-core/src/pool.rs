//! Image buffer pool management

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::buffer::{BufferData, BufferHandle};
use crate::config::BufferManagerCreateData;
#[cfg(feature = "shm")]
use crate::shm::ShmRegion;
use crate::storage::StorageType;
use crate::{Error, Result};

/// Per-target source of image buffers.
///
/// Implementations must be thread-safe; `image_buffer` may block while the
/// pool is exhausted.
pub trait BufferManager: Send + Sync {
    fn name(&self) -> &str;

    fn min_buffer_count(&self) -> u32;

    fn max_buffer_count(&self) -> u32;

    /// Hand out a buffer owned by the caller until released
    fn image_buffer(&self) -> Option<BufferHandle>;

    /// Give a lent buffer back to the pool
    fn release_reference(&self, buffer: &BufferHandle) -> Result<()>;

    /// Stop handing out buffers and free the idle ones
    fn destroy(&self);
}

/// Creates buffer managers for internal-stream targets
pub trait BufferManagerFactory: Send + Sync {
    fn create(&self, name: &str, data: &BufferManagerCreateData) -> Result<Arc<dyn BufferManager>>;
}

/// Factory producing [`ImageBufferPool`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolFactory;

impl BufferManagerFactory for PoolFactory {
    fn create(&self, name: &str, data: &BufferManagerCreateData) -> Result<Arc<dyn BufferManager>> {
        Ok(Arc::new(ImageBufferPool::create(name, data.clone())?))
    }
}

#[derive(Default)]
struct PoolState {
    free: Vec<BufferHandle>,
    lent: HashMap<u64, BufferHandle>,
    allocated: u32,
    destroyed: bool,
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// Bounded pool of equally sized image buffers
pub struct ImageBufferPool {
    /// Pool name
    name: String,
    /// Unique prefix for shared memory segment names
    #[cfg_attr(not(feature = "shm"), allow(dead_code))]
    shm_prefix: String,
    data: BufferManagerCreateData,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl ImageBufferPool {
    /// Create a new pool; with `immediate_allocation` the first
    /// `min_buffer_count` buffers are allocated here
    pub fn create(name: &str, data: BufferManagerCreateData) -> Result<Self> {
        if data.max_buffer_count == 0 || data.min_buffer_count > data.max_buffer_count {
            return Err(Error::InvalidArg(format!(
                "pool {}: min {} / max {} buffer count",
                name, data.min_buffer_count, data.max_buffer_count
            )));
        }
        if data.buffer_size() == 0 {
            return Err(Error::InvalidArg(format!(
                "pool {}: zero sized {:?} {}x{}",
                name, data.format, data.width, data.height
            )));
        }

        let pool = Self {
            name: name.to_string(),
            shm_prefix: format!(
                "/tbm_{}_{}",
                std::process::id(),
                NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)
            ),
            data,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        };

        if pool.data.immediate_allocation {
            let mut state = pool.state.lock();
            for _ in 0..pool.data.min_buffer_count {
                let buffer = pool.allocate(state.allocated)?;
                state.allocated += 1;
                state.free.push(buffer);
            }
        }

        debug!(
            pool = %pool.name,
            min = pool.data.min_buffer_count,
            max = pool.data.max_buffer_count,
            size = pool.data.buffer_size(),
            "buffer pool created"
        );
        Ok(pool)
    }

    /// Creation parameters
    pub fn create_data(&self) -> &BufferManagerCreateData {
        &self.data
    }

    /// Buffers allocated so far
    pub fn allocated(&self) -> u32 {
        self.state.lock().allocated
    }

    /// Buffers currently idle in the pool
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Buffers currently handed out
    pub fn lent_count(&self) -> usize {
        self.state.lock().lent.len()
    }

    fn allocate(&self, index: u32) -> Result<BufferHandle> {
        let size = self.data.buffer_size();
        let data = match self.data.storage {
            StorageType::Heap => BufferData::Heap(vec![0; size]),
            #[cfg(feature = "shm")]
            StorageType::Shm => {
                let os_id = format!("{}_buf_{}", self.shm_prefix, index);
                BufferData::Shm(ShmRegion::create(&os_id, size)?)
            }
        };
        trace!(pool = %self.name, index, size, "allocated buffer");
        Ok(BufferHandle::from_data(
            self.data.width,
            self.data.height,
            self.data.format,
            data,
        ))
    }
}

impl BufferManager for ImageBufferPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_buffer_count(&self) -> u32 {
        self.data.min_buffer_count
    }

    fn max_buffer_count(&self) -> u32 {
        self.data.max_buffer_count
    }

    fn image_buffer(&self) -> Option<BufferHandle> {
        let deadline = Instant::now() + Duration::from_millis(self.data.acquire_timeout_ms);
        let mut state = self.state.lock();

        loop {
            if state.destroyed {
                warn!(pool = %self.name, "image_buffer on destroyed pool");
                return None;
            }

            let buffer = match state.free.pop() {
                Some(buffer) => Some(buffer),
                None if state.allocated < self.data.max_buffer_count => {
                    match self.allocate(state.allocated) {
                        Ok(buffer) => {
                            state.allocated += 1;
                            Some(buffer)
                        }
                        Err(e) => {
                            warn!(pool = %self.name, error = %e, "buffer allocation failed");
                            return None;
                        }
                    }
                }
                None => None,
            };

            if let Some(buffer) = buffer {
                state.lent.insert(buffer.id(), buffer.clone());
                return Some(buffer);
            }

            trace!(pool = %self.name, "pool exhausted, waiting for a free buffer");
            if self.available.wait_until(&mut state, deadline).timed_out() && state.free.is_empty() {
                warn!(
                    pool = %self.name,
                    timeout_ms = self.data.acquire_timeout_ms,
                    "timed out waiting for a free buffer"
                );
                return None;
            }
        }
    }

    fn release_reference(&self, buffer: &BufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        let lent = state.lent.remove(&buffer.id()).ok_or_else(|| {
            Error::InvalidArg(format!(
                "buffer {} is not lent by pool {}",
                buffer.id(),
                self.name
            ))
        })?;

        if state.destroyed {
            state.allocated -= 1;
        } else {
            state.free.push(lent);
            self.available.notify_one();
        }
        Ok(())
    }

    fn destroy(&self) {
        let mut state = self.state.lock();
        state.destroyed = true;
        let idle = state.free.len() as u32;
        state.free.clear();
        state.allocated -= idle;
        if !state.lent.is_empty() {
            warn!(
                pool = %self.name,
                lent = state.lent.len(),
                "pool destroyed with buffers still lent"
            );
        }
        self.available.notify_all();
    }
}
