//! Manager and pool configuration

use serde::{Deserialize, Serialize};

use crate::format::PixelFormat;
use crate::storage::StorageType;
use crate::target::TargetId;
use crate::Result;

/// Default per-iteration wait when a consumer blocks on readiness
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 3000;

/// Default wait for a free buffer when a pool is exhausted
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 1000;

/// Data needed to create one image buffer pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferManagerCreateData {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Buffers allocated up front when `immediate_allocation` is set, and the
    /// record count at which the target buffer manager starts recycling
    pub min_buffer_count: u32,
    /// Hard bound on allocated buffers
    pub max_buffer_count: u32,
    pub immediate_allocation: bool,
    pub storage: StorageType,
    /// How long `image_buffer` waits for a free buffer when exhausted
    pub acquire_timeout_ms: u64,
}

impl Default for BufferManagerCreateData {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::default(),
            min_buffer_count: 0,
            max_buffer_count: 8,
            immediate_allocation: false,
            storage: StorageType::default(),
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
        }
    }
}

impl BufferManagerCreateData {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            ..Default::default()
        }
    }

    pub fn with_counts(mut self, min: u32, max: u32) -> Self {
        self.min_buffer_count = min;
        self.max_buffer_count = max;
        self
    }

    pub fn with_storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_immediate_allocation(mut self, immediate: bool) -> Self {
        self.immediate_allocation = immediate;
        self
    }

    pub fn with_acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = timeout_ms;
        self
    }

    /// Bytes per buffer
    pub fn buffer_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

/// One internal-stream target and the pool that feeds it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalStreamConfig {
    pub id: TargetId,
    pub buffer_manager_name: String,
    pub create_data: BufferManagerCreateData,
}

/// Data needed to create a target buffer manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetBufferManagerConfig {
    /// Name used in every log line of this manager
    pub name: String,

    /// Metadata targets; each id must equal the metadata client id
    pub metadata_ids: Vec<TargetId>,
    pub min_meta_buffer_count: u32,

    pub internal_streams: Vec<InternalStreamConfig>,

    pub external_stream_ids: Vec<TargetId>,
    pub min_external_buffer_count: u32,
    pub max_external_buffer_count: u32,

    /// Create release/acquire fences for buffer targets
    pub fence_enabled: bool,

    /// Per-iteration timeout of blocking `get_target_buffers`
    pub wait_timeout_ms: u64,
}

impl Default for TargetBufferManagerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            metadata_ids: Vec::new(),
            min_meta_buffer_count: 0,
            internal_streams: Vec::new(),
            external_stream_ids: Vec::new(),
            min_external_buffer_count: 0,
            max_external_buffer_count: 0,
            fence_enabled: false,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
        }
    }
}

impl TargetBufferManagerConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Parse a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_metadata(mut self, id: TargetId) -> Self {
        self.metadata_ids.push(id);
        self
    }

    pub fn with_min_meta_buffer_count(mut self, min: u32) -> Self {
        self.min_meta_buffer_count = min;
        self
    }

    pub fn with_internal_stream(
        mut self,
        id: TargetId,
        buffer_manager_name: &str,
        create_data: BufferManagerCreateData,
    ) -> Self {
        self.internal_streams.push(InternalStreamConfig {
            id,
            buffer_manager_name: buffer_manager_name.to_string(),
            create_data,
        });
        self
    }

    pub fn with_external_stream(mut self, id: TargetId) -> Self {
        self.external_stream_ids.push(id);
        self
    }

    pub fn with_external_counts(mut self, min: u32, max: u32) -> Self {
        self.min_external_buffer_count = min;
        self.max_external_buffer_count = max;
        self
    }

    pub fn with_fences(mut self, enabled: bool) -> Self {
        self.fence_enabled = enabled;
        self
    }

    pub fn with_wait_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.wait_timeout_ms = timeout_ms;
        self
    }

    /// Total number of configured targets
    pub fn num_targets(&self) -> usize {
        self.metadata_ids.len() + self.internal_streams.len() + self.external_stream_ids.len()
    }
}
