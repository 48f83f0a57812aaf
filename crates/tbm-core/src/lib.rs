//! tbm - Target buffer manager for multi-stage capture pipelines

pub mod buffer;
pub mod config;
pub mod error;
pub mod fence;
pub mod format;
pub mod guard;
pub mod manager;
pub mod meta;
pub mod meta_pool;
pub mod pool;
pub mod record;
mod registry;
#[cfg(feature = "shm")]
pub mod shm;
pub mod storage;
pub mod target;

pub use buffer::{BufferData, BufferHandle};
pub use config::{BufferManagerCreateData, InternalStreamConfig, TargetBufferManagerConfig};
pub use error::{Error, Result};
pub use fence::{
    FenceCreateParams, FenceHandle, FenceInfo, FenceService, FenceStatus, FenceType,
    LocalFenceService,
};
pub use format::PixelFormat;
pub use guard::{TargetBufferHandle, TargetBufferLease};
pub use manager::{Collaborators, TargetBufferManager, TbmStats, DEFAULT_MAX_NODE};
pub use meta::{MetadataHandle, MAX_TAG_SIZE};
pub use meta_pool::{MetadataManager, MetadataPool};
pub use pool::{BufferManager, BufferManagerFactory, ImageBufferPool, PoolFactory};
pub use record::{StreamBuffer, TargetCallback, TargetPayload};
pub use storage::StorageType;
pub use target::{ListSelector, SeqId, TargetId, TargetKind, TargetStatus, MAX_TARGETS};
