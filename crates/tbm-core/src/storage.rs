//! Storage type definitions

use serde::{Deserialize, Serialize};

/// Where a pool places the bytes of its image buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Process-private heap allocation
    #[default]
    Heap,
    /// Named POSIX shared memory segment
    #[cfg(feature = "shm")]
    Shm,
}
