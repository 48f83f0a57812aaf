//! Error types for tbm-core

use thiserror::Error;

use crate::target::{SeqId, TargetId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("unknown target id {0}")]
    UnknownTarget(TargetId),

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("no more capacity: {live} records live, max {max}")]
    NoMore { live: usize, max: u32 },

    #[error("seqId {0} not found")]
    NoSuch(SeqId),

    #[error("stale or foreign target buffer handle (seqId {0})")]
    StaleHandle(SeqId),

    #[error("operation failed: {0}")]
    Failed(String),

    #[error("timed out waiting for seqId {0}")]
    Timeout(SeqId),

    #[error("resource creation failed: {0}")]
    Resource(String),

    #[error("fence error: {0}")]
    Fence(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[cfg(feature = "shm")]
    #[error("shared memory error: {0}")]
    SharedMemory(String),
}

impl Error {
    /// True for the not-found family (`NoSuch`, stale handles).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NoSuch(_) | Error::StaleHandle(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
