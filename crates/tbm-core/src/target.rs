//! Target identifiers, kinds and per-target status

use serde::{Deserialize, Serialize};

/// Pipeline sequence id, usually a frame or request number.
pub type SeqId = u32;

/// Identifier of one named target (a metadata client id or a stream id).
pub type TargetId = u64;

/// Maximum number of targets a single manager tracks per record.
pub const MAX_TARGETS: usize = 16;

/// Kind of a configured target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Metadata object drawn from the metadata manager
    Metadata,
    /// Image buffer drawn from a per-target buffer pool (RDI, FD, ...)
    InternalBuffer,
    /// Image buffer owned by the framework and imported per sequence id
    ExternalBuffer,
}

impl TargetKind {
    /// Whether the target carries an image buffer (and may carry fences)
    pub const fn is_buffer(&self) -> bool {
        matches!(self, TargetKind::InternalBuffer | TargetKind::ExternalBuffer)
    }
}

/// Status of one target, or the aggregate status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TargetStatus {
    #[default]
    NotReady,
    Ready,
    Error,
}

impl TargetStatus {
    /// Folds per-target statuses into a record status.
    ///
    /// Any `NotReady` wins; otherwise any `Error` makes the record `Error`.
    pub fn aggregate<I>(statuses: I) -> TargetStatus
    where
        I: IntoIterator<Item = TargetStatus>,
    {
        let mut status = TargetStatus::Ready;
        for s in statuses {
            match s {
                TargetStatus::NotReady => return TargetStatus::NotReady,
                TargetStatus::Error => status = TargetStatus::Error,
                TargetStatus::Ready => {}
            }
        }
        status
    }
}

/// Selects which staging area a query looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListSelector {
    Producer,
    Consumer,
    ProducerAndConsumer,
    Import,
}
