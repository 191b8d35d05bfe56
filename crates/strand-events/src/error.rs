//! Stream layer error types.

use strand_storage::{ErrorKind, StorageError};
use strand_types::{Hash, StreamId};
use thiserror::Error;

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur while loading, writing or producing streams.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Error from the storage engine.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Error from the stream registry.
    #[error("registry error: {0}")]
    Registry(String),

    /// Stored or received bytes could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// An envelope's declared hash does not match its event bytes.
    #[error("envelope hash mismatch: declared {declared:?}, computed {computed:?}")]
    HashMismatch { declared: Hash, computed: Hash },

    /// An event failed validation against the current view.
    #[error("bad event for stream {stream_id}: {reason}")]
    BadEvent { stream_id: StreamId, reason: String },

    /// An event references a block that is not in the view.
    #[error("bad previous miniblock for stream {stream_id}: {reason}")]
    BadPrevMiniblockHash { stream_id: StreamId, reason: String },

    /// A miniblock does not fit the current chain.
    #[error("bad miniblock for stream {stream_id}: {reason}")]
    BadBlock { stream_id: StreamId, reason: String },

    /// A proposal was cut against a different last block.
    #[error("proposal for stream {stream_id} targets block {proposed}, view expects {expected}")]
    LastBlockMismatch {
        stream_id: StreamId,
        expected: u64,
        proposed: u64,
    },

    /// A proposal names an event the minipool no longer holds.
    #[error("event {hash:?} of proposal for stream {stream_id} is not in the minipool")]
    MinipoolMissingEvent { stream_id: StreamId, hash: Hash },

    /// The entitlement backend refused the write.
    #[error("permission denied for stream {stream_id}: {reason}")]
    PermissionDenied { stream_id: StreamId, reason: String },

    /// The stream is not placed on this node.
    #[error("stream {0} is not local to this node")]
    NotLocal(StreamId),

    /// Creation was requested for a stream that already advanced.
    #[error("stream {stream_id} is already at miniblock {last_miniblock_num}")]
    StreamPastGenesis {
        stream_id: StreamId,
        last_miniblock_num: u64,
    },

    /// Internal error (impossible states, closed channels).
    #[error("internal stream error: {0}")]
    Internal(String),
}

impl StreamError {
    pub(crate) fn bad_event(stream_id: StreamId, reason: impl Into<String>) -> Self {
        StreamError::BadEvent {
            stream_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_prev_miniblock(stream_id: StreamId, reason: impl Into<String>) -> Self {
        StreamError::BadPrevMiniblockHash {
            stream_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_block(stream_id: StreamId, reason: impl Into<String>) -> Self {
        StreamError::BadBlock {
            stream_id,
            reason: reason.into(),
        }
    }

    /// Storage tag of the underlying error, if it came from storage.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            StreamError::Storage(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// Returns true if storage reported corrupted stream data.
    pub fn is_corruption(&self) -> bool {
        self.kind() == Some(ErrorKind::MiniblocksStorageFailure)
    }
}
