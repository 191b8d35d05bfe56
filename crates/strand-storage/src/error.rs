//! Storage error types.

use std::fmt::Display;

use strand_types::{Hash, StreamId};
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Coarse error tag shared by every backend.
///
/// Callers branch on the tag rather than on backend-specific variants: the
/// stream cache, for example, treats `AlreadyExists` from stream creation as
/// "lost the race, attach to the winner".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    BadGeneration,
    BadSlot,
    StaleBlock,
    MiniblocksStorageFailure,
    ResourceExhausted,
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::BadGeneration => "BAD_GENERATION",
            ErrorKind::BadSlot => "BAD_SLOT",
            ErrorKind::StaleBlock => "STALE_BLOCK",
            ErrorKind::MiniblocksStorageFailure => "MINIBLOCKS_STORAGE_FAILURE",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(tag)
    }
}

/// Notice that another process has taken ownership of the store.
///
/// Delivered on the exit-signal channel; the receiving process is expected
/// to shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superseded {
    /// The ownership marker this process wrote at startup.
    pub current: String,
    /// The markers found in storage instead.
    pub found: Vec<String>,
}

impl Display for Superseded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "no longer the current node (ours {}, found {:?})",
            self.current, self.found
        )
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The stream has no storage on this node.
    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    /// No candidate with this hash was proposed for the block number.
    #[error("miniblock candidate {hash} for block {block_number} of stream {stream_id} not found")]
    CandidateNotFound {
        stream_id: StreamId,
        hash: Hash,
        block_number: u64,
    },

    /// Stream storage already exists.
    #[error("stream {0} already exists")]
    AlreadyExists(StreamId),

    /// The caller's generation does not match the stored one.
    #[error("generation mismatch for stream {stream_id}: expected {expected}, actual {actual}")]
    GenerationMismatch {
        stream_id: StreamId,
        expected: u64,
        actual: u64,
    },

    /// The caller's slot does not match the next free minipool slot.
    #[error("slot mismatch for stream {stream_id}: expected {expected}, actual {actual}")]
    SlotMismatch {
        stream_id: StreamId,
        expected: u64,
        actual: u64,
    },

    /// A candidate targets a block number that is already sealed.
    #[error(
        "stale candidate for stream {stream_id}: block {block_number} is below open generation {open_generation}"
    )]
    StaleCandidate {
        stream_id: StreamId,
        block_number: u64,
        open_generation: u64,
    },

    /// Stored data violates a sequencing invariant.
    ///
    /// Never repaired automatically.
    #[error("miniblocks storage failure for stream {stream_id}: {reason}")]
    Consistency { stream_id: StreamId, reason: String },

    /// This process no longer owns the store.
    #[error("{0}")]
    Superseded(Superseded),

    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Internal error (lock poisoning, impossible states).
    #[error("internal storage error: {0}")]
    Internal(String),
}

impl StorageError {
    pub(crate) fn consistency(stream_id: StreamId, reason: impl Into<String>) -> Self {
        StorageError::Consistency {
            stream_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        StorageError::Internal(msg.into())
    }

    /// Returns the tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::StreamNotFound(_) | StorageError::CandidateNotFound { .. } => {
                ErrorKind::NotFound
            }
            StorageError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            StorageError::GenerationMismatch { .. } => ErrorKind::BadGeneration,
            StorageError::SlotMismatch { .. } => ErrorKind::BadSlot,
            StorageError::StaleCandidate { .. } => ErrorKind::StaleBlock,
            StorageError::Consistency { .. } => ErrorKind::MiniblocksStorageFailure,
            StorageError::Superseded(_) => ErrorKind::ResourceExhausted,
            StorageError::Database(_) | StorageError::Migrate(_) | StorageError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Returns true for write conflicts that a fresh transaction may resolve.
    ///
    /// SQLite reports these as `SQLITE_BUSY` or `SQLITE_LOCKED`, possibly
    /// carrying an extended code in the upper bits.
    pub fn is_transient(&self) -> bool {
        let StorageError::Database(sqlx::Error::Database(db)) = self else {
            return false;
        };
        db.code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
