//! # strand-storage: Durable per-stream block storage
//!
//! Each stream owns three partitions plus one row in the stream record table:
//!
//! ```text
//! es                 stream_id -> latest_snapshot_miniblock, table_suffix
//! miniblocks_<s>     seq_num -> block bytes            (gapless from 0)
//! minipools_<s>      (generation, slot_num) -> envelope (slot -1 = sentinel)
//! candidates_<s>     (seq_num, block_hash) -> block bytes
//! ```
//!
//! The life of a stream is a loop of event writes and promotions:
//!
//! ```text
//!  create ──► genesis (seq 0) + sentinel (gen 1, slot -1)
//!               │
//!   write_event(gen, slot) ──► minipools_<s> (gen, 0..n)
//!               │
//!   write_block_proposal(hash, n) ──► candidates_<s>
//!               │
//!   promote_block(gen, hash) ──► miniblocks_<s> += candidate
//!                                minipool := carryover at gen + 1
//!                                candidates <= gen purged
//! ```
//!
//! Every operation checks the invariants against stored state and rejects
//! divergence with a typed error; see [`ErrorKind`] for the tags.
//!
//! Two backends implement [`StreamStorage`]:
//! - [`SqliteStreamStore`]: persistent, transactional, guarded by a
//!   single-owner marker.
//! - [`MemoryStreamStore`]: volatile, for tests and development nodes.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use strand_types::{Hash, StreamId};

mod error;
mod memory;
mod partition;
mod pool;
mod sqlite;

pub use error::{ErrorKind, StorageError, StorageResult, Superseded};
pub use memory::MemoryStreamStore;
pub use partition::table_suffix;
pub use pool::PoolConfig;
pub use sqlite::{ExitSignal, SqliteStreamStore};

/// Stream contents from the latest snapshot onward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStreamResult {
    /// Number of the first miniblock in `miniblocks`.
    pub start_miniblock_num: u64,
    /// Number of the latest miniblock flagged as a snapshot.
    pub snapshot_miniblock_num: u64,
    /// Encoded miniblocks, consecutive from `start_miniblock_num`.
    pub miniblocks: Vec<Bytes>,
    /// Encoded minipool envelopes in slot order.
    pub minipool: Vec<Bytes>,
}

impl ReadStreamResult {
    /// Number of the last miniblock returned.
    pub fn last_miniblock_num(&self) -> u64 {
        self.start_miniblock_num + self.miniblocks.len() as u64 - 1
    }
}

/// Durable store of per-stream miniblocks, minipools and candidates.
///
/// All operations are stream-scoped and safe to call concurrently for
/// different streams. Calls for one stream are expected to be serialized by
/// the caller; the generation and slot parameters are optimistic-concurrency
/// guards, not locks.
#[async_trait]
pub trait StreamStorage: Send + Sync + Debug {
    /// Creates storage for a stream holding `genesis` as miniblock 0 and an
    /// empty minipool at generation 1.
    async fn create_stream_storage(&self, stream_id: &StreamId, genesis: Bytes)
    -> StorageResult<()>;

    /// Reads miniblocks from `max(0, snapshot - preceding)` through the
    /// latest, plus the minipool in slot order.
    async fn read_stream_from_last_snapshot(
        &self,
        stream_id: &StreamId,
        preceding: u64,
    ) -> StorageResult<ReadStreamResult>;

    /// Reads miniblocks in `[from_inclusive, to_exclusive)`, stopping at the
    /// last stored block; `u64::MAX` reads to the end.
    async fn read_miniblocks(
        &self,
        stream_id: &StreamId,
        from_inclusive: u64,
        to_exclusive: u64,
    ) -> StorageResult<Vec<Bytes>>;

    /// Appends one envelope at `expected_slot` of `expected_generation`.
    async fn write_event(
        &self,
        stream_id: &StreamId,
        expected_generation: u64,
        expected_slot: u64,
        envelope: Bytes,
    ) -> StorageResult<()>;

    /// Stores a candidate block. Storing the same hash twice is a no-op.
    async fn write_block_proposal(
        &self,
        stream_id: &StreamId,
        candidate_hash: Hash,
        block_number: u64,
        block: Bytes,
    ) -> StorageResult<()>;

    /// Reads a stored candidate.
    async fn read_miniblock_candidate(
        &self,
        stream_id: &StreamId,
        candidate_hash: Hash,
        block_number: u64,
    ) -> StorageResult<Bytes>;

    /// Atomically turns a candidate into miniblock `generation`.
    ///
    /// The old minipool is replaced by `carryover` at `generation + 1`, the
    /// snapshot pointer moves when `is_snapshot` is set and every candidate
    /// at or below `generation` for this stream is purged.
    async fn promote_block(
        &self,
        stream_id: &StreamId,
        generation: u64,
        candidate_hash: Hash,
        is_snapshot: bool,
        carryover: Vec<Bytes>,
    ) -> StorageResult<()>;

    /// Number of the last stored miniblock.
    async fn get_last_miniblock_number(&self, stream_id: &StreamId) -> StorageResult<u64>;

    /// Removes all storage for a stream.
    async fn delete_stream(&self, stream_id: &StreamId) -> StorageResult<()>;

    /// Lists every stored stream.
    async fn get_streams(&self) -> StorageResult<Vec<StreamId>>;

    /// Counts stored streams.
    async fn get_streams_number(&self) -> StorageResult<usize>;

    /// Releases this process's ownership of the store.
    async fn cleanup_storage(&self) -> StorageResult<()>;

    /// Stops background work and closes connections. Ownership is kept;
    /// call [`StreamStorage::cleanup_storage`] first to give it up.
    async fn close(&self);
}

#[cfg(test)]
mod tests;
