//! Volatile stream store.
//!
//! Mirrors the checks of the SQLite backend operation for operation so that
//! the stream layer can be tested without touching disk. There is no
//! ownership marker: a memory store cannot be shared between processes.

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use async_trait::async_trait;
use bytes::Bytes;
use strand_types::{Hash, StreamId};

use crate::{
    ReadStreamResult, StreamStorage,
    error::{StorageError, StorageResult},
};

#[derive(Debug, Default)]
struct StreamData {
    snapshot_miniblock: u64,
    miniblocks: Vec<Bytes>,
    minipool_generation: u64,
    minipool: Vec<Bytes>,
    candidates: BTreeMap<(u64, Hash), Bytes>,
}

impl StreamData {
    fn open_generation(&self) -> u64 {
        self.miniblocks.len() as u64
    }
}

/// In-memory [`StreamStorage`].
#[derive(Debug, Default)]
pub struct MemoryStreamStore {
    streams: RwLock<HashMap<StreamId, StreamData>>,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(
        &self,
        stream_id: &StreamId,
        f: impl FnOnce(&StreamData) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let streams = self
            .streams
            .read()
            .map_err(|_| StorageError::internal("lock poisoned"))?;
        let data = streams
            .get(stream_id)
            .ok_or(StorageError::StreamNotFound(*stream_id))?;
        f(data)
    }

    fn write<T>(
        &self,
        stream_id: &StreamId,
        f: impl FnOnce(&mut StreamData) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| StorageError::internal("lock poisoned"))?;
        let data = streams
            .get_mut(stream_id)
            .ok_or(StorageError::StreamNotFound(*stream_id))?;
        f(data)
    }
}

#[async_trait]
impl StreamStorage for MemoryStreamStore {
    async fn create_stream_storage(
        &self,
        stream_id: &StreamId,
        genesis: Bytes,
    ) -> StorageResult<()> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| StorageError::internal("lock poisoned"))?;
        if streams.contains_key(stream_id) {
            return Err(StorageError::AlreadyExists(*stream_id));
        }
        streams.insert(
            *stream_id,
            StreamData {
                miniblocks: vec![genesis],
                minipool_generation: 1,
                ..StreamData::default()
            },
        );
        Ok(())
    }

    async fn read_stream_from_last_snapshot(
        &self,
        stream_id: &StreamId,
        preceding: u64,
    ) -> StorageResult<ReadStreamResult> {
        self.read(stream_id, |data| {
            let start = data.snapshot_miniblock.saturating_sub(preceding);
            let miniblocks: Vec<Bytes> = data
                .miniblocks
                .get(start as usize..)
                .unwrap_or_default()
                .to_vec();
            if miniblocks.is_empty() {
                return Err(StorageError::consistency(
                    *stream_id,
                    format!("no miniblocks from {start}"),
                ));
            }
            if data.minipool_generation != data.open_generation() {
                return Err(StorageError::consistency(
                    *stream_id,
                    format!(
                        "minipool generation {}, expected {}",
                        data.minipool_generation,
                        data.open_generation()
                    ),
                ));
            }
            Ok(ReadStreamResult {
                start_miniblock_num: start,
                snapshot_miniblock_num: data.snapshot_miniblock,
                miniblocks,
                minipool: data.minipool.clone(),
            })
        })
    }

    async fn read_miniblocks(
        &self,
        stream_id: &StreamId,
        from_inclusive: u64,
        to_exclusive: u64,
    ) -> StorageResult<Vec<Bytes>> {
        self.read(stream_id, |data| {
            let len = data.miniblocks.len();
            let from = usize::try_from(from_inclusive).unwrap_or(usize::MAX).min(len);
            let to = usize::try_from(to_exclusive)
                .unwrap_or(usize::MAX)
                .clamp(from, len);
            Ok(data.miniblocks[from..to].to_vec())
        })
    }

    async fn write_event(
        &self,
        stream_id: &StreamId,
        expected_generation: u64,
        expected_slot: u64,
        envelope: Bytes,
    ) -> StorageResult<()> {
        self.write(stream_id, |data| {
            if data.minipool_generation != expected_generation {
                return Err(StorageError::GenerationMismatch {
                    stream_id: *stream_id,
                    expected: expected_generation,
                    actual: data.minipool_generation,
                });
            }
            let next_slot = data.minipool.len() as u64;
            if next_slot != expected_slot {
                return Err(StorageError::SlotMismatch {
                    stream_id: *stream_id,
                    expected: expected_slot,
                    actual: next_slot,
                });
            }
            data.minipool.push(envelope);
            Ok(())
        })
    }

    async fn write_block_proposal(
        &self,
        stream_id: &StreamId,
        candidate_hash: Hash,
        block_number: u64,
        block: Bytes,
    ) -> StorageResult<()> {
        self.write(stream_id, |data| {
            let open_generation = data.open_generation();
            if block_number < open_generation {
                return Err(StorageError::StaleCandidate {
                    stream_id: *stream_id,
                    block_number,
                    open_generation,
                });
            }
            data.candidates
                .entry((block_number, candidate_hash))
                .or_insert(block);
            Ok(())
        })
    }

    async fn read_miniblock_candidate(
        &self,
        stream_id: &StreamId,
        candidate_hash: Hash,
        block_number: u64,
    ) -> StorageResult<Bytes> {
        self.read(stream_id, |data| {
            data.candidates
                .get(&(block_number, candidate_hash))
                .cloned()
                .ok_or(StorageError::CandidateNotFound {
                    stream_id: *stream_id,
                    hash: candidate_hash,
                    block_number,
                })
        })
    }

    async fn promote_block(
        &self,
        stream_id: &StreamId,
        generation: u64,
        candidate_hash: Hash,
        is_snapshot: bool,
        carryover: Vec<Bytes>,
    ) -> StorageResult<()> {
        self.write(stream_id, |data| {
            let open_generation = data.open_generation();
            if open_generation != generation {
                return Err(StorageError::GenerationMismatch {
                    stream_id: *stream_id,
                    expected: generation,
                    actual: open_generation,
                });
            }
            let block = data
                .candidates
                .get(&(generation, candidate_hash))
                .cloned()
                .ok_or(StorageError::CandidateNotFound {
                    stream_id: *stream_id,
                    hash: candidate_hash,
                    block_number: generation,
                })?;
            if data.minipool_generation != generation {
                return Err(StorageError::consistency(
                    *stream_id,
                    format!(
                        "minipool sentinel at generation {}, expected {generation}",
                        data.minipool_generation
                    ),
                ));
            }

            data.miniblocks.push(block);
            data.minipool_generation = generation + 1;
            data.minipool = carryover;
            if is_snapshot {
                data.snapshot_miniblock = generation;
            }
            data.candidates.retain(|(num, _), _| *num > generation);
            Ok(())
        })
    }

    async fn get_last_miniblock_number(&self, stream_id: &StreamId) -> StorageResult<u64> {
        self.read(stream_id, |data| Ok(data.open_generation() - 1))
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> StorageResult<()> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| StorageError::internal("lock poisoned"))?;
        streams
            .remove(stream_id)
            .map(|_| ())
            .ok_or(StorageError::StreamNotFound(*stream_id))
    }

    async fn get_streams(&self) -> StorageResult<Vec<StreamId>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| StorageError::internal("lock poisoned"))?;
        let mut ids: Vec<StreamId> = streams.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn get_streams_number(&self) -> StorageResult<usize> {
        let streams = self
            .streams
            .read()
            .map_err(|_| StorageError::internal("lock poisoned"))?;
        Ok(streams.len())
    }

    async fn cleanup_storage(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}
