//! Stream placement records.
//!
//! The registry says which nodes host a stream and where its chain stands.
//! The cache only reads from it; allocation is the registry's business.

use std::{collections::BTreeMap, sync::RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use strand_types::{Address, Hash, StreamId};

use crate::error::{StreamError, StreamResult};

/// Registry view of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub stream_id: StreamId,
    /// Hosting nodes; the first one produces blocks.
    pub nodes: Vec<Address>,
    pub last_miniblock_num: u64,
    pub last_miniblock_hash: Hash,
}

impl StreamRecord {
    pub fn is_local(&self, node: &Address) -> bool {
        self.nodes.contains(node)
    }

    pub fn first_node(&self) -> Option<Address> {
        self.nodes.first().copied()
    }
}

/// Read access to stream placement.
#[async_trait]
pub trait StreamRegistry: Send + Sync + std::fmt::Debug {
    /// Every stream known as of chain block `at_block`.
    async fn get_all_streams(&self, at_block: u64) -> StreamResult<Vec<StreamRecord>>;

    /// The record for `stream_id` together with its genesis miniblock bytes,
    /// or `None` while the stream is not allocated.
    async fn get_stream_with_genesis(
        &self,
        stream_id: &StreamId,
    ) -> StreamResult<Option<(StreamRecord, Bytes)>>;
}

#[derive(Debug, Clone)]
struct Allocation {
    record: StreamRecord,
    genesis: Bytes,
    allocated_at: u64,
}

/// Registry held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    streams: RwLock<BTreeMap<StreamId, Allocation>>,
    block: RwLock<u64>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new stream at the current chain block.
    pub fn allocate_stream(&self, record: StreamRecord, genesis: Bytes) -> StreamResult<()> {
        let allocated_at = self.current_block()?;
        let mut streams = self
            .streams
            .write()
            .map_err(|_| StreamError::Internal("registry lock poisoned".into()))?;
        if streams.contains_key(&record.stream_id) {
            return Err(StreamError::Registry(format!(
                "stream {} is already allocated",
                record.stream_id
            )));
        }
        streams.insert(
            record.stream_id,
            Allocation {
                record,
                genesis,
                allocated_at,
            },
        );
        Ok(())
    }

    /// Moves a stream's chain position forward.
    pub fn set_last_miniblock(&self, stream_id: &StreamId, num: u64, hash: Hash) -> StreamResult<()> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| StreamError::Internal("registry lock poisoned".into()))?;
        let allocation = streams
            .get_mut(stream_id)
            .ok_or_else(|| StreamError::Registry(format!("stream {stream_id} is not allocated")))?;
        allocation.record.last_miniblock_num = num;
        allocation.record.last_miniblock_hash = hash;
        Ok(())
    }

    /// Advances the chain block used to stamp new allocations.
    pub fn set_block(&self, block: u64) -> StreamResult<()> {
        *self
            .block
            .write()
            .map_err(|_| StreamError::Internal("registry lock poisoned".into()))? = block;
        Ok(())
    }

    fn current_block(&self) -> StreamResult<u64> {
        self.block
            .read()
            .map(|b| *b)
            .map_err(|_| StreamError::Internal("registry lock poisoned".into()))
    }
}

#[async_trait]
impl StreamRegistry for InMemoryRegistry {
    async fn get_all_streams(&self, at_block: u64) -> StreamResult<Vec<StreamRecord>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| StreamError::Internal("registry lock poisoned".into()))?;
        Ok(streams
            .values()
            .filter(|a| a.allocated_at <= at_block)
            .map(|a| a.record.clone())
            .collect())
    }

    async fn get_stream_with_genesis(
        &self,
        stream_id: &StreamId,
    ) -> StreamResult<Option<(StreamRecord, Bytes)>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| StreamError::Internal("registry lock poisoned".into()))?;
        Ok(streams
            .get(stream_id)
            .map(|a| (a.record.clone(), a.genesis.clone())))
    }
}
