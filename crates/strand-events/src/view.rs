//! Immutable stream views.
//!
//! A [`StreamView`] materializes the blocks from the last snapshot onward
//! plus the current minipool. Views are never mutated: adding an event or
//! applying a block returns a new view that shares block data with the old
//! one, so readers holding an `Arc<StreamView>` are never disturbed.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use bytes::Bytes;
use strand_storage::ReadStreamResult;
use strand_types::{Address, Hash, MiniblockRef, StreamId, StreamKind};

use crate::{
    error::{StreamError, StreamResult},
    event::{EventPayload, MembershipOp, ParsedEvent},
    miniblock::{MiniblockHeader, MiniblockInfo, Snapshot},
};

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for views and block production.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Blocks kept before a new snapshot, and loaded before the last one.
    pub recency_generations: u64,
    /// Snapshot threshold for kinds without an override.
    pub default_min_events_per_snapshot: u64,
    /// Per-kind snapshot thresholds.
    pub min_events_per_snapshot: HashMap<StreamKind, u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            recency_generations: 5,
            default_min_events_per_snapshot: 100,
            min_events_per_snapshot: HashMap::new(),
        }
    }
}

impl StreamConfig {
    pub fn min_events_for(&self, kind: StreamKind) -> u64 {
        self.min_events_per_snapshot
            .get(&kind)
            .copied()
            .unwrap_or(self.default_min_events_per_snapshot)
    }
}

// ============================================================================
// Proposal and stats
// ============================================================================

/// Description of the next block, cut from a view without touching storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiniblockProposal {
    pub new_miniblock_num: u64,
    pub prev_miniblock_hash: Hash,
    /// Included events, in minipool order.
    pub event_hashes: Vec<Hash>,
    pub should_snapshot: bool,
    pub timestamp_ms: i64,
}

/// Counters describing a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamViewStats {
    pub first_miniblock_num: u64,
    pub last_miniblock_num: u64,
    /// Events in loaded blocks, headers excluded.
    pub events_in_miniblocks: usize,
    pub snapshots_in_miniblocks: usize,
    pub events_in_minipool: usize,
    /// Events in the whole stream history, headers excluded.
    pub total_events_ever: u64,
}

/// Outcome of validating an incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// The event is new and may be appended.
    Append,
    /// The event is already in the view; adding it again is a no-op.
    Duplicate,
}

// ============================================================================
// Minipool
// ============================================================================

#[derive(Debug, Clone)]
struct Minipool {
    generation: u64,
    event_num_offset: u64,
    events: Vec<Arc<ParsedEvent>>,
    index: HashSet<Hash>,
}

impl Minipool {
    fn new(generation: u64, event_num_offset: u64, events: Vec<Arc<ParsedEvent>>) -> Self {
        let index = events.iter().map(|e| e.hash()).collect();
        Self {
            generation,
            event_num_offset,
            events,
            index,
        }
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.index.contains(hash)
    }
}

// ============================================================================
// View
// ============================================================================

/// Read-only materialization of a stream's recent state.
#[derive(Debug, Clone)]
pub struct StreamView {
    stream_id: StreamId,
    blocks: Vec<Arc<MiniblockInfo>>,
    minipool: Minipool,
    snapshot: Arc<Snapshot>,
    /// Index into `blocks` of the latest block carrying a snapshot.
    snapshot_index: usize,
}

impl StreamView {
    /// Replays stored blocks and minipool into a view.
    pub fn from_stored(stream_id: StreamId, stored: &ReadStreamResult) -> StreamResult<Self> {
        if stored.miniblocks.is_empty() {
            return Err(StreamError::bad_block(stream_id, "no blocks"));
        }

        let mut blocks = Vec::with_capacity(stored.miniblocks.len());
        let mut snapshot_index = None;
        for (i, raw) in stored.miniblocks.iter().enumerate() {
            let expected = stored.start_miniblock_num + i as u64;
            let block = MiniblockInfo::from_bytes(stream_id, raw, Some(expected))?;
            if let Some(prev) = blocks.last().map(|b: &Arc<MiniblockInfo>| b.hash())
                && block.header.prev_miniblock_hash != Some(prev)
            {
                return Err(StreamError::bad_block(
                    stream_id,
                    format!("stored block {expected} does not link to block {}", expected - 1),
                ));
            }
            if block.snapshot().is_some() {
                snapshot_index = Some(i);
            }
            blocks.push(Arc::new(block));
        }
        let (snapshot_index, snapshot) = snapshot_index
            .and_then(|i| blocks[i].snapshot().map(|s| (i, Arc::new(s.clone()))))
            .ok_or_else(|| StreamError::bad_block(stream_id, "no snapshot"))?;
        if snapshot.inception.stream_id != stream_id {
            return Err(StreamError::bad_block(
                stream_id,
                format!("snapshot names stream {}", snapshot.inception.stream_id),
            ));
        }

        let mut events = Vec::with_capacity(stored.minipool.len());
        let mut seen = HashSet::with_capacity(stored.minipool.len());
        for raw in &stored.minipool {
            let event = ParsedEvent::from_bytes(raw)?;
            if !seen.insert(event.hash()) {
                return Err(StreamError::bad_event(
                    stream_id,
                    format!("duplicate event {:?} in stored minipool", event.hash()),
                ));
            }
            events.push(Arc::new(event));
        }

        let last = &blocks[blocks.len() - 1];
        let minipool = Minipool::new(
            last.num() + 1,
            last.header.event_num_offset + last.events.len() as u64,
            events,
        );

        Ok(Self {
            stream_id,
            blocks,
            minipool,
            snapshot,
            snapshot_index,
        })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn last_block(&self) -> &MiniblockInfo {
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn last_miniblock_ref(&self) -> MiniblockRef {
        self.last_block().reference()
    }

    pub fn last_miniblock_hash(&self) -> Hash {
        self.last_block().hash()
    }

    /// The most recent user event, from the minipool or else the loaded blocks.
    pub fn last_event(&self) -> Option<&ParsedEvent> {
        self.minipool
            .events
            .last()
            .map(|e| &**e)
            .or_else(|| self.blocks.iter().rev().find_map(|b| b.events.last()))
    }

    pub fn blocks(&self) -> &[Arc<MiniblockInfo>] {
        &self.blocks
    }

    /// Blocks from the latest snapshot onward.
    pub fn miniblocks_from_last_snapshot(&self) -> &[Arc<MiniblockInfo>] {
        &self.blocks[self.snapshot_index..]
    }

    /// The latest snapshot in the view.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Generation the minipool will become.
    pub fn generation(&self) -> u64 {
        self.minipool.generation
    }

    pub fn minipool_len(&self) -> usize {
        self.minipool.events.len()
    }

    pub fn minipool_events(&self) -> impl Iterator<Item = &ParsedEvent> {
        self.minipool.events.iter().map(|e| &**e)
    }

    /// Encoded minipool envelopes, in slot order.
    pub fn minipool_envelopes(&self) -> Vec<Bytes> {
        self.minipool.events.iter().map(|e| e.raw().clone()).collect()
    }

    /// Whether `user` is a member as of the latest event in the view.
    pub fn is_member(&self, user: &Address) -> bool {
        let mut member = self.snapshot().members.contains(user);
        for event in self.events_after_snapshot() {
            if let EventPayload::Member { op, user: u } = &event.event.payload
                && u == user
            {
                member = *op == MembershipOp::Join;
            }
        }
        member
    }

    /// Current members, with events after the latest snapshot applied.
    pub fn members(&self) -> BTreeSet<Address> {
        let mut snapshot = self.snapshot().clone();
        for event in self.events_after_snapshot() {
            snapshot.apply(&event.event);
        }
        snapshot.members
    }

    fn events_after_snapshot(&self) -> impl Iterator<Item = &ParsedEvent> {
        self.blocks[self.snapshot_index + 1..]
            .iter()
            .flat_map(|b| b.events.iter())
            .chain(self.minipool_events())
    }

    pub fn stats(&self) -> StreamViewStats {
        let events_in_miniblocks = self.blocks.iter().map(|b| b.events.len()).sum();
        let snapshots_in_miniblocks = self
            .blocks
            .iter()
            .filter(|b| b.snapshot().is_some())
            .count();

        StreamViewStats {
            first_miniblock_num: self.blocks[0].num(),
            last_miniblock_num: self.last_block().num(),
            events_in_miniblocks,
            snapshots_in_miniblocks,
            events_in_minipool: self.minipool_len(),
            total_events_ever: self.minipool.event_num_offset + self.minipool_len() as u64,
        }
    }

    /// Whether the next block should carry a snapshot.
    pub fn should_snapshot(&self, config: &StreamConfig) -> bool {
        let min_events = self
            .snapshot()
            .inception
            .settings
            .min_events_per_snapshot
            .unwrap_or_else(|| config.min_events_for(self.stream_id.kind()));

        let mut count = self.minipool_len() as u64;
        if count >= min_events {
            return true;
        }
        for block in self.blocks.iter().rev() {
            if block.snapshot().is_some() {
                break;
            }
            count += block.events.len() as u64;
            if count >= min_events {
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// Checks that `event` may be appended to this view.
    ///
    /// The event must reference a loaded block by number and hash. An event
    /// already present after that block, or in the minipool, is reported as
    /// [`EventDisposition::Duplicate`].
    pub fn validate_next_event(&self, event: &ParsedEvent) -> StreamResult<EventDisposition> {
        if event.event.is_miniblock_header() {
            return Err(StreamError::bad_event(
                self.stream_id,
                "miniblock headers cannot be added as events",
            ));
        }
        let prev = event.event.prev_miniblock.ok_or_else(|| {
            StreamError::bad_event(self.stream_id, "event does not reference a miniblock")
        })?;

        let first = self.blocks[0].num();
        let last = self.last_block().num();
        if prev.num > last {
            return Err(StreamError::bad_prev_miniblock(
                self.stream_id,
                format!("references block {} beyond last block {last}", prev.num),
            ));
        }
        if prev.num < first {
            return Err(StreamError::bad_prev_miniblock(
                self.stream_id,
                format!("references block {} older than first loaded block {first}", prev.num),
            ));
        }
        let found_at = (prev.num - first) as usize;
        if self.blocks[found_at].hash() != prev.hash {
            return Err(StreamError::bad_prev_miniblock(
                self.stream_id,
                format!("hash {:?} does not match block {}", prev.hash, prev.num),
            ));
        }

        let hash = event.hash();
        let in_later_block = self.blocks[found_at + 1..]
            .iter()
            .any(|b| b.header.event_hashes.contains(&hash));
        if in_later_block || self.minipool.contains(&hash) {
            return Ok(EventDisposition::Duplicate);
        }
        Ok(EventDisposition::Append)
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Returns a view with `event` appended to the minipool.
    pub fn with_event(&self, event: ParsedEvent) -> StreamResult<Self> {
        if event.event.is_miniblock_header() {
            return Err(StreamError::bad_event(
                self.stream_id,
                "miniblock headers cannot be added as events",
            ));
        }
        if self.minipool.contains(&event.hash()) {
            return Err(StreamError::bad_event(
                self.stream_id,
                format!("duplicate event {:?}", event.hash()),
            ));
        }

        let mut minipool = self.minipool.clone();
        minipool.index.insert(event.hash());
        minipool.events.push(Arc::new(event));
        Ok(Self {
            stream_id: self.stream_id,
            blocks: self.blocks.clone(),
            minipool,
            snapshot: Arc::clone(&self.snapshot),
            snapshot_index: self.snapshot_index,
        })
    }

    /// Cuts a proposal covering the whole minipool.
    ///
    /// The timestamp is strictly after the last block's so that block time
    /// never goes backwards even when clocks disagree.
    pub fn propose_next_miniblock(
        &self,
        config: &StreamConfig,
        force_snapshot: bool,
        now_ms: i64,
    ) -> MiniblockProposal {
        MiniblockProposal {
            new_miniblock_num: self.minipool.generation,
            prev_miniblock_hash: self.last_block().hash(),
            event_hashes: self.minipool.events.iter().map(|e| e.hash()).collect(),
            should_snapshot: force_snapshot || self.should_snapshot(config),
            timestamp_ms: now_ms.max(self.last_block().header.timestamp_ms + 1),
        }
    }

    /// Builds the block described by `proposal`.
    ///
    /// Output depends only on the view and the proposal, so every replica
    /// holding the same view produces the same header bytes.
    pub fn make_miniblock_header(&self, proposal: &MiniblockProposal) -> StreamResult<MiniblockInfo> {
        let last = self.last_block();
        if proposal.new_miniblock_num != self.minipool.generation
            || proposal.prev_miniblock_hash != last.hash()
        {
            return Err(StreamError::LastBlockMismatch {
                stream_id: self.stream_id,
                expected: self.minipool.generation,
                proposed: proposal.new_miniblock_num,
            });
        }

        let events = proposal
            .event_hashes
            .iter()
            .map(|hash| {
                self.minipool
                    .events
                    .iter()
                    .find(|e| e.hash() == *hash)
                    .map(|e| (**e).clone())
                    .ok_or(StreamError::MinipoolMissingEvent {
                        stream_id: self.stream_id,
                        hash: *hash,
                    })
            })
            .collect::<StreamResult<Vec<_>>>()?;

        let snapshot = proposal.should_snapshot.then(|| {
            let mut snapshot = self.snapshot().clone();
            for block in &self.blocks[self.snapshot_index + 1..] {
                for event in &block.events {
                    snapshot.apply(&event.event);
                }
            }
            for event in &events {
                snapshot.apply(&event.event);
            }
            snapshot
        });

        let prev_snapshot_miniblock_num = if last.snapshot().is_some() {
            last.num()
        } else {
            last.header.prev_snapshot_miniblock_num
        };

        let header = MiniblockHeader {
            miniblock_num: last.num() + 1,
            prev_miniblock_hash: Some(last.hash()),
            timestamp_ms: proposal.timestamp_ms,
            event_hashes: proposal.event_hashes.clone(),
            snapshot,
            event_num_offset: last.header.event_num_offset + last.events.len() as u64,
            prev_snapshot_miniblock_num,
        };
        MiniblockInfo::from_header_and_events(self.stream_id, header, events)
    }

    /// Returns a view with `block` appended.
    ///
    /// Minipool events not included in the block stay in the new minipool
    /// in their original order. When the block carries a snapshot, only the
    /// `recency_generations` blocks before it are kept.
    pub fn with_block(&self, block: Arc<MiniblockInfo>, config: &StreamConfig) -> StreamResult<Self> {
        let last = self.last_block();
        if block.num() != last.num() + 1 {
            return Err(StreamError::bad_block(
                self.stream_id,
                format!("expected block {}, got {}", last.num() + 1, block.num()),
            ));
        }
        if block.header.prev_miniblock_hash != Some(last.hash()) {
            return Err(StreamError::bad_block(
                self.stream_id,
                format!(
                    "block {} does not follow {:?}",
                    block.num(),
                    last.hash()
                ),
            ));
        }

        let included: HashSet<Hash> = block.header.event_hashes.iter().copied().collect();
        let remaining: Vec<Arc<ParsedEvent>> = self
            .minipool
            .events
            .iter()
            .filter(|e| !included.contains(&e.hash()))
            .cloned()
            .collect();

        let (start, snapshot_index, snapshot) = match block.snapshot() {
            Some(snapshot) => {
                let start = self
                    .blocks
                    .len()
                    .saturating_sub(config.recency_generations as usize);
                (start, self.blocks.len() - start, Arc::new(snapshot.clone()))
            }
            None => (0, self.snapshot_index, Arc::clone(&self.snapshot)),
        };

        let minipool = Minipool::new(
            block.num() + 1,
            block.header.event_num_offset + block.events.len() as u64,
            remaining,
        );
        let mut blocks = self.blocks[start..].to_vec();
        blocks.push(block);

        Ok(Self {
            stream_id: self.stream_id,
            blocks,
            minipool,
            snapshot,
            snapshot_index,
        })
    }
}
