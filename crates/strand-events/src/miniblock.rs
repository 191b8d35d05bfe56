//! Miniblocks, headers and snapshots.

use std::collections::BTreeSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strand_types::{Address, Hash, MiniblockRef, StreamId};

use crate::{
    error::{StreamError, StreamResult},
    event::{Envelope, EventPayload, MembershipOp, ParsedEvent, StreamEvent},
};

// ============================================================================
// Snapshot
// ============================================================================

/// Per-stream settings fixed at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Skip this stream during periodic miniblock production.
    pub disable_miniblock_creation: bool,
    /// Overrides the configured snapshot threshold for this stream.
    pub min_events_per_snapshot: Option<u64>,
}

/// What a stream is, recorded once in its genesis snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inception {
    pub stream_id: StreamId,
    pub settings: StreamSettings,
}

/// Full state of a stream as of the block that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub inception: Inception,
    pub members: BTreeSet<Address>,
}

impl Snapshot {
    pub fn new(inception: Inception) -> Self {
        Self {
            inception,
            members: BTreeSet::new(),
        }
    }

    /// Folds one event into the snapshot.
    pub fn apply(&mut self, event: &StreamEvent) {
        if let EventPayload::Member { op, user } = &event.payload {
            match op {
                MembershipOp::Join => {
                    self.members.insert(*user);
                }
                MembershipOp::Leave => {
                    self.members.remove(user);
                }
            }
        }
    }
}

// ============================================================================
// Header
// ============================================================================

/// Header of a miniblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniblockHeader {
    pub miniblock_num: u64,
    /// Hash of the previous block's header event; `None` only for genesis.
    pub prev_miniblock_hash: Option<Hash>,
    pub timestamp_ms: i64,
    /// Hashes of the included events, in block order.
    pub event_hashes: Vec<Hash>,
    /// Present when this block carries a full state snapshot.
    pub snapshot: Option<Snapshot>,
    /// Number of events in the stream before this block.
    pub event_num_offset: u64,
    /// Number of the last block before this one that carries a snapshot.
    pub prev_snapshot_miniblock_num: u64,
}

/// Encoded miniblock as stored and exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Miniblock {
    pub header: Envelope,
    pub events: Vec<Envelope>,
}

// ============================================================================
// Parsed miniblock
// ============================================================================

/// A decoded miniblock.
///
/// Its hash is the hash of the header envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiniblockInfo {
    pub header_event: ParsedEvent,
    pub header: MiniblockHeader,
    pub events: Vec<ParsedEvent>,
}

impl MiniblockInfo {
    /// Seals `header` into a header event and pairs it with `events`.
    pub fn from_header_and_events(
        stream_id: StreamId,
        header: MiniblockHeader,
        events: Vec<ParsedEvent>,
    ) -> StreamResult<Self> {
        check_event_hashes(stream_id, &header, &events)?;
        let header_event = ParsedEvent::new(
            StreamEvent {
                creator: None,
                prev_miniblock: None,
                created_at_ms: header.timestamp_ms,
                payload: EventPayload::MiniblockHeader(header.clone()),
            },
            Bytes::new(),
        )?;
        Ok(Self {
            header_event,
            header,
            events,
        })
    }

    /// Decodes a stored miniblock, checking that it is block `expected_num`
    /// when given.
    pub fn from_bytes(
        stream_id: StreamId,
        raw: &[u8],
        expected_num: Option<u64>,
    ) -> StreamResult<Self> {
        let block: Miniblock = postcard::from_bytes(raw)?;
        let header_event = ParsedEvent::parse(block.header)?;
        let EventPayload::MiniblockHeader(header) = header_event.event.payload.clone() else {
            return Err(StreamError::bad_block(stream_id, "header envelope is not a header"));
        };
        if let Some(expected) = expected_num
            && header.miniblock_num != expected
        {
            return Err(StreamError::bad_block(
                stream_id,
                format!("expected block {expected}, found {}", header.miniblock_num),
            ));
        }

        let events = block
            .events
            .into_iter()
            .map(ParsedEvent::parse)
            .collect::<StreamResult<Vec<_>>>()?;
        check_event_hashes(stream_id, &header, &events)?;

        Ok(Self {
            header_event,
            header,
            events,
        })
    }

    pub fn to_bytes(&self) -> StreamResult<Bytes> {
        let block = Miniblock {
            header: self.header_event.envelope.clone(),
            events: self.events.iter().map(|e| e.envelope.clone()).collect(),
        };
        Ok(Bytes::from(postcard::to_allocvec(&block)?))
    }

    pub fn num(&self) -> u64 {
        self.header.miniblock_num
    }

    pub fn hash(&self) -> Hash {
        self.header_event.hash()
    }

    pub fn reference(&self) -> MiniblockRef {
        MiniblockRef::new(self.num(), self.hash())
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.header.snapshot.as_ref()
    }
}

fn check_event_hashes(
    stream_id: StreamId,
    header: &MiniblockHeader,
    events: &[ParsedEvent],
) -> StreamResult<()> {
    let matches = header.event_hashes.len() == events.len()
        && header
            .event_hashes
            .iter()
            .zip(events)
            .all(|(h, e)| *h == e.hash());
    if !matches {
        return Err(StreamError::bad_block(
            stream_id,
            format!(
                "header of block {} lists {} event hashes that do not match its {} events",
                header.miniblock_num,
                header.event_hashes.len(),
                events.len()
            ),
        ));
    }
    Ok(())
}

/// Builds block 0 of a new stream.
///
/// The genesis block always carries a snapshot that already includes its
/// own events.
pub fn make_genesis(
    stream_id: StreamId,
    settings: StreamSettings,
    events: Vec<ParsedEvent>,
    timestamp_ms: i64,
) -> StreamResult<MiniblockInfo> {
    let mut snapshot = Snapshot::new(Inception {
        stream_id,
        settings,
    });
    for event in &events {
        if event.event.is_miniblock_header() {
            return Err(StreamError::bad_event(stream_id, "genesis cannot contain headers"));
        }
        snapshot.apply(&event.event);
    }

    let header = MiniblockHeader {
        miniblock_num: 0,
        prev_miniblock_hash: None,
        timestamp_ms,
        event_hashes: events.iter().map(ParsedEvent::hash).collect(),
        snapshot: Some(snapshot),
        event_num_offset: 0,
        prev_snapshot_miniblock_num: 0,
    };
    MiniblockInfo::from_header_and_events(stream_id, header, events)
}
