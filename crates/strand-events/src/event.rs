//! Events and their signed envelopes.
//!
//! An [`Envelope`] is the unit stored in a minipool slot: the encoded
//! [`StreamEvent`], the BLAKE3 hash of those bytes and an opaque signature
//! produced by the client. Signing and signature checks happen outside this
//! crate; the hash is always recomputed on parse.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strand_types::{Address, Hash, MiniblockRef};

use crate::{
    error::{StreamError, StreamResult},
    miniblock::MiniblockHeader,
};

// ============================================================================
// Event model
// ============================================================================

/// Membership change carried by a member event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipOp {
    Join,
    Leave,
}

/// What an event does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    /// A user joins or leaves the stream.
    Member { op: MembershipOp, user: Address },
    /// Opaque application content.
    Message { body: Bytes },
    /// The header of a miniblock; never stored in a minipool.
    MiniblockHeader(MiniblockHeader),
}

/// A stream event before sealing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Author of the event; `None` for miniblock headers.
    pub creator: Option<Address>,
    /// Block the author had seen when writing the event; `None` for headers.
    pub prev_miniblock: Option<MiniblockRef>,
    /// Client-side creation time in milliseconds since the epoch.
    pub created_at_ms: i64,
    pub payload: EventPayload,
}

impl StreamEvent {
    /// Builds a member event.
    pub fn member(creator: Address, prev: MiniblockRef, op: MembershipOp, user: Address) -> Self {
        Self {
            creator: Some(creator),
            prev_miniblock: Some(prev),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            payload: EventPayload::Member { op, user },
        }
    }

    /// Builds a message event.
    pub fn message(creator: Address, prev: MiniblockRef, body: impl Into<Bytes>) -> Self {
        Self {
            creator: Some(creator),
            prev_miniblock: Some(prev),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            payload: EventPayload::Message { body: body.into() },
        }
    }

    pub fn is_miniblock_header(&self) -> bool {
        matches!(self.payload, EventPayload::MiniblockHeader(_))
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A sealed event: encoded bytes, their hash and a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub hash: Hash,
    pub event: Bytes,
    pub signature: Bytes,
}

impl Envelope {
    /// Encodes `event` and computes its hash.
    pub fn seal(event: &StreamEvent, signature: Bytes) -> StreamResult<Self> {
        let encoded = Bytes::from(postcard::to_allocvec(event)?);
        Ok(Self {
            hash: hash_bytes(&encoded),
            event: encoded,
            signature,
        })
    }

    pub fn to_bytes(&self) -> StreamResult<Bytes> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }

    pub fn from_bytes(raw: &[u8]) -> StreamResult<Self> {
        Ok(postcard::from_bytes(raw)?)
    }
}

/// BLAKE3 digest of `bytes` as a [`Hash`].
pub fn hash_bytes(bytes: &[u8]) -> Hash {
    Hash::from_bytes(*blake3::hash(bytes).as_bytes())
}

// ============================================================================
// Parsed event
// ============================================================================

/// An envelope together with its decoded event and encoded form.
///
/// The encoded form is kept so that minipool carryover and storage writes
/// never re-encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    pub envelope: Envelope,
    pub event: StreamEvent,
    raw: Bytes,
}

impl ParsedEvent {
    /// Seals and parses a fresh event.
    pub fn new(event: StreamEvent, signature: Bytes) -> StreamResult<Self> {
        let envelope = Envelope::seal(&event, signature)?;
        let raw = envelope.to_bytes()?;
        Ok(Self {
            envelope,
            event,
            raw,
        })
    }

    /// Decodes an envelope, checking its declared hash.
    pub fn parse(envelope: Envelope) -> StreamResult<Self> {
        let computed = hash_bytes(&envelope.event);
        if computed != envelope.hash {
            return Err(StreamError::HashMismatch {
                declared: envelope.hash,
                computed,
            });
        }
        let event = postcard::from_bytes(&envelope.event)?;
        let raw = envelope.to_bytes()?;
        Ok(Self {
            envelope,
            event,
            raw,
        })
    }

    /// Decodes an encoded envelope.
    pub fn from_bytes(raw: &[u8]) -> StreamResult<Self> {
        Self::parse(Envelope::from_bytes(raw)?)
    }

    pub fn hash(&self) -> Hash {
        self.envelope.hash
    }

    /// The encoded envelope.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}
