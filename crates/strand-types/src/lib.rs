//! # strand-types: Core types for `Strand`
//!
//! This crate contains shared types used across the `Strand` node:
//! - Stream identity ([`StreamId`], [`StreamKind`])
//! - Node and user identity ([`Address`])
//! - Cryptographic digests ([`struct@Hash`])
//! - Block references ([`MiniblockRef`])
//!
//! Everything here is a small `Copy` value so that ids can be passed around
//! by value and used as map keys without allocation.

use std::{
    fmt::{Debug, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Hex helpers
// ============================================================================

fn write_hex(f: &mut std::fmt::Formatter<'_>, bytes: &[u8]) -> std::fmt::Result {
    for byte in bytes {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

/// Decodes a lowercase or uppercase hex string into bytes.
fn decode_hex(s: &str) -> Result<Vec<u8>, HexError> {
    if s.len() % 2 != 0 {
        return Err(HexError::OddLength(s.len()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .filter(|pair| pair.bytes().all(|b| b.is_ascii_hexdigit()))
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or(HexError::InvalidDigit(i))
        })
        .collect()
}

/// Errors produced while decoding hex text.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    /// Hex text must contain an even number of digits.
    #[error("hex string has odd length {0}")]
    OddLength(usize),

    /// A non-hex character was found at the given position.
    #[error("invalid hex digit at position {0}")]
    InvalidDigit(usize),
}

// ============================================================================
// Stream identity - Copy (fixed-capacity byte array)
// ============================================================================

/// Length of stream ids that carry a user address (prefix + 20 bytes).
pub const USER_STREAM_ID_LENGTH: usize = 1 + ADDRESS_LENGTH;

/// Length of every other stream id.
pub const STREAM_ID_LENGTH: usize = 32;

/// The kind of a stream, encoded as the first byte of its [`StreamId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    Space,
    Channel,
    DmChannel,
    GdmChannel,
    Media,
    User,
    UserDeviceKey,
    UserInbox,
    UserSettings,
    Metadata,
}

impl StreamKind {
    /// All kinds, in prefix order of declaration.
    pub const ALL: [StreamKind; 10] = [
        StreamKind::Space,
        StreamKind::Channel,
        StreamKind::DmChannel,
        StreamKind::GdmChannel,
        StreamKind::Media,
        StreamKind::User,
        StreamKind::UserDeviceKey,
        StreamKind::UserInbox,
        StreamKind::UserSettings,
        StreamKind::Metadata,
    ];

    /// Returns the single-byte prefix stored at the front of the id.
    pub fn prefix(self) -> u8 {
        match self {
            StreamKind::Space => 0x10,
            StreamKind::Channel => 0x20,
            StreamKind::DmChannel => 0x88,
            StreamKind::GdmChannel => 0x77,
            StreamKind::Media => 0xff,
            StreamKind::User => 0xa8,
            StreamKind::UserDeviceKey => 0xad,
            StreamKind::UserInbox => 0xa1,
            StreamKind::UserSettings => 0xa5,
            StreamKind::Metadata => 0xdd,
        }
    }

    /// Creates a `StreamKind` from its prefix byte.
    pub fn from_prefix(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == byte)
    }

    /// Returns true for streams owned by a single user address.
    pub fn is_user_family(self) -> bool {
        matches!(
            self,
            StreamKind::User
                | StreamKind::UserDeviceKey
                | StreamKind::UserInbox
                | StreamKind::UserSettings
        )
    }

    /// Total id length (prefix included) for this kind.
    pub fn id_length(self) -> usize {
        if self.is_user_family() {
            USER_STREAM_ID_LENGTH
        } else {
            STREAM_ID_LENGTH
        }
    }

    /// Lowercase name used in configuration tables.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Space => "space",
            StreamKind::Channel => "channel",
            StreamKind::DmChannel => "dm-channel",
            StreamKind::GdmChannel => "gdm-channel",
            StreamKind::Media => "media",
            StreamKind::User => "user",
            StreamKind::UserDeviceKey => "user-device-key",
            StreamKind::UserInbox => "user-inbox",
            StreamKind::UserSettings => "user-settings",
            StreamKind::Metadata => "metadata",
        }
    }
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while building or parsing a [`StreamId`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamIdError {
    /// The id is empty.
    #[error("stream id is empty")]
    Empty,

    /// The first byte does not name a known stream kind.
    #[error("unknown stream kind prefix 0x{0:02x}")]
    UnknownPrefix(u8),

    /// The id length does not match its kind.
    #[error("stream id for {kind} must be {expected} bytes, got {actual}")]
    BadLength {
        kind: StreamKind,
        expected: usize,
        actual: usize,
    },

    /// The textual form is not valid hex.
    #[error("invalid stream id text: {0}")]
    Hex(#[from] HexError),
}

/// Identifier of a stream.
///
/// The first byte encodes the [`StreamKind`]; the remaining bytes are either
/// a 20-byte user address (user-family kinds) or 31 opaque bytes.
/// Ids are immutable once allocated.
///
/// Unused trailing capacity is always zero, so derived equality, ordering
/// and hashing only ever see meaningful bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId {
    bytes: [u8; STREAM_ID_LENGTH],
    len: u8,
}

impl StreamId {
    /// Builds an id from a kind and its body (the bytes after the prefix).
    pub fn new(kind: StreamKind, body: &[u8]) -> Result<Self, StreamIdError> {
        let expected = kind.id_length();
        if body.len() + 1 != expected {
            return Err(StreamIdError::BadLength {
                kind,
                expected,
                actual: body.len() + 1,
            });
        }
        let mut bytes = [0u8; STREAM_ID_LENGTH];
        bytes[0] = kind.prefix();
        bytes[1..expected].copy_from_slice(body);
        Ok(Self {
            bytes,
            len: expected as u8,
        })
    }

    /// Builds the id of a user-family stream owned by `user`.
    ///
    /// # Panics
    ///
    /// Panics if `kind` is not a user-family kind.
    pub fn for_user(kind: StreamKind, user: Address) -> Self {
        assert!(kind.is_user_family(), "{kind} is not a user stream kind");
        let mut bytes = [0u8; STREAM_ID_LENGTH];
        bytes[0] = kind.prefix();
        bytes[1..USER_STREAM_ID_LENGTH].copy_from_slice(user.as_bytes());
        Self {
            bytes,
            len: USER_STREAM_ID_LENGTH as u8,
        }
    }

    /// Parses an id from its raw bytes (prefix included).
    pub fn from_bytes(raw: &[u8]) -> Result<Self, StreamIdError> {
        let (&prefix, body) = raw.split_first().ok_or(StreamIdError::Empty)?;
        let kind = StreamKind::from_prefix(prefix).ok_or(StreamIdError::UnknownPrefix(prefix))?;
        Self::new(kind, body)
    }

    /// Returns the stream kind encoded in the prefix.
    pub fn kind(&self) -> StreamKind {
        // Constructors only accept known prefixes.
        StreamKind::from_prefix(self.bytes[0]).unwrap_or(StreamKind::Metadata)
    }

    /// Returns the raw id bytes, prefix included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_hex(f, self.as_bytes())
    }
}

impl Debug for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamId({self})")
    }
}

impl FromStr for StreamId {
    type Err = StreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(&decode_hex(s)?)
    }
}

impl TryFrom<&[u8]> for StreamId {
    type Error = StreamIdError;

    fn try_from(raw: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(raw)
    }
}

// ============================================================================
// Address - Copy (20-byte node or user address)
// ============================================================================

/// Length of node and user addresses in bytes.
pub const ADDRESS_LENGTH: usize = 20;

/// A 20-byte node or user address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_LENGTH]);

    pub fn from_bytes(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        write_hex(f, &self.0)
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({self})")
    }
}

impl From<[u8; ADDRESS_LENGTH]> for Address {
    fn from(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }
}

/// Errors produced while parsing an [`Address`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must be {ADDRESS_LENGTH} bytes, got {0}")]
    BadLength(usize),

    #[error("invalid address text: {0}")]
    Hex(#[from] HexError),
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let raw = decode_hex(digits)?;
        let bytes: [u8; ADDRESS_LENGTH] = raw
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::BadLength(raw.len()))?;
        Ok(Self(bytes))
    }
}

// ============================================================================
// Cryptographic Hash - Copy (fixed 32-byte value)
// ============================================================================

/// Length of hashes in bytes (BLAKE3).
pub const HASH_LENGTH: usize = 32;

/// A 32-byte digest naming an event or a miniblock.
///
/// This type only stores the digest; computing it is the job of the event
/// codec, which hashes the encoded event bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_LENGTH]);

    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// Builds a hash from a slice, returning `None` on a length mismatch.
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        raw.try_into().ok().map(Self)
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 bytes are enough to tell hashes apart in logs
        f.write_str("Hash(")?;
        write_hex(f, &self.0[..8])?;
        f.write_str("...)")
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_hex(f, &self.0)
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Miniblock reference
// ============================================================================

/// Number and hash of a miniblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MiniblockRef {
    pub num: u64,
    pub hash: Hash,
}

impl MiniblockRef {
    pub fn new(num: u64, hash: Hash) -> Self {
        Self { num, hash }
    }
}

impl Display for MiniblockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:?}", self.num, self.hash)
    }
}

#[cfg(test)]
mod tests;
