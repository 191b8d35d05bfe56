//! Unit tests for strand-types

use proptest::prelude::*;
use test_case::test_case;

use crate::{
    Address, Hash, MiniblockRef, STREAM_ID_LENGTH, StreamId, StreamIdError, StreamKind,
    USER_STREAM_ID_LENGTH,
};

// ============================================================================
// StreamKind Tests
// ============================================================================

#[test_case(StreamKind::Space, 0x10; "space")]
#[test_case(StreamKind::Channel, 0x20; "channel")]
#[test_case(StreamKind::User, 0xa8; "user")]
#[test_case(StreamKind::UserSettings, 0xa5; "user settings")]
#[test_case(StreamKind::Media, 0xff; "media")]
fn prefix_round_trips(kind: StreamKind, prefix: u8) {
    assert_eq!(kind.prefix(), prefix);
    assert_eq!(StreamKind::from_prefix(prefix), Some(kind));
}

#[test]
fn prefixes_are_unique() {
    let mut prefixes: Vec<u8> = StreamKind::ALL.iter().map(|k| k.prefix()).collect();
    prefixes.sort_unstable();
    prefixes.dedup();
    assert_eq!(prefixes.len(), StreamKind::ALL.len());
}

#[test]
fn unknown_prefix_is_rejected() {
    assert_eq!(StreamKind::from_prefix(0x00), None);
    let raw = [0x01u8; STREAM_ID_LENGTH];
    assert_eq!(
        StreamId::from_bytes(&raw),
        Err(StreamIdError::UnknownPrefix(0x01))
    );
}

// ============================================================================
// StreamId Tests
// ============================================================================

#[test]
fn user_stream_id_embeds_address() {
    let user = Address::from_bytes([7u8; 20]);
    let id = StreamId::for_user(StreamKind::UserSettings, user);

    assert_eq!(id.kind(), StreamKind::UserSettings);
    assert_eq!(id.as_bytes().len(), USER_STREAM_ID_LENGTH);
    assert_eq!(&id.as_bytes()[1..], user.as_bytes());
}

#[test]
fn wrong_length_is_rejected() {
    let err = StreamId::new(StreamKind::Channel, &[1u8; 20]).unwrap_err();
    assert_eq!(
        err,
        StreamIdError::BadLength {
            kind: StreamKind::Channel,
            expected: STREAM_ID_LENGTH,
            actual: 21,
        }
    );
}

#[test]
fn empty_id_is_rejected() {
    assert_eq!(StreamId::from_bytes(&[]), Err(StreamIdError::Empty));
}

#[test]
fn stream_id_text_is_lowercase_hex() {
    let id = StreamId::new(StreamKind::Space, &[0xabu8; 31]).unwrap();
    let text = id.to_string();

    assert_eq!(text.len(), STREAM_ID_LENGTH * 2);
    assert!(text.starts_with("10abab"));
    assert_eq!(text.parse::<StreamId>().unwrap(), id);
}

#[test]
fn malformed_hex_is_rejected() {
    assert!("10zz".parse::<StreamId>().is_err());
    assert!("101".parse::<StreamId>().is_err());
    assert!("+f".parse::<StreamId>().is_err());
}

// ============================================================================
// Address and Hash Tests
// ============================================================================

#[test]
fn address_parses_with_and_without_prefix() {
    let addr = Address::from_bytes([0x11u8; 20]);
    let text = addr.to_string();

    assert!(text.starts_with("0x1111"));
    assert_eq!(text.parse::<Address>().unwrap(), addr);
    assert_eq!(text.trim_start_matches("0x").parse::<Address>().unwrap(), addr);
    assert!("0x1234".parse::<Address>().is_err());
}

#[test]
fn hash_debug_is_abbreviated() {
    let hash = Hash::from_bytes([0xcdu8; 32]);
    assert_eq!(format!("{hash:?}"), "Hash(cdcdcdcdcdcdcdcd...)");
    assert_eq!(hash.to_string().len(), 64);
}

#[test]
fn hash_from_slice_checks_length() {
    assert!(Hash::from_slice(&[0u8; 31]).is_none());
    assert_eq!(Hash::from_slice(&[9u8; 32]), Some(Hash::from_bytes([9u8; 32])));
}

#[test]
fn miniblock_ref_serializes() {
    let r = MiniblockRef::new(4, Hash::from_bytes([1u8; 32]));
    let json = serde_json::to_string(&r).unwrap();
    let back: MiniblockRef = serde_json::from_str(&json).unwrap();
    assert_eq!(back, r);
}

// ============================================================================
// Property-Based Tests
// ============================================================================

fn any_kind() -> impl Strategy<Value = StreamKind> {
    prop::sample::select(StreamKind::ALL.to_vec())
}

proptest! {
    /// Property: every well-formed id survives the text form unchanged
    #[test]
    fn prop_stream_id_text_round_trip(kind in any_kind(), body in prop::collection::vec(any::<u8>(), 31)) {
        let body = &body[..kind.id_length() - 1];
        let id = StreamId::new(kind, body).unwrap();
        let parsed: StreamId = id.to_string().parse().unwrap();
        prop_assert_eq!(parsed, id);
        prop_assert_eq!(parsed.kind(), kind);
    }

    /// Property: ids of different lengths never compare equal
    #[test]
    fn prop_user_and_space_ids_differ(byte in any::<u8>()) {
        let user = StreamId::for_user(StreamKind::User, Address::from_bytes([byte; 20]));
        let space = StreamId::new(StreamKind::Space, &[byte; 31]).unwrap();
        prop_assert_ne!(user, space);
    }
}
