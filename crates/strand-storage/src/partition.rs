//! Per-stream table naming.

use sha2::{Digest, Sha224};
use strand_types::StreamId;

/// Suffix naming a stream's partition tables.
///
/// SHA-224 of the textual id keeps names a fixed 56 hex characters, which
/// are always valid SQL identifiers.
pub fn table_suffix(stream_id: &StreamId) -> String {
    let digest = Sha224::digest(stream_id.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Names of the three partition tables of one stream.
#[derive(Debug, Clone)]
pub(crate) struct Partition {
    pub miniblocks: String,
    pub minipools: String,
    pub candidates: String,
}

impl Partition {
    pub fn from_suffix(suffix: &str) -> Self {
        Self {
            miniblocks: format!("miniblocks_{suffix}"),
            minipools: format!("minipools_{suffix}"),
            candidates: format!("candidates_{suffix}"),
        }
    }

    pub fn create_statements(&self) -> [String; 3] {
        [
            format!(
                "CREATE TABLE {} (seq_num INTEGER PRIMARY KEY, blockdata BLOB NOT NULL)",
                self.miniblocks
            ),
            format!(
                "CREATE TABLE {} (generation INTEGER NOT NULL, slot_num INTEGER NOT NULL, \
                 envelope BLOB, PRIMARY KEY (generation, slot_num))",
                self.minipools
            ),
            format!(
                "CREATE TABLE {} (seq_num INTEGER NOT NULL, block_hash BLOB NOT NULL, \
                 blockdata BLOB NOT NULL, PRIMARY KEY (seq_num, block_hash))",
                self.candidates
            ),
        ]
    }

    pub fn drop_statements(&self) -> [String; 3] {
        [
            format!("DROP TABLE IF EXISTS {}", self.miniblocks),
            format!("DROP TABLE IF EXISTS {}", self.minipools),
            format!("DROP TABLE IF EXISTS {}", self.candidates),
        ]
    }
}

#[cfg(test)]
mod tests {
    use strand_types::StreamKind;

    use super::*;

    #[test]
    fn suffix_is_stable_and_identifier_safe() {
        let id = StreamId::new(StreamKind::Channel, &[3u8; 31]).unwrap();
        let a = table_suffix(&id);
        let b = table_suffix(&id);

        assert_eq!(a, b);
        assert_eq!(a.len(), 56);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_streams_get_different_tables() {
        let a = StreamId::new(StreamKind::Channel, &[3u8; 31]).unwrap();
        let b = StreamId::new(StreamKind::Channel, &[4u8; 31]).unwrap();
        assert_ne!(table_suffix(&a), table_suffix(&b));

        let partition = Partition::from_suffix(&table_suffix(&a));
        assert!(partition.miniblocks.starts_with("miniblocks_"));
        assert!(partition.candidates.starts_with("candidates_"));
    }
}
