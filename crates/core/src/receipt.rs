//! Vote receipt hashing.
//!
//! A receipt is the BLAKE3 digest of the five vote inputs:
//! election id, voter identity, candidate id, cast timestamp and a monotonic
//! sequence number. Variable-length fields are length-prefixed so that no two
//! distinct input tuples share an encoding. The sequence number guarantees two
//! votes cast in the same millisecond never collide.

use blake3::Hasher;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Domain separation tag mixed into every receipt.
const RECEIPT_DOMAIN: &[u8] = b"votechain.receipt.v1";

/// Size of a receipt digest in bytes.
pub const RECEIPT_LEN: usize = 32;

/// 32-byte vote receipt digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiptHash([u8; RECEIPT_LEN]);

impl ReceiptHash {
    pub const fn from_bytes(bytes: [u8; RECEIPT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; RECEIPT_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, as handed to voters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Build from a byte slice of exactly [`RECEIPT_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; RECEIPT_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for ReceiptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ReceiptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReceiptHash({})", self.to_hex())
    }
}

impl FromStr for ReceiptHash {
    type Err = hex::FromHexError;

    /// Parse a hex receipt. A leading `0x` is accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut bytes = [0u8; RECEIPT_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for ReceiptHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ReceiptHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Inputs to a vote receipt.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptInput<'a> {
    pub election_id: &'a str,
    pub voter: &'a str,
    pub candidate_id: u32,
    /// Cast time (Unix epoch milliseconds)
    pub timestamp: u64,
    /// Monotonic uniqueness salt
    pub sequence: u64,
}

/// Compute the receipt hash for a vote.
pub fn compute_receipt_hash(input: &ReceiptInput<'_>) -> ReceiptHash {
    let mut hasher = Hasher::new();
    hasher.update(RECEIPT_DOMAIN);
    update_prefixed(&mut hasher, input.election_id.as_bytes());
    update_prefixed(&mut hasher, input.voter.as_bytes());
    hasher.update(&input.candidate_id.to_be_bytes());
    hasher.update(&input.timestamp.to_be_bytes());
    hasher.update(&input.sequence.to_be_bytes());
    ReceiptHash(*hasher.finalize().as_bytes())
}

fn update_prefixed(hasher: &mut Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn input<'a>(voter: &'a str, timestamp: u64, sequence: u64) -> ReceiptInput<'a> {
        ReceiptInput {
            election_id: "e1",
            voter,
            candidate_id: 1,
            timestamp,
            sequence,
        }
    }

    #[test]
    fn test_receipt_is_deterministic() {
        let a = compute_receipt_hash(&input("v1", 1_700_000_000_000, 7));
        let b = compute_receipt_hash(&input("v1", 1_700_000_000_000, 7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_same_timestamp_distinct_sequence() {
        let a = compute_receipt_hash(&input("v1", 1_700_000_000_000, 1));
        let b = compute_receipt_hash(&input("v1", 1_700_000_000_000, 2));
        assert_ne!(a, b);
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let a = compute_receipt_hash(&ReceiptInput {
            election_id: "ab",
            voter: "c",
            candidate_id: 1,
            timestamp: 0,
            sequence: 0,
        });
        let b = compute_receipt_hash(&ReceiptInput {
            election_id: "a",
            voter: "bc",
            candidate_id: 1,
            timestamp: 0,
            sequence: 0,
        });
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_parsing() {
        let hash = compute_receipt_hash(&input("v1", 1, 1));
        let text = hash.to_hex();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<ReceiptHash>().unwrap(), hash);
        assert_eq!(format!("0x{}", text).parse::<ReceiptHash>().unwrap(), hash);
        assert!("zz".parse::<ReceiptHash>().is_err());
        assert!(text[..62].parse::<ReceiptHash>().is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = compute_receipt_hash(&input("v1", 1, 1));
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: ReceiptHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    proptest! {
        #[test]
        fn prop_distinct_sequences_never_collide(ts in any::<u64>(), s1 in any::<u64>(), s2 in any::<u64>()) {
            prop_assume!(s1 != s2);
            let a = compute_receipt_hash(&input("voter", ts, s1));
            let b = compute_receipt_hash(&input("voter", ts, s2));
            prop_assert_ne!(a, b);
        }

        #[test]
        fn prop_single_bit_flip_breaks_equality(seq in any::<u64>(), byte in 0usize..32, bit in 0u8..8) {
            let hash = compute_receipt_hash(&input("voter", 42, seq));
            let mut bytes = *hash.as_bytes();
            bytes[byte] ^= 1 << bit;
            prop_assert_ne!(ReceiptHash::from_bytes(bytes), hash);
        }
    }
}
