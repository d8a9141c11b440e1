//! # Node Identifiers and the XOR Metric
//!
//! Every peer in a CrissCross overlay is named by a 32-byte [`NodeId`].
//! Identifiers exist in two forms:
//!
//! - **raw**: the id a peer announces about itself (wire form)
//! - **hashed**: `SHA3-256(raw)`, the form the routing table keys on
//!
//! Hashing the announced id before placing it in the metric space means a
//! peer cannot choose its own routing-table position directly.
//!
//! Distances are bitwise XOR interpreted as a 256-bit big-endian integer.
//! [`distance_cmp`] compares two distances lexicographically, which is the
//! same total order and is what every shortlist and bucket scan uses.
//!
//! At the human boundary (CLI arguments, config files, logs) ids are Base58
//! without a checksum.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

/// Byte length of every node, cluster, key and name identifier.
pub const ID_LEN: usize = 32;

/// Bit length of the identifier space. `bucket_index` of two equal ids.
pub const ID_BITS: usize = ID_LEN * 8;

/// A 32-byte identifier: node id (raw or hashed), cluster id, value key,
/// info hash or record name. All of them share the XOR metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// SHA3-256 of this id. Routing tables operate on hashed ids only.
    pub fn hashed(&self) -> NodeId {
        let mut hasher = Sha3_256::new();
        hasher.update(self.0);
        NodeId(hasher.finalize().into())
    }

    pub fn xor_distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut dist = [0u8; ID_LEN];
        for (i, byte) in dist.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        dist
    }

    pub fn to_base58(self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub fn from_base58(s: &str) -> Result<Self, ParseIdError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| ParseIdError::Base58)?;
        let arr: [u8; ID_LEN] = bytes.try_into().map_err(|_| ParseIdError::Length)?;
        Ok(Self(arr))
    }
}

/// Generate a fresh raw node id: 32 bytes of OS randomness, then SHA3-256.
pub fn gen_node_id() -> NodeId {
    let mut seed = [0u8; ID_LEN];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    let mut hasher = Sha3_256::new();
    hasher.update(seed);
    NodeId(hasher.finalize().into())
}

/// Number of leading bits `a` and `b` have in common, i.e. the position of
/// the first differing bit in `a XOR b`. Equal ids yield [`ID_BITS`].
///
/// Callers clamp the result to the index of their last existing bucket.
pub fn bucket_index(a: &NodeId, b: &NodeId) -> usize {
    let dist = a.xor_distance(b);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    ID_BITS
}

/// Produce a random id sharing exactly `bucket_idx` leading bits with
/// `self_id`. Used to aim refresh lookups at a particular bucket's range.
pub fn random_id_in_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    let bucket_idx = bucket_idx.min(ID_BITS - 1);

    let mut distance = [0u8; ID_LEN];
    rand::rngs::OsRng.fill_bytes(&mut distance);

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    // Force the first differing bit, keep the tail random.
    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut out = [0u8; ID_LEN];
    for i in 0..ID_LEN {
        out[i] = self_id.as_bytes()[i] ^ distance[i];
    }
    NodeId(out)
}

/// Compare two XOR distances lexicographically.
///
/// Distances are big-endian 256-bit integers, so byte-wise comparison is the
/// numeric order.
#[inline]
pub fn distance_cmp(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Order `a` and `b` by their distance to `target`, ties broken by the ids
/// themselves so the order is total.
pub fn cmp_by_distance(a: &NodeId, b: &NodeId, target: &NodeId) -> std::cmp::Ordering {
    distance_cmp(&a.xor_distance(target), &b.xor_distance(target)).then_with(|| a.0.cmp(&b.0))
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &hex::encode(self.0)[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl std::str::FromStr for NodeId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base58(s)
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; ID_LEN] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Failure to parse a Base58 identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseIdError {
    /// Input is not valid Base58.
    Base58,
    /// Decoded to something other than 32 bytes.
    Length,
}

impl std::fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseIdError::Base58 => write!(f, "invalid Base58"),
            ParseIdError::Length => write!(f, "identifier must decode to 32 bytes"),
        }
    }
}

impl std::error::Error for ParseIdError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = b;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_on_self() {
        let a = id_with_first_byte(0xAA);
        let b = id_with_first_byte(0x55);
        assert_eq!(a.xor_distance(&a), [0u8; ID_LEN]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b)[0], 0xFF);
    }

    #[test]
    fn bucket_index_finds_first_differing_bit() {
        let zero = NodeId::from_bytes([0u8; ID_LEN]);
        assert_eq!(bucket_index(&zero, &id_with_first_byte(0x80)), 0);
        assert_eq!(bucket_index(&zero, &id_with_first_byte(0x40)), 1);
        assert_eq!(bucket_index(&zero, &id_with_first_byte(0x01)), 7);

        let mut far = [0u8; ID_LEN];
        far[31] = 0x01;
        assert_eq!(bucket_index(&zero, &NodeId::from_bytes(far)), 255);
    }

    #[test]
    fn identical_ids_share_all_bits() {
        let id = gen_node_id();
        assert_eq!(bucket_index(&id, &id), ID_BITS);
    }

    #[test]
    fn random_id_lands_in_requested_bucket() {
        let self_id = gen_node_id();
        for bucket in [0usize, 1, 7, 8, 42, 200, 255] {
            let id = random_id_in_bucket(&self_id, bucket);
            assert_eq!(bucket_index(&self_id, &id), bucket, "bucket {bucket}");
        }
    }

    #[test]
    fn distance_cmp_is_lexicographic() {
        let mut lo = [0u8; ID_LEN];
        let mut hi = [0u8; ID_LEN];
        lo[1] = 1;
        hi[0] = 1;
        assert_eq!(distance_cmp(&lo, &hi), std::cmp::Ordering::Less);
        assert_eq!(distance_cmp(&hi, &lo), std::cmp::Ordering::Greater);
        assert_eq!(distance_cmp(&lo, &lo), std::cmp::Ordering::Equal);
    }

    #[test]
    fn cmp_by_distance_breaks_ties_on_id_bytes() {
        let target = NodeId::from_bytes([0u8; ID_LEN]);
        let a = id_with_first_byte(0x01);
        let b = id_with_first_byte(0x02);
        assert_eq!(cmp_by_distance(&a, &b, &target), std::cmp::Ordering::Less);
        assert_eq!(cmp_by_distance(&a, &a, &target), std::cmp::Ordering::Equal);
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = gen_node_id();
        let b = gen_node_id();
        assert_ne!(a, b);
    }

    #[test]
    fn hashed_id_is_stable_and_differs_from_raw() {
        let raw = gen_node_id();
        assert_eq!(raw.hashed(), raw.hashed());
        assert_ne!(raw.hashed(), raw);
    }

    #[test]
    fn base58_round_trip() {
        let id = gen_node_id();
        let encoded = id.to_base58();
        assert_eq!(NodeId::from_base58(&encoded).unwrap(), id);
        assert!(NodeId::from_base58("not-base58!").is_err());
        assert!(NodeId::from_base58("abc").is_err());
    }
}
