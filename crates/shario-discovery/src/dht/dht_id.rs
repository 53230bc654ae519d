//! DHT keyspace identifiers and the XOR distance metric.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use shario_crypto::NodeId;
use std::fmt;

/// 256-bit identifier in the DHT keyspace.
///
/// Both node positions and content keys live in the same keyspace; a node's
/// DHT id is its node identifier bytes, a service key is a derived hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DhtId([u8; 32]);

impl DhtId {
    /// Create from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// A node's position in the keyspace.
    #[must_use]
    pub const fn from_node_id(id: &NodeId) -> Self {
        Self(*id.as_bytes())
    }

    /// Get the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to another id.
    ///
    /// Distances compare lexicographically: a smaller array is closer.
    #[must_use]
    pub fn distance(&self, other: &DhtId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bucket index for a peer at the given distance: the position of the
    /// highest set bit of the XOR distance (0..256). `None` for the distance
    /// to ourselves.
    #[must_use]
    pub fn bucket_index(&self, other: &DhtId) -> Option<usize> {
        let distance = self.distance(other);
        for (byte_idx, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return Some((31 - byte_idx) * 8 + bit);
            }
        }
        None
    }
}

impl fmt::Display for DhtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DhtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtId({})", hex::encode(&self.0[..4]))
    }
}

impl Serialize for DhtId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for DhtId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
        Ok(Self(arr))
    }
}
