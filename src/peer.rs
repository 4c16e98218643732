//! Peer and key primitives.
//!
//! All closeness comparisons use the Kademlia XOR metric over fixed-length
//! digests: `hash(peer_id) XOR hash(key)`, compared as a big-endian
//! unsigned integer. Identifiers themselves are opaque byte strings; only
//! their digests participate in ordering.

use serde::{Deserialize, Serialize};

/// Digest function used for XOR-metric comparisons.
///
/// Defaults to [`blake3_hasher`]. Injectable through `QueryConfig` so
/// deployments keyed on a different fixed-length hash can swap it without
/// touching the engine.
pub type KeyHasher = fn(&[u8]) -> [u8; 32];

/// Default digest: BLAKE3.
pub fn blake3_hasher(bytes: &[u8]) -> [u8; 32] {
    *blake3::hash(bytes).as_bytes()
}

/// Opaque lookup target key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = hex::encode(&self.0);
        write!(f, "Key({})", &hex[..hex.len().min(16)])
    }
}

/// Opaque identifier for a remote participant.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = self.to_hex();
        write!(f, "PeerId({})", &hex[..hex.len().min(16)])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Vec<u8>> for PeerId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for PeerId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// A peer plus zero or more network addresses supplied as dial hints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(id: PeerId) -> Self {
        Self { id, addrs: Vec::new() }
    }

    pub fn with_addrs(id: PeerId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }
}

#[inline]
pub fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Compare two XOR distances as big-endian unsigned integers.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Order two peer digests by distance to `target`.
///
/// Equal distances imply equal digests for a real hash; the lexicographic
/// tie-break keeps the order total and deterministic regardless.
#[inline]
pub(crate) fn cmp_by_distance(target: &[u8; 32], a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    distance_cmp(&xor_distance(a, target), &xor_distance(b, target)).then_with(|| a.cmp(b))
}

/// Sort peers ascending by XOR distance of their digests to `target`.
pub fn sort_closest(peers: Vec<PeerId>, target: &[u8; 32], hasher: KeyHasher) -> Vec<PeerId> {
    let mut keyed: Vec<([u8; 32], PeerId)> = peers
        .into_iter()
        .map(|peer| (hasher(peer.as_bytes()), peer))
        .collect();
    keyed.sort_by(|(a, _), (b, _)| cmp_by_distance(target, a, b));
    keyed.into_iter().map(|(_, peer)| peer).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_hasher(bytes: &[u8]) -> [u8; 32] {
        let mut out = [0u8; 32];
        let n = bytes.len().min(32);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }

    #[test]
    fn xor_distance_properties() {
        let a = [0u8; 32];
        let b = [0xFF; 32];
        assert_eq!(xor_distance(&a, &a), [0u8; 32]);
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert_eq!(xor_distance(&a, &b), [0xFF; 32]);
    }

    #[test]
    fn distance_cmp_is_big_endian() {
        let mut near = [0u8; 32];
        near[31] = 0xFF;
        let mut far = [0u8; 32];
        far[0] = 0x01;
        assert_eq!(distance_cmp(&near, &far), std::cmp::Ordering::Less);
    }

    #[test]
    fn sort_closest_orders_by_distance_to_target() {
        let target = flat_hasher(&[0x00]);
        let peers = vec![
            PeerId::new(vec![0x08]),
            PeerId::new(vec![0x01]),
            PeerId::new(vec![0x04]),
        ];
        let sorted = sort_closest(peers, &target, flat_hasher);
        assert_eq!(
            sorted,
            vec![
                PeerId::new(vec![0x01]),
                PeerId::new(vec![0x04]),
                PeerId::new(vec![0x08]),
            ]
        );
    }

    #[test]
    fn blake3_hasher_is_stable() {
        let digest = blake3_hasher(b"peer");
        assert_eq!(digest, blake3_hasher(b"peer"));
        assert_ne!(digest, blake3_hasher(b"other"));
    }
}
