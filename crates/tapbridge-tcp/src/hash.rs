//! Keyed hashing for initial sequence numbers and the flow lookup index.

use std::net::{IpAddr, SocketAddr};

use crate::Millis;

/// Per-process secret. Keys every hash so that neither sequence numbers nor bucket positions can
/// be predicted from outside.
#[derive(Clone)]
pub struct HashSecret([u8; 32]);

impl HashSecret {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn hash(&self, domain: u8, key: &FlowKey) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(&[domain]);
        key.feed(&mut hasher);
        hasher.finalize()
    }

    /// Bucket hash for the flow index.
    pub fn flow_hash(&self, key: &FlowKey) -> u64 {
        let bytes = self.hash(b'h', key);
        let mut out = [0u8; 8];
        out.copy_from_slice(&bytes.as_bytes()[..8]);
        u64::from_le_bytes(out)
    }

    /// Initial sequence number towards the guest: keyed hash of the flow identity plus a clock
    /// component ticking every 32ns (RFC 6528).
    pub fn isn(&self, key: &FlowKey, now_ms: Millis) -> u32 {
        let bytes = self.hash(b's', key);
        let h = prefix_u32(&bytes);
        h.wrapping_add(now_ms.wrapping_mul(31_250) as u32)
    }

    /// IPv6 flow label for segments of this flow.
    pub fn flow_label(&self, key: &FlowKey) -> u32 {
        let bytes = self.hash(b'l', key);
        prefix_u32(&bytes) & 0x000f_ffff
    }
}

fn prefix_u32(hash: &blake3::Hash) -> u32 {
    let b = hash.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

impl std::fmt::Debug for HashSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HashSecret(..)")
    }
}

/// Identity of a flow as seen from the guest: its own endpoint and the remote endpoint it talks
/// to. Both addresses are always of the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub guest: SocketAddr,
    pub remote: SocketAddr,
}

impl FlowKey {
    pub fn new(guest: SocketAddr, remote: SocketAddr) -> Self {
        Self { guest, remote }
    }

    fn feed(&self, hasher: &mut blake3::Hasher) {
        for addr in [self.guest, self.remote] {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    hasher.update(&[4]);
                    hasher.update(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    hasher.update(&[6]);
                    hasher.update(&ip.octets());
                }
            }
            hasher.update(&addr.port().to_be_bytes());
        }
    }
}

const EMPTY: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    index: u32,
    hash: u64,
}

/// Open-addressing, linear-probe index from flow hash to connection index.
///
/// The bucket count is a power of two at least `capacity / 0.7`, so a probe sequence always
/// meets an empty bucket. Removal uses backward-shift deletion, which keeps chains contiguous
/// without tombstones.
#[derive(Debug)]
pub struct FlowIndex {
    buckets: Vec<Bucket>,
    mask: usize,
}

impl FlowIndex {
    pub fn with_capacity(capacity: usize) -> Self {
        let size = (capacity.max(1) * 10 / 7 + 1).next_power_of_two();
        Self {
            buckets: vec![
                Bucket {
                    index: EMPTY,
                    hash: 0
                };
                size
            ],
            mask: size - 1,
        }
    }

    fn home(&self, hash: u64) -> usize {
        hash as usize & self.mask
    }

    pub fn insert(&mut self, hash: u64, index: u32) {
        let mut b = self.home(hash);
        while self.buckets[b].index != EMPTY {
            b = (b + 1) & self.mask;
        }
        self.buckets[b] = Bucket { index, hash };
    }

    /// Find the connection whose key matches, using `is_match` to compare candidates.
    pub fn find(&self, hash: u64, mut is_match: impl FnMut(u32) -> bool) -> Option<u32> {
        let mut b = self.home(hash);
        loop {
            let bucket = self.buckets[b];
            if bucket.index == EMPTY {
                return None;
            }
            if bucket.hash == hash && is_match(bucket.index) {
                return Some(bucket.index);
            }
            b = (b + 1) & self.mask;
        }
    }

    pub fn remove(&mut self, hash: u64, index: u32) -> bool {
        let mut b = self.home(hash);
        loop {
            let bucket = self.buckets[b];
            if bucket.index == EMPTY {
                return false;
            }
            if bucket.index == index {
                break;
            }
            b = (b + 1) & self.mask;
        }

        // Backward shift: pull later members of the chain into the hole when their home bucket
        // does not lie cyclically in (hole, candidate].
        let mut hole = b;
        let mut next = (hole + 1) & self.mask;
        loop {
            let bucket = self.buckets[next];
            if bucket.index == EMPTY {
                break;
            }
            let home = self.home(bucket.hash);
            let dist_home = next.wrapping_sub(home) & self.mask;
            let dist_hole = next.wrapping_sub(hole) & self.mask;
            if dist_home >= dist_hole {
                self.buckets[hole] = bucket;
                hole = next;
            }
            next = (next + 1) & self.mask;
        }
        self.buckets[hole] = Bucket {
            index: EMPTY,
            hash: 0,
        };
        true
    }
}
