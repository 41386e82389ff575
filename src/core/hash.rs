//! Snapshot Digests
//!
//! Deterministic SHA-256 digests of snapshots, taken in navigation order.
//! Used to confirm that client and server histories agree, and by the demo
//! to print a compact fingerprint of the final session.

use sha2::{Sha256, Digest};

use super::snapshot::{navigate, Navigation, SnapshotRef};
use super::value::Value;

/// Digest output (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Incremental hasher with a domain separator.
///
/// Order of updates is part of the digest.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a hasher with a domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Hasher for full snapshots.
    pub fn for_snapshot() -> Self {
        Self::new(b"TICKSTATE_SNAPSHOT_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u8.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u32 (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an f32 by bit pattern.
    #[inline]
    pub fn update_f32(&mut self, value: f32) {
        self.hasher.update(value.to_bits().to_le_bytes());
    }

    /// Update with a typed value, tagged by kind.
    pub fn update_value(&mut self, value: &Value) {
        self.update_u8(value.kind() as u8);
        match value {
            Value::Bool(v) => self.update_u8(*v as u8),
            Value::U8(v) => self.update_u8(*v),
            Value::U16(v) => self.hasher.update(v.to_le_bytes()),
            Value::U32(v) => self.update_u32(*v),
            Value::U64(v) => self.update_u64(*v),
            Value::F32(v) => self.update_f32(*v),
            Value::Vec3(v) => {
                self.update_f32(v.x);
                self.update_f32(v.y);
                self.update_f32(v.z);
            }
            Value::Str(v) => {
                self.update_u32(v.len() as u32);
                self.update_bytes(v.as_bytes());
            }
        }
    }

    /// Update with every leaf of a view; absent leaves contribute a marker.
    ///
    /// Leaves marked local-only are skipped, so both ends of a connection
    /// produce the same digest for the same transmitted state.
    pub fn update_snapshot(&mut self, view: SnapshotRef<'_>) {
        navigate(view, |_, node, field| {
            if node.meta.local_only {
                return Navigation::SkipSubtree;
            }
            if let Some(field) = field {
                match field.get() {
                    Some(value) => {
                        self.update_u8(1);
                        self.update_value(value);
                    }
                    None => self.update_u8(0),
                }
            }
            Navigation::Continue
        });
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Digest of one snapshot view.
pub fn hash_snapshot(view: SnapshotRef<'_>) -> StateHash {
    let mut hasher = StateHasher::for_snapshot();
    hasher.update_snapshot(view);
    hasher.finalize()
}

/// Short hex prefix of a digest, for logs.
pub fn short_hex(hash: &StateHash) -> String {
    hex::encode(&hash[..6])
}
