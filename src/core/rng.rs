//! Deterministic Random Number Generator
//!
//! Xorshift128+ seeded through SplitMix64. Modes draw spawn points from it;
//! seeding it from the session config keeps runs reproducible.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

use super::vec3::Vec3;

/// Deterministic PRNG (Xorshift128+).
///
/// ```
/// use tickstate::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(7);
/// let mut b = DeterministicRng::new(7);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create from a 64-bit seed.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let a = splitmix64(&mut s);
        let b = splitmix64(&mut s);
        let state = if a == 0 && b == 0 { [1, 1] } else { [a, b] };
        Self { state }
    }

    /// Create from a session label and mode id.
    pub fn for_session(label: &str, mode_id: u8) -> Self {
        Self::new(derive_session_seed(label, mode_id))
    }

    /// Next 64-bit value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Integer in `[0, max)`. Returns 0 when `max` is 0.
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        (self.next_u64() % max as u64) as u32
    }

    /// Float in `[0, 1)` from the top 24 bits.
    #[inline]
    pub fn next_unit(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Float in `[min, max)`.
    #[inline]
    pub fn next_range(&mut self, min: f32, max: f32) -> f32 {
        if min >= max {
            return min;
        }
        min + (max - min) * self.next_unit()
    }

    /// Point on the horizontal disc of `radius` around `center`.
    pub fn jitter_horizontal(&mut self, center: Vec3, radius: f32) -> Vec3 {
        let x = self.next_range(-radius, radius);
        let z = self.next_range(-radius, radius);
        Vec3::new(center.x + x, center.y, center.z + z)
    }

    /// Pick an element.
    pub fn choose<'a, T>(&mut self, slice: &'a [T]) -> Option<&'a T> {
        if slice.is_empty() {
            None
        } else {
            let idx = self.next_int(slice.len() as u32) as usize;
            Some(&slice[idx])
        }
    }
}

#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Seed derived from a session label and mode id.
pub fn derive_session_seed(label: &str, mode_id: u8) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(b"TICKSTATE_SEED_V1");
    hasher.update(label.as_bytes());
    hasher.update([mode_id]);
    let hash = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(seed)
}
