//! Seeded Random Number Generator
//!
//! Xorshift128+ seeded per session, so a match's image order can be
//! reproduced from its session id when investigating a disputed result.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

/// Xorshift128+ PRNG.
///
/// # Example
///
/// ```
/// use campus_guessr::core::rng::DeterministicRng;
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
    /// Create a new RNG from a 64-bit seed.
    ///
    /// SplitMix64 spreads weak seeds across the internal state.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // All-zero state would lock the generator at zero
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Seed from a session id and its match number.
    pub fn for_session(session_id: &[u8; 16], match_number: u32) -> Self {
        Self::new(derive_session_seed(session_id, match_number))
    }

    /// Generate the next 64-bit random value.
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

    /// Generate a random index in range [0, max).
    #[inline]
    pub fn next_index(&mut self, max: usize) -> usize {
        if max == 0 {
            return 0;
        }
        (self.next_u64() % max as u64) as usize
    }
}

/// SplitMix64 for seed initialization.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive the picker seed for one match of a session.
///
/// Rematches bump `match_number`, so a rematch draws a fresh image order.
pub fn derive_session_seed(session_id: &[u8; 16], match_number: u32) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(b"CAMPUS_GUESSR_SEED_V1");
    hasher.update(session_id);
    hasher.update(match_number.to_le_bytes());
    let hash = hasher.finalize();

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[0..8]);
    u64::from_le_bytes(seed)
}
