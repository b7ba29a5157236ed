//! Round Types
//!
//! Player slots, round identity and the per-round guess record.
//! The correct coordinate lives only in [`RoundTarget`]; the client-facing
//! [`RoundView`] never carries it.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use thiserror::Error;

use crate::core::coord::Coord;
use crate::game::scoring::Score;

// =============================================================================
// PLAYER SLOTS
// =============================================================================

/// Session-scoped player role. Stable for the lifetime of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerSlot {
    /// First dequeued player.
    #[serde(rename = "player1")]
    Player1,
    /// Second dequeued player.
    #[serde(rename = "player2")]
    Player2,
}

impl PlayerSlot {
    /// Both slots in order.
    pub const ALL: [PlayerSlot; 2] = [PlayerSlot::Player1, PlayerSlot::Player2];

    /// The other slot.
    #[inline]
    pub fn opponent(self) -> Self {
        match self {
            PlayerSlot::Player1 => PlayerSlot::Player2,
            PlayerSlot::Player2 => PlayerSlot::Player1,
        }
    }

    /// Slot number as shown on the wire (1 or 2).
    #[inline]
    pub fn number(self) -> u8 {
        match self {
            PlayerSlot::Player1 => 1,
            PlayerSlot::Player2 => 2,
        }
    }

    /// Parse a slot number.
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(PlayerSlot::Player1),
            2 => Some(PlayerSlot::Player2),
            _ => None,
        }
    }
}

impl fmt::Display for PlayerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player{}", self.number())
    }
}

/// One value per player slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPair<T> {
    /// Value for player 1.
    pub player1: T,
    /// Value for player 2.
    pub player2: T,
}

impl<T> SlotPair<T> {
    /// Build from both values.
    pub const fn new(player1: T, player2: T) -> Self {
        Self { player1, player2 }
    }

    /// Apply `f` to each value.
    pub fn map<U>(self, mut f: impl FnMut(PlayerSlot, T) -> U) -> SlotPair<U> {
        SlotPair {
            player1: f(PlayerSlot::Player1, self.player1),
            player2: f(PlayerSlot::Player2, self.player2),
        }
    }

    /// Iterate `(slot, &value)` in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (PlayerSlot, &T)> {
        [(PlayerSlot::Player1, &self.player1), (PlayerSlot::Player2, &self.player2)].into_iter()
    }

    /// Both values satisfy `pred`.
    pub fn all(&self, mut pred: impl FnMut(&T) -> bool) -> bool {
        pred(&self.player1) && pred(&self.player2)
    }
}

impl<T: Clone> SlotPair<T> {
    /// Same value in both slots.
    pub fn splat(value: T) -> Self {
        Self { player1: value.clone(), player2: value }
    }
}

impl<T> Index<PlayerSlot> for SlotPair<T> {
    type Output = T;

    fn index(&self, slot: PlayerSlot) -> &T {
        match slot {
            PlayerSlot::Player1 => &self.player1,
            PlayerSlot::Player2 => &self.player2,
        }
    }
}

impl<T> IndexMut<PlayerSlot> for SlotPair<T> {
    fn index_mut(&mut self, slot: PlayerSlot) -> &mut T {
        match slot {
            PlayerSlot::Player1 => &mut self.player1,
            PlayerSlot::Player2 => &mut self.player2,
        }
    }
}

// =============================================================================
// ROUNDS
// =============================================================================

/// Opaque round identifier (16 hex chars).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(pub String);

impl RoundId {
    /// Derive a round id. `nonce` keeps ids unguessable across matches.
    pub fn generate(session_id: &[u8; 16], match_number: u32, round_number: u32, nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"CAMPUS_GUESSR_ROUND_V1");
        hasher.update(session_id);
        hasher.update(match_number.to_le_bytes());
        hasher.update(round_number.to_le_bytes());
        hasher.update(nonce.to_le_bytes());
        let hash = hasher.finalize();
        Self(hex::encode(&hash[..8]))
    }

    /// Borrow as str.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoundId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a round asks players to find. Server-side only.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundTarget {
    /// Catalog location id.
    pub location_id: String,
    /// Image reference shown to players.
    pub image_url: String,
    /// Correct answer.
    pub correct: Coord,
}

/// One accepted guess.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedGuess {
    /// Where the player clicked.
    pub coord: Coord,
    /// Base distance/points.
    pub score: Score,
    /// Time offset from round start.
    pub submitted_after: Duration,
    /// 1 for the first accepted guess of the round, 2 for the second.
    pub arrival: u8,
}

/// The active round of a session.
#[derive(Debug, Clone)]
pub struct Round {
    /// Round identifier.
    pub id: RoundId,
    /// 1-based round number within the match.
    pub number: u32,
    /// Target image and answer.
    pub target: RoundTarget,
    /// Monotonic start time for timeouts and bonuses.
    pub started_at: Instant,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
    /// Accepted guesses.
    pub guesses: SlotPair<Option<AcceptedGuess>>,
}

impl Round {
    /// Start a new round.
    pub fn new(id: RoundId, number: u32, target: RoundTarget, now: Instant) -> Self {
        Self {
            id,
            number,
            target,
            started_at: now,
            created_at: Utc::now(),
            guesses: SlotPair::default(),
        }
    }

    /// Whether `slot` has an accepted guess.
    pub fn has_submitted(&self, slot: PlayerSlot) -> bool {
        self.guesses[slot].is_some()
    }

    /// Both players have an accepted guess.
    pub fn all_submitted(&self) -> bool {
        self.guesses.all(Option::is_some)
    }

    /// Number of accepted guesses so far.
    pub fn submitted_count(&self) -> u8 {
        self.guesses.iter().filter(|(_, g)| g.is_some()).count() as u8
    }

    /// Client-safe view.
    pub fn view(&self, round_limit: u32, time_limit: Duration) -> RoundView {
        RoundView {
            round_id: self.id.clone(),
            image_id: self.target.location_id.clone(),
            image_url: self.target.image_url.clone(),
            round_number: self.number,
            round_limit,
            created_at: self.created_at.timestamp_millis(),
            time_limit_secs: time_limit.as_secs(),
        }
    }
}

/// Round data sent to clients. Never includes the correct coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundView {
    /// Round identifier (echoed back with guesses).
    pub round_id: RoundId,
    /// Location id.
    pub image_id: String,
    /// Image reference.
    pub image_url: String,
    /// 1-based round number.
    pub round_number: u32,
    /// Rounds per match.
    pub round_limit: u32,
    /// Creation timestamp (Unix ms).
    pub created_at: i64,
    /// Submission time limit in seconds.
    pub time_limit_secs: u64,
}

/// Round setup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoundError {
    /// The picked location cannot be played.
    #[error("malformed round data: {0}")]
    MalformedRoundData(String),
}
