//! Match Records
//!
//! The durable summary of a finished match, and the store it is handed to.
//! Once handed off, the record is no longer owned by the coordinator;
//! a failed save never unwinds what players already saw.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::info;

use crate::core::coord::Coord;
use crate::game::round::{PlayerSlot, RoundId, SlotPair};

/// One player's outcome for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRoundResult {
    /// Guess, if the player submitted before lock.
    pub guess: Option<Coord>,
    /// Distance, if the player submitted.
    pub distance: Option<f64>,
    /// Base points.
    pub points: u32,
    /// Timed-mode bonus.
    pub time_bonus: u32,
    /// Submission order (1 or 2), if submitted.
    pub arrival: Option<u8>,
}

impl PlayerRoundResult {
    /// Result for a player who did not submit.
    pub fn missed() -> Self {
        Self { guess: None, distance: None, points: 0, time_bonus: 0, arrival: None }
    }

    /// Points counted toward the total.
    pub fn total(&self) -> u32 {
        self.points + self.time_bonus
    }
}

/// One completed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundRecord {
    /// 1-based round number.
    pub round: u32,
    /// Round identifier.
    pub round_id: RoundId,
    /// Location played.
    pub location_id: String,
    /// Correct answer.
    pub correct: Coord,
    /// Per-player outcome.
    pub results: SlotPair<PlayerRoundResult>,
    /// Round was locked by timeout rather than both submissions.
    pub timed_out: bool,
    /// When the round locked.
    pub locked_at: DateTime<Utc>,
}

/// Per-player match summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSummary {
    /// Slot.
    pub slot: PlayerSlot,
    /// Display name, if given when queueing.
    pub display_name: Option<String>,
    /// Total points.
    pub total_score: u32,
}

/// A finished match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    /// Session identifier (UUID string).
    pub session_id: String,
    /// 0 for the first match of a session, +1 per rematch.
    pub match_number: u32,
    /// Always "multiplayer" for versus records.
    pub mode: String,
    /// Player summaries.
    pub players: SlotPair<PlayerSummary>,
    /// Winner, `None` on a tie.
    pub winner: Option<PlayerSlot>,
    /// Rounds in play order.
    pub rounds: Vec<RoundRecord>,
    /// When the first round started.
    pub started_at: DateTime<Utc>,
    /// When the last round locked.
    pub completed_at: DateTime<Utc>,
}

impl MatchRecord {
    /// Number of rounds played.
    pub fn round_count(&self) -> usize {
        self.rounds.len()
    }
}

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Store I/O failed.
    #[error("match store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Record could not be serialized.
    #[error("match record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Store lock poisoned.
    #[error("match store unavailable")]
    Unavailable,
}

/// Destination for finished matches.
pub trait MatchStore: Send + Sync {
    /// Persist one record. Called exactly once per finished match.
    fn save(&self, record: &MatchRecord) -> Result<(), PersistenceError>;
}

/// Store that only logs. Used when no match log is configured.
#[derive(Debug, Default)]
pub struct LogMatchStore;

impl MatchStore for LogMatchStore {
    fn save(&self, record: &MatchRecord) -> Result<(), PersistenceError> {
        info!(
            "Match {} #{} complete: {} - {} ({} rounds)",
            &record.session_id[..8.min(record.session_id.len())],
            record.match_number,
            record.players.player1.total_score,
            record.players.player2.total_score,
            record.round_count()
        );
        Ok(())
    }
}

/// Appends one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesMatchStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesMatchStore {
    /// Create a store appending to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }
}

impl MatchStore for JsonLinesMatchStore {
    fn save(&self, record: &MatchRecord) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock().map_err(|_| PersistenceError::Unavailable)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryMatchStore {
    records: Mutex<Vec<MatchRecord>>,
}

impl MemoryMatchStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all saved records.
    pub fn records(&self) -> Vec<MatchRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl MatchStore for MemoryMatchStore {
    fn save(&self, record: &MatchRecord) -> Result<(), PersistenceError> {
        self.records
            .lock()
            .map_err(|_| PersistenceError::Unavailable)?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MatchRecord {
        let now = Utc::now();
        let result = PlayerRoundResult {
            guess: Some(Coord::new(0.5, 0.5)),
            distance: Some(0.0),
            points: 1000,
            time_bonus: 0,
            arrival: Some(1),
        };
        MatchRecord {
            session_id: "2f1c9a7e-0000-4000-8000-000000000000".to_string(),
            match_number: 0,
            mode: "multiplayer".to_string(),
            players: SlotPair::new(
                PlayerSummary { slot: PlayerSlot::Player1, display_name: Some("ada".into()), total_score: 1000 },
                PlayerSummary { slot: PlayerSlot::Player2, display_name: None, total_score: 0 },
            ),
            winner: Some(PlayerSlot::Player1),
            rounds: vec![RoundRecord {
                round: 1,
                round_id: RoundId::from("00ff00ff00ff00ff"),
                location_id: "loc-1".to_string(),
                correct: Coord::new(0.5, 0.5),
                results: SlotPair::new(result, PlayerRoundResult::missed()),
                timed_out: true,
                locked_at: now,
            }],
            started_at: now,
            completed_at: now,
        }
    }

    #[test]
    fn test_missed_result() {
        let missed = PlayerRoundResult::missed();
        assert_eq!(missed.total(), 0);
        assert!(missed.guess.is_none());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryMatchStore::new();
        store.save(&record()).unwrap();
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.records()[0].winner, Some(PlayerSlot::Player1));
    }

    #[test]
    fn test_json_lines_store_appends() {
        let path = std::env::temp_dir().join(format!("campus-guessr-{}.jsonl", uuid::Uuid::new_v4()));
        let store = JsonLinesMatchStore::new(&path);
        store.save(&record()).unwrap();
        store.save(&record()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: MatchRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.round_count(), 1);
        assert!(lines[0].contains("\"totalScore\":1000"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_json_lines_store_bad_path() {
        let store = JsonLinesMatchStore::new("/nonexistent-dir/matches.jsonl");
        assert!(matches!(store.save(&record()), Err(PersistenceError::Io(_))));
    }

    #[test]
    fn test_log_store() {
        assert!(LogMatchStore.save(&record()).is_ok());
    }
}
