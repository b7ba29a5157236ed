//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON object tagged by `type` with a camelCase event
//! name; payload fields sit beside the tag.

use serde::{Serialize, Deserialize};

use crate::core::coord::Coord;
use crate::game::coordinator::{GuessRejection, RoundState};
use crate::game::round::{PlayerSlot, RoundId, RoundView, SlotPair};
use crate::game::scoring::{ValidationRequest, ValidationResponse};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Enter the matchmaking queue.
    JoinQueue(JoinQueueRequest),

    /// Leave the matchmaking queue.
    LeaveQueue,

    /// Attach this connection to a session's player slot.
    Identify(SessionRef),

    /// Reattach after a dropped connection.
    RestoreSession(SessionRef),

    /// Ready to start the match.
    Ready,

    /// Submit a guess for the active round.
    #[serde(alias = "validateCoordinates")]
    SubmitGuess(GuessSubmission),

    /// Ask for the active round when no `startRound` arrived.
    RequestCurrentRound(CurrentRoundRequest),

    /// Ask for a rematch after the match ends.
    Rematch,

    /// Decline a rematch; tears the session down.
    DeclineRematch,

    /// Leave the current session.
    Leave,

    /// List matches open to spectators.
    ListMatches,

    /// Watch a match.
    Spectate(SpectateRequest),

    /// Stop watching.
    StopSpectating,

    /// Single-player coordinate validation.
    ValidateLocation(ValidationRequest),

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp.
        timestamp: u64,
    },
}

/// Queue join request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JoinQueueRequest {
    /// Optional display name.
    pub display_name: Option<String>,
}

/// Reference to a session by its durable key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    /// Durable session key issued in `queueMatched`.
    pub session_id: String,
}

/// A guess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuessSubmission {
    /// Guessed x.
    pub x: f64,
    /// Guessed y.
    pub y: f64,
    /// Round the guess targets.
    pub round_id: RoundId,
    /// Sender's session key (informational; the connection's attachment wins).
    #[serde(default)]
    pub session_id: Option<String>,
    /// Partner id (informational).
    #[serde(default)]
    pub partner_id: Option<String>,
}

impl GuessSubmission {
    /// Guess as a coordinate.
    pub fn coord(&self) -> Coord {
        Coord::new(self.x, self.y)
    }
}

/// Current round request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CurrentRoundRequest {
    /// Session key; falls back to the connection's attachment.
    pub session_id: Option<String>,
    /// Partner id (informational).
    pub partner_id: Option<String>,
}

/// Spectate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectateRequest {
    /// Match (session) id.
    pub match_id: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Waiting in queue.
    QueueJoined(QueueJoined),

    /// Left the queue.
    QueueLeft,

    /// Paired (or re-paired on reconnect).
    QueueMatched(QueueMatched),

    /// `identify` succeeded.
    SessionAttached(SessionAttached),

    /// Reply to `restoreSession`.
    RestoreResult(RestoreAck),

    /// Opponent is ready.
    PartnerReady,

    /// A new round begins.
    StartRound(RoundView),

    /// Private acknowledgment of the sender's own guess.
    GuessAccepted(GuessAccepted),

    /// Guess was not accepted; sent to the sender only.
    GuessRejected(GuessRejected),

    /// The opponent has submitted.
    OpponentSubmitted(OpponentSubmitted),

    /// Round result, sent once the round locks.
    ValidationResult(ValidationResult),

    /// Submission/score state after a reconnect.
    RestoreGameState(RestoreGameState),

    /// Reply to `requestCurrentRound`.
    CurrentRound(CurrentRound),

    /// Round could not be started or round data was malformed.
    RoundError(RoundErrorInfo),

    /// Match finished.
    MatchComplete(MatchOutcome),

    /// Rematch intents.
    RematchStatus(RematchStatus),

    /// Both players agreed to a rematch.
    RematchStarting,

    /// The opponent left or never came back.
    OpponentLeft(OpponentLeft),

    /// Matches open to spectators.
    ActiveMatches(ActiveMatches),

    /// Spectator view of a match.
    SpectatorUpdate(SpectatorView),

    /// Single-player validation result.
    LocationValidated(ValidationResponse),

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time (Unix ms).
        #[serde(rename = "serverTime")]
        server_time: u64,
    },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Reason.
        reason: String,
    },
}

/// Queue acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJoined {
    /// Entries waiting, including this one.
    pub waiting: usize,
}

/// Pairing notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMatched {
    /// Durable session key to persist for reconnects.
    pub session_id: String,
    /// Opponent's transient connection id.
    pub partner_id: String,
    /// Match (session) id shared by both players.
    pub match_id: String,
    /// This player's slot.
    pub slot: PlayerSlot,
    /// Sent as part of a restore.
    pub is_reconnect: bool,
}

/// Identify acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAttached {
    /// Session key.
    pub session_id: String,
    /// Match id.
    pub match_id: String,
    /// Slot attached.
    pub slot: PlayerSlot,
    /// Opponent currently has no live connection.
    pub opponent_pending: bool,
}

/// Restore acknowledgment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreAck {
    /// Session found and reattached.
    pub success: bool,
    /// Active round, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_data: Option<RoundView>,
    /// Restored but no round is active.
    pub no_round_data: bool,
    /// Opponent has no live connection.
    pub opponent_pending: bool,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Private guess acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuessAccepted {
    /// Round.
    pub round_id: RoundId,
    /// Own distance.
    pub distance: f64,
    /// Own base points.
    pub points: u32,
    /// Provisional timed-mode bonus.
    pub time_bonus: u32,
}

/// Guess rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuessRejected {
    /// Round id the guess carried.
    pub round_id: RoundId,
    /// Why.
    pub reason: GuessRejection,
    /// Human-readable message.
    pub message: String,
}

/// Opponent submission notice. Never carries coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpponentSubmitted {
    /// Round.
    pub round_id: RoundId,
    /// Withheld until the round locks.
    pub points: Option<u32>,
    /// Opponent submission offset from round start (timed mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_after_ms: Option<u64>,
}

/// Round result for one player.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// Round.
    pub round_id: RoundId,
    /// 1-based round number.
    pub round_number: u32,
    /// Own guess within the valid threshold.
    pub valid: bool,
    /// Own base points this round.
    pub points: u32,
    /// Own time bonus this round.
    pub time_bonus: u32,
    /// Own distance, if submitted.
    pub distance: Option<f64>,
    /// Own running total.
    pub total_points: u32,
    /// Opponent points this round (base + bonus).
    pub opponent_points: u32,
    /// Opponent running total.
    pub opponent_total_points: u32,
    /// Correct x (first reveal).
    pub correct_x: f64,
    /// Correct y (first reveal).
    pub correct_y: f64,
    /// Always true: results are only sent on lock.
    pub round_complete: bool,
    /// Locked by timeout.
    pub timed_out: bool,
    /// This was the last round.
    pub match_complete: bool,
}

/// State resent after reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreGameState {
    /// Own total.
    pub total_points: u32,
    /// Opponent total.
    pub partner_points: u32,
    /// Own guess accepted this round.
    pub has_submitted: bool,
    /// Opponent guess accepted this round.
    pub opponent_has_submitted: bool,
    /// Current round number (0 before the first round).
    pub round_number: u32,
    /// Coordinator state.
    pub state: RoundState,
}

/// Current round reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentRound {
    /// Round found.
    pub success: bool,
    /// Round data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_data: Option<RoundView>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Round error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundErrorInfo {
    /// Message.
    pub message: String,
}

/// Match outcome from one player's perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchOutcome {
    /// Winner slot, `None` on a tie.
    pub winner: Option<PlayerSlot>,
    /// Scores were equal.
    pub tie: bool,
    /// Recipient's slot.
    pub you: PlayerSlot,
    /// Recipient's total.
    pub total_points: u32,
    /// Opponent's total.
    pub opponent_points: u32,
    /// Match number within the session.
    pub match_number: u32,
}

/// Rematch intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RematchStatus {
    /// Player 1 asked.
    pub player1_requested: bool,
    /// Player 2 asked.
    pub player2_requested: bool,
}

/// Why a session ended for the remaining player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaveReason {
    /// Opponent left explicitly.
    Left,
    /// Opponent did not reconnect within the grace period.
    ReconnectTimeout,
    /// Opponent declined or abandoned the rematch.
    RematchDeclined,
    /// Opponent disconnected after the match ended.
    Disconnected,
}

/// Opponent-left notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpponentLeft {
    /// Reason.
    pub reason: LeaveReason,
}

/// Summary of a match for the spectator list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSummary {
    /// Match id.
    pub match_id: String,
    /// Display names.
    pub players: SlotPair<Option<String>>,
    /// Rounds completed.
    pub rounds_completed: u32,
    /// Rounds per match.
    pub round_limit: u32,
    /// First round has started.
    pub started: bool,
}

/// Reveal of a locked round for spectators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectatorReveal {
    /// Round number.
    pub round_number: u32,
    /// Correct answer.
    pub correct: Coord,
    /// Guesses.
    pub guesses: SlotPair<Option<Coord>>,
    /// Points this round.
    pub points: SlotPair<u32>,
}

/// Spectator view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectatorView {
    /// Match id.
    pub match_id: String,
    /// Coordinator state.
    pub state: RoundState,
    /// Active round (no answer).
    pub round: Option<RoundView>,
    /// Running totals.
    pub totals: SlotPair<u32>,
    /// Submission status.
    pub submitted: SlotPair<bool>,
    /// Most recent locked round.
    pub last_reveal: Option<SpectatorReveal>,
}

/// Spectator match list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveMatches {
    /// Matches.
    pub matches: Vec<MatchSummary>,
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    /// Frame could not be decoded.
    InvalidInput,
    /// Connection is not attached to a session.
    NotInSession,
    /// Unknown or expired session key.
    SessionNotFound,
    /// Connection already belongs to a session.
    AlreadyInSession,
    /// Unknown match id.
    MatchNotFound,
    /// Single-player validation failed.
    ValidationFailed,
    /// Rematch not possible now.
    RematchUnavailable,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

impl ServerMessage {
    /// Build an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError { code, message: message.into() })
    }

    /// Frames sent once that a client cannot ask for again in place.
    ///
    /// Losing one of these must cost the connection, not the frame.
    pub fn carries_result(&self) -> bool {
        matches!(
            self,
            ServerMessage::QueueMatched(_)
                | ServerMessage::ValidationResult(_)
                | ServerMessage::MatchComplete(_)
                | ServerMessage::OpponentLeft(_)
                | ServerMessage::LocationValidated(_)
        )
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_queue_without_payload() {
        let msg = ClientMessage::from_json(r#"{"type":"joinQueue"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::JoinQueue(JoinQueueRequest { display_name: None })));

        let msg = ClientMessage::from_json(r#"{"type":"joinQueue","displayName":"goose"}"#).unwrap();
        if let ClientMessage::JoinQueue(req) = msg {
            assert_eq!(req.display_name.as_deref(), Some("goose"));
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_submit_guess_alias() {
        let json = r#"{"type":"validateCoordinates","x":0.4,"y":0.6,"roundId":"abcd","sessionId":"s","partnerId":"7"}"#;
        match ClientMessage::from_json(json).unwrap() {
            ClientMessage::SubmitGuess(guess) => {
                assert_eq!(guess.coord(), Coord::new(0.4, 0.6));
                assert_eq!(guess.round_id, RoundId::from("abcd"));
            }
            other => panic!("Wrong message type: {:?}", other),
        }

        let json = r#"{"type":"submitGuess","x":0.1,"y":0.2,"roundId":"r1"}"#;
        assert!(matches!(ClientMessage::from_json(json).unwrap(), ClientMessage::SubmitGuess(_)));
    }

    #[test]
    fn test_submit_guess_requires_round_id() {
        let json = r#"{"type":"submitGuess","x":0.1,"y":0.2}"#;
        assert!(ClientMessage::from_json(json).is_err());
    }

    #[test]
    fn test_unit_and_struct_variants() {
        assert!(matches!(ClientMessage::from_json(r#"{"type":"ready"}"#).unwrap(), ClientMessage::Ready));
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":"ping","timestamp":5}"#).unwrap(),
            ClientMessage::Ping { timestamp: 5 }
        ));
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":"restoreSession","sessionId":"x.1"}"#).unwrap(),
            ClientMessage::RestoreSession(SessionRef { .. })
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_server_message_tags() {
        let json = ServerMessage::QueueMatched(QueueMatched {
            session_id: "abc.1".to_string(),
            partner_id: "42".to_string(),
            match_id: "abc".to_string(),
            slot: PlayerSlot::Player1,
            is_reconnect: false,
        })
        .to_json()
        .unwrap();
        assert!(json.contains("\"type\":\"queueMatched\""));
        assert!(json.contains("\"partnerId\":\"42\""));
        assert!(json.contains("\"isReconnect\":false"));
        assert!(json.contains("\"slot\":\"player1\""));

        let json = ServerMessage::Pong { timestamp: 1, server_time: 2 }.to_json().unwrap();
        assert!(json.contains("\"serverTime\":2"));
    }

    #[test]
    fn test_opponent_submitted_withholds_points() {
        let json = ServerMessage::OpponentSubmitted(OpponentSubmitted {
            round_id: RoundId::from("r"),
            points: None,
            submitted_after_ms: None,
        })
        .to_json()
        .unwrap();
        assert!(json.contains("\"points\":null"));
        assert!(!json.contains("submittedAfterMs"));
    }

    #[test]
    fn test_error_codes() {
        let json = ServerMessage::error(ErrorCode::SessionNotFound, "gone").to_json().unwrap();
        assert!(json.contains("sessionNotFound"));
        let parsed = ServerMessage::from_json(&json).unwrap();
        assert!(matches!(parsed, ServerMessage::Error(ServerError { code: ErrorCode::SessionNotFound, .. })));
    }
}
