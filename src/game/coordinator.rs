//! Round Coordinator
//!
//! Authoritative state machine for one session's matches:
//!
//! ```text
//! AwaitingStart --both ready--> RoundActive --both guessed / timeout--> RoundLocked
//!      ^                                                                    |
//!      +------------------ intermission ----------------- RoundComplete <---+
//!                                                              |
//!                                               round limit -> MatchComplete --rematch--> AwaitingStart
//! ```
//!
//! The coordinator never touches sockets or timers. Every transition
//! returns a list of [`Effect`]s which the owning session task carries
//! out in order. Time is passed in, so the whole machine is testable
//! without a runtime.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::coord::Coord;
use crate::core::rng::DeterministicRng;
use crate::game::catalog::{LocationCatalog, RoundPicker};
use crate::game::record::{MatchRecord, PlayerRoundResult, PlayerSummary, RoundRecord};
use crate::game::round::{AcceptedGuess, PlayerSlot, Round, RoundId, RoundView, SlotPair};
use crate::game::scoring::{self, VALID_THRESHOLD};
use crate::network::protocol::{
    GuessAccepted, LeaveReason, MatchOutcome, MatchSummary, OpponentSubmitted, RematchStatus,
    RoundErrorInfo, RestoreGameState, ServerMessage, SpectatorReveal, SpectatorView,
    ValidationResult,
};
use crate::network::session::SessionError;

/// Match rules.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Rounds per match.
    pub round_limit: u32,
    /// Time allowed to submit before the round locks.
    pub round_timeout: Duration,
    /// Pause between a locked round and the next one.
    pub intermission: Duration,
    /// Award time bonuses.
    pub timed_mode: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            round_limit: 5,
            round_timeout: Duration::from_secs(60),
            intermission: Duration::from_secs(5),
            timed_mode: false,
        }
    }
}

/// Coordinator state.
#[derive(Debug, Clone)]
pub enum RoundPhase {
    /// Waiting for both players to be ready (or for the intermission to end).
    AwaitingStart {
        /// Ready flags.
        ready: SlotPair<bool>,
    },
    /// Accepting guesses.
    RoundActive(Round),
    /// No more guesses; results are being settled.
    RoundLocked(Round),
    /// Results settled, next step not yet decided.
    RoundComplete,
    /// Round limit reached.
    MatchComplete {
        /// Rematch intents.
        rematch: SlotPair<bool>,
    },
}

/// Observable state name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoundState {
    /// See [`RoundPhase::AwaitingStart`].
    AwaitingStart,
    /// See [`RoundPhase::RoundActive`].
    RoundActive,
    /// See [`RoundPhase::RoundLocked`].
    RoundLocked,
    /// See [`RoundPhase::RoundComplete`].
    RoundComplete,
    /// See [`RoundPhase::MatchComplete`].
    MatchComplete,
}

impl RoundPhase {
    /// State name.
    pub fn state(&self) -> RoundState {
        match self {
            RoundPhase::AwaitingStart { .. } => RoundState::AwaitingStart,
            RoundPhase::RoundActive(_) => RoundState::RoundActive,
            RoundPhase::RoundLocked(_) => RoundState::RoundLocked,
            RoundPhase::RoundComplete => RoundState::RoundComplete,
            RoundPhase::MatchComplete { .. } => RoundState::MatchComplete,
        }
    }
}

/// Why a guess was not accepted. Rejections never mutate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GuessRejection {
    /// No round is accepting guesses.
    #[error("no active round")]
    NoActiveRound,
    /// Guess targets a round other than the active one.
    #[error("guess targets a stale round")]
    StaleRound,
    /// Player already has an accepted guess this round.
    #[error("already submitted this round")]
    AlreadySubmitted,
    /// Coordinate is not finite or lies outside the map.
    #[error("coordinate outside map bounds")]
    InvalidCoordinate,
}

/// Who receives a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// One player.
    Player(PlayerSlot),
    /// Both players.
    Both,
    /// Everyone watching the match.
    Spectators,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Deliver a message.
    Send {
        /// Recipient.
        to: Recipient,
        /// Message.
        message: ServerMessage,
    },
    /// Lock `round_id` after `after` unless both guesses arrive first.
    ArmRoundTimer {
        /// Round the timer belongs to.
        round_id: RoundId,
        /// Delay.
        after: Duration,
    },
    /// Drop any pending round timer.
    CancelRoundTimer,
    /// Call [`RoundCoordinator::begin_round`] after `after`.
    ScheduleRoundStart {
        /// Delay.
        after: Duration,
    },
    /// Hand a finished match to the store.
    Persist(Box<MatchRecord>),
    /// End the session.
    Teardown {
        /// Player to tell, if any.
        notify: Option<PlayerSlot>,
        /// Reason given to them.
        reason: LeaveReason,
    },
}

impl Effect {
    fn send(to: Recipient, message: ServerMessage) -> Self {
        Effect::Send { to, message }
    }
}

/// Round coordinator for one session.
pub struct RoundCoordinator {
    session_id: Uuid,
    config: MatchConfig,
    phase: RoundPhase,
    match_number: u32,
    rounds_completed: u32,
    totals: SlotPair<u32>,
    history: Vec<RoundRecord>,
    display_names: SlotPair<Option<String>>,
    picker: RoundPicker,
    started_at: Option<DateTime<Utc>>,
    record_handed_off: bool,
}

impl RoundCoordinator {
    /// Create a coordinator waiting for both players to be ready.
    pub fn new(session_id: Uuid, config: MatchConfig, display_names: SlotPair<Option<String>>) -> Self {
        Self {
            session_id,
            config,
            phase: RoundPhase::AwaitingStart { ready: SlotPair::splat(false) },
            match_number: 0,
            rounds_completed: 0,
            totals: SlotPair::default(),
            history: Vec::new(),
            display_names,
            picker: RoundPicker::new(DeterministicRng::for_session(session_id.as_bytes(), 0)),
            started_at: None,
            record_handed_off: false,
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Current phase.
    pub fn phase(&self) -> &RoundPhase {
        &self.phase
    }

    /// Current state name.
    pub fn state(&self) -> RoundState {
        self.phase.state()
    }

    /// Match rules.
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// 0 for the first match, +1 per rematch.
    pub fn match_number(&self) -> u32 {
        self.match_number
    }

    /// Rounds locked in the current match.
    pub fn rounds_completed(&self) -> u32 {
        self.rounds_completed
    }

    /// Running totals.
    pub fn totals(&self) -> SlotPair<u32> {
        self.totals
    }

    /// Locked rounds of the current match.
    pub fn history(&self) -> &[RoundRecord] {
        &self.history
    }

    /// Both players are ready and a round may start.
    pub fn start_pending(&self) -> bool {
        matches!(&self.phase, RoundPhase::AwaitingStart { ready } if ready.all(|r| *r))
    }

    /// Round number shown to clients (0 before the first round).
    pub fn round_number(&self) -> u32 {
        match &self.phase {
            RoundPhase::RoundActive(round) | RoundPhase::RoundLocked(round) => round.number,
            _ => self.rounds_completed,
        }
    }

    /// Client view of the active round.
    pub fn current_round(&self) -> Option<RoundView> {
        match &self.phase {
            RoundPhase::RoundActive(round) => {
                Some(round.view(self.config.round_limit, self.config.round_timeout))
            }
            _ => None,
        }
    }

    /// Active round id.
    pub fn current_round_id(&self) -> Option<&RoundId> {
        match &self.phase {
            RoundPhase::RoundActive(round) => Some(&round.id),
            _ => None,
        }
    }

    /// Score/submission state for a reconnecting player.
    pub fn snapshot_for(&self, slot: PlayerSlot) -> RestoreGameState {
        let (has_submitted, opponent_has_submitted) = match &self.phase {
            RoundPhase::RoundActive(round) | RoundPhase::RoundLocked(round) => {
                (round.has_submitted(slot), round.has_submitted(slot.opponent()))
            }
            _ => (false, false),
        };
        RestoreGameState {
            total_points: self.totals[slot],
            partner_points: self.totals[slot.opponent()],
            has_submitted,
            opponent_has_submitted,
            round_number: self.round_number(),
            state: self.state(),
        }
    }

    /// Entry for the spectator match list.
    pub fn summary(&self) -> MatchSummary {
        MatchSummary {
            match_id: self.session_id.to_string(),
            players: self.display_names.clone(),
            rounds_completed: self.rounds_completed,
            round_limit: self.config.round_limit,
            started: self.started_at.is_some(),
        }
    }

    /// What spectators see. Hides the answer until the round locks.
    pub fn spectator_view(&self) -> SpectatorView {
        let submitted = match &self.phase {
            RoundPhase::RoundActive(round) | RoundPhase::RoundLocked(round) => {
                SlotPair::new(round.has_submitted(PlayerSlot::Player1), round.has_submitted(PlayerSlot::Player2))
            }
            _ => SlotPair::splat(false),
        };
        let last_reveal = self.history.last().map(|record| SpectatorReveal {
            round_number: record.round,
            correct: record.correct,
            guesses: record.results.clone().map(|_, r| r.guess),
            points: record.results.clone().map(|_, r| r.total()),
        });
        SpectatorView {
            match_id: self.session_id.to_string(),
            state: self.state(),
            round: self.current_round(),
            totals: self.totals,
            submitted,
            last_reveal,
        }
    }

    // =========================================================================
    // TRANSITIONS
    // =========================================================================

    /// Record that `slot` is ready. Idempotent.
    pub fn mark_ready(&mut self, slot: PlayerSlot) -> Vec<Effect> {
        let ready = match &mut self.phase {
            RoundPhase::AwaitingStart { ready } => ready,
            _ => return Vec::new(),
        };
        if ready[slot] {
            return Vec::new();
        }
        ready[slot] = true;

        let mut effects = vec![Effect::send(Recipient::Player(slot.opponent()), ServerMessage::PartnerReady)];
        if ready.all(|r| *r) {
            effects.push(Effect::ScheduleRoundStart { after: Duration::ZERO });
        }
        effects
    }

    /// Start the next round if both players are ready.
    ///
    /// A target that cannot be played is reported to both players and
    /// leaves the coordinator in `AwaitingStart`.
    pub fn begin_round(&mut self, catalog: &dyn LocationCatalog, now: Instant) -> Vec<Effect> {
        if !self.start_pending() {
            debug!("Round start ignored in state {:?}", self.state());
            return Vec::new();
        }

        let target = match self.picker.pick(catalog) {
            Ok(target) => target,
            Err(e) => {
                warn!("Session {}: {}", self.short_id(), e);
                return vec![Effect::send(
                    Recipient::Both,
                    ServerMessage::RoundError(RoundErrorInfo { message: e.to_string() }),
                )];
            }
        };

        let number = self.rounds_completed + 1;
        let id = RoundId::generate(self.session_id.as_bytes(), self.match_number, number, self.picker.next_nonce());

        #[cfg(feature = "debug-tracing")]
        debug!("Round {} answer ({:.4}, {:.4})", id, target.correct.x, target.correct.y);

        let round = Round::new(id.clone(), number, target, now);
        let view = round.view(self.config.round_limit, self.config.round_timeout);
        self.started_at.get_or_insert_with(Utc::now);
        self.phase = RoundPhase::RoundActive(round);

        info!("Session {}: round {}/{} started ({})", self.short_id(), number, self.config.round_limit, id);

        vec![
            Effect::send(Recipient::Both, ServerMessage::StartRound(view)),
            Effect::send(Recipient::Spectators, ServerMessage::SpectatorUpdate(self.spectator_view())),
            Effect::ArmRoundTimer { round_id: id, after: self.config.round_timeout },
        ]
    }

    /// Accept or reject a guess.
    pub fn submit_guess(
        &mut self,
        slot: PlayerSlot,
        round_id: &RoundId,
        coord: Coord,
        now: Instant,
    ) -> Result<Vec<Effect>, GuessRejection> {
        let timed_mode = self.config.timed_mode;
        let round = match &mut self.phase {
            RoundPhase::RoundActive(round) => round,
            _ => return Err(GuessRejection::NoActiveRound),
        };
        if &round.id != round_id {
            return Err(GuessRejection::StaleRound);
        }
        if round.has_submitted(slot) {
            return Err(GuessRejection::AlreadySubmitted);
        }
        if !coord.is_normalized() {
            return Err(GuessRejection::InvalidCoordinate);
        }

        let score = scoring::score(coord, round.target.correct);
        let submitted_after = now.saturating_duration_since(round.started_at);
        let arrival = round.submitted_count() + 1;
        round.guesses[slot] = Some(AcceptedGuess { coord, score, submitted_after, arrival });

        let opponent_offset = round.guesses[slot.opponent()].as_ref().map(|g| g.submitted_after);
        let all_submitted = round.all_submitted();
        let time_bonus = if timed_mode { scoring::time_bonus(submitted_after, opponent_offset) } else { 0 };

        debug!("Session {}: {} guessed round {} ({} pts)", self.short_id(), slot, round_id, score.points);

        let mut effects = vec![
            Effect::send(
                Recipient::Player(slot),
                ServerMessage::GuessAccepted(GuessAccepted {
                    round_id: round_id.clone(),
                    distance: score.distance,
                    points: score.points,
                    time_bonus,
                }),
            ),
            Effect::send(
                Recipient::Player(slot.opponent()),
                ServerMessage::OpponentSubmitted(OpponentSubmitted {
                    round_id: round_id.clone(),
                    points: None,
                    submitted_after_ms: timed_mode.then(|| submitted_after.as_millis() as u64),
                }),
            ),
        ];

        if all_submitted {
            effects.extend(self.lock_round(false));
        } else {
            effects.push(Effect::send(Recipient::Spectators, ServerMessage::SpectatorUpdate(self.spectator_view())));
        }
        Ok(effects)
    }

    /// Round timer fired. Ignored unless `round_id` is still active.
    pub fn round_timed_out(&mut self, round_id: &RoundId) -> Vec<Effect> {
        match self.current_round_id() {
            Some(active) if active == round_id => {
                info!("Session {}: round {} timed out", self.short_id(), round_id);
                self.lock_round(true)
            }
            _ => {
                debug!("Stale round timer {} ignored", round_id);
                Vec::new()
            }
        }
    }

    /// Ask for a rematch. Starts the next match once both players have asked.
    pub fn request_rematch(&mut self, slot: PlayerSlot) -> Result<Vec<Effect>, SessionError> {
        let rematch = match &mut self.phase {
            RoundPhase::MatchComplete { rematch } => rematch,
            _ => return Err(SessionError::RematchUnavailable),
        };
        rematch[slot] = true;
        let status = RematchStatus {
            player1_requested: rematch.player1,
            player2_requested: rematch.player2,
        };
        let agreed = rematch.all(|r| *r);

        let mut effects = vec![Effect::send(Recipient::Both, ServerMessage::RematchStatus(status))];
        if agreed {
            self.reset_for_rematch();
            info!("Session {}: rematch #{} starting", self.short_id(), self.match_number);
            effects.push(Effect::send(Recipient::Both, ServerMessage::RematchStarting));
            effects.push(Effect::ScheduleRoundStart { after: Duration::ZERO });
        }
        Ok(effects)
    }

    /// Decline a rematch. Tears the session down.
    pub fn decline_rematch(&mut self, slot: PlayerSlot) -> Result<Vec<Effect>, SessionError> {
        if self.state() != RoundState::MatchComplete {
            return Err(SessionError::RematchUnavailable);
        }
        Ok(self.abandon(slot, LeaveReason::RematchDeclined))
    }

    /// `slot` is gone for good. Clears rematch intents and ends the session.
    pub fn abandon(&mut self, slot: PlayerSlot, reason: LeaveReason) -> Vec<Effect> {
        if let RoundPhase::MatchComplete { rematch } = &mut self.phase {
            *rematch = SlotPair::splat(false);
        }
        vec![
            Effect::CancelRoundTimer,
            Effect::Teardown { notify: Some(slot.opponent()), reason },
        ]
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn lock_round(&mut self, timed_out: bool) -> Vec<Effect> {
        let round = match std::mem::replace(&mut self.phase, RoundPhase::RoundComplete) {
            RoundPhase::RoundActive(round) => round,
            other => {
                self.phase = other;
                return Vec::new();
            }
        };

        let results = SlotPair::new(
            self.settle(&round, PlayerSlot::Player1),
            self.settle(&round, PlayerSlot::Player2),
        );
        for slot in PlayerSlot::ALL {
            self.totals[slot] += results[slot].total();
        }
        let match_complete = self.rounds_completed + 1 >= self.config.round_limit;

        let mut effects = vec![Effect::CancelRoundTimer];
        for slot in PlayerSlot::ALL {
            let own = &results[slot];
            let opponent = slot.opponent();
            effects.push(Effect::send(
                Recipient::Player(slot),
                ServerMessage::ValidationResult(ValidationResult {
                    round_id: round.id.clone(),
                    round_number: round.number,
                    valid: own.distance.map_or(false, |d| d <= VALID_THRESHOLD),
                    points: own.points,
                    time_bonus: own.time_bonus,
                    distance: own.distance,
                    total_points: self.totals[slot],
                    opponent_points: results[opponent].total(),
                    opponent_total_points: self.totals[opponent],
                    correct_x: round.target.correct.x,
                    correct_y: round.target.correct.y,
                    round_complete: true,
                    timed_out,
                    match_complete,
                }),
            ));
        }

        self.history.push(RoundRecord {
            round: round.number,
            round_id: round.id.clone(),
            location_id: round.target.location_id.clone(),
            correct: round.target.correct,
            results,
            timed_out,
            locked_at: Utc::now(),
        });
        self.rounds_completed += 1;

        self.phase = RoundPhase::RoundLocked(round);
        effects.push(Effect::send(Recipient::Spectators, ServerMessage::SpectatorUpdate(self.spectator_view())));
        self.phase = RoundPhase::RoundComplete;

        if match_complete {
            effects.extend(self.finish_match());
        } else {
            self.phase = RoundPhase::AwaitingStart { ready: SlotPair::splat(true) };
            effects.push(Effect::ScheduleRoundStart { after: self.config.intermission });
        }
        effects
    }

    fn settle(&self, round: &Round, slot: PlayerSlot) -> PlayerRoundResult {
        let guess = match &round.guesses[slot] {
            Some(guess) => guess,
            None => return PlayerRoundResult::missed(),
        };
        let time_bonus = if self.config.timed_mode {
            let opponent = round.guesses[slot.opponent()].as_ref().map(|g| g.submitted_after);
            scoring::time_bonus(guess.submitted_after, opponent)
        } else {
            0
        };
        PlayerRoundResult {
            guess: Some(guess.coord),
            distance: Some(guess.score.distance),
            points: guess.score.points,
            time_bonus,
            arrival: Some(guess.arrival),
        }
    }

    fn finish_match(&mut self) -> Vec<Effect> {
        let winner = match self.totals.player1.cmp(&self.totals.player2) {
            Ordering::Greater => Some(PlayerSlot::Player1),
            Ordering::Less => Some(PlayerSlot::Player2),
            Ordering::Equal => None,
        };
        self.phase = RoundPhase::MatchComplete { rematch: SlotPair::splat(false) };

        info!(
            "Session {}: match #{} complete {}-{}",
            self.short_id(),
            self.match_number,
            self.totals.player1,
            self.totals.player2
        );

        let mut effects: Vec<Effect> = PlayerSlot::ALL
            .into_iter()
            .map(|slot| {
                Effect::send(
                    Recipient::Player(slot),
                    ServerMessage::MatchComplete(MatchOutcome {
                        winner,
                        tie: winner.is_none(),
                        you: slot,
                        total_points: self.totals[slot],
                        opponent_points: self.totals[slot.opponent()],
                        match_number: self.match_number,
                    }),
                )
            })
            .collect();
        effects.push(Effect::send(Recipient::Spectators, ServerMessage::SpectatorUpdate(self.spectator_view())));

        if !self.record_handed_off {
            self.record_handed_off = true;
            effects.push(Effect::Persist(Box::new(self.match_record(winner))));
        }
        effects
    }

    fn match_record(&self, winner: Option<PlayerSlot>) -> MatchRecord {
        let completed_at = Utc::now();
        MatchRecord {
            session_id: self.session_id.to_string(),
            match_number: self.match_number,
            mode: "multiplayer".to_string(),
            players: self.display_names.clone().map(|slot, display_name| PlayerSummary {
                slot,
                display_name,
                total_score: self.totals[slot],
            }),
            winner,
            rounds: self.history.clone(),
            started_at: self.started_at.unwrap_or(completed_at),
            completed_at,
        }
    }

    fn reset_for_rematch(&mut self) {
        self.match_number += 1;
        self.rounds_completed = 0;
        self.totals = SlotPair::default();
        self.history.clear();
        self.picker = RoundPicker::new(DeterministicRng::for_session(self.session_id.as_bytes(), self.match_number));
        self.started_at = None;
        self.record_handed_off = false;
        self.phase = RoundPhase::AwaitingStart { ready: SlotPair::splat(true) };
    }

    fn short_id(&self) -> String {
        self.session_id.simple().to_string()[..8].to_string()
    }
}
