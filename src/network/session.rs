//! Session Management
//!
//! A session binds two player slots to one [`RoundCoordinator`] for as long
//! as either player might come back. Each session runs as its own task and
//! is driven through a mailbox, so sessions never share locks with each
//! other and a slow socket cannot stall a round.
//!
//! Connections are transient. A player is identified by a [`SessionKey`]
//! (`<session uuid>.<slot>`); a new connection presenting that key takes the
//! slot over. A slot left empty past the reconnect grace period ends the
//! session.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::coord::Coord;
use crate::game::catalog::LocationCatalog;
use crate::game::coordinator::{Effect, MatchConfig, Recipient, RoundCoordinator, RoundState};
use crate::game::record::{MatchRecord, MatchStore};
use crate::game::round::{PlayerSlot, RoundId, RoundView, SlotPair};
use crate::network::gateway::{ConnectionHandle, ConnectionId};
use crate::network::protocol::{
    CurrentRound, ErrorCode, GuessRejected, LeaveReason, MatchSummary, OpponentLeft, QueueMatched,
    RestoreGameState, ServerMessage,
};
use crate::network::queue::QueueEntry;

/// Commands buffered per session before senders wait.
const MAILBOX_CAPACITY: usize = 64;

/// Unique session identifier.
pub type SessionId = Uuid;

// =============================================================================
// SESSION KEY
// =============================================================================

/// Durable identity of one player in one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey {
    /// Session.
    pub session_id: SessionId,
    /// Slot within it.
    pub slot: PlayerSlot,
}

impl SessionKey {
    /// Build a key.
    pub fn new(session_id: SessionId, slot: PlayerSlot) -> Self {
        Self { session_id, slot }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.session_id, self.slot.number())
    }
}

impl FromStr for SessionKey {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, slot) = s.rsplit_once('.').ok_or(SessionError::SessionNotFound)?;
        let session_id = Uuid::parse_str(id).map_err(|_| SessionError::SessionNotFound)?;
        let slot = slot
            .parse::<u8>()
            .ok()
            .and_then(PlayerSlot::from_number)
            .ok_or(SessionError::SessionNotFound)?;
        Ok(Self { session_id, slot })
    }
}

// =============================================================================
// CONFIG & ERRORS
// =============================================================================

/// Configuration shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a slot may stay empty before the session ends.
    pub reconnect_grace: Duration,
    /// Match rules.
    pub match_config: MatchConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: Duration::from_secs(30),
            match_config: MatchConfig::default(),
        }
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Unknown, malformed or expired session key.
    #[error("Session not found")]
    SessionNotFound,

    /// Connection is not attached to any session.
    #[error("Not in a session")]
    NotInSession,

    /// Connection already belongs to another session.
    #[error("Already in session")]
    AlreadyInSession,

    /// Session task has ended.
    #[error("Session closed")]
    SessionClosed,

    /// Rematch requested outside a completed match.
    #[error("Rematch not available")]
    RematchUnavailable,
}

impl SessionError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::SessionNotFound | SessionError::SessionClosed => ErrorCode::SessionNotFound,
            SessionError::NotInSession => ErrorCode::NotInSession,
            SessionError::AlreadyInSession => ErrorCode::AlreadyInSession,
            SessionError::RematchUnavailable => ErrorCode::RematchUnavailable,
        }
    }
}

/// Connection state for reconnection support.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// Slot has a live connection.
    Connected(ConnectionHandle),
    /// Slot is waiting for a reconnect.
    Disconnected {
        /// When the connection dropped.
        since: Instant,
    },
}

impl ConnectionState {
    /// Check if the slot is connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    fn handle(&self) -> Option<&ConnectionHandle> {
        match self {
            ConnectionState::Connected(handle) => Some(handle),
            ConnectionState::Disconnected { .. } => None,
        }
    }
}

/// State handed to a connection when it attaches to a slot.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Key the connection is now bound to.
    pub key: SessionKey,
    /// Scores and submission state.
    pub state: RestoreGameState,
    /// Active round, if any.
    pub round: Option<RoundView>,
    /// Opponent's current connection, if connected.
    pub partner: Option<ConnectionId>,
    /// Connection that held the slot before, if it was still attached.
    pub replaced: Option<ConnectionId>,
}

impl SessionSnapshot {
    /// Opponent has no live connection.
    pub fn opponent_pending(&self) -> bool {
        self.partner.is_none()
    }
}

/// Result of a restore attempt.
#[derive(Debug, Clone)]
pub enum RestoreResult {
    /// Reattached; both players present.
    Active(SessionSnapshot),
    /// Reattached; waiting on the opponent.
    OpponentPending(SessionSnapshot),
    /// No such session (never existed, torn down or expired).
    NotFound,
}

// =============================================================================
// SESSION HANDLE
// =============================================================================

/// Messages processed by a session task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Bind a connection to a slot.
    Attach {
        /// Slot.
        slot: PlayerSlot,
        /// New connection.
        connection: ConnectionHandle,
        /// Reply.
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// A slot's connection dropped.
    Detach {
        /// Slot.
        slot: PlayerSlot,
        /// Connection that dropped; ignored if it no longer owns the slot.
        connection_id: ConnectionId,
    },
    /// Player is ready.
    Ready {
        /// Slot.
        slot: PlayerSlot,
    },
    /// Player guessed.
    SubmitGuess {
        /// Slot.
        slot: PlayerSlot,
        /// Round targeted.
        round_id: RoundId,
        /// Guess.
        coord: Coord,
    },
    /// Player asked for the active round.
    RequestCurrentRound {
        /// Slot.
        slot: PlayerSlot,
    },
    /// Player asked for a rematch.
    Rematch {
        /// Slot.
        slot: PlayerSlot,
    },
    /// Player declined a rematch.
    DeclineRematch {
        /// Slot.
        slot: PlayerSlot,
    },
    /// Player left.
    Leave {
        /// Slot.
        slot: PlayerSlot,
    },
    /// Add a spectator.
    Spectate {
        /// Spectator connection.
        connection: ConnectionHandle,
    },
    /// Remove a spectator.
    StopSpectating {
        /// Spectator connection.
        connection_id: ConnectionId,
    },
    /// Report a list entry.
    Summary {
        /// Reply.
        reply: oneshot::Sender<MatchSummary>,
    },
}

/// Mailbox of a running session.
#[derive(Debug, Clone)]
struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx.send(command).await.map_err(|_| SessionError::SessionClosed)
    }

    async fn attach(&self, slot: PlayerSlot, connection: ConnectionHandle) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Attach { slot, connection, reply }).await?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    async fn summary(&self) -> Result<MatchSummary, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Summary { reply }).await?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }
}

// =============================================================================
// SESSION REGISTRY
// =============================================================================

#[derive(Default)]
struct RegistryInner {
    sessions: BTreeMap<SessionId, SessionHandle>,
    /// Player connection -> slot it is attached to.
    connections: HashMap<ConnectionId, SessionKey>,
    /// Spectator connection -> watched session.
    spectators: HashMap<ConnectionId, SessionId>,
}

impl RegistryInner {
    /// Remove a spectator entry, returning the session it watched.
    fn take_spectator(&mut self, connection_id: ConnectionId) -> Option<(ConnectionId, SessionHandle)> {
        let watched = self.spectators.remove(&connection_id)?;
        self.sessions.get(&watched).cloned().map(|handle| (connection_id, handle))
    }
}

/// Tell watched sessions to drop these spectators.
async fn release_spectators(watched: impl IntoIterator<Item = (ConnectionId, SessionHandle)>) {
    for (connection_id, handle) in watched {
        let _ = handle.send(SessionCommand::StopSpectating { connection_id }).await;
    }
}

struct SessionShared {
    config: SessionConfig,
    catalog: Arc<dyn LocationCatalog>,
    store: Arc<dyn MatchStore>,
}

/// Index of live sessions and of which connection is attached where.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    shared: Arc<SessionShared>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(config: SessionConfig, catalog: Arc<dyn LocationCatalog>, store: Arc<dyn MatchStore>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            shared: Arc::new(SessionShared { config, catalog, store }),
        }
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Create a session for a freshly paired couple and notify both.
    ///
    /// The first entry becomes player 1.
    pub async fn create_session(&self, first: QueueEntry, second: QueueEntry) -> Result<SessionId, SessionError> {
        let id = Uuid::new_v4();
        let entries = SlotPair::new(first, second);
        let watched = {
            let mut inner = self.inner.write().await;
            if entries.iter().any(|(_, e)| inner.connections.contains_key(&e.connection.id())) {
                return Err(SessionError::AlreadyInSession);
            }
            let watched: Vec<_> = entries
                .iter()
                .filter_map(|(_, e)| inner.take_spectator(e.connection.id()))
                .collect();
            let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
            inner.sessions.insert(id, SessionHandle { tx });
            for (slot, entry) in entries.iter() {
                inner.connections.insert(entry.connection.id(), SessionKey::new(id, slot));
            }

            let coordinator = RoundCoordinator::new(
                id,
                self.shared.config.match_config.clone(),
                entries.clone().map(|_, e| e.display_name),
            );
            let actor = SessionActor::new(
                id,
                coordinator,
                entries.clone().map(|_, e| ConnectionState::Connected(e.connection)),
                self.clone(),
            );
            tokio::spawn(actor.run(rx));
            watched
        };
        release_spectators(watched).await;

        for (slot, entry) in entries.iter() {
            let partner = &entries[slot.opponent()].connection;
            entry.connection.send(ServerMessage::QueueMatched(QueueMatched {
                session_id: SessionKey::new(id, slot).to_string(),
                partner_id: partner.id().to_string(),
                match_id: id.to_string(),
                slot,
                is_reconnect: false,
            }));
        }

        info!(
            "Created session {} (connections {} vs {})",
            &id.simple().to_string()[..8],
            entries.player1.connection.id(),
            entries.player2.connection.id()
        );
        Ok(id)
    }

    /// Attach a connection to the slot named by `key`.
    pub async fn identify(&self, key: SessionKey, connection: ConnectionHandle) -> Result<SessionSnapshot, SessionError> {
        let handle = {
            let inner = self.inner.read().await;
            match inner.connections.get(&connection.id()) {
                Some(existing) if *existing != key => return Err(SessionError::AlreadyInSession),
                _ => {}
            }
            inner.sessions.get(&key.session_id).cloned().ok_or(SessionError::SessionNotFound)?
        };

        let connection_id = connection.id();
        let snapshot = handle.attach(key.slot, connection).await?;

        let watched = {
            let mut inner = self.inner.write().await;
            if !inner.sessions.contains_key(&key.session_id) {
                return Err(SessionError::SessionClosed);
            }
            if let Some(old) = snapshot.replaced {
                inner.connections.remove(&old);
            }
            inner.connections.insert(connection_id, key);
            inner.take_spectator(connection_id)
        };
        release_spectators(watched).await;
        Ok(snapshot)
    }

    /// Restore a dropped player. Unknown keys yield [`RestoreResult::NotFound`].
    pub async fn restore(&self, key: &str, connection: ConnectionHandle) -> Result<RestoreResult, SessionError> {
        let key = match key.parse::<SessionKey>() {
            Ok(key) => key,
            Err(_) => return Ok(RestoreResult::NotFound),
        };
        match self.identify(key, connection).await {
            Ok(snapshot) if snapshot.opponent_pending() => Ok(RestoreResult::OpponentPending(snapshot)),
            Ok(snapshot) => Ok(RestoreResult::Active(snapshot)),
            Err(SessionError::SessionNotFound) | Err(SessionError::SessionClosed) => Ok(RestoreResult::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Slot a connection is attached to.
    pub async fn lookup(&self, connection_id: ConnectionId) -> Option<SessionKey> {
        self.inner.read().await.connections.get(&connection_id).copied()
    }

    /// Send a command to the session `connection_id` plays in.
    pub async fn dispatch(
        &self,
        connection_id: ConnectionId,
        command: impl FnOnce(PlayerSlot) -> SessionCommand,
    ) -> Result<SessionKey, SessionError> {
        let (key, handle) = {
            let inner = self.inner.read().await;
            let key = *inner.connections.get(&connection_id).ok_or(SessionError::NotInSession)?;
            let handle = inner.sessions.get(&key.session_id).cloned().ok_or(SessionError::SessionClosed)?;
            (key, handle)
        };
        handle.send(command(key.slot)).await?;
        Ok(key)
    }

    /// A connection dropped. The session survives for the grace period.
    pub async fn detach(&self, connection_id: ConnectionId) {
        let (key, handle, spectating) = {
            let mut inner = self.inner.write().await;
            let key = inner.connections.remove(&connection_id);
            let handle = key.and_then(|k| inner.sessions.get(&k.session_id).cloned());
            let spectating = inner.take_spectator(connection_id);
            (key, handle, spectating)
        };

        if let (Some(key), Some(handle)) = (key, handle) {
            debug!("Connection {} detached from {}", connection_id, key);
            let _ = handle.send(SessionCommand::Detach { slot: key.slot, connection_id }).await;
        }
        release_spectators(spectating).await;
    }

    /// Start watching a match.
    pub async fn spectate(&self, match_id: &str, connection: ConnectionHandle) -> Result<(), SessionError> {
        let session_id = Uuid::parse_str(match_id).map_err(|_| SessionError::SessionNotFound)?;
        self.stop_spectating(connection.id()).await;

        let handle = {
            let mut inner = self.inner.write().await;
            if inner.connections.contains_key(&connection.id()) {
                return Err(SessionError::AlreadyInSession);
            }
            let handle = inner.sessions.get(&session_id).cloned().ok_or(SessionError::SessionNotFound)?;
            inner.spectators.insert(connection.id(), session_id);
            handle
        };
        handle.send(SessionCommand::Spectate { connection }).await
    }

    /// Stop watching. No-op if not spectating.
    pub async fn stop_spectating(&self, connection_id: ConnectionId) {
        let watched = self.inner.write().await.take_spectator(connection_id);
        release_spectators(watched).await;
    }

    /// Summaries of all live sessions.
    pub async fn list(&self) -> Vec<MatchSummary> {
        let handles: Vec<SessionHandle> = self.inner.read().await.sessions.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(summary) = handle.summary().await {
                summaries.push(summary);
            }
        }
        summaries
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Drop a session and every connection bound to it.
    async fn forget(&self, id: SessionId) {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(&id);
        inner.connections.retain(|_, key| key.session_id != id);
        inner.spectators.retain(|_, watched| *watched != id);
        info!("Session {} removed", &id.simple().to_string()[..8]);
    }
}

// =============================================================================
// SESSION TASK
// =============================================================================

struct SessionActor {
    id: SessionId,
    coordinator: RoundCoordinator,
    players: SlotPair<ConnectionState>,
    spectators: BTreeMap<ConnectionId, ConnectionHandle>,
    round_deadline: Option<(RoundId, Instant)>,
    start_at: Option<Instant>,
    grace: SlotPair<Option<Instant>>,
    unsaved: Vec<MatchRecord>,
    registry: SessionRegistry,
    closed: bool,
}

/// Sleep until `deadline`, or forever if there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    fn new(
        id: SessionId,
        coordinator: RoundCoordinator,
        players: SlotPair<ConnectionState>,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            id,
            coordinator,
            players,
            spectators: BTreeMap::new(),
            round_deadline: None,
            start_at: None,
            grace: SlotPair::default(),
            unsaved: Vec::new(),
            registry,
            closed: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        while !self.closed {
            let round_deadline = self.round_deadline.as_ref().map(|(_, at)| *at);
            let start_due = self.start_due();
            let grace_due = self.next_grace();

            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sleep_until_opt(round_deadline) => self.on_round_deadline(),
                _ = sleep_until_opt(start_due) => self.on_start_due(),
                _ = sleep_until_opt(grace_due) => self.on_grace_expired(),
            }
            self.persist().await;
        }

        self.registry.forget(self.id).await;
    }

    /// Round start deadline, held back while a slot is empty.
    fn start_due(&self) -> Option<Instant> {
        if self.players.all(ConnectionState::is_connected) {
            self.start_at
        } else {
            None
        }
    }

    fn next_grace(&self) -> Option<Instant> {
        self.grace.iter().filter_map(|(_, at)| *at).min()
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Attach { slot, connection, reply } => {
                let snapshot = self.attach(slot, connection);
                let _ = reply.send(snapshot);
            }
            SessionCommand::Detach { slot, connection_id } => self.detach(slot, connection_id),
            SessionCommand::Ready { slot } => {
                let effects = self.coordinator.mark_ready(slot);
                self.apply(effects);
            }
            SessionCommand::SubmitGuess { slot, round_id, coord } => {
                match self.coordinator.submit_guess(slot, &round_id, coord, Instant::now().into_std()) {
                    Ok(effects) => self.apply(effects),
                    Err(reason) => {
                        debug!("Guess from {} rejected: {}", slot, reason);
                        self.send_to(slot, ServerMessage::GuessRejected(GuessRejected {
                            round_id,
                            reason,
                            message: reason.to_string(),
                        }));
                    }
                }
            }
            SessionCommand::RequestCurrentRound { slot } => {
                let round = self.coordinator.current_round();
                self.send_to(slot, ServerMessage::CurrentRound(CurrentRound {
                    success: round.is_some(),
                    error: round.is_none().then(|| "No active round".to_string()),
                    round_data: round,
                }));
            }
            SessionCommand::Rematch { slot } => match self.coordinator.request_rematch(slot) {
                Ok(effects) => self.apply(effects),
                Err(e) => self.send_to(slot, ServerMessage::error(e.code(), e.to_string())),
            },
            SessionCommand::DeclineRematch { slot } => match self.coordinator.decline_rematch(slot) {
                Ok(effects) => self.apply(effects),
                Err(e) => self.send_to(slot, ServerMessage::error(e.code(), e.to_string())),
            },
            SessionCommand::Leave { slot } => {
                info!("Session {}: {} left", self.short_id(), slot);
                let effects = self.coordinator.abandon(slot, LeaveReason::Left);
                self.apply(effects);
            }
            SessionCommand::Spectate { connection } => {
                connection.send(ServerMessage::SpectatorUpdate(self.coordinator.spectator_view()));
                self.spectators.insert(connection.id(), connection);
            }
            SessionCommand::StopSpectating { connection_id } => {
                self.spectators.remove(&connection_id);
            }
            SessionCommand::Summary { reply } => {
                let _ = reply.send(self.coordinator.summary());
            }
        }
    }

    fn attach(&mut self, slot: PlayerSlot, connection: ConnectionHandle) -> SessionSnapshot {
        let key = SessionKey::new(self.id, slot);
        let replaced = match &self.players[slot] {
            ConnectionState::Connected(old) if old.id() != connection.id() => Some(old.id()),
            _ => None,
        };
        if let Some(old) = replaced {
            debug!("Connection {} replaces {} on {}", connection.id(), old, key);
        }

        self.players[slot] = ConnectionState::Connected(connection);
        self.grace[slot] = None;

        SessionSnapshot {
            key,
            state: self.coordinator.snapshot_for(slot),
            round: self.coordinator.current_round(),
            partner: self.players[slot.opponent()].handle().map(ConnectionHandle::id),
            replaced,
        }
    }

    fn detach(&mut self, slot: PlayerSlot, connection_id: ConnectionId) {
        match self.players[slot].handle() {
            Some(current) if current.id() == connection_id => {}
            _ => return,
        }

        if self.coordinator.state() == RoundState::MatchComplete {
            // No reconnect window once the match is over.
            let effects = self.coordinator.abandon(slot, LeaveReason::Disconnected);
            self.apply(effects);
            return;
        }

        let now = Instant::now();
        self.players[slot] = ConnectionState::Disconnected { since: now };
        self.grace[slot] = Some(now + self.registry.config().reconnect_grace);
        info!("Session {}: {} disconnected, holding slot", self.short_id(), slot);
    }

    fn on_round_deadline(&mut self) {
        if let Some((round_id, _)) = self.round_deadline.take() {
            let effects = self.coordinator.round_timed_out(&round_id);
            self.apply(effects);
        }
    }

    fn on_start_due(&mut self) {
        self.start_at = None;
        let catalog = self.registry.shared.catalog.clone();
        let effects = self.coordinator.begin_round(catalog.as_ref(), Instant::now().into_std());
        self.apply(effects);
    }

    fn on_grace_expired(&mut self) {
        let now = Instant::now();
        let expired = PlayerSlot::ALL
            .into_iter()
            .find(|slot| self.grace[*slot].map_or(false, |at| at <= now));
        if let Some(slot) = expired {
            let since = match &self.players[slot] {
                ConnectionState::Disconnected { since } => now.duration_since(*since),
                ConnectionState::Connected(_) => Duration::ZERO,
            };
            info!("Session {}: {} did not return after {:?}", self.short_id(), slot, since);
            self.grace[slot] = None;
            let effects = self.coordinator.abandon(slot, LeaveReason::ReconnectTimeout);
            self.apply(effects);
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, message } => self.deliver(to, message),
                Effect::ArmRoundTimer { round_id, after } => {
                    self.round_deadline = Some((round_id, Instant::now() + after));
                }
                Effect::CancelRoundTimer => self.round_deadline = None,
                Effect::ScheduleRoundStart { after } => self.start_at = Some(Instant::now() + after),
                Effect::Persist(record) => self.unsaved.push(*record),
                Effect::Teardown { notify, reason } => self.teardown(notify, reason),
            }
        }
    }

    fn deliver(&mut self, to: Recipient, message: ServerMessage) {
        match to {
            Recipient::Player(slot) => self.send_to(slot, message),
            Recipient::Both => {
                for slot in PlayerSlot::ALL {
                    self.send_to(slot, message.clone());
                }
            }
            Recipient::Spectators => {
                self.spectators.retain(|_, spectator| spectator.send(message.clone()));
            }
        }
    }

    /// Messages to an empty slot are dropped; restore resends state.
    fn send_to(&self, slot: PlayerSlot, message: ServerMessage) {
        if let Some(connection) = self.players[slot].handle() {
            connection.send(message);
        }
    }

    /// Hand finished matches to the store off the runtime threads.
    ///
    /// Save errors are logged; players have already seen the result.
    async fn persist(&mut self) {
        for record in std::mem::take(&mut self.unsaved) {
            let store = self.registry.shared.store.clone();
            let match_number = record.match_number;
            match tokio::task::spawn_blocking(move || store.save(&record)).await {
                Ok(Ok(())) => debug!("Session {}: match #{} saved", self.short_id(), match_number),
                Ok(Err(e)) => error!("Session {}: failed to save match #{}: {}", self.short_id(), match_number, e),
                Err(e) => error!("Session {}: save task for match #{} failed: {}", self.short_id(), match_number, e),
            }
        }
    }

    fn teardown(&mut self, notify: Option<PlayerSlot>, reason: LeaveReason) {
        if let Some(slot) = notify {
            self.send_to(slot, ServerMessage::OpponentLeft(OpponentLeft { reason }));
        }
        for spectator in self.spectators.values() {
            spectator.send(ServerMessage::OpponentLeft(OpponentLeft { reason }));
        }
        if self.round_deadline.is_some() || self.start_at.is_some() {
            warn!("Session {} torn down mid-match ({:?})", self.short_id(), reason);
        }
        self.round_deadline = None;
        self.start_at = None;
        self.closed = true;
    }

    fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}
