//! Connection Gateway
//!
//! Translates decoded client frames into queue, registry and session
//! operations, and session output back into frames. One gateway exists per
//! live connection; all gateways share one [`Lobby`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::game::catalog::LocationCatalog;
use crate::game::record::MatchStore;
use crate::game::round::PlayerSlot;
use crate::game::scoring;
use crate::network::protocol::{
    ActiveMatches, ClientMessage, CurrentRound, CurrentRoundRequest, ErrorCode, GuessSubmission,
    JoinQueueRequest, QueueJoined, QueueMatched, RestoreAck, ServerMessage, SessionAttached,
};
use crate::network::queue::{EnqueueOutcome, MatchQueue, QueueEntry};
use crate::network::session::{
    RestoreResult, SessionCommand, SessionConfig, SessionError, SessionKey, SessionRegistry,
    SessionSnapshot,
};

/// Transient per-connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a connection id. Never reused within a process.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Outbound side of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<ServerMessage>,
    overflow: Arc<Notify>,
}

impl ConnectionHandle {
    /// Wrap an outbound channel.
    pub fn new(id: ConnectionId, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self { id, sender, overflow: Arc::new(Notify::new()) }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message without waiting.
    ///
    /// A full buffer drops progress frames. Dropping a frame that
    /// [carries a result](ServerMessage::carries_result) instead marks the
    /// connection overflowed and reports it gone, so the client reconnects
    /// and restores. Returns `false` once the connection is unusable.
    pub fn send(&self, message: ServerMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) if message.carries_result() => {
                warn!("Connection {} outbound buffer full, closing", self.id);
                self.overflow.notify_one();
                false
            }
            Err(TrySendError::Full(_)) => {
                warn!("Connection {} outbound buffer full, message dropped", self.id);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Resolves once a result frame could not be buffered.
    pub async fn overflowed(&self) {
        self.overflow.notified().await
    }

    /// Whether the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

// =============================================================================
// LOBBY
// =============================================================================

/// State shared by every connection.
pub struct Lobby {
    queue: Mutex<MatchQueue>,
    registry: SessionRegistry,
    catalog: Arc<dyn LocationCatalog>,
}

impl Lobby {
    /// Create a lobby.
    pub fn new(config: SessionConfig, catalog: Arc<dyn LocationCatalog>, store: Arc<dyn MatchStore>) -> Self {
        Self {
            queue: Mutex::new(MatchQueue::new()),
            registry: SessionRegistry::new(config, catalog.clone(), store),
            catalog,
        }
    }

    /// Session registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Entries waiting in the queue.
    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drop queue entries whose connection has closed.
    pub async fn reap_queue(&self) -> usize {
        self.queue.lock().await.remove_closed()
    }
}

// =============================================================================
// GATEWAY
// =============================================================================

/// Per-connection message router.
pub struct ConnectionGateway {
    lobby: Arc<Lobby>,
    connection: ConnectionHandle,
}

impl ConnectionGateway {
    /// Create a gateway for one connection.
    pub fn new(lobby: Arc<Lobby>, connection: ConnectionHandle) -> Self {
        Self { lobby, connection }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    fn send(&self, message: ServerMessage) {
        self.connection.send(message);
    }

    fn send_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.send(ServerMessage::error(code, message));
    }

    /// Decode and handle one text frame.
    pub async fn handle_text(&self, text: &str) {
        match ClientMessage::from_json(text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                debug!("Invalid message from connection {}: {}", self.id(), e);
                self.send_error(ErrorCode::InvalidInput, "Invalid message format");
            }
        }
    }

    /// Handle a client message.
    pub async fn handle_message(&self, message: ClientMessage) {
        match message {
            ClientMessage::JoinQueue(req) => self.handle_join_queue(req).await,
            ClientMessage::LeaveQueue => {
                self.lobby.queue.lock().await.dequeue(self.id());
                self.send(ServerMessage::QueueLeft);
            }
            ClientMessage::Identify(req) => self.handle_identify(&req.session_id).await,
            ClientMessage::RestoreSession(req) => self.handle_restore(&req.session_id).await,
            ClientMessage::Ready => self.dispatch(|slot| SessionCommand::Ready { slot }).await,
            ClientMessage::SubmitGuess(guess) => self.handle_guess(guess).await,
            ClientMessage::RequestCurrentRound(req) => self.handle_current_round(req).await,
            ClientMessage::Rematch => self.dispatch(|slot| SessionCommand::Rematch { slot }).await,
            ClientMessage::DeclineRematch => {
                self.dispatch(|slot| SessionCommand::DeclineRematch { slot }).await
            }
            ClientMessage::Leave => self.handle_leave().await,
            ClientMessage::ListMatches => {
                let matches = self.lobby.registry.list().await;
                self.send(ServerMessage::ActiveMatches(ActiveMatches { matches }));
            }
            ClientMessage::Spectate(req) => {
                if let Err(e) = self.lobby.registry.spectate(&req.match_id, self.connection.clone()).await {
                    let code = match &e {
                        SessionError::SessionNotFound | SessionError::SessionClosed => ErrorCode::MatchNotFound,
                        other => other.code(),
                    };
                    self.send_error(code, e.to_string());
                }
            }
            ClientMessage::StopSpectating => self.lobby.registry.stop_spectating(self.id()).await,
            ClientMessage::ValidateLocation(req) => {
                match scoring::validate(&req, self.lobby.catalog.as_ref()) {
                    Ok(response) => self.send(ServerMessage::LocationValidated(response)),
                    Err(e) => self.send_error(ErrorCode::ValidationFailed, e.to_string()),
                }
            }
            ClientMessage::Ping { timestamp } => {
                self.send(ServerMessage::Pong {
                    timestamp,
                    server_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
                });
            }
        }
    }

    /// Connection closed. Leaves the queue; sessions keep the slot for the
    /// reconnect grace period.
    pub async fn disconnect(&self) {
        self.lobby.queue.lock().await.dequeue(self.id());
        self.lobby.registry.detach(self.id()).await;
    }

    async fn dispatch(&self, command: impl FnOnce(PlayerSlot) -> SessionCommand) {
        if let Err(e) = self.lobby.registry.dispatch(self.id(), command).await {
            self.send_error(e.code(), e.to_string());
        }
    }

    async fn handle_join_queue(&self, req: JoinQueueRequest) {
        if self.lobby.registry.lookup(self.id()).await.is_some() {
            self.send_error(ErrorCode::AlreadyInSession, "Already in a session");
            return;
        }
        // A player never watches another match.
        self.lobby.registry.stop_spectating(self.id()).await;

        let display_name = req
            .display_name
            .map(|name| name.trim().chars().take(32).collect::<String>())
            .filter(|name| !name.is_empty());
        let entry = QueueEntry::new(self.connection.clone(), display_name);

        // Pairing and session creation happen under one lock so a pair is
        // never visible half-created.
        let mut queue = self.lobby.queue.lock().await;
        match queue.enqueue(entry) {
            Ok(EnqueueOutcome::Waiting { waiting }) | Ok(EnqueueOutcome::AlreadyQueued { waiting }) => {
                self.send(ServerMessage::QueueJoined(QueueJoined { waiting }));
            }
            Ok(EnqueueOutcome::Paired(first, second)) => {
                if let Err(e) = self.lobby.registry.create_session(first.clone(), second.clone()).await {
                    warn!("Pairing {} with {} failed: {}", first.connection.id(), second.connection.id(), e);
                    // Whoever is still free goes back to the head of the queue.
                    for entry in [second, first] {
                        if self.lobby.registry.lookup(entry.connection.id()).await.is_none() {
                            queue.requeue_front(entry);
                        }
                    }
                    if queue.contains(self.id()) {
                        self.send(ServerMessage::QueueJoined(QueueJoined { waiting: queue.len() }));
                    }
                }
            }
            Err(e) => {
                error!("Queue error: {}", e);
                self.send_error(ErrorCode::InternalError, "Matchmaking failed");
            }
        }
    }

    async fn handle_identify(&self, session_id: &str) {
        let key = match session_id.parse::<SessionKey>() {
            Ok(key) => key,
            Err(e) => {
                self.send_error(e.code(), e.to_string());
                return;
            }
        };
        self.lobby.queue.lock().await.dequeue(self.id());

        match self.lobby.registry.identify(key, self.connection.clone()).await {
            Ok(snapshot) => {
                info!("Connection {} identified as {}", self.id(), key);
                self.send(ServerMessage::SessionAttached(SessionAttached {
                    session_id: key.to_string(),
                    match_id: key.session_id.to_string(),
                    slot: key.slot,
                    opponent_pending: snapshot.opponent_pending(),
                }));
            }
            Err(e) => self.send_error(e.code(), e.to_string()),
        }
    }

    async fn handle_restore(&self, session_id: &str) {
        self.lobby.queue.lock().await.dequeue(self.id());

        match self.lobby.registry.restore(session_id, self.connection.clone()).await {
            Ok(RestoreResult::Active(snapshot)) | Ok(RestoreResult::OpponentPending(snapshot)) => {
                info!("Connection {} restored {}", self.id(), snapshot.key);
                self.send_restored(snapshot);
            }
            Ok(RestoreResult::NotFound) => {
                debug!("Restore of unknown session {} by connection {}", session_id, self.id());
                self.send(ServerMessage::RestoreResult(RestoreAck {
                    success: false,
                    error: Some("Session not found".to_string()),
                    ..Default::default()
                }));
            }
            Err(e) => self.send_error(e.code(), e.to_string()),
        }
    }

    fn send_restored(&self, snapshot: SessionSnapshot) {
        let SessionSnapshot { key, state, round, partner, .. } = snapshot;
        self.send(ServerMessage::QueueMatched(QueueMatched {
            session_id: key.to_string(),
            partner_id: partner.map(|id| id.to_string()).unwrap_or_default(),
            match_id: key.session_id.to_string(),
            slot: key.slot,
            is_reconnect: true,
        }));
        if let Some(round) = &round {
            self.send(ServerMessage::StartRound(round.clone()));
        }
        self.send(ServerMessage::RestoreGameState(state));
        self.send(ServerMessage::RestoreResult(RestoreAck {
            success: true,
            no_round_data: round.is_none(),
            round_data: round,
            opponent_pending: partner.is_none(),
            error: None,
        }));
    }

    async fn handle_guess(&self, guess: GuessSubmission) {
        let coord = guess.coord();
        let round_id = guess.round_id;
        self.dispatch(move |slot| SessionCommand::SubmitGuess { slot, round_id, coord }).await;
    }

    async fn handle_current_round(&self, req: CurrentRoundRequest) {
        if self.lobby.registry.lookup(self.id()).await.is_some() {
            self.dispatch(|slot| SessionCommand::RequestCurrentRound { slot }).await;
            return;
        }
        debug!(
            "Current round requested by unattached connection {} (session hint {:?})",
            self.id(),
            req.session_id
        );
        self.send(ServerMessage::CurrentRound(CurrentRound {
            success: false,
            round_data: None,
            error: Some(SessionError::NotInSession.to_string()),
        }));
    }

    async fn handle_leave(&self) {
        let was_queued = self.lobby.queue.lock().await.dequeue(self.id());
        match self.lobby.registry.dispatch(self.id(), |slot| SessionCommand::Leave { slot }).await {
            Ok(key) => debug!("Connection {} left {}", self.id(), key),
            Err(SessionError::NotInSession) if was_queued => self.send(ServerMessage::QueueLeft),
            Err(e) => self.send_error(e.code(), e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::game::catalog::{Location, MemoryCatalog};
    use crate::game::coordinator::GuessRejection;
    use crate::game::record::MemoryMatchStore;
    use crate::game::round::RoundView;
    use crate::network::protocol::{GuessRejected, LeaveReason, OpponentLeft};

    struct TestClient {
        gateway: ConnectionGateway,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl TestClient {
        fn connect(lobby: &Arc<Lobby>) -> Self {
            let (tx, rx) = mpsc::channel(64);
            let handle = ConnectionHandle::new(next_connection_id(), tx);
            Self { gateway: ConnectionGateway::new(lobby.clone(), handle), rx }
        }

        async fn send(&self, json: &str) {
            self.gateway.handle_text(json).await;
        }

        async fn expect<T>(&mut self, mut pick: impl FnMut(&ServerMessage) -> Option<T>) -> T {
            loop {
                let message = tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
                    .await
                    .expect("timed out waiting for message")
                    .expect("channel closed");
                if let Some(found) = pick(&message) {
                    return found;
                }
            }
        }
    }

    fn lobby() -> Arc<Lobby> {
        let catalog = MemoryCatalog::new(vec![
            Location {
                id: "quad".to_string(),
                image: "img/quad.jpg".to_string(),
                x_coordinate: 0.25,
                y_coordinate: 0.75,
            },
            Location {
                id: "library".to_string(),
                image: "img/library.jpg".to_string(),
                x_coordinate: 0.25,
                y_coordinate: 0.75,
            },
        ]);
        Arc::new(Lobby::new(
            SessionConfig::default(),
            Arc::new(catalog),
            Arc::new(MemoryMatchStore::new()),
        ))
    }

    fn matched(message: &ServerMessage) -> Option<QueueMatched> {
        match message {
            ServerMessage::QueueMatched(m) => Some(m.clone()),
            _ => None,
        }
    }

    fn start_round(message: &ServerMessage) -> Option<RoundView> {
        match message {
            ServerMessage::StartRound(view) => Some(view.clone()),
            _ => None,
        }
    }

    fn error_code(message: &ServerMessage) -> Option<ErrorCode> {
        match message {
            ServerMessage::Error(e) => Some(e.code),
            _ => None,
        }
    }

    async fn pair(lobby: &Arc<Lobby>) -> (TestClient, TestClient, QueueMatched) {
        let mut a = TestClient::connect(lobby);
        let mut b = TestClient::connect(lobby);
        a.send(r#"{"type":"joinQueue","displayName":"ada"}"#).await;
        a.expect(|m| matches!(m, ServerMessage::QueueJoined(_)).then_some(())).await;
        b.send(r#"{"type":"joinQueue"}"#).await;
        let ma = a.expect(matched).await;
        b.expect(matched).await;
        (a, b, ma)
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_queue_pairs_fifo() {
        let lobby = lobby();
        let (a, b, ma) = pair(&lobby).await;
        assert_eq!(ma.slot, PlayerSlot::Player1);
        assert_eq!(ma.partner_id, b.gateway.id().to_string());
        assert_eq!(lobby.queue_size().await, 0);
        assert!(lobby.registry().lookup(a.gateway.id()).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_while_in_session_rejected() {
        let lobby = lobby();
        let (mut a, _b, _) = pair(&lobby).await;
        a.send(r#"{"type":"joinQueue"}"#).await;
        assert_eq!(a.expect(error_code).await, ErrorCode::AlreadyInSession);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_queue() {
        let lobby = lobby();
        let mut a = TestClient::connect(&lobby);
        a.send(r#"{"type":"joinQueue"}"#).await;
        a.send(r#"{"type":"leaveQueue"}"#).await;
        a.expect(|m| matches!(m, ServerMessage::QueueLeft).then_some(())).await;
        assert_eq!(lobby.queue_size().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_frame() {
        let lobby = lobby();
        let mut a = TestClient::connect(&lobby);
        a.send("{\"type\":").await;
        assert_eq!(a.expect(error_code).await, ErrorCode::InvalidInput);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guess_without_session() {
        let lobby = lobby();
        let mut a = TestClient::connect(&lobby);
        a.send(r#"{"type":"submitGuess","x":0.5,"y":0.5,"roundId":"abc"}"#).await;
        assert_eq!(a.expect(error_code).await, ErrorCode::NotInSession);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_and_stale_guess() {
        let lobby = lobby();
        let (mut a, mut b, _) = pair(&lobby).await;
        a.send(r#"{"type":"ready"}"#).await;
        b.send(r#"{"type":"ready"}"#).await;
        let round = a.expect(start_round).await;

        b.send(r#"{"type":"validateCoordinates","x":0.5,"y":0.5,"roundId":"0000000000000000"}"#).await;
        let rejected = b
            .expect(|m| match m {
                ServerMessage::GuessRejected(GuessRejected { reason, .. }) => Some(*reason),
                _ => None,
            })
            .await;
        assert_eq!(rejected, GuessRejection::StaleRound);

        let frame = format!(r#"{{"type":"submitGuess","x":0.25,"y":0.75,"roundId":"{}"}}"#, round.round_id);
        a.send(&frame).await;
        b.send(&frame).await;
        let result = a
            .expect(|m| match m {
                ServerMessage::ValidationResult(v) => Some(v.clone()),
                _ => None,
            })
            .await;
        assert_eq!(result.points, 1000);
        assert_eq!(result.opponent_points, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_after_disconnect() {
        let lobby = lobby();
        let (a, mut b, ma) = pair(&lobby).await;
        a.send(r#"{"type":"ready"}"#).await;
        b.send(r#"{"type":"ready"}"#).await;
        let round = b.expect(start_round).await;

        a.gateway.disconnect().await;
        drop(a);

        let mut a2 = TestClient::connect(&lobby);
        a2.send(&format!(r#"{{"type":"restoreSession","sessionId":"{}"}}"#, ma.session_id)).await;

        let rematched = a2.expect(matched).await;
        assert!(rematched.is_reconnect);
        assert_eq!(rematched.session_id, ma.session_id);
        assert_eq!(a2.expect(start_round).await, round);
        let state = a2
            .expect(|m| match m {
                ServerMessage::RestoreGameState(s) => Some(s.clone()),
                _ => None,
            })
            .await;
        assert_eq!(state.round_number, 1);
        let ack = a2
            .expect(|m| match m {
                ServerMessage::RestoreResult(ack) => Some(ack.clone()),
                _ => None,
            })
            .await;
        assert!(ack.success);
        assert!(!ack.no_round_data);
        assert!(!ack.opponent_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_unknown_session() {
        let lobby = lobby();
        let mut a = TestClient::connect(&lobby);
        a.send(r#"{"type":"restoreSession","sessionId":"nope"}"#).await;
        let ack = a
            .expect(|m| match m {
                ServerMessage::RestoreResult(ack) => Some(ack.clone()),
                _ => None,
            })
            .await;
        assert!(!ack.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_attaches() {
        let lobby = lobby();
        let (a, mut b, ma) = pair(&lobby).await;
        a.gateway.disconnect().await;

        let mut a2 = TestClient::connect(&lobby);
        a2.send(&format!(r#"{{"type":"identify","sessionId":"{}"}}"#, ma.session_id)).await;
        let attached = a2
            .expect(|m| match m {
                ServerMessage::SessionAttached(s) => Some(s.clone()),
                _ => None,
            })
            .await;
        assert_eq!(attached.slot, PlayerSlot::Player1);
        assert!(!attached.opponent_pending);

        // The new connection drives the slot
        a2.send(r#"{"type":"leave"}"#).await;
        let reason = b
            .expect(|m| match m {
                ServerMessage::OpponentLeft(o) => Some(o.reason),
                _ => None,
            })
            .await;
        assert_eq!(reason, LeaveReason::Left);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_location() {
        let lobby = lobby();
        let mut a = TestClient::connect(&lobby);
        a.send(r#"{"type":"validateLocation","xCoor":0.25,"yCoor":0.75,"id":"quad"}"#).await;
        let response = a
            .expect(|m| match m {
                ServerMessage::LocationValidated(r) => Some(r.clone()),
                _ => None,
            })
            .await;
        assert_eq!(response.points, 1000);

        a.send(r#"{"type":"validateLocation","xCoor":0.25,"yCoor":0.75,"id":"gym"}"#).await;
        assert_eq!(a.expect(error_code).await, ErrorCode::ValidationFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_and_spectate() {
        let lobby = lobby();
        let (_a, _b, ma) = pair(&lobby).await;
        let mut watcher = TestClient::connect(&lobby);

        watcher.send(r#"{"type":"listMatches"}"#).await;
        let matches = watcher
            .expect(|m| match m {
                ServerMessage::ActiveMatches(list) => Some(list.matches.clone()),
                _ => None,
            })
            .await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].match_id, ma.match_id);
        assert_eq!(matches[0].players.player1.as_deref(), Some("ada"));

        watcher.send(&format!(r#"{{"type":"spectate","matchId":"{}"}}"#, ma.match_id)).await;
        watcher.expect(|m| matches!(m, ServerMessage::SpectatorUpdate(_)).then_some(())).await;

        watcher.send(r#"{"type":"spectate","matchId":"00000000-0000-0000-0000-000000000000"}"#).await;
        assert_eq!(watcher.expect(error_code).await, ErrorCode::MatchNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spectator_joining_queue_stops_watching() {
        let lobby = lobby();
        let (mut a, b, ma) = pair(&lobby).await;

        let mut watcher = TestClient::connect(&lobby);
        watcher.send(&format!(r#"{{"type":"spectate","matchId":"{}"}}"#, ma.match_id)).await;
        watcher.expect(|m| matches!(m, ServerMessage::SpectatorUpdate(_)).then_some(())).await;

        let mut rival = TestClient::connect(&lobby);
        watcher.send(r#"{"type":"joinQueue"}"#).await;
        rival.send(r#"{"type":"joinQueue"}"#).await;
        let own = watcher.expect(matched).await;
        assert_ne!(own.match_id, ma.match_id);
        rival.expect(matched).await;

        b.send(r#"{"type":"leave"}"#).await;
        a.expect(|m| matches!(m, ServerMessage::OpponentLeft(_)).then_some(())).await;

        // Nothing from the first match reaches the new player
        let mut leaked = Vec::new();
        while let Ok(message) = watcher.rx.try_recv() {
            leaked.push(message);
        }
        assert!(leaked.iter().all(|m| !matches!(m, ServerMessage::OpponentLeft(_) | ServerMessage::SpectatorUpdate(_))));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_progress_frames() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(next_connection_id(), tx);
        assert!(handle.send(ServerMessage::PartnerReady));
        assert!(handle.send(ServerMessage::QueueLeft));
        assert!(tokio::time::timeout(Duration::from_millis(20), handle.overflowed()).await.is_err());
        assert!(matches!(rx.recv().await, Some(ServerMessage::PartnerReady)));
    }

    #[tokio::test]
    async fn test_full_buffer_closes_on_result_frame() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(next_connection_id(), tx);
        assert!(handle.send(ServerMessage::PartnerReady));

        let lost = ServerMessage::OpponentLeft(OpponentLeft { reason: LeaveReason::Left });
        assert!(lost.carries_result());
        assert!(!handle.send(lost));
        tokio::time::timeout(Duration::from_secs(1), handle.overflowed())
            .await
            .expect("overflow not signalled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping() {
        let lobby = lobby();
        let mut a = TestClient::connect(&lobby);
        a.send(r#"{"type":"ping","timestamp":77}"#).await;
        let echoed = a
            .expect(|m| match m {
                ServerMessage::Pong { timestamp, .. } => Some(*timestamp),
                _ => None,
            })
            .await;
        assert_eq!(echoed, 77);
    }
}
