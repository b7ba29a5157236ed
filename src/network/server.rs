//! WebSocket Game Server
//!
//! Async WebSocket server for versus connections. Each connection gets a
//! [`ConnectionGateway`]; everything game-related happens behind it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, broadcast};
use tokio::time::{interval, sleep_until, Instant};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::game::catalog::LocationCatalog;
use crate::game::coordinator::MatchConfig;
use crate::game::record::MatchStore;
use crate::network::gateway::{next_connection_id, ConnectionGateway, ConnectionHandle, Lobby};
use crate::network::protocol::{ErrorCode, ServerMessage};
use crate::network::session::SessionConfig;

/// Outbound frames buffered per connection.
const OUTBOUND_BUFFER: usize = 64;

/// How often closed queue entries are swept.
const QUEUE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections silent this long are closed.
    pub idle_timeout: Duration,
    /// Session and match rules.
    pub session: SessionConfig,
    /// JSON catalog of playable locations.
    pub locations_file: Option<PathBuf>,
    /// JSON-lines file finished matches are appended to.
    pub match_log_file: Option<PathBuf>,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            session: SessionConfig::default(),
            locations_file: None,
            match_log_file: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(None),
    }
}

fn env_secs(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(var)?.map(Duration::from_secs))
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let match_defaults = MatchConfig::default();

        let match_config = MatchConfig {
            round_limit: env_parse("ROUND_LIMIT")?.unwrap_or(match_defaults.round_limit),
            round_timeout: env_secs("ROUND_TIMEOUT_SECS")?.unwrap_or(match_defaults.round_timeout),
            intermission: env_secs("ROUND_INTERMISSION_SECS")?.unwrap_or(match_defaults.intermission),
            timed_mode: std::env::var("TIMED_MODE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(match_defaults.timed_mode),
        };
        if match_config.round_limit == 0 {
            return Err(ConfigError::Invalid { var: "ROUND_LIMIT", value: "0".to_string() });
        }

        Ok(Self {
            bind_addr: env_parse("BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            max_connections: env_parse("MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            idle_timeout: env_secs("IDLE_TIMEOUT_SECS")?.unwrap_or(defaults.idle_timeout),
            session: SessionConfig {
                reconnect_grace: env_secs("RECONNECT_GRACE_SECS")?
                    .unwrap_or(defaults.session.reconnect_grace),
                match_config,
            },
            locations_file: std::env::var("LOCATIONS_FILE").ok().map(PathBuf::from),
            match_log_file: std::env::var("MATCH_LOG_FILE").ok().map(PathBuf::from),
            version: defaults.version,
        })
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Queue, sessions and catalog.
    lobby: Arc<Lobby>,
    /// Live connections.
    connections: Arc<AtomicUsize>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, catalog: Arc<dyn LocationCatalog>, store: Arc<dyn MatchStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let lobby = Arc::new(Lobby::new(config.session.clone(), catalog, store));

        Self {
            config,
            lobby,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Run the server until [`GameServer::shutdown`] is called.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Game server v{} listening on {}", self.config.version, self.config.bind_addr);

        let cleanup_lobby = self.lobby.clone();
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_lobby).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::Relaxed) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                Self::reject_overloaded(stream);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let lobby = self.lobby.clone();
        let connections = self.connections.clone();
        let idle_timeout = self.config.idle_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };
            connections.fetch_add(1, Ordering::Relaxed);

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);
            let connection = ConnectionHandle::new(next_connection_id(), msg_tx);
            let gateway = ConnectionGateway::new(lobby, connection.clone());
            info!("Connection {} opened from {}", gateway.id(), addr);

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let mut last_activity = Instant::now();

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        last_activity = Instant::now();
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                gateway.handle_text(&text).await;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                connection.send(ServerMessage::error(
                                    ErrorCode::InvalidInput,
                                    "Binary frames are not supported",
                                ));
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Connection {} closed by peer", gateway.id());
                                break;
                            }
                            Some(Err(e)) => {
                                debug!("WebSocket error on connection {}: {}", gateway.id(), e);
                                break;
                            }
                            // Ping/pong frames are answered by tungstenite
                            _ => {}
                        }
                    }
                    _ = connection.overflowed() => {
                        warn!("Connection {} fell behind, closing", gateway.id());
                        break;
                    }
                    _ = sleep_until(last_activity + idle_timeout) => {
                        info!("Connection {} idle for {:?}, closing", gateway.id(), idle_timeout);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        connection.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        });
                        break;
                    }
                }
            }

            // Cleanup
            let connection_id = gateway.id();
            gateway.disconnect().await;
            drop(gateway);
            drop(connection);
            // Queued frames flush before the socket goes away
            let _ = tokio::time::timeout(Duration::from_secs(1), sender_task).await;
            connections.fetch_sub(1, Ordering::Relaxed);

            info!("Connection {} from {} cleaned up", connection_id, addr);
        });
    }

    /// Complete the handshake only to tell the client the server is full.
    fn reject_overloaded(stream: TcpStream) {
        tokio::spawn(async move {
            let Ok(mut ws) = accept_async(stream).await else {
                return;
            };
            let message = ServerMessage::error(ErrorCode::ServerOverloaded, "Server is at capacity");
            if let Ok(text) = message.to_json() {
                let _ = ws.send(Message::Text(text)).await;
            }
            let _ = ws.close(None).await;
        });
    }

    /// Periodically drop queue entries whose connection has gone.
    async fn run_cleanup_loop(lobby: Arc<Lobby>) {
        let mut interval = interval(QUEUE_SWEEP_INTERVAL);

        loop {
            interval.tick().await;

            let removed = lobby.reap_queue().await;
            if removed > 0 {
                debug!("Removed {} stale queue entries", removed);
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Shared lobby.
    pub fn lobby(&self) -> &Arc<Lobby> {
        &self.lobby
    }

    /// Get connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.lobby.registry().session_count().await
    }

    /// Get matchmaking queue size.
    pub async fn queue_size(&self) -> usize {
        self.lobby.queue_size().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::catalog::MemoryCatalog;
    use crate::game::record::MemoryMatchStore;

    fn server(config: ServerConfig) -> GameServer {
        GameServer::new(config, Arc::new(MemoryCatalog::default()), Arc::new(MemoryMatchStore::new()))
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.session.reconnect_grace, Duration::from_secs(30));
        assert_eq!(config.session.match_config.round_limit, 5);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = server(ServerConfig::default());
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.session_count().await, 0);
        assert_eq!(server.queue_size().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        let server = Arc::new(server(config));
        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
