//! Network Layer
//!
//! WebSocket server, matchmaking and session management.
//! Round rules live in `game/`; this layer routes messages and owns timers.

pub mod protocol;
pub mod queue;
pub mod session;
pub mod gateway;
pub mod server;

pub use protocol::{ClientMessage, ServerMessage, ErrorCode, LeaveReason, MatchSummary};
pub use queue::{MatchQueue, QueueEntry, EnqueueOutcome};
pub use session::{SessionId, SessionKey, SessionConfig, SessionError, SessionRegistry};
pub use gateway::{ConnectionGateway, ConnectionHandle, ConnectionId, Lobby};
pub use server::{GameServer, ServerConfig, GameServerError, ConfigError};
