//! # Campus Guessr Match Server
//!
//! Real-time versus coordination for Campus Guessr: two players see the same
//! campus photo, drop a pin on the map, and score by distance.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  CAMPUS GUESSR SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/              - Primitives                             │
//! │  ├── coord.rs       - Normalized map coordinates             │
//! │  └── rng.rs         - Seeded Xorshift128+ PRNG               │
//! │                                                              │
//! │  game/              - Match rules (no I/O)                   │
//! │  ├── scoring.rs     - Distance to points                     │
//! │  ├── round.rs       - Slots, round ids, round state          │
//! │  ├── catalog.rs     - Location pool and picker               │
//! │  ├── record.rs      - Finished-match records                 │
//! │  └── coordinator.rs - Round state machine                    │
//! │                                                              │
//! │  network/           - Networking                             │
//! │  ├── server.rs      - WebSocket server                       │
//! │  ├── gateway.rs     - Per-connection message routing         │
//! │  ├── queue.rs       - FIFO matchmaking                       │
//! │  ├── session.rs     - Session actors and reconnection        │
//! │  └── protocol.rs    - Message types                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority
//!
//! The server is authoritative for scores. Clients only ever send a pin
//! position; the answer for a round never leaves the server until the
//! round is locked.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::coord::Coord;
pub use core::rng::DeterministicRng;
pub use game::coordinator::{MatchConfig, RoundCoordinator};
pub use game::round::{PlayerSlot, SlotPair};
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
