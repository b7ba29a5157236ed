//! Game Logic Module
//!
//! Everything that decides a match. No sockets, no clocks of its own:
//! callers pass the current instant in.
//!
//! ## Module Structure
//!
//! - `scoring`: Distance to points, time bonus, standalone validation
//! - `round`: Player slots, round ids, per-round state
//! - `catalog`: Location pool and non-repeating picker
//! - `record`: Finished-match records and stores
//! - `coordinator`: Round state machine for one match

pub mod scoring;
pub mod round;
pub mod catalog;
pub mod record;
pub mod coordinator;

// Re-export key types
pub use scoring::{score, MAX_POINTS, VALID_THRESHOLD};
pub use round::{PlayerSlot, SlotPair, RoundId, RoundView};
pub use catalog::{Location, LocationCatalog, MemoryCatalog};
pub use record::{MatchRecord, MatchStore};
pub use coordinator::{RoundCoordinator, MatchConfig, RoundState, Effect};
