//! Core primitives.
//!
//! Normalized map coordinates and the seeded RNG used to draw locations.

pub mod coord;
pub mod rng;

// Re-export core types
pub use coord::Coord;
pub use rng::DeterministicRng;
