//! Normalized Map Coordinates
//!
//! Every position on the campus map is expressed as a pair of floats in
//! [0, 1], independent of the rendered map size. Guesses, correct answers
//! and distances all live in this space.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Lower bound of the normalized map space.
pub const COORD_MIN: f64 = 0.0;

/// Upper bound of the normalized map space.
pub const COORD_MAX: f64 = 1.0;

/// A point on the normalized campus map.
#[derive(Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coord {
    /// Horizontal position, 0 = left edge.
    pub x: f64,
    /// Vertical position, 0 = top edge.
    pub y: f64,
}

impl Coord {
    /// Create a new coordinate.
    #[inline]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another coordinate.
    #[inline]
    pub fn distance(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Both components are finite numbers.
    #[inline]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Both components lie inside the normalized map space.
    #[inline]
    pub fn is_normalized(self) -> bool {
        self.is_finite()
            && (COORD_MIN..=COORD_MAX).contains(&self.x)
            && (COORD_MIN..=COORD_MAX).contains(&self.y)
    }
}

impl fmt::Debug for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coord({:.4}, {:.4})", self.x, self.y)
    }
}
