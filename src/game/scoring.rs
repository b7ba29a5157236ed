//! Guess Scoring
//!
//! One pure scoring function shared by the versus round coordinator and
//! the single-player validation path. Both must produce bit-identical
//! results for identical inputs, so nothing here reads state or time.

use std::time::Duration;
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::coord::Coord;
use crate::game::catalog::LocationCatalog;

/// Points for a perfect guess.
pub const MAX_POINTS: u32 = 1000;

/// Points lost per unit of normalized distance.
///
/// A guess half the map away scores zero.
pub const POINTS_PER_UNIT: f64 = 2000.0;

/// Distance at or beyond which a guess scores zero.
pub const ZERO_POINT_DISTANCE: f64 = MAX_POINTS as f64 / POINTS_PER_UNIT;

/// Guesses within this distance count as "valid" (close enough to flag as a hit).
pub const VALID_THRESHOLD: f64 = 0.1;

/// Maximum timed-mode bonus, awarded to the first submitter.
pub const MAX_TIME_BONUS: u32 = 500;

/// Window after the opponent's submission over which the bonus decays to zero.
pub const TIME_PRESSURE_WINDOW: Duration = Duration::from_secs(15);

/// Result of scoring one guess.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Euclidean distance in normalized map units.
    pub distance: f64,
    /// Integer points in [0, MAX_POINTS].
    pub points: u32,
}

impl Score {
    /// Whether the guess landed within [`VALID_THRESHOLD`].
    pub fn is_valid(&self) -> bool {
        self.distance <= VALID_THRESHOLD
    }
}

/// Score a guess against the correct coordinate.
///
/// `points == MAX_POINTS` exactly when the distance is zero; any non-zero
/// distance is capped one point below, even when rounding would hide it.
pub fn score(guess: Coord, correct: Coord) -> Score {
    let distance = guess.distance(correct);
    Score { distance, points: points_for_distance(distance) }
}

/// Map a distance to points. Monotonically non-increasing.
pub fn points_for_distance(distance: f64) -> u32 {
    if distance.is_nan() || distance >= ZERO_POINT_DISTANCE {
        return 0;
    }
    if distance <= 0.0 {
        return MAX_POINTS;
    }
    let raw = (MAX_POINTS as f64 - distance * POINTS_PER_UNIT).round();
    (raw.max(0.0) as u32).min(MAX_POINTS - 1)
}

/// Timed-mode bonus for a submission.
///
/// Offsets are measured from round start. Submitting first (or alone)
/// earns the full bonus; a later submitter's bonus decays linearly over
/// [`TIME_PRESSURE_WINDOW`] after the opponent's submission.
pub fn time_bonus(own: Duration, opponent: Option<Duration>) -> u32 {
    let opponent = match opponent {
        Some(at) if at < own => at,
        _ => return MAX_TIME_BONUS,
    };

    let delay = own - opponent;
    if delay >= TIME_PRESSURE_WINDOW {
        return 0;
    }
    let ratio = 1.0 - delay.as_secs_f64() / TIME_PRESSURE_WINDOW.as_secs_f64();
    (MAX_TIME_BONUS as f64 * ratio).round() as u32
}

// =============================================================================
// SINGLE-PLAYER VALIDATION
// =============================================================================

/// Stand-alone coordinate validation request (single-player mode).
///
/// The correct coordinate comes either inline or from the catalog by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    /// Guessed x.
    pub x_coor: Option<f64>,
    /// Guessed y.
    pub y_coor: Option<f64>,
    /// Catalog location id.
    #[serde(default)]
    pub id: Option<String>,
    /// Inline correct x (short-circuits the catalog lookup).
    #[serde(default, alias = "correct_x")]
    pub correct_x: Option<f64>,
    /// Inline correct y.
    #[serde(default, alias = "correct_y")]
    pub correct_y: Option<f64>,
}

/// Validation response; `x_coor`/`y_coor` echo the correct location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    /// Distance from guess to correct location.
    pub distance: f64,
    /// Points earned.
    pub points: u32,
    /// Correct x.
    pub x_coor: f64,
    /// Correct y.
    pub y_coor: f64,
}

/// Validation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Guess coordinates missing.
    #[error("missing required fields")]
    MissingFields,
    /// Neither inline coordinates nor a location id were given.
    #[error("missing id for lookup")]
    MissingLocationId,
    /// Catalog has no location with this id.
    #[error("location not found: {0}")]
    LocationNotFound(String),
    /// Guess is not a finite coordinate.
    #[error("invalid coordinate")]
    InvalidCoordinate,
}

/// Validate a single-player guess.
pub fn validate(
    request: &ValidationRequest,
    catalog: &dyn LocationCatalog,
) -> Result<ValidationResponse, ValidationError> {
    let (x, y) = match (request.x_coor, request.y_coor) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err(ValidationError::MissingFields),
    };
    let guess = Coord::new(x, y);
    if !guess.is_finite() {
        return Err(ValidationError::InvalidCoordinate);
    }

    let correct = match (request.correct_x, request.correct_y) {
        (Some(cx), Some(cy)) => Coord::new(cx, cy),
        _ => {
            let id = request.id.as_deref().ok_or(ValidationError::MissingLocationId)?;
            catalog
                .find(id)
                .map(|location| location.coord())
                .ok_or_else(|| ValidationError::LocationNotFound(id.to_string()))?
        }
    };

    let result = score(guess, correct);
    Ok(ValidationResponse {
        distance: result.distance,
        points: result.points,
        x_coor: correct.x,
        y_coor: correct.y,
    })
}
