//! Location Catalog
//!
//! The pool of approved campus photos. Image hosting lives elsewhere; the
//! coordinator only needs an id, an image reference and the answer.

use std::collections::HashMap;
use std::path::Path;

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::coord::Coord;
use crate::core::rng::DeterministicRng;
use crate::game::round::{RoundError, RoundTarget};

/// Draws attempted before accepting a repeated image.
pub const MAX_UNIQUE_ATTEMPTS: usize = 20;

/// One photo location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Location id.
    #[serde(alias = "_id")]
    pub id: String,
    /// Image reference (CDN URL or key).
    pub image: String,
    /// Correct x.
    pub x_coordinate: f64,
    /// Correct y.
    pub y_coordinate: f64,
}

impl Location {
    /// Correct answer as a coordinate.
    pub fn coord(&self) -> Coord {
        Coord::new(self.x_coordinate, self.y_coordinate)
    }

    /// Convert to a round target, rejecting unusable entries.
    pub fn to_target(&self) -> Result<RoundTarget, RoundError> {
        if self.image.trim().is_empty() {
            return Err(RoundError::MalformedRoundData(format!("location {} has no image", self.id)));
        }
        if !self.coord().is_normalized() {
            return Err(RoundError::MalformedRoundData(format!(
                "location {} target outside map bounds",
                self.id
            )));
        }
        Ok(RoundTarget {
            location_id: self.id.clone(),
            image_url: self.image.clone(),
            correct: self.coord(),
        })
    }
}

/// Source of playable locations.
pub trait LocationCatalog: Send + Sync {
    /// Number of locations.
    fn len(&self) -> usize;

    /// Location by position.
    fn get(&self, index: usize) -> Option<&Location>;

    /// Location by id.
    fn find(&self, id: &str) -> Option<&Location>;

    /// Whether the catalog has no locations.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Catalog loading errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// File could not be read.
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    /// File is not valid catalog JSON.
    #[error("failed to parse catalog: {0}")]
    Json(#[from] serde_json::Error),
}

/// Catalog file entry; `status` filters out unapproved uploads.
#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(flatten)]
    location: Location,
    #[serde(default)]
    status: Option<String>,
}

/// In-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    locations: Vec<Location>,
    by_id: HashMap<String, usize>,
}

impl MemoryCatalog {
    /// Build from locations. Later duplicates of an id are ignored.
    pub fn new(locations: Vec<Location>) -> Self {
        let mut kept = Vec::with_capacity(locations.len());
        let mut by_id = HashMap::with_capacity(locations.len());
        for location in locations {
            if by_id.contains_key(&location.id) {
                warn!("Duplicate location id {} ignored", location.id);
                continue;
            }
            by_id.insert(location.id.clone(), kept.len());
            kept.push(location);
        }
        Self { locations: kept, by_id }
    }

    /// Parse a JSON array of locations, keeping approved (or unlabelled) entries.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(json)?;
        let total = entries.len();
        let locations: Vec<Location> = entries
            .into_iter()
            .filter(|e| e.status.as_deref().map_or(true, |s| s == "approved"))
            .map(|e| e.location)
            .collect();
        debug!("Catalog: {} of {} locations approved", locations.len(), total);
        Ok(Self::new(locations))
    }

    /// Load a JSON catalog file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

impl LocationCatalog for MemoryCatalog {
    fn len(&self) -> usize {
        self.locations.len()
    }

    fn get(&self, index: usize) -> Option<&Location> {
        self.locations.get(index)
    }

    fn find(&self, id: &str) -> Option<&Location> {
        self.by_id.get(id).and_then(|&i| self.locations.get(i))
    }
}

// =============================================================================
// ROUND PICKER
// =============================================================================

/// Picks round targets for one match without repeating images.
///
/// When every location has been used the history resets.
#[derive(Debug, Clone)]
pub struct RoundPicker {
    rng: DeterministicRng,
    used: Vec<String>,
}

impl RoundPicker {
    /// Create a picker with its own RNG.
    pub fn new(rng: DeterministicRng) -> Self {
        Self { rng, used: Vec::new() }
    }

    /// Location ids used so far in this match.
    pub fn used(&self) -> &[String] {
        &self.used
    }

    /// Draw a raw 64-bit value from the picker's RNG.
    pub fn next_nonce(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// Pick the next round target.
    pub fn pick(&mut self, catalog: &dyn LocationCatalog) -> Result<RoundTarget, RoundError> {
        let count = catalog.len();
        if count == 0 {
            return Err(RoundError::MalformedRoundData("no locations available".to_string()));
        }

        if self.used.len() >= count {
            debug!("All {} locations used, resetting history", count);
            self.used.clear();
        }

        let mut pick = None;
        for _ in 0..MAX_UNIQUE_ATTEMPTS {
            let candidate = catalog.get(self.rng.next_index(count));
            let repeat = candidate.map_or(true, |l| self.used.contains(&l.id));
            pick = candidate;
            if !repeat {
                break;
            }
        }

        let location = pick
            .or_else(|| catalog.get(0))
            .ok_or_else(|| RoundError::MalformedRoundData("catalog lookup failed".to_string()))?;
        let target = location.to_target()?;
        self.used.push(location.id.clone());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn location(id: &str, x: f64, y: f64) -> Location {
        Location {
            id: id.to_string(),
            image: format!("https://cdn.example/{id}.jpg"),
            x_coordinate: x,
            y_coordinate: y,
        }
    }

    fn catalog(n: usize) -> MemoryCatalog {
        MemoryCatalog::new(
            (0..n).map(|i| location(&format!("loc-{i}"), 0.1, 0.9)).collect(),
        )
    }

    #[test]
    fn test_find_by_id() {
        let catalog = catalog(3);
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.find("loc-2").map(|l| l.id.as_str()), Some("loc-2"));
        assert!(catalog.find("loc-9").is_none());
    }

    #[test]
    fn test_from_json_filters_unapproved() {
        let json = r#"[
            {"_id": "a", "image": "a.jpg", "xCoordinate": 0.1, "yCoordinate": 0.2, "status": "approved"},
            {"id": "b", "image": "b.jpg", "xCoordinate": 0.3, "yCoordinate": 0.4, "status": "pending"},
            {"id": "c", "image": "c.jpg", "xCoordinate": 0.5, "yCoordinate": 0.6}
        ]"#;
        let catalog = MemoryCatalog::from_json(json).unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.find("a").is_some());
        assert!(catalog.find("b").is_none());
    }

    #[test]
    fn test_pick_empty_catalog() {
        let mut picker = RoundPicker::new(DeterministicRng::new(1));
        let result = picker.pick(&MemoryCatalog::default());
        assert!(matches!(result, Err(RoundError::MalformedRoundData(_))));
    }

    #[test]
    fn test_pick_rejects_bad_target() {
        let catalog = MemoryCatalog::new(vec![location("off-map", 1.5, 0.5)]);
        let mut picker = RoundPicker::new(DeterministicRng::new(1));
        assert!(matches!(picker.pick(&catalog), Err(RoundError::MalformedRoundData(_))));
        assert!(picker.used().is_empty());
    }

    #[test]
    fn test_pick_no_repeats_until_exhausted() {
        let catalog = catalog(5);
        let mut seed_source = rand::thread_rng();

        for _ in 0..20 {
            let mut picker = RoundPicker::new(DeterministicRng::new(seed_source.gen()));
            let mut seen = Vec::new();
            for _ in 0..5 {
                seen.push(picker.pick(&catalog).unwrap().location_id);
            }
            // 20 draws per pick make a repeat vanishingly unlikely with 5 items
            seen.sort();
            seen.dedup();
            assert!(seen.len() >= 4, "too many repeats: {:?}", seen);

            // History resets once exhausted
            picker.pick(&catalog).unwrap();
            assert!(picker.used().len() <= 5);
        }
    }

    #[test]
    fn test_pick_single_location_reuses() {
        let catalog = catalog(1);
        let mut picker = RoundPicker::new(DeterministicRng::new(9));
        for _ in 0..3 {
            assert_eq!(picker.pick(&catalog).unwrap().location_id, "loc-0");
        }
    }
}
