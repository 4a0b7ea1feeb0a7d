//! Region descriptor: coverage box and charging point locations

use crate::error::RegionError;
use crate::types::PointId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Bounding box of the served area
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageArea {
    pub latitude_min: f64,
    pub latitude_max: f64,
    pub longitude_min: f64,
    pub longitude_max: f64,
}

/// Fixed location of one charging point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointLocation {
    pub id: PointId,
    pub latitude: f64,
    pub longitude: f64,
}

/// Region descriptor loaded once at broker start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    #[serde(rename = "area-cobertura")]
    pub area: CoverageArea,
    #[serde(rename = "pontos-de-recarga")]
    points: Vec<PointLocation>,
}

impl Region {
    /// Build a region, checking that point ids are exactly `1..=N`
    pub fn new(area: CoverageArea, mut points: Vec<PointLocation>) -> Result<Self, RegionError> {
        if points.is_empty() {
            return Err(RegionError::Empty);
        }

        points.sort_by_key(|p| p.id);
        let valid = points
            .iter()
            .enumerate()
            .all(|(i, p)| p.id as usize == i + 1);
        if !valid {
            return Err(RegionError::InvalidIds {
                expected: points.len(),
                found: points.iter().map(|p| p.id).collect(),
            });
        }

        Ok(Self { area, points })
    }

    pub fn from_json(text: &str) -> Result<Self, RegionError> {
        let raw: Region = serde_json::from_str(text)?;
        Self::new(raw.area, raw.points)
    }

    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegionError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let region = Self::from_json(&text)?;
        info!(
            "Region: loaded {} charging points from {}",
            region.point_count(),
            path.display()
        );
        Ok(region)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn point(&self, id: PointId) -> Option<&PointLocation> {
        let index = (id as usize).checked_sub(1)?;
        self.points.get(index)
    }

    /// Points in ascending id order
    pub fn points(&self) -> &[PointLocation] {
        &self.points
    }

    /// Check whether a coordinate falls inside the coverage box
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.area.latitude_min..=self.area.latitude_max).contains(&latitude)
            && (self.area.longitude_min..=self.area.longitude_max).contains(&longitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "area-cobertura": {
            "latitude_min": -13.0, "latitude_max": -12.8,
            "longitude_min": -38.6, "longitude_max": -38.3
        },
        "pontos-de-recarga": [
            {"id": 2, "latitude": -12.95, "longitude": -38.45},
            {"id": 1, "latitude": -12.90, "longitude": -38.40}
        ]
    }"#;

    #[test]
    fn test_parse_and_lookup() {
        let region = Region::from_json(SAMPLE).unwrap();
        assert_eq!(region.point_count(), 2);
        assert_eq!(region.points()[0].id, 1);
        assert_eq!(region.point(2).unwrap().latitude, -12.95);
        assert!(region.point(0).is_none());
        assert!(region.point(3).is_none());
    }

    #[test]
    fn test_contains() {
        let region = Region::from_json(SAMPLE).unwrap();
        assert!(region.contains(-12.9, -38.5));
        assert!(!region.contains(-14.0, -38.5));
    }

    #[test]
    fn test_rejects_gaps_and_duplicates() {
        let gap = SAMPLE.replace("\"id\": 2", "\"id\": 3");
        assert!(matches!(
            Region::from_json(&gap),
            Err(RegionError::InvalidIds { expected: 2, .. })
        ));

        let dup = SAMPLE.replace("\"id\": 2", "\"id\": 1");
        assert!(matches!(Region::from_json(&dup), Err(RegionError::InvalidIds { .. })));

        let empty = r#"{"area-cobertura": {"latitude_min": 0, "latitude_max": 1,
            "longitude_min": 0, "longitude_max": 1}, "pontos-de-recarga": []}"#;
        assert!(matches!(Region::from_json(empty), Err(RegionError::Empty)));
    }

    #[test]
    fn test_load_and_reencode() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let region = Region::load(file.path()).unwrap();
        let again = Region::from_json(&region.to_json().unwrap()).unwrap();
        assert_eq!(again, region);
    }
}
