//! Active reservation table, keyed by vehicle plate

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use recarga_core::PointId;
use uuid::Uuid;

/// One plate's claim on a charging point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub point_id: PointId,
    /// Short id distinguishing successive reservations of the same plate
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(point_id: PointId) -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self {
            point_id,
            id,
            created_at: Utc::now(),
        }
    }
}

/// Plate → reservation map with its own lock
#[derive(Default)]
pub struct ReservationTable {
    inner: Mutex<HashMap<String, Reservation>>,
}

impl ReservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, returning the entry it replaced
    pub fn insert(&self, plate: &str, reservation: Reservation) -> Option<Reservation> {
        self.inner.lock().insert(plate.to_string(), reservation)
    }

    pub fn get(&self, plate: &str) -> Option<Reservation> {
        self.inner.lock().get(plate).cloned()
    }

    pub fn remove(&self, plate: &str) -> Option<Reservation> {
        self.inner.lock().remove(plate)
    }

    /// Remove only if the current entry still has reservation id `id`
    pub fn remove_if(&self, plate: &str, id: &str) -> Option<Reservation> {
        let mut inner = self.inner.lock();
        if inner.get(plate).map_or(false, |r| r.id == id) {
            inner.remove(plate)
        } else {
            None
        }
    }

    /// Drop every reservation held at `point_id`; returns the affected plates
    pub fn remove_by_point(&self, point_id: PointId) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut plates: Vec<String> = inner
            .iter()
            .filter(|(_, r)| r.point_id == point_id)
            .map(|(plate, _)| plate.clone())
            .collect();
        for plate in &plates {
            inner.remove(plate);
        }
        plates.sort();
        plates
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<(String, Reservation)> {
        let mut entries: Vec<(String, Reservation)> = self
            .inner
            .lock()
            .iter()
            .map(|(plate, r)| (plate.clone(), r.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
