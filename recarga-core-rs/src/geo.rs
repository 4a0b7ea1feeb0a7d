//! Distance and congestion scoring
//!
//! Lower scores are better. Distance saturates at [`DISTANCE_CAP_KM`] so a far
//! but empty point can still beat a near but congested one.

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Queue length used when a point did not answer in time
pub const UNKNOWN_QUEUE: usize = 999;

pub const DISTANCE_WEIGHT: f64 = 0.4;
pub const QUEUE_WEIGHT: f64 = 0.6;
pub const DISTANCE_CAP_KM: f64 = 10.0;

/// Queue length after which the penalty grows super-linearly
pub const PENALTY_KNEE: usize = 3;

/// Great-circle distance in kilometers
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c / 1000.0
}

/// Congestion penalty for a queue of `queue` vehicles
pub fn penalty(queue: usize) -> f64 {
    if queue <= PENALTY_KNEE {
        queue as f64
    } else {
        PENALTY_KNEE as f64 + ((queue - PENALTY_KNEE) as f64).powf(1.5)
    }
}

pub fn score(distance_km: f64, queue: usize) -> f64 {
    DISTANCE_WEIGHT * distance_km.min(DISTANCE_CAP_KM) + QUEUE_WEIGHT * penalty(queue)
}

/// Queue length as shown to a vehicle (unknown shows as empty)
pub fn display_queue(queue: usize) -> usize {
    if queue == UNKNOWN_QUEUE {
        0
    } else {
        queue
    }
}

/// Parse a `"<lat>,<lon>"` location payload
pub fn parse_location(text: &str) -> Option<(f64, f64)> {
    let (lat, lon) = text.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    if !lat.is_finite() || !lon.is_finite() {
        return None;
    }
    Some((lat, lon))
}
