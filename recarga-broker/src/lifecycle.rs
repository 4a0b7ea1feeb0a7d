//! Vehicle reservation lifecycle
//!
//! ```text
//! IDLE -> REQUESTED -> LOCATING -> RANKED -> RESERVING -> QUEUED -> CALLED -> CHARGING -> SETTLED
//!                                    ^           |
//!                                    +-rejected--+
//! any stage --(timeout / disconnect)--> ABORTED
//! any stage without a reservation --(charge request)--> REQUESTED
//! ```
//!
//! Each vehicle connection carries one [`Stage`]. Events coming from the
//! vehicle are checked against it; events coming from a charging point are
//! applied when legal and only logged otherwise.

use crate::error::BrokerError;

/// Stage of a vehicle in the reservation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Stage {
    /// Identified, nothing requested
    #[default]
    Idle,
    /// Charge requested
    Requested,
    /// Location asked from the vehicle
    Locating,
    /// Shortlist delivered
    Ranked,
    /// Reservation forwarded to a point
    Reserving,
    /// Accepted into a point's queue
    Queued,
    /// Point called the vehicle
    Called,
    /// Vehicle plugged in
    Charging,
    /// Charge completed and billed
    Settled,
    /// Timed out, disconnected or the point went away
    Aborted,
}

/// Event driving the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ChargeRequested,
    LocationRequested,
    LocationReported,
    PointChosen,
    Rejected,
    Enqueued,
    Called,
    Arrived,
    Completed,
    Expired,
    PointLost,
    Disconnected,
}

/// Pure transition function; `None` when the event is not allowed
pub fn transition(stage: Stage, event: LifecycleEvent) -> Option<Stage> {
    use LifecycleEvent as E;
    use Stage as S;

    match (stage, event) {
        (_, E::Expired | E::PointLost | E::Disconnected) => Some(S::Aborted),

        (
            S::Idle | S::Requested | S::Locating | S::Ranked | S::Settled | S::Aborted,
            E::ChargeRequested,
        ) => Some(S::Requested),
        (S::Requested, E::LocationRequested) => Some(S::Locating),
        (S::Locating | S::Ranked, E::LocationReported) => Some(S::Ranked),
        (S::Ranked, E::PointChosen) => Some(S::Reserving),
        (S::Reserving, E::Rejected) => Some(S::Ranked),
        (S::Reserving, E::Enqueued) => Some(S::Queued),
        (S::Reserving | S::Queued, E::Called) => Some(S::Called),
        (S::Called, E::Arrived) => Some(S::Charging),
        (S::Called | S::Charging, E::Completed) => Some(S::Settled),

        _ => None,
    }
}

impl Stage {
    /// Apply an event, failing if it is not allowed in this stage
    pub fn advance(&mut self, event: LifecycleEvent) -> Result<Stage, BrokerError> {
        match transition(*self, event) {
            Some(next) => {
                *self = next;
                Ok(next)
            }
            None => Err(BrokerError::InvalidTransition { stage: *self, event }),
        }
    }

    /// True while a reservation is held at some point
    pub fn holds_reservation(&self) -> bool {
        matches!(self, Stage::Reserving | Stage::Queued | Stage::Called | Stage::Charging)
    }
}
