//! Configuration for a charging point

use std::time::Duration;

use crate::tariff::CostModel;

/// Complete charging point configuration
#[derive(Debug, Clone)]
pub struct PointConfig {
    /// Broker address (`host:port`)
    pub broker_addr: String,

    /// How long a called vehicle has to report arrival
    pub arrival_timeout: Duration,

    /// Simulated charging time
    pub charge_duration: Duration,

    /// Pause after a settled charge before calling the next vehicle
    pub settle_pause: Duration,

    /// Wait before re-sending a failed call
    pub call_retry_backoff: Duration,

    /// Poll interval of an idle, empty queue
    pub idle_poll: Duration,

    pub cost: CostModel,
}

impl Default for PointConfig {
    fn default() -> Self {
        Self {
            broker_addr: "127.0.0.1:5000".to_string(),
            arrival_timeout: Duration::from_secs(60),
            charge_duration: Duration::from_secs(20),
            settle_pause: Duration::from_secs(1),
            call_retry_backoff: Duration::from_secs(2),
            idle_poll: Duration::from_secs(1),
            cost: CostModel::default(),
        }
    }
}

impl PointConfig {
    pub fn new(broker_addr: impl Into<String>) -> Self {
        Self {
            broker_addr: broker_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_arrival_timeout(mut self, timeout: Duration) -> Self {
        self.arrival_timeout = timeout;
        self
    }

    /// Set simulated charge duration and post-charge pause
    pub fn with_charge_timing(mut self, charge: Duration, settle_pause: Duration) -> Self {
        self.charge_duration = charge;
        self.settle_pause = settle_pause;
        self
    }

    pub fn with_call_retry_backoff(mut self, backoff: Duration) -> Self {
        self.call_retry_backoff = backoff;
        self
    }

    pub fn with_cost_model(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }
}
