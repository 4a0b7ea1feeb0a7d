//! Configuration for the dispatch broker
//!
//! Timing knobs for ranking, reservation confirmation and queue monitoring.

use std::net::SocketAddr;
use std::time::Duration;

/// Default TCP port of the broker
pub const DEFAULT_PORT: u16 = 5000;

/// Complete broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address the listener binds to
    pub listen_addr: SocketAddr,

    pub ranking: RankingConfig,

    pub monitor: MonitorConfig,

    /// Retries for `reserva-confirmada`
    pub confirm_retry: RetryPolicy,

    /// Retries for `ranking-pontos`
    pub ranking_retry: RetryPolicy,

    /// Upper bound on one availability poll outside ranking
    pub poll_timeout: Duration,
}

/// Ranking configuration
#[derive(Debug, Clone)]
pub struct RankingConfig {
    /// Wait for one point's queue length
    pub query_timeout: Duration,

    /// Wait for the whole batch of queries
    pub batch_timeout: Duration,

    /// Number of entries returned to the vehicle
    pub shortlist_len: usize,
}

/// Queue position monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub max_duration: Duration,
}

/// Bounded retry with a fixed backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            ranking: RankingConfig::default(),
            monitor: MonitorConfig::default(),
            confirm_retry: RetryPolicy::new(3, Duration::from_millis(100)),
            ranking_retry: RetryPolicy::new(3, Duration::from_millis(500)),
            poll_timeout: Duration::from_secs(3),
        }
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(2),
            batch_timeout: Duration::from_secs(5),
            shortlist_len: 3,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_duration: Duration::from_secs(600),
        }
    }
}

impl BrokerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Set ranking timeouts
    pub fn with_ranking_timeouts(mut self, query: Duration, batch: Duration) -> Self {
        self.ranking.query_timeout = query;
        self.ranking.batch_timeout = batch;
        self
    }

    /// Set monitor cadence
    pub fn with_monitor(mut self, interval: Duration, max_duration: Duration) -> Self {
        self.monitor.interval = interval;
        self.monitor.max_duration = max_duration;
        self
    }

    pub fn with_confirm_retry(mut self, retry: RetryPolicy) -> Self {
        self.confirm_retry = retry;
        self
    }

    pub fn with_ranking_retry(mut self, retry: RetryPolicy) -> Self {
        self.ranking_retry = retry;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}
