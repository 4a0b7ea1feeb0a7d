//! # Recarga Point
//!
//! A simulated charging point. It registers with the broker, answers
//! availability probes and serves queued vehicles one at a time:
//! call, wait for arrival, charge, report the amount due.
//!
//! ```text
//!  broker ──nova-solicitacao──▶ LocalQueue ──▶ QueueEngine
//!    ▲                                           │
//!    └──── chamando-veiculo / recarga-finalizada ┘
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod queue;
pub mod tariff;

pub use client::{handle_message, run};
pub use config::PointConfig;
pub use engine::{Phase, QueueEngine};
pub use error::PointError;
pub use queue::{LocalQueue, WakeSignal};
pub use tariff::{ChargeCost, CostModel};
