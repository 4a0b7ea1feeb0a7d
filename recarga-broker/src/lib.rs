//! # Recarga Broker
//!
//! Central dispatch broker for EV charging. Vehicles and charging points
//! connect over TCP; the broker ranks points for each vehicle, forwards
//! reservations to the chosen point and relays the point's queue events
//! back to the vehicle.
//!
//! ## Architecture
//!
//! ```text
//! vehicles           charging points
//!     │ TCP JSON           │ TCP JSON
//!     ▼                    ▼
//! ┌──────────────────────────────────┐
//! │          Dispatcher              │
//! │  ┌──────────┐  ┌──────────────┐  │
//! │  │ Registry │  │ Reservations │  │
//! │  └──────────┘  └──────────────┘  │
//! │  ┌──────────┐  ┌──────────────┐  │
//! │  │ Ranker   │  │ HistoryStore │  │
//! │  └──────────┘  └──────────────┘  │
//! └──────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use recarga_broker::{Broker, BrokerConfig, MemoryHistory};
//! use recarga_core::Region;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let region = Region::load("regiao.json")?;
//!     let broker = Broker::new(BrokerConfig::default(), region, Arc::new(MemoryHistory::new()));
//!
//!     broker.bind().await?.run().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod peer;
pub mod ranking;
pub mod registry;
pub mod reservations;
pub mod server;

pub use config::{BrokerConfig, MonitorConfig, RankingConfig, RetryPolicy, DEFAULT_PORT};
pub use dispatcher::Dispatcher;
pub use error::{BrokerError, HistoryError};
pub use history::{HistoryStore, JsonFileHistory, MemoryHistory, RechargeRecord};
pub use lifecycle::{LifecycleEvent, Stage};
pub use peer::{ConnId, Peer};
pub use ranking::{Ranker, RankingEntry};
pub use registry::{Registry, Released};
pub use reservations::{Reservation, ReservationTable};
pub use server::{BoundBroker, Broker};
