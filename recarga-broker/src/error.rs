//! Broker error taxonomy

use recarga_core::{ChannelError, PointId};
use thiserror::Error;

use crate::lifecycle::{LifecycleEvent, Stage};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("No free charging point id")]
    PoolExhausted,

    #[error("Plate {0} is already in use")]
    PlateInUse(String),

    #[error("Charging point {0} not found")]
    PointNotFound(PointId),

    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("Event {event:?} not allowed in stage {stage:?}")]
    InvalidTransition { stage: Stage, event: LifecycleEvent },

    #[error("History error: {0}")]
    History(#[from] HistoryError),
}

/// Failure of the recharge history store
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Invalid record: {0}")]
    InvalidRecord(&'static str),

    #[error("History file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
