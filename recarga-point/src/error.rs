//! Charging point errors

use recarga_core::ChannelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PointError {
    #[error("Vehicle {0} is not in the queue")]
    NotInQueue(String),

    #[error("Vehicle {plate} is at position {position}, not at the head of the queue")]
    NotAtHead { plate: String, position: usize },

    #[error("Vehicle {0} has not been called yet")]
    NotAwaited(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Rejected by broker: {0}")]
    Rejected(String),
}
