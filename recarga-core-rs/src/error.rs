//! Error types shared by broker and point

use thiserror::Error;

/// Failure on a message channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("stream ended inside a message ({0} bytes pending)")]
    Truncated(usize),

    #[error("message exceeds {0} bytes")]
    Oversized(usize),

    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    /// True for errors caused by the underlying byte stream
    pub fn is_transport(&self) -> bool {
        matches!(self, ChannelError::Io(_) | ChannelError::Closed)
    }
}

/// Failure loading a region descriptor
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("failed to read region file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid region JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("point ids must be exactly 1..={expected}, found {found:?}")]
    InvalidIds { expected: usize, found: Vec<u32> },

    #[error("region has no charging points")]
    Empty,
}

/// Failure parsing a charge summary
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SummaryError {
    #[error("summary does not match the expected layout")]
    Malformed,

    #[error("summary has no vehicle plate")]
    MissingPlate,
}
