//! Recarga Core Library
//!
//! Wire protocol shared by the dispatch broker, charging points and vehicles.
//! Messages are JSON objects streamed over TCP; ranking uses a haversine
//! distance blended with a congestion penalty.

pub mod channel;
pub mod error;
pub mod geo;
pub mod region;
pub mod summary;
pub mod types;

pub use channel::{split_stream, MessageReader, MessageSink, MessageWriter, SharedWriter};
pub use error::{ChannelError, RegionError, SummaryError};
pub use region::{CoverageArea, PointLocation, Region};
pub use summary::ChargeSummary;
pub use types::*;
