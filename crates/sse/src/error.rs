use micro_fabric::FabricError;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SseError {
    #[error("event of {length} bytes exceeds the decode capacity {capacity}")]
    EventTooLong { length: usize, capacity: usize },

    #[error("last event id of {length} bytes exceeds {maximum}")]
    LastEventIdTooLong { length: usize, maximum: usize },

    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    #[error(transparent)]
    Fabric(#[from] FabricError),
}

impl SseError {
    pub fn event_too_long(length: usize, capacity: usize) -> Self {
        Self::EventTooLong { length, capacity }
    }

    pub fn invalid_config<S: ToString>(str: S) -> Self {
        Self::InvalidConfig { reason: str.to_string() }
    }
}
