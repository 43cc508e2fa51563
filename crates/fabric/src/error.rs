use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FabricError {
    #[error("buffer pool exhausted, owner {owner}")]
    SlotExhausted { owner: u64 },

    #[error("slot overflow, length {length} exceed the capacity {capacity}")]
    SlotOverflow { length: usize, capacity: usize },

    #[error("window violation: {reason}")]
    Window { reason: String },

    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },
}

impl FabricError {
    pub fn slot_overflow(length: usize, capacity: usize) -> Self {
        Self::SlotOverflow { length, capacity }
    }

    pub fn window<S: ToString>(str: S) -> Self {
        Self::Window { reason: str.to_string() }
    }

    pub fn invalid_config<S: ToString>(str: S) -> Self {
        Self::InvalidConfig { reason: str.to_string() }
    }
}
