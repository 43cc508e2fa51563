use serde::Deserialize;

use crate::error::FabricError;

/// Sizing of the shared [`BufferPool`](crate::BufferPool).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    pub slot_capacity: usize,
    pub slot_count: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { slot_capacity: 65536, slot_count: 1024 }
    }
}

impl BufferPoolConfig {
    pub fn from_json(json: &str) -> Result<Self, FabricError> {
        let config: Self = serde_json::from_str(json).map_err(FabricError::invalid_config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FabricError> {
        crate::ensure!(self.slot_capacity > 0, FabricError::invalid_config("slot_capacity must be positive"));
        crate::ensure!(self.slot_count > 0, FabricError::invalid_config("slot_count must be positive"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = BufferPoolConfig::from_json(r#"{"slot_count": 8}"#).unwrap();
        assert_eq!(config, BufferPoolConfig { slot_capacity: 65536, slot_count: 8 });
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let error = BufferPoolConfig::from_json(r#"{"slot_capacity": 0}"#).unwrap_err();
        assert!(matches!(error, FabricError::InvalidConfig { .. }));
    }
}
