use serde::Deserialize;

use crate::error::SseError;
use crate::utils::ensure;

/// Event stream tuning, loaded from JSON with defaults for every missing field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SseConfig {
    /// `event:` of the event a fabric challenge is delivered as.
    pub challenge_event_type: String,
    /// Comment written once when a response stream opens.
    pub initial_comment: Option<String>,
    /// Reconnection delay in milliseconds advertised when a response stream opens.
    pub retry: Option<u32>,
    pub maximum_last_event_id_size: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            challenge_event_type: "challenge".to_string(),
            initial_comment: None,
            retry: None,
            maximum_last_event_id_size: 254,
        }
    }
}

impl SseConfig {
    pub fn from_json(json: &str) -> Result<Self, SseError> {
        let config: Self = serde_json::from_str(json).map_err(SseError::invalid_config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SseError> {
        ensure!(
            !self.challenge_event_type.is_empty() && !self.challenge_event_type.contains(['\r', '\n']),
            SseError::invalid_config("challenge_event_type must be a single non empty line")
        );
        ensure!(
            self.initial_comment.as_deref().is_none_or(|comment| !comment.contains(['\r', '\n'])),
            SseError::invalid_config("initial_comment must be a single line")
        );
        ensure!(
            self.maximum_last_event_id_size <= 255,
            SseError::invalid_config(format!("maximum_last_event_id_size {} exceeds 255", self.maximum_last_event_id_size))
        );
        Ok(())
    }
}
