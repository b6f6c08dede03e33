//! Decoder configuration, loadable from JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::demuxer::SourceOptions;
use crate::gate::DEFAULT_CAPACITY;
use crate::pixel_convert::ColorSpace;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Frames that may be published and not yet released
    pub max_frames_in_queue: usize,
    /// How long `abort()` waits for the decode thread
    pub abort_timeout_ms: u64,
    pub color_space: ColorSpace,
    /// Row alignment of the converter's output buffer
    pub row_alignment: usize,
    /// Row alignment of published images
    pub image_row_alignment: usize,
    /// Upper bound on empty-packet submissions when draining
    pub flush_limit: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_frames_in_queue: DEFAULT_CAPACITY,
            abort_timeout_ms: 5_000,
            color_space: ColorSpace::Bt601,
            row_alignment: 32,
            image_row_alignment: 4,
            flush_limit: 1_024,
        }
    }
}

impl DecoderConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frames_in_queue == 0 {
            return Err(ConfigError::Invalid("max_frames_in_queue must be at least 1".into()));
        }
        for (name, value) in [
            ("row_alignment", self.row_alignment),
            ("image_row_alignment", self.image_row_alignment),
        ] {
            if !value.is_power_of_two() {
                return Err(ConfigError::Invalid(format!("{} must be a power of two, got {}", name, value)));
            }
        }
        if self.flush_limit == 0 {
            return Err(ConfigError::Invalid("flush_limit must be at least 1".into()));
        }
        Ok(())
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            color_space: self.color_space,
            row_alignment: self.row_alignment,
        }
    }
}
