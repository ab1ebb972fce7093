/*!
Session configuration consumed by the pipeline.
*/

use crate::error::{PipelineError, Result};
use crate::protocol::CHANNEL_WIDTH;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What happens to the intensity of a column whose distance sample is invalid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidIntensity {
    /// Leave the raw intensity untouched
    #[default]
    Keep,
    /// Force the intensity to zero
    Zero,
}

/// Half-open column range `[start, end)` kept from every profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnWindow {
    pub start: usize,
    pub end: usize,
}

impl ColumnWindow {
    pub fn new(start: usize, end: usize) -> Result<Self> {
        if start >= end {
            return Err(PipelineError::config(format!(
                "empty column window {}..{}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse `START:END`
    pub fn parse(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once(':')
            .ok_or_else(|| PipelineError::config(format!("column window '{}' is not START:END", s)))?;
        let start = start
            .trim()
            .parse()
            .map_err(|_| PipelineError::config(format!("invalid window start '{}'", start)))?;
        let end = end
            .trim()
            .parse()
            .map_err(|_| PipelineError::config(format!("invalid window end '{}'", end)))?;
        Self::new(start, end)
    }

    pub fn width(&self) -> usize {
        self.end - self.start
    }

    /// Check that the window fits into a profile of `width` columns
    pub fn validate(&self, width: usize) -> Result<()> {
        if self.end > width {
            return Err(PipelineError::config(format!(
                "column window {}..{} exceeds profile width {}",
                self.start, self.end, width
            )));
        }
        Ok(())
    }
}

/// Settings for one acquisition session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Rows per chunk appended to storage in one go
    pub chunk_rows: usize,

    /// Raw frames buffered between acquisition and consumer
    pub queue_capacity: usize,

    /// Optional column crop applied to every decoded profile
    pub column_window: Option<ColumnWindow>,

    /// Recording threshold on the mean distance; `None` records everything
    pub threshold: Option<f32>,

    /// Backing file for the datasets
    pub storage_path: PathBuf,

    /// Align frames of several sensors into synchronized tuples
    pub multi_device_sync: bool,

    /// Decode the frames still queued when the session stops
    pub drain_on_stop: bool,

    /// Intensity handling at invalid positions
    pub invalid_intensity: InvalidIntensity,

    /// Sleep between polls of an empty source or queue, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_rows: 2048,
            queue_capacity: 500,
            column_window: None,
            threshold: None,
            storage_path: PathBuf::from("vrmagic-dump.hdf5"),
            multi_device_sync: false,
            drain_on_stop: true,
            invalid_intensity: InvalidIntensity::Keep,
            poll_interval_ms: 5,
        }
    }
}

impl SessionConfig {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_rows == 0 {
            return Err(PipelineError::config("chunk_rows must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::config("queue_capacity must be at least 1"));
        }
        if let Some(window) = &self.column_window {
            window.validate(CHANNEL_WIDTH)?;
        }
        if let Some(threshold) = self.threshold {
            if !threshold.is_finite() {
                return Err(PipelineError::config("threshold must be a finite number"));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = SessionConfig::default();
        assert_eq!(config.chunk_rows, 2048);
        assert_eq!(config.queue_capacity, 500);
        assert!(config.threshold.is_none());
        assert!(config.drain_on_stop);
        assert_eq!(config.invalid_intensity, InvalidIntensity::Keep);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_column_window_parsing() {
        let window = ColumnWindow::parse("100:612").unwrap();
        assert_eq!(window, ColumnWindow { start: 100, end: 612 });
        assert_eq!(window.width(), 512);

        assert!(ColumnWindow::parse("612:100").is_err());
        assert!(ColumnWindow::parse("100").is_err());
        assert!(ColumnWindow::parse("a:b").is_err());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = SessionConfig {
            chunk_rows: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());

        config.chunk_rows = 4;
        config.column_window = Some(ColumnWindow { start: 0, end: 4096 });
        assert!(config.validate().is_err());

        config.column_window = None;
        config.threshold = Some(f32::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SessionConfig = toml::from_str("chunk_rows = 16\nthreshold = -30.0\n").unwrap();
        assert_eq!(config.chunk_rows, 16);
        assert_eq!(config.threshold, Some(-30.0));
        assert_eq!(config.queue_capacity, 500);
    }
}
