/*!
Configuration management for the profile grabber application.
*/

use anyhow::{Context, Result};
use profile_core::{CalibrationRegisters, SessionConfig, SyntheticConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub source: SourceConfig,
    pub reporting: ReportingConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Load the file if it exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Generated frames of an object passing through the line
    #[default]
    Synthetic,
    /// Raw dump recorded by an earlier capture
    Replay,
}

/// Frame source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,

    /// Number of sensors recorded together
    pub sensors: usize,

    /// Raw dump replayed by the replay source
    pub replay_path: Option<PathBuf>,

    /// Payload size of the frames in a replay file
    pub payload_size: usize,

    /// Synthetic generator settings
    pub synthetic: SyntheticConfig,

    /// Calibration registers of the sensor
    pub registers: CalibrationRegisters,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Synthetic,
            sensors: 1,
            replay_path: None,
            payload_size: profile_core::protocol::DEFAULT_PAYLOAD_SIZE,
            synthetic: SyntheticConfig::default(),
            registers: CalibrationRegisters::default(),
        }
    }
}

/// Status reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// Statistics reporting interval in seconds
    pub stats_interval_seconds: u64,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            stats_interval_seconds: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let mut original_config = AppConfig::new();
        original_config.session.threshold = Some(-30.0);
        original_config.source.kind = SourceKind::Replay;
        original_config.source.replay_path = Some(PathBuf::from("raw.bin"));

        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        // Save and load
        original_config.save_to_file(temp_path).unwrap();
        let loaded_config = AppConfig::load_from_file(temp_path).unwrap();

        assert_eq!(format!("{:?}", original_config), format!("{:?}", loaded_config));
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::new();

        assert_eq!(config.session.chunk_rows, 2048);
        assert_eq!(config.session.queue_capacity, 500);
        assert_eq!(config.session.storage_path, PathBuf::from("vrmagic-dump.hdf5"));
        assert!(config.session.threshold.is_none());
        assert_eq!(config.source.kind, SourceKind::Synthetic);
        assert_eq!(config.source.sensors, 1);
        assert_eq!(config.source.payload_size, 12352);
        assert_eq!(config.reporting.stats_interval_seconds, 10);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut temp_file,
            b"[session]\nthreshold = -25.5\n\n[source.registers]\nc_offset_numerator = 4294967246\n",
        )
        .unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.session.threshold, Some(-25.5));
        assert_eq!(config.session.chunk_rows, 2048);
        assert_eq!(config.source.registers.c_offset_numerator, 4294967246);
        assert_eq!(config.source.registers.c_scale_denominator, 100);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AppConfig::load_from_file("/nonexistent/profilegrabber.toml").is_err());
        assert!(AppConfig::load_or_default("/nonexistent/profilegrabber.toml").is_ok());
    }
}
