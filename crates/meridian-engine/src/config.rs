//! Engine configuration.
//!
//! Wraps the streaming configuration with the settings of the headless
//! driver. Configuration can be loaded from and saved to a TOML file.

use meridian_world::StreamingConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Configuration file name.
const CONFIG_FILE: &str = "meridian.toml";

/// Engine configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // === Driver Settings ===
    /// Number of turns to simulate
    pub ticks: u64,
    /// Columns the reality bubble moves east per turn
    pub walk_step: i32,
    /// Dimension to switch to halfway through the run (None = stay)
    pub switch_dimension: Option<String>,
    /// Log progress every this many turns (0 = never)
    pub report_interval: u64,
    /// Save every dimension before exiting
    pub save_on_exit: bool,

    // === Streaming ===
    /// Streaming layer settings
    pub streaming: StreamingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ticks: 100,
            walk_step: 1,
            switch_dimension: None,
            report_interval: 10,
            save_on_exit: true,
            streaming: StreamingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default file location.
    /// Returns default config if file doesn't exist.
    pub fn load() -> Self {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from a specific path.
    /// Returns default config if file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found, using defaults");
            return Self::default();
        }

        let mut config: Self = match fs::File::open(path) {
            Ok(mut file) => {
                let mut contents = String::new();
                if let Err(e) = file.read_to_string(&mut contents) {
                    warn!("Failed to read config file: {e}");
                    return Self::default();
                }

                match toml::from_str(&contents) {
                    Ok(config) => {
                        info!("Loaded config from {}", path.display());
                        config
                    },
                    Err(e) => {
                        warn!("Failed to parse config file: {e}");
                        return Self::default();
                    },
                }
            },
            Err(e) => {
                warn!("Failed to open config file: {e}");
                return Self::default();
            },
        };
        config.validate();
        config
    }

    /// Save configuration to the default file location.
    pub fn save(&self) -> io::Result<()> {
        self.save_to(Self::config_path())
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path.
    fn config_path() -> PathBuf {
        dirs::config_dir().map_or_else(
            || PathBuf::from(CONFIG_FILE),
            |dir| dir.join("meridian").join(CONFIG_FILE),
        )
    }

    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        self.walk_step = self.walk_step.clamp(-16, 16);
        self.streaming.validate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.ticks, 100);
        assert!(config.save_on_exit);
        assert!(config.switch_dimension.is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.walk_step = 400;
        config.streaming.bubble_radius = 10_000;

        config.validate();

        assert_eq!(config.walk_step, 16);
        assert!(config.streaming.bubble_radius < 10_000);
    }

    #[test]
    fn test_config_save_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let mut config = EngineConfig::default();
        config.ticks = 7;
        config.switch_dimension = Some("lab".to_string());
        config.streaming.worker_threads = Some(3);
        config.streaming.generator.seed = 99;

        config.save_to(&config_path).expect("Failed to save config");

        let loaded = EngineConfig::load_from(&config_path);
        assert_eq!(loaded.ticks, 7);
        assert_eq!(loaded.switch_dimension.as_deref(), Some("lab"));
        assert_eq!(loaded.streaming.worker_threads, Some(3));
        assert_eq!(loaded.streaming.generator.seed, 99);
    }

    #[test]
    fn test_config_load_missing_file() {
        let config = EngineConfig::load_from("/nonexistent/path/meridian.toml");
        assert_eq!(config.ticks, 100);
    }

    #[test]
    fn test_config_load_invalid_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("broken.toml");
        fs::write(&config_path, "ticks = \"many\"").expect("Failed to write file");
        let config = EngineConfig::load_from(&config_path);
        assert_eq!(config.ticks, 100);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("partial.toml");
        fs::write(&config_path, "ticks = 3\n[streaming]\nbubble_radius = 2\n")
            .expect("Failed to write file");
        let config = EngineConfig::load_from(&config_path);
        assert_eq!(config.ticks, 3);
        assert_eq!(config.streaming.bubble_radius, 2);
        assert_eq!(config.walk_step, 1);
    }

    #[test]
    fn test_loaded_config_is_validated() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("wild.toml");
        fs::write(&config_path, "walk_step = 99\n[streaming]\nz_min = 3\nz_max = -2\n")
            .expect("Failed to write file");
        let config = EngineConfig::load_from(&config_path);
        assert_eq!(config.walk_step, 16);
        assert_eq!((config.streaming.z_min, config.streaming.z_max), (-2, 3));
    }

    #[test]
    fn test_config_toml_serialization() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("Failed to serialize");

        assert!(toml_str.contains("ticks"));
        assert!(toml_str.contains("[streaming]"));
    }
}
