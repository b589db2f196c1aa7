//! Configuration file support for ecgsim.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ECGSIM_*)
//! 3. Local config file (./ecgsim.toml)
//! 4. Global config file (~/.config/ecgsim/config.toml)

use crate::CliError;
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "ecgsim.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Default response timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// Upload defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadDefaults {
    /// DAC peak-to-peak voltage.
    pub pp_voltage: Option<f64>,
    /// Heart rate in beats per minute.
    pub heart_rate: Option<f64>,
    /// Accept any reply to the firmware-info request.
    #[serde(default)]
    pub lenient_firmware_info: bool,
}

/// Benchmark defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchmarkDefaults {
    /// Polling interval in seconds.
    pub interval: Option<f64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Upload settings.
    #[serde(default)]
    pub upload: UploadDefaults,
    /// Benchmark settings.
    #[serde(default)]
    pub benchmark: BenchmarkDefaults,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// Unlike auto-discovered files, a file that was asked for must exist
    /// and parse.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config = Self::parse(&content).map_err(|e| {
            CliError::Config(format!("invalid config file {}: {e}", path.display()))
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .map_err(|e| warn!("Failed to parse config file {}: {e}", path.display()))
                .ok(),
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Parse TOML text.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ecgsim").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.timeout_ms.is_some() {
            self.connection.timeout_ms = other.connection.timeout_ms;
        }

        if other.upload.pp_voltage.is_some() {
            self.upload.pp_voltage = other.upload.pp_voltage;
        }
        if other.upload.heart_rate.is_some() {
            self.upload.heart_rate = other.upload.heart_rate;
        }
        if other.upload.lenient_firmware_info {
            self.upload.lenient_firmware_info = true;
        }

        if other.benchmark.interval.is_some() {
            self.benchmark.interval = other.benchmark.interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.port.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.connection.timeout_ms.is_none());
        assert!(config.upload.pp_voltage.is_none());
        assert!(!config.upload.lenient_firmware_info);
        assert!(config.benchmark.interval.is_none());
    }

    #[test]
    fn test_config_merge_overrides_set_fields() {
        let mut base = Config::default();
        base.connection.port = Some("/dev/ttyUSB0".to_string());
        base.connection.baud = Some(9600);

        let mut other = Config::default();
        other.connection.baud = Some(115200);
        other.upload.heart_rate = Some(80.0);
        other.benchmark.interval = Some(0.5);

        base.merge(other);

        assert_eq!(base.connection.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.connection.baud, Some(115200));
        assert_eq!(base.upload.heart_rate, Some(80.0));
        assert_eq!(base.benchmark.interval, Some(0.5));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.connection.port = Some("COM3".to_string());
        base.upload.pp_voltage = Some(1.5);
        base.upload.lenient_firmware_info = true;

        base.merge(Config::default());

        assert_eq!(base.connection.port.as_deref(), Some("COM3"));
        assert_eq!(base.upload.pp_voltage, Some(1.5));
        assert!(base.upload.lenient_firmware_info);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
port = "/dev/ttyACM0"
baud = 115200
timeout_ms = 2500

[upload]
pp_voltage = 2.5
heart_rate = 72
lenient_firmware_info = true

[benchmark]
interval = 0.25
"#;
        let config = Config::parse(toml_str).unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.baud, Some(115200));
        assert_eq!(config.connection.timeout_ms, Some(2500));
        assert_eq!(config.upload.pp_voltage, Some(2.5));
        assert_eq!(config.upload.heart_rate, Some(72.0));
        assert!(config.upload.lenient_firmware_info);
        assert_eq!(config.benchmark.interval, Some(0.25));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config = Config::parse("").unwrap();
        assert!(config.connection.port.is_none());
        assert!(config.upload.heart_rate.is_none());
    }

    #[test]
    fn test_config_invalid_toml_is_an_error() {
        let err = Config::parse("invalid toml [[[").unwrap_err();
        assert!(err.to_string().contains("TOML"));
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let mut config = Config::default();
        config.connection.port = Some("COM3".to_string());
        config.upload.heart_rate = Some(90.0);

        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized = Config::parse(&serialized).unwrap();

        assert_eq!(deserialized.connection.port.as_deref(), Some("COM3"));
        assert_eq!(deserialized.upload.heart_rate, Some(90.0));
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(
            &path,
            r#"
[connection]
port = "/dev/ttyUSB1"
[benchmark]
interval = 2.0
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.benchmark.interval, Some(2.0));
    }

    #[test]
    fn test_load_from_path_invalid_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[connection\nport = ").unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert_eq!(crate::exit_code_for(&err), 3);
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let err = Config::load_from_path(Path::new("/nonexistent/path/config.toml")).unwrap_err();
        assert_eq!(crate::exit_code_for(&err), 3);
    }

    #[test]
    fn test_load_from_file_skips_missing_and_invalid() {
        let dir = tempdir().unwrap();
        assert!(Config::load_from_file(&dir.path().join("absent.toml")).is_none());

        let path = dir.path().join("broken.toml");
        fs::write(&path, "not = [valid").unwrap();
        assert!(Config::load_from_file(&path).is_none());
    }

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("ecgsim"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
