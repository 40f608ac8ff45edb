//! Configuration file support for bootlink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BOOTLINK_*)
//! 3. Local config file (./bootlink.toml)
//! 4. Global config file (~/.config/bootlink/config.toml)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bootlink::port::{DataBits, FlowControl, Parity, StopBits};
use bootlink::{SerialConfig, YmodemConfig, protocol::ymodem::ChecksumMode};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Data bits (7 or 8).
    pub data_bits: Option<u8>,
    /// Parity ("none", "odd" or "even").
    pub parity: Option<Parity>,
    /// Stop bits (1 or 2).
    pub stop_bits: Option<u8>,
    /// Flow control ("none" or "hardware").
    pub flow_control: Option<FlowControl>,
}

impl ConnectionConfig {
    /// Line settings for `port_name`. Unset fields keep the 8N1 defaults.
    pub fn serial_config(&self, port_name: &str, baud: u32) -> bootlink::Result<SerialConfig> {
        let mut serial = SerialConfig::new(port_name, baud);
        if let Some(bits) = self.data_bits {
            serial.data_bits = DataBits::try_from(bits)?;
        }
        if let Some(parity) = self.parity {
            serial.parity = parity;
        }
        if let Some(bits) = self.stop_bits {
            serial.stop_bits = StopBits::try_from(bits)?;
        }
        if let Some(flow) = self.flow_control {
            serial.flow_control = flow;
        }
        Ok(serial)
    }
}

/// Block integrity check requested from the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// CRC16 ('C' handshake).
    Crc,
    /// Additive checksum (NAK handshake).
    Checksum,
}

impl From<TransferMode> for ChecksumMode {
    fn from(mode: TransferMode) -> Self {
        match mode {
            TransferMode::Crc => Self::Crc16,
            TransferMode::Checksum => Self::Checksum,
        }
    }
}

/// Receiver tuning. Unset fields keep the library defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Preferred integrity check.
    pub mode: Option<TransferMode>,
    /// Interval between handshake bytes, in milliseconds.
    pub start_interval_ms: Option<u64>,
    /// Longest gap between bytes inside a block, in milliseconds.
    pub char_timeout_ms: Option<u64>,
    /// Time to wait for the next block, in milliseconds.
    pub block_timeout_ms: Option<u64>,
    /// Handshake bytes sent before giving up.
    pub max_start_attempts: Option<u32>,
    /// Unanswered CRC requests before falling back to checksum mode.
    pub crc_fallback_after: Option<u32>,
    /// Consecutive failed blocks before aborting.
    pub max_retries: Option<u32>,
}

impl TransferConfig {
    /// Build the receiver configuration, starting from the library defaults.
    pub fn to_ymodem_config(&self) -> YmodemConfig {
        let mut config = YmodemConfig::default();
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(ms) = self.start_interval_ms {
            config.start_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.char_timeout_ms {
            config.char_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.block_timeout_ms {
            config.block_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_start_attempts {
            config.max_start_attempts = n;
        }
        if let Some(n) = self.crc_fallback_after {
            config.crc_fallback_after = n;
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        config
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Receiver settings.
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new("bootlink.toml")) {
            debug!("Loaded local config from bootlink.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "bootlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Fields set in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        let line = &mut self.connection;
        line.data_bits = other.connection.data_bits.or(line.data_bits);
        line.parity = other.connection.parity.or(line.parity);
        line.stop_bits = other.connection.stop_bits.or(line.stop_bits);
        line.flow_control = other.connection.flow_control.or(line.flow_control);

        let ours = &mut self.transfer;
        let theirs = other.transfer;
        ours.mode = theirs.mode.or(ours.mode);
        ours.start_interval_ms = theirs.start_interval_ms.or(ours.start_interval_ms);
        ours.char_timeout_ms = theirs.char_timeout_ms.or(ours.char_timeout_ms);
        ours.block_timeout_ms = theirs.block_timeout_ms.or(ours.block_timeout_ms);
        ours.max_start_attempts = theirs.max_start_attempts.or(ours.max_start_attempts);
        ours.crc_fallback_after = theirs.crc_fallback_after.or(ours.crc_fallback_after);
        ours.max_retries = theirs.max_retries.or(ours.max_retries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.serial.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.transfer.mode.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            [connection]
            serial = "/dev/ttyUSB0"
            baud = 921600

            [transfer]
            mode = "checksum"
            block_timeout_ms = 2500
            max_retries = 4
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.serial, Some("/dev/ttyUSB0".to_string()));
        assert_eq!(config.connection.baud, Some(921600));
        assert_eq!(config.transfer.mode, Some(TransferMode::Checksum));
        assert_eq!(config.transfer.block_timeout_ms, Some(2500));
    }

    #[test]
    fn test_line_settings() {
        let config: Config = toml::from_str(
            "[connection]\ndata_bits = 7\nparity = \"even\"\nstop_bits = 2\nflow_control = \"hardware\"\n",
        )
        .unwrap();

        let serial = config
            .connection
            .serial_config("/dev/ttyS1", 57600)
            .unwrap();
        assert_eq!(serial.port_name, "/dev/ttyS1");
        assert_eq!(serial.baud_rate, 57600);
        assert_eq!(serial.data_bits, DataBits::Seven);
        assert_eq!(serial.parity, Parity::Even);
        assert_eq!(serial.stop_bits, StopBits::Two);
        assert_eq!(serial.flow_control, FlowControl::Hardware);
    }

    #[test]
    fn test_unset_line_settings_are_8n1() {
        let serial = ConnectionConfig::default()
            .serial_config("COM4", 115200)
            .unwrap();
        assert_eq!(serial.data_bits, DataBits::Eight);
        assert_eq!(serial.parity, Parity::None);
        assert_eq!(serial.stop_bits, StopBits::One);
        assert_eq!(serial.flow_control, FlowControl::None);
    }

    #[test]
    fn test_invalid_data_bits_is_config_error() {
        let connection = ConnectionConfig {
            data_bits: Some(9),
            ..Default::default()
        };
        let err = connection.serial_config("COM4", 115200).unwrap_err();
        assert!(matches!(err, bootlink::Error::Config(_)));
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[transfer]\nmode = \"sha256\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_to_ymodem_config_keeps_unset_defaults() {
        let transfer = TransferConfig {
            mode: Some(TransferMode::Checksum),
            char_timeout_ms: Some(250),
            ..Default::default()
        };
        let config = transfer.to_ymodem_config();
        let defaults = YmodemConfig::default();

        assert_eq!(config.mode, ChecksumMode::Checksum);
        assert_eq!(config.char_timeout, Duration::from_millis(250));
        assert_eq!(config.block_timeout, defaults.block_timeout);
        assert_eq!(config.max_retries, defaults.max_retries);
        assert_eq!(config.poll_interval, defaults.poll_interval);
    }

    #[test]
    fn test_merge_prefers_later_source() {
        let mut config: Config = toml::from_str(
            "[connection]\nserial = \"COM3\"\nbaud = 57600\n[transfer]\nmax_retries = 2\n",
        )
        .unwrap();
        let local: Config =
            toml::from_str("[connection]\nbaud = 115200\n[transfer]\nmode = \"crc\"\n").unwrap();

        config.merge(local);

        assert_eq!(config.connection.serial.as_deref(), Some("COM3"));
        assert_eq!(config.connection.baud, Some(115200));
        assert_eq!(config.transfer.mode, Some(TransferMode::Crc));
        assert_eq!(config.transfer.max_retries, Some(2));
    }

    #[test]
    fn test_load_from_path_falls_back_on_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[connection\nserial = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.connection.serial.is_none());
    }

    #[test]
    fn test_load_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootlink.toml");
        fs::write(&path, "[connection]\nserial = \"/dev/ttyACM0\"\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyACM0"));
    }
}
