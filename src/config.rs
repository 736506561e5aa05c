//! TOML configuration for the bus daemon.
//!
//! Every table and field falls back to its default, so an empty file (or no
//! file at all) gives a working PAL bus on the tunneled transport:
//!
//! ```toml
//! [link]
//! baud = 19200
//! high_speed_index = 6
//! checksum = "additive"
//!
//! [transport]
//! kind = "netsio"
//! host = "localhost"
//! port = 9997
//!
//! [devices.disk]
//! id = 0x31
//! sectors = 720
//! ```

use crate::checksum::ChecksumPolicy;
use crate::devices::{CLOCK_DEVICE_ID, DISK_DEVICE_ID};
use crate::engine::EngineConfig;
use crate::link::{
    CHECKSUM_FAILURE_THRESHOLD, DEFAULT_HIGH_SPEED_INDEX, HIGH_SPEED_INDEX_INVALID,
    HIGH_SPEED_INDEX_MAX, PAL_OSCILLATOR_HZ, STANDARD_BAUD,
};
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_NETSIO_PORT: u16 = 9997;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub link: LinkConfig,
    pub protocol: ProtocolConfig,
    pub timing: TimingConfig,
    pub transport: TransportConfig,
    pub devices: DevicesConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub baud: u32,
    /// Persisted high speed index; -1 disables high speed.
    pub high_speed_index: i32,
    pub oscillator_hz: u32,
    pub checksum: ChecksumPolicy,
    pub checksum_failure_threshold: u32,
    pub frame_timeout_ms: u64,
    /// How many times to poll for the command line to drop after a frame.
    pub deassert_retries: u32,
    pub deassert_poll_us: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud: STANDARD_BAUD,
            high_speed_index: DEFAULT_HIGH_SPEED_INDEX,
            oscillator_hz: PAL_OSCILLATOR_HZ,
            checksum: ChecksumPolicy::Additive,
            checksum_failure_threshold: CHECKSUM_FAILURE_THRESHOLD,
            frame_timeout_ms: 300,
            deassert_retries: 1000,
            deassert_poll_us: 50,
        }
    }
}

impl LinkConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

/// Bus-level housekeeping addresses. These are host compatibility constants
/// and only change for non-standard hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub broadcast_id: u8,
    pub poll_command: u8,
    pub null_poll_aux: u8,
    pub reset_poll_aux: u8,
    pub high_speed_query: u8,
    pub config_boot_id: u8,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            broadcast_id: 0x4F,
            poll_command: b'@',
            null_poll_aux: 0x4E,
            reset_poll_aux: 0x4F,
            high_speed_query: b'?',
            config_boot_id: 0x31,
        }
    }
}

/// Inter-byte delays in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Data frame received to Ack/Nak.
    pub t4_us: u32,
    /// Ack to Complete/Error.
    pub t5_us: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { t4_us: 850, t5_us: 250 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::NetSio,
            host: "localhost".to_string(),
            port: DEFAULT_NETSIO_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub disk: DiskConfig,
    pub clock: ClockConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub id: u8,
    pub enabled: bool,
    pub sectors: u16,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            id: DISK_DEVICE_ID,
            enabled: true,
            sectors: 720,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub id: u8,
    pub enabled: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            id: CLOCK_DEVICE_ID,
            enabled: true,
        }
    }
}

impl BusConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link.baud == 0 {
            return Err(ConfigError::Invalid("link.baud must be non-zero".into()));
        }
        if self.link.oscillator_hz == 0 {
            return Err(ConfigError::Invalid("link.oscillator_hz must be non-zero".into()));
        }
        if !(HIGH_SPEED_INDEX_INVALID..=HIGH_SPEED_INDEX_MAX).contains(&self.link.high_speed_index) {
            return Err(ConfigError::Invalid(format!(
                "link.high_speed_index {} is outside {}..={}",
                self.link.high_speed_index, HIGH_SPEED_INDEX_INVALID, HIGH_SPEED_INDEX_MAX
            )));
        }
        if self.link.checksum_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "link.checksum_failure_threshold must be at least 1".into(),
            ));
        }
        if self.link.frame_timeout_ms == 0 {
            return Err(ConfigError::Invalid("link.frame_timeout_ms must be non-zero".into()));
        }
        if self.transport.kind == TransportKind::NetSio && self.transport.port == 0 {
            return Err(ConfigError::Invalid("transport.port must be non-zero".into()));
        }
        if self.devices.disk.enabled
            && self.devices.clock.enabled
            && self.devices.disk.id == self.devices.clock.id
        {
            return Err(ConfigError::Invalid(format!(
                "devices.disk and devices.clock share id 0x{:02X}",
                self.devices.disk.id
            )));
        }
        Ok(())
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            link: self.link,
            protocol: self.protocol,
            timing: self.timing,
        }
    }
}
