//! Configuration file (`lensmem.toml`)
//!
//! Every field has a default, so an empty file (or none at all) gives the
//! stock setup: projector at 9600 8N1, PowerLinc modem at 19200 8N1 with
//! the two theater dimmers, IMDb lookups on.

use crate::aspect::{lens::MAX_LENS_SLOT, AspectRatio, LensMap};
use crate::error::ConfigError;
use crate::lighting::insteon::InsteonAddress;
use crate::serial::port::{
    parse_data_bits, parse_parity, parse_stop_bits, PortConfig, COMMON_BAUD_RATES,
    PLM_DEFAULT_BAUD, PROJECTOR_DEFAULT_BAUD,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name
pub const DEFAULT_CONFIG_FILE: &str = "lensmem.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub projector: ProjectorConfig,
    pub lighting: LightingConfig,
    pub metadata: MetadataConfig,
    pub overrides: OverridesConfig,
    pub triggers: TriggerConfig,
    pub events: EventsConfig,
}

/// Serial line settings, as read from the `[projector]` or `[lighting]`
/// section
#[derive(Debug, Clone)]
pub struct LineConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: String,
    pub write_timeout_ms: u64,
    pub retries: u32,
}

impl LineConfig {
    /// Port settings; call after `validate`
    pub fn port_config(&self) -> PortConfig {
        let mut config = PortConfig::new(&self.port)
            .with_baud_rate(self.baud_rate)
            .with_timeout(Duration::from_millis(self.write_timeout_ms));
        if let Some(parity) = parse_parity(&self.parity) {
            config = config.with_parity(parity);
        }
        if let Some(stop_bits) = parse_stop_bits(self.stop_bits) {
            config = config.with_stop_bits(stop_bits);
        }
        if let Some(data_bits) = parse_data_bits(self.data_bits) {
            config = config.with_data_bits(data_bits);
        }
        config
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        let field = |name: &str| format!("{}.{}", section, name);

        if self.port.trim().is_empty() {
            return Err(ConfigError::invalid(&field("port"), "must not be empty"));
        }
        if !COMMON_BAUD_RATES.contains(&self.baud_rate) {
            return Err(ConfigError::invalid(
                &field("baud_rate"),
                format!("{} is not one of {:?}", self.baud_rate, COMMON_BAUD_RATES),
            ));
        }
        if parse_parity(&self.parity).is_none() {
            return Err(ConfigError::invalid(
                &field("parity"),
                format!("unknown parity '{}'", self.parity),
            ));
        }
        if parse_stop_bits(self.stop_bits).is_none() {
            return Err(ConfigError::invalid(&field("stop_bits"), "must be 1 or 2"));
        }
        if parse_data_bits(self.data_bits).is_none() {
            return Err(ConfigError::invalid(&field("data_bits"), "must be 5 to 8"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                &field("write_timeout_ms"),
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Implements `line()` for a section carrying the serial line fields
macro_rules! line_settings {
    ($section:ty) => {
        impl $section {
            pub fn line(&self) -> LineConfig {
                LineConfig {
                    port: self.port.clone(),
                    baud_rate: self.baud_rate,
                    data_bits: self.data_bits,
                    stop_bits: self.stop_bits,
                    parity: self.parity.clone(),
                    write_timeout_ms: self.write_timeout_ms,
                    retries: self.retries,
                }
            }
        }
    };
}

line_settings!(ProjectorConfig);
line_settings!(LightingConfig);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectorConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// "none", "even" or "odd"
    pub parity: String,
    pub write_timeout_ms: u64,
    /// Retries after a failed write before the command is dropped
    pub retries: u32,
    /// Time the lens needs after a memory load before the next one
    pub settle_ms: u64,
    pub lens: LensMap,
    /// Ratio the projector is returned to on pause/stop when enabled
    pub home_ratio: AspectRatio,
    pub restore_on_pause: bool,
    pub restore_on_stop: bool,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: PROJECTOR_DEFAULT_BAUD,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
            write_timeout_ms: 500,
            retries: 2,
            settle_ms: 10_000,
            lens: LensMap::default(),
            home_ratio: AspectRatio::Flat,
            restore_on_pause: false,
            restore_on_stop: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingConfig {
    pub enabled: bool,
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: String,
    pub write_timeout_ms: u64,
    pub retries: u32,
    /// Delay between commands to different dimmers
    pub command_gap_ms: u64,
    /// Step used by the brighter/dimmer keys, in percent
    pub step_percent: u8,
    pub dimmers: Vec<DimmerConfig>,
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: "/dev/ttyUSB1".to_string(),
            baud_rate: PLM_DEFAULT_BAUD,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
            write_timeout_ms: 500,
            retries: 2,
            command_gap_ms: 1000,
            step_percent: 33,
            dimmers: vec![
                DimmerConfig {
                    name: "Pots".to_string(),
                    address: "42.22.B8".to_string(),
                    playing: 0,
                    paused: 20,
                    stopped: 0,
                    all_on: 100,
                    all_dim: 0,
                },
                DimmerConfig {
                    name: "Tray".to_string(),
                    address: "42.20.F8".to_string(),
                    playing: 30,
                    paused: 100,
                    stopped: 100,
                    all_on: 100,
                    all_dim: 30,
                },
            ],
        }
    }
}

/// One dimmer and its level (percent) for each scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimmerConfig {
    pub name: String,
    /// Dotted hex Insteon address, e.g. "42.22.B8"
    pub address: String,
    pub playing: u8,
    pub paused: u8,
    pub stopped: u8,
    pub all_on: u8,
    pub all_dim: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Per-attempt timeout
    pub timeout_ms: u64,
    pub attempts: u32,
    pub user_agent: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://www.imdb.com".to_string(),
            timeout_ms: 3000,
            attempts: 2,
            user_agent: concat!("lensmem/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl MetadataConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverridesConfig {
    pub path: PathBuf,
}

impl Default for OverridesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("lensmem-overrides.toml"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Expiry used when a trigger arrives without one
    pub default_expiry_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            default_expiry_ms: 10_000,
        }
    }
}

impl TriggerConfig {
    pub fn default_expiry(&self) -> Duration {
        Duration::from_millis(self.default_expiry_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Read JSON events from standard input
    pub stdin: bool,
    /// Also accept one JSON event per UDP datagram on this address
    pub udp_listen: Option<String>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            stdin: true,
            udp_listen: None,
        }
    }
}

impl Config {
    /// Load a config file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check everything that would otherwise fail per event
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.projector.line().validate("projector")?;

        for (band, slot) in self.projector.lens.slots() {
            if slot > MAX_LENS_SLOT {
                return Err(ConfigError::invalid(
                    &format!("projector.lens.{}", band),
                    format!("slot {} exceeds {}", slot, MAX_LENS_SLOT),
                ));
            }
        }
        if !self.projector.home_ratio.is_known() {
            return Err(ConfigError::invalid(
                "projector.home_ratio",
                "must be an explicit ratio",
            ));
        }

        if self.lighting.enabled {
            self.lighting.line().validate("lighting")?;
            if self.lighting.step_percent == 0 || self.lighting.step_percent > 100 {
                return Err(ConfigError::invalid(
                    "lighting.step_percent",
                    "must be 1 to 100",
                ));
            }
            for dimmer in &self.lighting.dimmers {
                if InsteonAddress::parse(&dimmer.address).is_none() {
                    return Err(ConfigError::invalid(
                        &format!("lighting.dimmers.{}.address", dimmer.name),
                        format!("'{}' is not a dotted hex address", dimmer.address),
                    ));
                }
                let levels = [
                    dimmer.playing,
                    dimmer.paused,
                    dimmer.stopped,
                    dimmer.all_on,
                    dimmer.all_dim,
                ];
                if levels.iter().any(|l| *l > 100) {
                    return Err(ConfigError::invalid(
                        &format!("lighting.dimmers.{}", dimmer.name),
                        "levels are percentages (0-100)",
                    ));
                }
            }
        }

        if self.metadata.enabled {
            if self.metadata.attempts == 0 {
                return Err(ConfigError::invalid("metadata.attempts", "must be at least 1"));
            }
            if self.metadata.timeout_ms == 0 {
                return Err(ConfigError::invalid(
                    "metadata.timeout_ms",
                    "must be greater than zero",
                ));
            }
        }

        Ok(())
    }

    /// Effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.projector.baud_rate, 9600);
        assert_eq!(config.lighting.baud_rate, 19200);
        assert_eq!(config.lighting.dimmers.len(), 2);
        assert_eq!(config.projector.home_ratio, AspectRatio::Flat);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[projector]
port = "/dev/ttyS0"
settle_ms = 0
restore_on_pause = true

[projector.lens]
scope = 5

[lighting]
enabled = false
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.projector.port, "/dev/ttyS0");
        assert_eq!(config.projector.baud_rate, 9600);
        assert_eq!(config.projector.lens.scope, 5);
        assert_eq!(config.projector.lens.flat, 2);
        assert!(config.projector.restore_on_pause);
        assert!(!config.lighting.enabled);
        assert!(config.metadata.enabled);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.triggers.default_expiry_ms, 10_000);
    }

    #[test]
    fn test_bad_values_rejected() {
        let path = Path::new("test.toml");

        let config = Config::parse("[projector]\nbaud_rate = 12345\n", path).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let config = Config::parse("[projector]\nparity = \"mark\"\n", path).unwrap();
        assert!(config.validate().is_err());

        let config = Config::parse("[projector.lens]\nultra = 9\n", path).unwrap();
        assert!(config.validate().is_err());

        let config = Config::parse(
            "[[lighting.dimmers]]\nname = \"x\"\naddress = \"42.22\"\nplaying = 0\npaused = 0\nstopped = 0\nall_on = 100\nall_dim = 0\n",
            path,
        )
        .unwrap();
        assert!(config.validate().is_err());

        assert!(matches!(
            Config::parse("[projector\n", path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_port_config_from_line() {
        let mut lighting = LightingConfig::default();
        lighting.parity = "even".to_string();
        lighting.stop_bits = 2;
        let port = lighting.line().port_config();
        assert_eq!(port.baud_rate, 19200);
        assert_eq!(port.parity, serialport::Parity::Even);
        assert_eq!(port.stop_bits, serialport::StopBits::Two);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let text = Config::default().to_toml().unwrap();
        let parsed = Config::parse(&text, Path::new("x.toml")).unwrap();
        assert_eq!(parsed.lighting.dimmers, Config::default().lighting.dimmers);
    }
}
