//! Configuration loading for the turntable engine.
//!
//! Settings are loaded with Figment from a TOML file plus environment
//! variables prefixed with `ROTATING_TABLE_` (double underscore separates
//! nesting levels):
//!
//! ```text
//! ROTATING_TABLE_CLIENT__SERIAL__PORT_NAME=/dev/ttyACM0
//! ROTATING_TABLE_CLIENT__COMMAND_INITIATION_TIMEOUT=5s
//! ```
//!
//! Example file:
//!
//! ```toml
//! [client]
//! command_initiation_timeout = "10s"
//!
//! [client.serial]
//! port_name = "/dev/ttyUSB0"
//! baud_rate = 115200
//! reconnect_attempts = 3
//! reconnect_delay = "1s"
//!
//! [emulator]
//! step_divisor = 5.0
//! step_interval = "300ms"
//!
//! [emulator.serial]
//! port_name = "/dev/ttyUSB1"
//! ```

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "ROTATING_TABLE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] figment::Error),
    #[error("configuration validation error: {0}")]
    Validation(String),
}

/// Serial line settings shared by the client and the emulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialPortSettings {
    /// Path to the serial device (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,

    /// Baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Poll granularity of the decode loop; a blocked read returns at this
    /// interval so shutdown and reconnects stay responsive.
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Upper bound on one line write.
    #[serde(with = "humantime_serde", default = "default_write_timeout")]
    pub write_timeout: Duration,

    /// How many times `reinit` tries to open the port before giving up.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Delay between reconnect attempts.
    #[serde(with = "humantime_serde", default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,
}

impl SerialPortSettings {
    /// Settings for a named port with all defaults.
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: default_baud_rate(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

/// Settings for the client-side table driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableClientSettings {
    pub serial: SerialPortSettings,

    /// How long to wait for the OK/ERR (or acceleration value) after a
    /// command has been sent.
    #[serde(with = "humantime_serde", default = "default_command_initiation_timeout")]
    pub command_initiation_timeout: Duration,
}

impl TableClientSettings {
    pub fn new(serial: SerialPortSettings) -> Self {
        Self {
            serial,
            command_initiation_timeout: default_command_initiation_timeout(),
        }
    }
}

fn default_command_initiation_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Settings for the protocol-compatible table emulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEmulatorSettings {
    pub serial: SerialPortSettings,

    /// Divisor for the default step function: one step is `angle / divisor`.
    #[serde(default = "default_step_divisor")]
    pub step_divisor: f64,

    /// Pause between emitted positions.
    #[serde(with = "humantime_serde", default = "default_step_interval")]
    pub step_interval: Duration,
}

impl TableEmulatorSettings {
    pub fn new(serial: SerialPortSettings) -> Self {
        Self {
            serial,
            step_divisor: default_step_divisor(),
            step_interval: default_step_interval(),
        }
    }
}

fn default_step_divisor() -> f64 {
    5.0
}

fn default_step_interval() -> Duration {
    Duration::from_millis(300)
}

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub client: TableClientSettings,
    #[serde(default)]
    pub emulator: Option<TableEmulatorSettings>,
}

impl Settings {
    /// Load from `rotating-table.toml` in the working directory plus
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Toml::file("rotating-table.toml")))
    }

    /// Load from an explicit file path plus environment overrides.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Toml::file(path.as_ref())))
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.client.serial.port_name.is_empty() {
            return Err(ConfigError::Validation(
                "client.serial.port_name must not be empty".to_string(),
            ));
        }
        if let Some(emulator) = &self.emulator {
            if emulator.step_divisor <= 0.0 {
                return Err(ConfigError::Validation(
                    "emulator.step_divisor must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}
