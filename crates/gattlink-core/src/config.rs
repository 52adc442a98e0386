//! Gateway configuration.
//!
//! Configuration is layered: compiled defaults, then an optional TOML file,
//! then environment variable overrides. `GatewayConfig::load` applies all
//! three and validates the result.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Default values shared by the config structs and their env overrides.
pub mod defaults {
    /// Per-command GATT operation timeout.
    pub const COMMAND_TIMEOUT_MS: u64 = 3000;
    /// Delay before a synthesized SUBACK is sent to the device.
    pub const SUBACK_DELAY_MS: u64 = 500;
    /// How long a scan runs before it is stopped automatically.
    pub const SCAN_PERIOD_MS: u64 = 20_000;
    /// Secure MQTT port.
    pub const BROKER_PORT: u16 = 8883;
    pub const BROKER_KEEP_ALIVE_SECS: u64 = 30;
    /// Request channel capacity handed to the MQTT client.
    pub const BROKER_CAPACITY: usize = 10;
    pub const LOG_FILTER: &str = "gattlink=info";
    /// Service advertised by provisionable devices, used as the scan filter.
    pub const ADVERTISED_SERVICE: u128 = 0x8a7f1168_48af_4efb_83b5_e679f932ff00;
}

/// Environment variable names.
pub mod env_vars {
    use super::defaults;

    pub const CONFIG_PATH: &str = "GATTLINK_CONFIG";
    pub const COMMAND_TIMEOUT_MS: &str = "GATTLINK_COMMAND_TIMEOUT_MS";
    pub const SUBACK_DELAY_MS: &str = "GATTLINK_SUBACK_DELAY_MS";
    pub const SCAN_PERIOD_MS: &str = "GATTLINK_SCAN_PERIOD_MS";
    pub const BROKER_PORT: &str = "GATTLINK_BROKER_PORT";
    pub const LOG_JSON: &str = "GATTLINK_LOG_JSON";

    /// Command timeout from the environment, or the default.
    pub fn command_timeout_ms() -> u64 {
        std::env::var(COMMAND_TIMEOUT_MS)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults::COMMAND_TIMEOUT_MS)
    }

    pub fn suback_delay_ms() -> Option<u64> {
        std::env::var(SUBACK_DELAY_MS)
            .ok()
            .and_then(|s| s.parse().ok())
    }

    pub fn scan_period_ms() -> Option<u64> {
        std::env::var(SCAN_PERIOD_MS)
            .ok()
            .and_then(|s| s.parse().ok())
    }

    pub fn broker_port() -> Option<u16> {
        std::env::var(BROKER_PORT)
            .ok()
            .and_then(|s| s.parse().ok())
    }

    /// `1`, `true` or `yes` enable JSON log output.
    pub fn log_json() -> Option<bool> {
        std::env::var(LOG_JSON)
            .ok()
            .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub mqtt: MqttProxyConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// GATT command scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_command_timeout_ms() -> u64 {
    defaults::COMMAND_TIMEOUT_MS
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// How the proxy enable/disable flag is written to a control characteristic.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlEncoding {
    /// A single byte, `1` for on and `0` for off.
    #[default]
    Raw,
    /// A CBOR map `{l: state}`.
    Cbor,
}

/// MQTT proxy bridge behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttProxyConfig {
    #[serde(default = "default_suback_delay_ms")]
    pub suback_delay_ms: u64,
    #[serde(default)]
    pub control_encoding: ControlEncoding,
}

fn default_suback_delay_ms() -> u64 {
    defaults::SUBACK_DELAY_MS
}

impl Default for MqttProxyConfig {
    fn default() -> Self {
        Self {
            suback_delay_ms: default_suback_delay_ms(),
            control_encoding: ControlEncoding::default(),
        }
    }
}

impl MqttProxyConfig {
    pub fn suback_delay(&self) -> Duration {
        Duration::from_millis(self.suback_delay_ms)
    }
}

/// BLE scan parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Scan duration in milliseconds; `0` scans until stopped.
    #[serde(default = "default_scan_period_ms")]
    pub period_ms: u64,
    #[serde(default = "default_service_filter")]
    pub service_filter: Vec<Uuid>,
}

fn default_scan_period_ms() -> u64 {
    defaults::SCAN_PERIOD_MS
}

fn default_service_filter() -> Vec<Uuid> {
    vec![Uuid::from_u128(defaults::ADVERTISED_SERVICE)]
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            period_ms: default_scan_period_ms(),
            service_filter: default_service_filter(),
        }
    }
}

impl ScanConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// TLS material for the broker connection, as PEM file paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    pub ca_path: PathBuf,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

/// Broker connection settings shared by every proxied device.
///
/// The endpoint and client id are supplied per session by the device's
/// CONNECT message; everything here is gateway-wide.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_broker_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_broker_port() -> u16 {
    defaults::BROKER_PORT
}

fn default_keep_alive_secs() -> u64 {
    defaults::BROKER_KEEP_ALIVE_SECS
}

fn default_broker_capacity() -> usize {
    defaults::BROKER_CAPACITY
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: default_broker_port(),
            keep_alive_secs: default_keep_alive_secs(),
            capacity: default_broker_capacity(),
            tls: None,
            username: None,
            password: None,
        }
    }
}

impl BrokerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Logging output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    defaults::LOG_FILTER.to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl GatewayConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Load the effective configuration.
    ///
    /// Uses `path` if given, otherwise the file named by `GATTLINK_CONFIG`,
    /// otherwise defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(env_vars::CONFIG_PATH).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => {
                info!(category = "config", "Loading config from: {}", path.display());
                Self::from_path(&path)?
            }
            None => {
                info!(category = "config", "No config file, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment variables where set.
    pub fn apply_env_overrides(&mut self) {
        if std::env::var(env_vars::COMMAND_TIMEOUT_MS).is_ok() {
            self.scheduler.command_timeout_ms = env_vars::command_timeout_ms();
        }
        if let Some(delay) = env_vars::suback_delay_ms() {
            self.mqtt.suback_delay_ms = delay;
        }
        if let Some(period) = env_vars::scan_period_ms() {
            self.scan.period_ms = period;
        }
        if let Some(port) = env_vars::broker_port() {
            self.broker.port = port;
        }
        if let Some(json) = env_vars::log_json() {
            self.log.json = json;
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.command_timeout_ms == 0 {
            return Err(Error::config("scheduler.command_timeout_ms must be greater than 0"));
        }
        if self.broker.port == 0 {
            return Err(Error::config("broker.port must be greater than 0"));
        }
        if self.broker.capacity == 0 {
            return Err(Error::config("broker.capacity must be greater than 0"));
        }
        if let Some(tls) = &self.broker.tls {
            if tls.cert_path.is_some() != tls.key_path.is_some() {
                return Err(Error::config(
                    "broker.tls.cert_path and broker.tls.key_path must be set together",
                ));
            }
        }
        if self.broker.username.is_none() && self.broker.password.is_some() {
            return Err(Error::config("broker.password requires broker.username"));
        }
        Ok(())
    }
}
