//! Configuration file for the `amt` CLI.

use amt_gateway::{DEFAULT_RELAY, GatewayConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewaySection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[gateway]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    /// Native multicast timeout (seconds)
    #[serde(default = "default_native_timeout")]
    pub native_timeout: u64,
    /// AMT timeout (seconds)
    #[serde(default = "default_amt_timeout")]
    pub amt_timeout: u64,
    /// Relay host name(s) or address(es), comma separated
    #[serde(default = "default_relay")]
    pub relay: String,
    /// Relay UDP port
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    /// Expected payload size
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Local interface address for group joins
    #[serde(default = "default_interface")]
    pub interface: String,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_native_timeout() -> u64 {
    3
}

fn default_amt_timeout() -> u64 {
    5
}

fn default_relay() -> String {
    DEFAULT_RELAY.to_string()
}

fn default_relay_port() -> u16 {
    amt_core::AMT_PORT
}

fn default_mtu() -> usize {
    amt_core::DEFAULT_MTU
}

fn default_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            native_timeout: default_native_timeout(),
            amt_timeout: default_amt_timeout(),
            relay: default_relay(),
            relay_port: default_relay_port(),
            mtu: default_mtu(),
            interface: default_interface(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("amt/config.toml")
    }

    /// Load `path`, or the default path if given none.
    ///
    /// A missing file at the default path yields the defaults; a missing
    /// explicitly named file is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or parsing the file fails.
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse the join interface
    ///
    /// # Errors
    ///
    /// Returns an error if the interface is not an IPv4 address.
    pub fn interface(&self) -> anyhow::Result<Ipv4Addr> {
        self.gateway.interface.parse().map_err(|_| {
            anyhow::anyhow!(
                "Invalid interface address: {} (expected IPv4)",
                self.gateway.interface
            )
        })
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.to_gateway_config()?.validate()?;
        Ok(())
    }

    /// Runtime gateway configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the interface address is malformed.
    pub fn to_gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        Ok(GatewayConfig {
            native_timeout: Duration::from_secs(self.gateway.native_timeout),
            amt_timeout: Duration::from_secs(self.gateway.amt_timeout),
            relay: self.gateway.relay.clone(),
            relay_port: self.gateway.relay_port,
            mtu: self.gateway.mtu,
            interface: self.interface()?,
            ..GatewayConfig::default()
        })
    }
}
