//! Transport configuration management

use anyhow::{Context, Result, anyhow};
use common::{EndpointAddress, InterfaceNumber};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted `handle_events` timeout; it bounds the pump's stop latency
pub const MAX_EVENT_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "TransportConfig::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub pump: PumpSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub accept: AcceptSettings,
    /// Options applied to every new device handle
    #[serde(default)]
    pub device: DeviceOptionSettings,
}

/// Event pump configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpSettings {
    /// Timeout of each `handle_events` call in milliseconds
    #[serde(default = "PumpSettings::default_event_timeout")]
    pub event_timeout_ms: u64,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            event_timeout_ms: Self::default_event_timeout(),
        }
    }
}

impl PumpSettings {
    fn default_event_timeout() -> u64 {
        100
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }
}

/// Transfer timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Native timeout of asynchronous transfers in milliseconds
    #[serde(default = "TransferSettings::default_async_timeout")]
    pub async_timeout_ms: u64,
    /// Timeout of blocking send/receive in milliseconds
    #[serde(default = "TransferSettings::default_sync_timeout")]
    pub sync_timeout_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            async_timeout_ms: Self::default_async_timeout(),
            sync_timeout_ms: Self::default_sync_timeout(),
        }
    }
}

impl TransferSettings {
    fn default_async_timeout() -> u64 {
        1000
    }

    fn default_sync_timeout() -> u64 {
        5000
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

/// Accept configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptSettings {
    /// Pause between unmatched scan rounds in milliseconds
    #[serde(default = "AcceptSettings::default_rescan_interval")]
    pub rescan_interval_ms: u64,
}

impl Default for AcceptSettings {
    fn default() -> Self {
        Self {
            rescan_interval_ms: Self::default_rescan_interval(),
        }
    }
}

impl AcceptSettings {
    fn default_rescan_interval() -> u64 {
        100
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }
}

/// Initial interface and endpoint of a device handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOptionSettings {
    #[serde(default)]
    pub interface_number: InterfaceNumber,
    #[serde(default)]
    pub endpoint_address: EndpointAddress,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            pump: PumpSettings::default(),
            transfer: TransferSettings::default(),
            accept: AcceptSettings::default(),
            device: DeviceOptionSettings::default(),
        }
    }
}

impl TransportConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand_path(&p),
            None => {
                let p = Self::default_path();
                if !p.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                p
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: TransportConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let path = expand_path(path);
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-transport").join("config.toml")
        } else {
            PathBuf::from(".config/usb-transport/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if !(1..=MAX_EVENT_TIMEOUT_MS).contains(&self.pump.event_timeout_ms) {
            return Err(anyhow!(
                "Invalid pump.event_timeout_ms {}, must be 1-{}",
                self.pump.event_timeout_ms,
                MAX_EVENT_TIMEOUT_MS
            ));
        }

        if self.transfer.async_timeout_ms == 0 {
            return Err(anyhow!("transfer.async_timeout_ms must be greater than 0"));
        }
        if self.transfer.sync_timeout_ms == 0 {
            return Err(anyhow!("transfer.sync_timeout_ms must be greater than 0"));
        }

        Ok(())
    }
}

/// Expand a leading `~` in a user-supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}
