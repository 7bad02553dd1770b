//! Client configuration management

use crate::matcher::ConnectOptions;
use crate::session::SessionOptions;
use anyhow::{Context, Result, anyhow};
use protocol::DeviceSelector;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client: ClientSettings,
    pub device: DeviceSettings,
    pub timing: TimingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    pub log_level: String,
}

/// Which device to talk to and which interface to claim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// "vid:pid" in hex, e.g. "1234:5678"
    pub selector: String,
    /// Interface position in enumeration order
    #[serde(default)]
    pub interface: u8,
    /// Only 1 triggers alternate setting negotiation
    #[serde(default)]
    pub alt_setting: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    pub retry_interval_ms: u64,
    pub control_timeout_ms: u64,
    pub async_timeout_ms: u64,
    /// Give up discovery after this long; waits forever when unset
    #[serde(default)]
    pub discovery_deadline_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client: ClientSettings {
                log_level: "info".to_string(),
            },
            device: DeviceSettings {
                selector: "1234:5678".to_string(),
                interface: 0,
                alt_setting: 0,
            },
            timing: TimingSettings {
                retry_interval_ms: 200,
                control_timeout_ms: 6,
                async_timeout_ms: 100,
                discovery_deadline_ms: None,
            },
        }
    }
}

impl ClientConfig {
    /// Parsed device selector
    pub fn selector(&self) -> Result<DeviceSelector> {
        self.device
            .selector
            .parse()
            .with_context(|| format!("Invalid device selector '{}'", self.device.selector))
    }

    /// Session options derived from the timing section
    pub fn session_options(&self) -> SessionOptions {
        let mut connect = ConnectOptions::default()
            .with_retry_interval(Duration::from_millis(self.timing.retry_interval_ms));
        if let Some(ms) = self.timing.discovery_deadline_ms {
            connect = connect.with_timeout(Duration::from_millis(ms));
        }

        SessionOptions {
            control_timeout: Duration::from_millis(self.timing.control_timeout_ms),
            connect,
        }
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.async_timeout_ms)
    }
}

/// Accepted values for `client.log_level`
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// System-wide fallback consulted after the per-user file
const SYSTEM_CONFIG_PATH: &str = "/etc/usb-ctrl/client.toml";

impl ClientConfig {
    /// Read and validate a config file
    ///
    /// Without an explicit `path`, the first existing file among
    /// [`ClientConfig::search_paths`] is used.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => Self::search_paths()
                .into_iter()
                .find(|candidate| candidate.is_file())
                .ok_or_else(|| anyhow!("no usb-ctrl config file present, using built-in values"))?,
        };

        let text = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let config: ClientConfig =
            toml::from_str(&text).with_context(|| format!("Malformed TOML in {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Rejected settings in {}", path.display()))?;

        tracing::info!("Using config {}", path.display());
        tracing::debug!(
            "Target {} interface {} alt {}, retry every {} ms",
            config.device.selector,
            config.device.interface,
            config.device.alt_setting,
            config.timing.retry_interval_ms
        );
        Ok(config)
    }

    /// [`ClientConfig::load`] from the search paths, falling back to defaults
    pub fn load_or_default() -> Self {
        Self::load(None).unwrap_or_else(|e| {
            // The subscriber is installed only after the log level is known
            eprintln!("usb-ctrl: {:#}", e);
            Self::default()
        })
    }

    /// Write this configuration as TOML, creating missing directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Cannot encode configuration as TOML")?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
        }
        fs::write(path, text).with_context(|| format!("Cannot write {}", path.display()))?;

        tracing::info!("Wrote config {}", path.display());
        Ok(())
    }

    /// Per-user config file, written by `--save-config`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("usb-ctrl")
            .join("client.toml")
    }

    /// Files consulted by [`ClientConfig::load`] when no path is given
    pub fn search_paths() -> Vec<PathBuf> {
        vec![Self::default_path(), PathBuf::from(SYSTEM_CONFIG_PATH)]
    }

    /// Check values serde cannot check on its own
    pub fn validate(&self) -> Result<()> {
        let level = self.client.log_level.as_str();
        if !LOG_LEVELS.contains(&level) {
            return Err(anyhow!(
                "log_level '{}' is not one of {}",
                level,
                LOG_LEVELS.join("/")
            ));
        }

        self.selector()?;

        if self.timing.retry_interval_ms == 0 {
            return Err(anyhow!("retry_interval_ms must be greater than zero"));
        }

        Ok(())
    }
}

/// Expand a leading `~` in a user-supplied path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.client.log_level, "info");
        assert_eq!(config.device.interface, 0);
        assert_eq!(config.timing.retry_interval_ms, 200);
        assert_eq!(config.timing.control_timeout_ms, 6);
        assert!(config.timing.discovery_deadline_ms.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = ClientConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.client.log_level, parsed.client.log_level);
        assert_eq!(config.device.selector, parsed.device.selector);
        assert_eq!(config.timing.async_timeout_ms, parsed.timing.async_timeout_ms);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = ClientConfig::default();
        config.client.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.client.log_level = "trace".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_selector() {
        let mut config = ClientConfig::default();
        config.device.selector = "12345678".to_string();
        assert!(config.validate().is_err());

        config.device.selector = "0x05ac:0x12a8".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.selector().unwrap(), DeviceSelector::new(0x05ac, 0x12a8));
    }

    #[test]
    fn test_validate_retry_interval() {
        let mut config = ClientConfig::default();
        config.timing.retry_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_options() {
        let mut config = ClientConfig::default();
        config.timing.control_timeout_ms = 25;

        let options = config.session_options();
        assert_eq!(options.control_timeout, Duration::from_millis(25));
        assert_eq!(options.connect.retry_interval, Duration::from_millis(200));
        assert!(options.connect.timeout.is_none());

        config.timing.discovery_deadline_ms = Some(1000);
        assert_eq!(
            config.session_options().connect.timeout,
            Some(Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_search_paths_end_with_system_file() {
        let paths = ClientConfig::search_paths();
        assert_eq!(paths[0], ClientConfig::default_path());
        assert_eq!(paths.last(), Some(&PathBuf::from(SYSTEM_CONFIG_PATH)));
        assert!(ClientConfig::default_path().ends_with("usb-ctrl/client.toml"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        assert_eq!(expand_path("/etc/usb-ctrl/client.toml"), PathBuf::from("/etc/usb-ctrl/client.toml"));
    }
}
