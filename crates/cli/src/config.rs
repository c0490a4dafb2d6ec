//! CLI configuration management

use anyhow::{Context, Result, anyhow};
use common::TargetIdentity;
use serde::{Deserialize, Serialize};
use session::SessionConfig;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    /// Session tuning, passed through to the session engine unchanged
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// Which session engine drives the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Hid,
    Usb,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Hid => write!(f, "hid"),
            DeviceKind::Usb => write!(f, "usb"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hid" => Ok(DeviceKind::Hid),
            "usb" => Ok(DeviceKind::Usb),
            other => Err(anyhow!("Invalid device kind '{}', must be 'hid' or 'usb'", other)),
        }
    }
}

/// Default device for `monitor`, `write` and `feature`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default)]
    pub kind: DeviceKind,
    /// `vvvv:pppp` or `vvvv:pppp/gggg:uuuu`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetIdentity>,
    /// Enable hot-plug notifications for USB sessions
    #[serde(default)]
    pub hotplug: bool,
}

impl CliConfig {
    /// Load configuration from the specified path, or the first standard
    /// location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand_path(&p),
            None => Self::candidate_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?,
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: CliConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
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
            config_dir.join("devsession").join("config.toml")
        } else {
            PathBuf::from(".config/devsession/config.toml")
        }
    }

    fn candidate_paths() -> Vec<PathBuf> {
        vec![
            Self::default_path(),
            PathBuf::from("/etc/devsession/config.toml"),
        ]
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let session = &self.session;
        if session.read_buffer_size == 0 || session.async_buffer_size == 0 {
            return Err(anyhow!("Receive buffer sizes must be greater than 0"));
        }
        if session.max_report_size < 2 {
            return Err(anyhow!(
                "max_report_size must leave room for a report ID and one data byte"
            ));
        }
        if session.max_retry_count == 0 {
            return Err(anyhow!("max_retry_count must be at least 1"));
        }
        if session.backoff.initial_ms > session.backoff.max_ms {
            return Err(anyhow!(
                "backoff.initial_ms ({}) exceeds backoff.max_ms ({})",
                session.backoff.initial_ms,
                session.backoff.max_ms
            ));
        }

        Ok(())
    }
}

/// Expand `~` and environment variables in a user-supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(&raw).as_ref()),
    }
}
