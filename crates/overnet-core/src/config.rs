//! Configuration for the network control plane.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $OVERNET_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/overnet/config.toml
//!   3. ~/.config/overnet/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OvernetConfig {
    pub control: ControlConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Bound on a single negotiation run, init to reconciled bindings.
    pub negotiation_timeout_secs: u64,
    /// Bound on one certificate authority round-trip.
    pub renew_timeout_secs: u64,
    /// Minimum spacing between renewal sweeps.
    pub cert_recheck_interval_secs: u64,
    /// Renew this long before a certificate's NotAfter.
    pub cert_renew_lead_secs: u64,
    /// How far past NotAfter a neighbor's certificate is still accepted in
    /// bindings. 0 = no limit.
    pub expiry_grace_secs: u64,
    /// Capacity of the event bus.
    pub event_buffer: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_secs: 10,
            renew_timeout_secs: 10,
            cert_recheck_interval_secs: 5 * 60,
            cert_renew_lead_secs: 7 * 24 * 60 * 60,
            expiry_grace_secs: 0,
            event_buffer: 128,
        }
    }
}

impl ControlConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn renew_timeout(&self) -> Duration {
        Duration::from_secs(self.renew_timeout_secs)
    }

    pub fn cert_recheck_interval(&self) -> Duration {
        Duration::from_secs(self.cert_recheck_interval_secs)
    }

    pub fn cert_renew_lead(&self) -> Duration {
        Duration::from_secs(self.cert_renew_lead_secs)
    }

    pub fn expiry_grace(&self) -> Option<Duration> {
        match self.expiry_grace_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("overnet")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl OvernetConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit file, falling back to defaults if it is absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(OvernetConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("OVERNET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&OvernetConfig::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply OVERNET_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parse = |name: &str| lookup(name).and_then(|v| v.parse::<u64>().ok());

        if let Some(v) = parse("OVERNET_CONTROL__NEGOTIATION_TIMEOUT_SECS") {
            self.control.negotiation_timeout_secs = v;
        }
        if let Some(v) = parse("OVERNET_CONTROL__RENEW_TIMEOUT_SECS") {
            self.control.renew_timeout_secs = v;
        }
        if let Some(v) = parse("OVERNET_CONTROL__CERT_RECHECK_INTERVAL_SECS") {
            self.control.cert_recheck_interval_secs = v;
        }
        if let Some(v) = parse("OVERNET_CONTROL__CERT_RENEW_LEAD_SECS") {
            self.control.cert_renew_lead_secs = v;
        }
        if let Some(v) = parse("OVERNET_CONTROL__EXPIRY_GRACE_SECS") {
            self.control.expiry_grace_secs = v;
        }
    }
}
