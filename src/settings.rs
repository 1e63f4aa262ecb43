//! Persisted client settings
//!
//! Stored as TOML, by default under `~/.config/robot-remote/config.toml`.
//! `ROBOT_REMOTE_CONFIG` points somewhere else.

use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RobotError};

/// Environment variable overriding the settings file location
pub const CONFIG_ENV: &str = "ROBOT_REMOTE_CONFIG";

pub const DEFAULT_SERVER_URL: &str = "ws://192.168.1.100:8765";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_STREAM_PORT: u16 = 8080;
pub const DEFAULT_STREAM_PATH: &str = "/stream";

/// User settings for the robot connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotSettings {
    /// Control channel URL (`ws://host:port`)
    pub server_url: String,
    pub reconnect_enabled: bool,
    pub max_reconnect_attempts: u32,
    /// Start the video stream automatically once connected
    pub streaming_enabled: bool,
    pub stream_port: u16,
    pub stream_path: String,
}

impl Default for RobotSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            reconnect_enabled: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            streaming_enabled: true,
            stream_port: DEFAULT_STREAM_PORT,
            stream_path: DEFAULT_STREAM_PATH.to_string(),
        }
    }
}

impl RobotSettings {
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(RobotError::Config("server_url must not be empty".into()));
        }
        if self.stream_port == 0 {
            return Err(RobotError::Config("stream_port must be non-zero".into()));
        }
        Ok(())
    }

    /// Load settings from `path`; a missing file gives the defaults
    pub fn load(path: &Path) -> Result<Self> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(RobotError::ConfigRead(e)),
        };
        let settings: Self = toml::from_str(&data)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Write settings to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn set_server_url(&mut self, url: impl Into<String>) {
        self.server_url = url.into();
    }

    pub fn set_reconnect_enabled(&mut self, enabled: bool) {
        self.reconnect_enabled = enabled;
    }

    pub fn set_max_reconnect_attempts(&mut self, attempts: u32) {
        self.max_reconnect_attempts = attempts;
    }
}

/// `~/.config/robot-remote/config.toml`
pub fn default_config_path() -> PathBuf {
    if let Some(home) = env::var_os("HOME") {
        PathBuf::from(home)
            .join(".config")
            .join("robot-remote")
            .join("config.toml")
    } else {
        PathBuf::from(".config/robot-remote/config.toml")
    }
}

/// Settings file location, honouring [`CONFIG_ENV`]
pub fn config_path() -> PathBuf {
    env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path)
}
