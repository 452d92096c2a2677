//! Player configuration with persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::player::BackendKind;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config: {0}")]
  Io(#[from] std::io::Error),
  #[error("Malformed config: {0}")]
  Json(#[from] serde_json::Error),
  #[error("Invalid config: {0}")]
  Invalid(String),
}

/// Player configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerConfig {
  /// Which player backend to drive.
  #[serde(default)]
  pub backend: BackendKind,

  /// Custom player executable path (None = auto-detect).
  #[serde(default)]
  pub executable: Option<String>,

  /// Additional command-line arguments, placed after the backend's fixed flags.
  #[serde(default)]
  pub extra_args: Vec<String>,

  /// Volume used for the first start, 0-100.
  #[serde(default = "default_volume")]
  pub default_volume: u8,

  /// Pause after every command write before a response can be expected.
  #[serde(default = "default_settle_delay_ms")]
  pub settle_delay_ms: u64,

  /// How long a stop waits for the player to exit before killing its process group.
  #[serde(default = "default_stop_grace_ms")]
  pub stop_grace_ms: u64,
}

fn default_volume() -> u8 {
  100
}

fn default_settle_delay_ms() -> u64 {
  100
}

fn default_stop_grace_ms() -> u64 {
  2000
}

impl Default for PlayerConfig {
  fn default() -> Self {
    Self {
      backend: BackendKind::default(),
      executable: None,
      extra_args: Vec::new(),
      default_volume: default_volume(),
      settle_delay_ms: default_settle_delay_ms(),
      stop_grace_ms: default_stop_grace_ms(),
    }
  }
}

impl PlayerConfig {
  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.default_volume > 100 {
      return Err(ConfigError::Invalid(format!(
        "Default volume must be between 0 and 100, got {}",
        self.default_volume
      )));
    }
    if self.settle_delay_ms == 0 {
      return Err(ConfigError::Invalid("Settle delay cannot be zero".to_string()));
    }
    if self.stop_grace_ms == 0 {
      return Err(ConfigError::Invalid("Stop grace period cannot be zero".to_string()));
    }
    if let Some(exe) = &self.executable {
      if exe.trim().is_empty() {
        return Err(ConfigError::Invalid("Executable path cannot be empty".to_string()));
      }
    }
    Ok(())
  }

  pub fn settle_delay(&self) -> Duration {
    Duration::from_millis(self.settle_delay_ms)
  }

  pub fn stop_grace(&self) -> Duration {
    Duration::from_millis(self.stop_grace_ms)
  }

  /// Default config location: `<config dir>/subplayer/config.json`.
  pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("subplayer").join("config.json"))
  }

  /// Load and validate a config file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config: PlayerConfig = serde_json::from_str(&raw)?;
    config.validate()?;
    Ok(config)
  }

  /// Load from `path`, falling back to defaults when the file does not exist.
  pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
    match Self::load(path) {
      Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
        log::debug!("No config at {:?}, using defaults", path);
        Ok(Self::default())
      }
      other => other,
    }
  }

  /// Write the config as pretty JSON, creating parent directories.
  pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
    self.validate()?;
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(self)?;
    std::fs::write(path, json)?;
    Ok(())
  }
}
