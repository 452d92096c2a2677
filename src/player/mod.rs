//! Player module - spawns and controls an external slave-mode player.
//!
//! Architecture:
//! - `process.rs` - executable lookup, spawning, exit watcher and stop strategies
//! - `transport.rs` - non-blocking line channel over the child's stdin/stdout
//! - `protocol.rs` - slave command lines, answer parsing and the settle/expect codec
//! - `mplayer.rs` - MPlayer backend implementing [`Player`]

mod mplayer;
mod process;
mod protocol;
mod transport;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, PlayerConfig};
use crate::signal::CompletionSignal;

pub use mplayer::MPlayer;
pub use process::{
  find_executable, ProcessError, ProcessHandle, SpawnedPipes, StopStrategy, Supervisor,
};
pub use protocol::{clamp_volume, parse_seconds, Codec, Response, SlaveCommand, ANS_TIME_POSITION};
pub use transport::{ChildTransport, ReadOutcome, Transport, TransportError};

#[derive(Error, Debug)]
pub enum PlayerError {
  #[error("Player unavailable: {0}")]
  Unavailable(#[source] ProcessError),
  #[error("Player is not running")]
  NotPlaying,
  #[error("Process error: {0}")]
  Process(#[source] ProcessError),
  #[error("Transport error: {0}")]
  Transport(#[from] TransportError),
  #[error("Config error: {0}")]
  Config(#[from] ConfigError),
}

impl From<ProcessError> for PlayerError {
  fn from(e: ProcessError) -> Self {
    if e.is_unavailable() {
      PlayerError::Unavailable(e)
    } else {
      PlayerError::Process(e)
    }
  }
}

/// Coarse playback state as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
  Stopped,
  Playing,
  Paused,
}

/// Available player backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
  #[default]
  MPlayer,
}

/// Uniform control surface over a player backend.
///
/// One controller owns at most one player process. Query and command
/// operations fail with [`PlayerError::NotPlaying`] when nothing is running;
/// `start`, `set_volume` and `quit` accept a dead process.
pub trait Player: Send + Sync {
  /// Force-quit whatever is playing and start `url` at the session volume.
  fn start(&self, url: &str) -> Result<(), PlayerError>;

  /// Toggle between playing and paused.
  fn pause(&self) -> Result<(), PlayerError>;

  /// Store `volume` (clamped to 0-100) and apply it to a running player.
  ///
  /// The value is stored even when the player cannot be reached. Only a
  /// missing player is not an error.
  fn set_volume(&self, volume: i64) -> Result<(), PlayerError>;

  /// Current position in whole seconds; `None` when the player gave no answer.
  fn time_pos(&self) -> Result<Option<i64>, PlayerError>;

  /// Stop the player. No-op when not running.
  fn quit(&self) -> Result<(), PlayerError>;

  fn is_alive(&self) -> bool;

  /// Session volume used for the next start.
  fn volume(&self) -> u8;

  fn state(&self) -> PlaybackState;

  /// Spawn counter matching [`crate::signal::ExitNotice::generation`] of the current process.
  fn generation(&self) -> u64;
}

/// Create the backend selected in `config`.
pub fn open_player(
  config: PlayerConfig,
  signal: Arc<dyn CompletionSignal>,
) -> Result<Box<dyn Player>, PlayerError> {
  config.validate()?;
  match config.backend {
    BackendKind::MPlayer => Ok(Box::new(MPlayer::new(config, signal))),
  }
}
