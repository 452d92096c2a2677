//! Supervises an external slave-mode audio player.
//!
//! A [`Player`] spawns the player binary as a child process in its own
//! process group, talks to it over a line protocol on stdin/stdout, and
//! raises the caller's [`CompletionSignal`] once whenever the child exits,
//! so the caller can move on to the next track.
//!
//! ```no_run
//! use std::sync::Arc;
//! use subplayer::{open_player, Latch, Player, PlayerConfig};
//!
//! let latch = Arc::new(Latch::new());
//! let player = open_player(PlayerConfig::default(), latch.clone())?;
//! player.start("http://example.com/track.mp3")?;
//! player.set_volume(60)?;
//! let notice = latch.wait();
//! assert_eq!(notice.generation, player.generation());
//! # Ok::<(), subplayer::PlayerError>(())
//! ```

mod config;
mod player;
mod signal;

pub use config::{ConfigError, PlayerConfig};
pub use player::{
  clamp_volume, find_executable, open_player, parse_seconds, BackendKind, ChildTransport, Codec,
  MPlayer, PlaybackState, Player, PlayerError, ProcessError, ProcessHandle, ReadOutcome, Response,
  SlaveCommand, SpawnedPipes, StopStrategy, Supervisor, Transport, TransportError,
  ANS_TIME_POSITION,
};
pub use signal::{CompletionSignal, ExitNotice, Latch};
