//! MPlayer backend driven through `-slave` mode.

use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;

use parking_lot::Mutex;

use super::process::{find_executable, StopStrategy, Supervisor};
use super::protocol::{clamp_volume, parse_seconds, Codec, SlaveCommand};
use super::transport::ChildTransport;
use super::{PlaybackState, Player, PlayerError};
use crate::config::PlayerConfig;
use crate::signal::CompletionSignal;

/// Executable name looked up when no path is configured.
pub const MPLAYER_COMMAND: &str = "mplayer";

/// Flags passed on every launch, before any user or per-track arguments.
const DEFAULT_ARGS: &[&str] = &[
  "-slave",
  "-nolirc",    // silence the LIRC warning
  "-quiet",     // not -really-quiet, that also mutes get_* answers
  "-softvol",   // keep volume changes local to this player
  "-cache",
  "5120",       // 5 MiB cache
  "-cache-min",
  "2",          // start once 2% of the cache is filled
];

#[derive(Debug)]
struct Session {
  volume: u8,
  paused: bool,
}

/// MPlayer controller.
///
/// MPlayer forks a helper in slave mode and ignores SIGTERM while it is
/// still opening a network stream, so it is always stopped by killing its
/// whole process group.
pub struct MPlayer {
  command: String,
  extra_args: Vec<String>,
  codec: Codec,
  supervisor: Supervisor,
  /// Held across a whole start or quit so two starts never both install a process.
  lifecycle: Mutex<()>,
  transport: Mutex<Option<ChildTransport>>,
  session: Mutex<Session>,
}

impl MPlayer {
  /// Create a controller. Nothing is spawned until [`Player::start`].
  pub fn new(config: PlayerConfig, signal: Arc<dyn CompletionSignal>) -> Self {
    Self {
      command: config
        .executable
        .clone()
        .unwrap_or_else(|| MPLAYER_COMMAND.to_string()),
      extra_args: config.extra_args.clone(),
      codec: Codec::new(config.settle_delay()),
      supervisor: Supervisor::new(signal, StopStrategy::ForceGroup, config.stop_grace()),
      lifecycle: Mutex::new(()),
      transport: Mutex::new(None),
      session: Mutex::new(Session {
        volume: clamp_volume(config.default_volume.into()),
        paused: false,
      }),
    }
  }

  /// Whether the configured executable can be found.
  pub fn is_available(&self) -> bool {
    find_executable(&self.command).is_some()
  }

  pub fn pid(&self) -> Option<u32> {
    self.supervisor.pid()
  }

  /// Exit status of the last process stopped by this controller.
  pub fn last_exit(&self) -> Option<ExitStatus> {
    self.supervisor.last_exit()
  }

  fn launch_args(&self, volume: u8, url: &str) -> Vec<String> {
    let mut args = Vec::with_capacity(DEFAULT_ARGS.len() + self.extra_args.len() + 4);
    args.push(self.command.clone());
    args.extend(DEFAULT_ARGS.iter().map(|a| a.to_string()));
    args.extend(self.extra_args.iter().cloned());
    args.push("-volume".to_string());
    args.push(volume.to_string());
    args.push(url.to_string());
    args
  }

  fn send(&self, cmd: &SlaveCommand) -> Result<Option<String>, PlayerError> {
    if !self.supervisor.is_alive() {
      return Err(PlayerError::NotPlaying);
    }
    let mut guard = self.transport.lock();
    let transport = guard.as_mut().ok_or(PlayerError::NotPlaying)?;
    match self.codec.send_and_expect(transport, cmd) {
      Ok(answer) => Ok(answer),
      // The player died under us; report it like any other dead player.
      Err(_) if !self.supervisor.is_alive() => Err(PlayerError::NotPlaying),
      Err(e) => Err(e.into()),
    }
  }

  /// Caller holds `lifecycle`.
  fn stop(&self) -> Result<(), PlayerError> {
    // Taking the channel first lets an in-flight command finish against a live player.
    let transport = self.transport.lock().take();
    if let Err(e) = self.supervisor.quit() {
      *self.transport.lock() = transport;
      return Err(e.into());
    }
    drop(transport);
    self.session.lock().paused = false;
    Ok(())
  }
}

impl Player for MPlayer {
  fn start(&self, url: &str) -> Result<(), PlayerError> {
    let _lifecycle = self.lifecycle.lock();
    self.stop()?;

    let volume = self.session.lock().volume;
    let args = self.launch_args(volume, url);
    let pipes = self.supervisor.spawn(&args)?;

    let transport = match ChildTransport::from_child(pipes.stdin, pipes.stdout) {
      Ok(transport) => transport,
      Err(e) => {
        self.supervisor.force_stop()?;
        return Err(e.into());
      }
    };
    *self.transport.lock() = Some(transport);
    self.session.lock().paused = false;

    log::info!("Playing {} (pid {:?})", url, self.supervisor.pid());
    Ok(())
  }

  fn pause(&self) -> Result<(), PlayerError> {
    self.send(&SlaveCommand::pause())?;
    let mut session = self.session.lock();
    session.paused = !session.paused;
    Ok(())
  }

  fn set_volume(&self, volume: i64) -> Result<(), PlayerError> {
    let volume = clamp_volume(volume);
    self.session.lock().volume = volume;
    match self.send(&SlaveCommand::set_volume(volume)) {
      Ok(_) => Ok(()),
      Err(PlayerError::NotPlaying) => {
        log::debug!("No player running, volume {} kept for the next start", volume);
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  fn time_pos(&self) -> Result<Option<i64>, PlayerError> {
    let answer = self.send(&SlaveCommand::get_time_pos())?;
    Ok(answer.as_deref().and_then(parse_seconds))
  }

  fn quit(&self) -> Result<(), PlayerError> {
    let _lifecycle = self.lifecycle.lock();
    self.stop()
  }

  fn is_alive(&self) -> bool {
    self.supervisor.is_alive()
  }

  fn volume(&self) -> u8 {
    self.session.lock().volume
  }

  fn state(&self) -> PlaybackState {
    if !self.is_alive() {
      PlaybackState::Stopped
    } else if self.session.lock().paused {
      PlaybackState::Paused
    } else {
      PlaybackState::Playing
    }
  }

  fn generation(&self) -> u64 {
    self.supervisor.generation()
  }
}

impl fmt::Display for MPlayer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.pid() {
      Some(pid) => write!(f, "MPlayer (pid {})", pid),
      None => write!(f, "MPlayer (not running)"),
    }
  }
}
