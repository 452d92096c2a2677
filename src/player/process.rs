//! Player process detection, spawning and supervision.
//!
//! Every spawn starts one watcher thread. The watcher owns the `Child`, is the
//! only place the child gets reaped, and raises the completion signal exactly
//! once when the process exits. The foreground keeps a [`ProcessHandle`] that
//! observes the watcher's result and can signal the process group.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::signal::{CompletionSignal, ExitNotice};

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("Player executable not found: {0}")]
  NotFound(String),
  #[error("Failed to spawn {executable}: {source}")]
  SpawnFailed {
    executable: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Player {0} stream was not captured")]
  MissingPipe(&'static str),
  #[error("Failed to start watcher thread: {0}")]
  Watcher(std::io::Error),
  #[error("Failed to signal player: {0}")]
  Signal(#[from] nix::Error),
}

impl ProcessError {
  /// True when the backend cannot be run at all on this system.
  pub fn is_unavailable(&self) -> bool {
    match self {
      ProcessError::NotFound(_) => true,
      ProcessError::SpawnFailed { source, .. } => matches!(
        source.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
      ),
      _ => false,
    }
  }
}

/// How `quit` asks a player to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStrategy {
  /// SIGTERM to the player process only.
  Graceful,
  /// SIGKILL to the player's whole process group, for backends that fork
  /// helpers or ignore SIGTERM while they are still opening the stream.
  ForceGroup,
}

/// Find a player executable.
///
/// A name containing a path separator must point at an existing file; a bare
/// name is looked up in PATH first, then in common install locations.
pub fn find_executable(name: &str) -> Option<PathBuf> {
  if name.contains(std::path::MAIN_SEPARATOR) {
    let path = PathBuf::from(name);
    return path.is_file().then_some(path);
  }

  if let Ok(path) = which::which(name) {
    return Some(path);
  }

  #[cfg(target_os = "macos")]
  let common_dirs = ["/usr/local/bin", "/opt/homebrew/bin", "/opt/local/bin"];
  #[cfg(not(target_os = "macos"))]
  let common_dirs = ["/usr/bin", "/usr/local/bin"];

  common_dirs
    .iter()
    .map(|dir| Path::new(dir).join(name))
    .find(|p| p.is_file())
}

/// What the watcher knows about its process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ExitState {
  #[default]
  Running,
  /// Reaped. The status is missing when `wait` itself failed.
  Exited(Option<ExitStatus>),
}

/// Exit state published by the watcher, which notifies `cond` after each change.
#[derive(Debug, Default)]
struct ExitSlot {
  state: Mutex<ExitState>,
  cond: Condvar,
}

/// Foreground view of one spawned player process.
///
/// Replaced, never edited, on each spawn.
#[derive(Debug)]
pub struct ProcessHandle {
  pid: u32,
  generation: u64,
  exit: Arc<ExitSlot>,
  watcher: Option<JoinHandle<()>>,
}

impl ProcessHandle {
  pub fn pid(&self) -> u32 {
    self.pid
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  /// Non-blocking liveness check.
  pub fn is_alive(&self) -> bool {
    *self.exit.state.lock() == ExitState::Running
  }

  /// Status the process exited with; `None` while running or when it could not be collected.
  pub fn exit_status(&self) -> Option<ExitStatus> {
    match *self.exit.state.lock() {
      ExitState::Running => None,
      ExitState::Exited(status) => status,
    }
  }

  /// Wait until the watcher has reaped the process, at most `timeout`.
  ///
  /// Returns whether it has.
  pub fn wait_timeout(&self, timeout: Duration) -> bool {
    let mut state = self.exit.state.lock();
    if *state == ExitState::Running {
      self
        .exit
        .cond
        .wait_while_for(&mut state, |state| *state == ExitState::Running, timeout);
    }
    *state != ExitState::Running
  }

  /// Send SIGTERM to the player process.
  pub fn terminate(&self) -> Result<(), ProcessError> {
    self.send(Signal::SIGTERM, false)
  }

  /// Send SIGKILL to the player's process group.
  pub fn kill_group(&self) -> Result<(), ProcessError> {
    self.send(Signal::SIGKILL, true)
  }

  fn send(&self, signal: Signal, group: bool) -> Result<(), ProcessError> {
    // The watcher reaps under this lock, so while it is held and the state
    // is Running the pid still names our child (alive or a zombie).
    let state = self.exit.state.lock();
    if *state != ExitState::Running {
      return Ok(());
    }
    let pid = Pid::from_raw(self.pid as i32);
    log::debug!(
      "Sending {:?} to player {} (group: {})",
      signal,
      self.pid,
      group
    );
    let result = if group {
      killpg(pid, signal)
    } else {
      kill(pid, signal)
    };
    match result {
      Ok(()) | Err(Errno::ESRCH) => Ok(()),
      Err(e) => Err(ProcessError::Signal(e)),
    }
  }

  fn join_watcher(&mut self) {
    if let Some(handle) = self.watcher.take() {
      if handle.join().is_err() {
        log::error!("Watcher thread for player {} panicked", self.pid);
      }
    }
  }
}

/// Pipes of a freshly spawned player.
#[derive(Debug)]
pub struct SpawnedPipes {
  pub stdin: ChildStdin,
  pub stdout: ChildStdout,
}

/// Owns the player process slot of one controller.
///
/// Spawning and stopping are serialized, so at most one process is ever live.
pub struct Supervisor {
  signal: Arc<dyn CompletionSignal>,
  strategy: StopStrategy,
  grace: Duration,
  generation: AtomicU64,
  /// Held for the whole of every spawn and stop.
  lifecycle: Mutex<()>,
  current: Mutex<Option<ProcessHandle>>,
  last_exit: Mutex<Option<ExitStatus>>,
}

impl Supervisor {
  pub fn new(signal: Arc<dyn CompletionSignal>, strategy: StopStrategy, grace: Duration) -> Self {
    Self {
      signal,
      strategy,
      grace,
      generation: AtomicU64::new(0),
      lifecycle: Mutex::new(()),
      current: Mutex::new(None),
      last_exit: Mutex::new(None),
    }
  }

  /// Spawn counter of the current (or most recent) process; 0 before the first spawn.
  pub fn generation(&self) -> u64 {
    self.generation.load(Ordering::SeqCst)
  }

  pub fn is_alive(&self) -> bool {
    self
      .current
      .lock()
      .as_ref()
      .is_some_and(ProcessHandle::is_alive)
  }

  pub fn pid(&self) -> Option<u32> {
    self
      .current
      .lock()
      .as_ref()
      .filter(|h| h.is_alive())
      .map(ProcessHandle::pid)
  }

  /// Exit status of the most recently retired process, if it could be collected.
  pub fn last_exit(&self) -> Option<ExitStatus> {
    *self.last_exit.lock()
  }

  /// Start a new player from `argv` (executable first), stopping any live one first.
  ///
  /// The child gets piped stdin/stdout, a discarded stderr and its own process group.
  pub fn spawn(&self, argv: &[String]) -> Result<SpawnedPipes, ProcessError> {
    let _lifecycle = self.lifecycle.lock();
    self.retire(self.strategy)?;

    let (name, args) = argv
      .split_first()
      .ok_or_else(|| ProcessError::NotFound(String::new()))?;
    let exe = find_executable(name).ok_or_else(|| ProcessError::NotFound(name.clone()))?;

    log::debug!("Exec: {} {}", exe.display(), args.join(" "));

    let mut child = Command::new(&exe)
      .args(args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .process_group(0)
      .spawn()
      .map_err(|source| ProcessError::SpawnFailed {
        executable: exe.display().to_string(),
        source,
      })?;

    let pipes = match (child.stdin.take(), child.stdout.take()) {
      (Some(stdin), Some(stdout)) => SpawnedPipes { stdin, stdout },
      (stdin, _) => {
        reap_failed(child);
        return Err(ProcessError::MissingPipe(if stdin.is_none() {
          "stdin"
        } else {
          "stdout"
        }));
      }
    };

    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let pid = child.id();
    let exit = Arc::new(ExitSlot::default());

    let watcher = {
      let exit = exit.clone();
      let signal = self.signal.clone();
      std::thread::Builder::new()
        .name(format!("player-watch-{}", pid))
        .spawn(move || watch(child, generation, exit, signal))
    };
    let watcher = match watcher {
      Ok(handle) => handle,
      Err(e) => {
        // The child moved into the failed closure and was dropped; take it down by pid.
        let pid = Pid::from_raw(pid as i32);
        let _ = killpg(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
        return Err(ProcessError::Watcher(e));
      }
    };

    *self.current.lock() = Some(ProcessHandle {
      pid,
      generation,
      exit,
      watcher: Some(watcher),
    });

    Ok(pipes)
  }

  /// Stop the current player using the configured strategy.
  ///
  /// No-op when nothing is running. Returns once the watcher has reported the
  /// exit, escalating to a group kill after the grace period.
  pub fn quit(&self) -> Result<(), ProcessError> {
    self.stop(self.strategy)
  }

  /// SIGTERM the player, then wait for it to go away.
  pub fn request_graceful_stop(&self) -> Result<(), ProcessError> {
    self.stop(StopStrategy::Graceful)
  }

  /// SIGKILL the player's process group, then wait for the watcher.
  pub fn force_stop(&self) -> Result<(), ProcessError> {
    self.stop(StopStrategy::ForceGroup)
  }

  fn stop(&self, strategy: StopStrategy) -> Result<(), ProcessError> {
    let _lifecycle = self.lifecycle.lock();
    self.retire(strategy)
  }

  /// Caller holds `lifecycle`.
  fn retire(&self, strategy: StopStrategy) -> Result<(), ProcessError> {
    let Some(mut handle) = self.current.lock().take() else {
      return Ok(());
    };

    if handle.is_alive() {
      let sent = match strategy {
        StopStrategy::Graceful => handle.terminate(),
        StopStrategy::ForceGroup => handle.kill_group(),
      };
      if let Err(e) = sent {
        // Keep the handle so a later quit can try again.
        *self.current.lock() = Some(handle);
        return Err(e);
      }
    }

    let mut exited = handle.wait_timeout(self.grace);
    if !exited {
      log::warn!(
        "Player {} still running after {:?}, killing its process group",
        handle.pid,
        self.grace
      );
      handle.kill_group()?;
      exited = handle.wait_timeout(self.grace);
    }

    if exited {
      handle.join_watcher();
      *self.last_exit.lock() = handle.exit_status();
    } else {
      log::warn!("Player {} did not exit, detaching its watcher", handle.pid);
    }
    Ok(())
  }
}

impl Drop for Supervisor {
  fn drop(&mut self) {
    if let Err(e) = self.force_stop() {
      log::warn!("Failed to stop player on drop: {}", e);
    }
  }
}

fn reap_failed(mut child: Child) {
  let _ = child.kill();
  let _ = child.wait();
}

/// Watcher body: block on the child's exit, publish it, raise the signal once.
fn watch(
  mut child: Child,
  generation: u64,
  exit: Arc<ExitSlot>,
  signal: Arc<dyn CompletionSignal>,
) {
  let pid = child.id();
  log::debug!("Watching player {}", pid);

  let status = reap(&mut child, &exit);
  exit.cond.notify_all();
  match status {
    Some(status) => log::debug!("Player {} exited with {}", pid, status),
    None => log::error!("Lost track of player {}, exit status unknown", pid),
  }

  signal.set(ExitNotice::new(generation, pid, status));
}

/// Wait for the exit without reaping, then reap under the slot lock.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn reap(child: &mut Child, exit: &ExitSlot) -> Option<ExitStatus> {
  use nix::sys::wait::{waitid, Id, WaitPidFlag};

  let pid = Pid::from_raw(child.id() as i32);
  loop {
    match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
      Err(Errno::EINTR) => continue,
      Err(e) => {
        log::debug!("waitid on player {} failed: {}", pid, e);
        break;
      }
      Ok(_) => break,
    }
  }

  let mut state = exit.state.lock();
  let status = child.wait().ok();
  *state = ExitState::Exited(status);
  status
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn reap(child: &mut Child, exit: &ExitSlot) -> Option<ExitStatus> {
  // No waitid here: a signal sent just after the reap can hit a recycled pid.
  let status = child.wait().ok();
  *exit.state.lock() = ExitState::Exited(status);
  status
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::signal::Latch;

  fn supervisor(latch: Arc<Latch>, strategy: StopStrategy) -> Supervisor {
    Supervisor::new(latch, strategy, Duration::from_secs(2))
  }

  fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn test_find_executable() {
    assert!(find_executable("sh").is_some());
    assert!(find_executable("/bin/sh").is_some());
    assert!(find_executable("/nonexistent/dir/player").is_none());
    assert!(find_executable("definitely-not-a-player-binary").is_none());
  }

  #[test]
  fn test_spawn_missing_executable() {
    let latch = Arc::new(Latch::new());
    let sup = supervisor(latch.clone(), StopStrategy::ForceGroup);
    let err = sup.spawn(&argv(&["/nonexistent/dir/player"])).unwrap_err();
    assert!(err.is_unavailable());
    assert!(!sup.is_alive());
    assert_eq!(sup.generation(), 0);
    assert!(!latch.is_set());
  }

  #[test]
  fn test_watcher_signals_natural_exit() {
    let latch = Arc::new(Latch::new());
    let sup = supervisor(latch.clone(), StopStrategy::ForceGroup);
    let _pipes = sup.spawn(&argv(&["sh", "-c", "exit 3"])).unwrap();
    let notice = latch.wait_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(notice.generation, 1);
    assert_eq!(notice.code, Some(3));
  }

  #[test]
  fn test_force_stop_kills_group() {
    let latch = Arc::new(Latch::new());
    let sup = supervisor(latch.clone(), StopStrategy::ForceGroup);
    // A helper in the background shares the group and must die too.
    let _pipes = sup
      .spawn(&argv(&["sh", "-c", "sleep 30 & sleep 30"]))
      .unwrap();
    let pid = sup.pid().unwrap();
    assert!(sup.is_alive());

    sup.quit().unwrap();
    assert!(!sup.is_alive());
    let notice = latch.notice().unwrap();
    assert_eq!(notice.pid, pid);
    assert_eq!(notice.signal, Some(Signal::SIGKILL as i32));
  }

  #[test]
  fn test_graceful_stop_terminates() {
    let latch = Arc::new(Latch::new());
    let sup = supervisor(latch.clone(), StopStrategy::Graceful);
    let _pipes = sup.spawn(&argv(&["sleep", "30"])).unwrap();
    sup.quit().unwrap();
    assert!(!sup.is_alive());
    assert_eq!(latch.notice().unwrap().signal, Some(Signal::SIGTERM as i32));
    assert!(sup.last_exit().is_some());
  }

  #[test]
  fn test_graceful_stop_escalates() {
    let latch = Arc::new(Latch::new());
    let sup = Supervisor::new(latch.clone(), StopStrategy::Graceful, Duration::from_millis(200));
    let _pipes = sup
      .spawn(&argv(&["sh", "-c", "trap '' TERM; while true; do sleep 1; done"]))
      .unwrap();
    // Give the shell time to install its trap.
    std::thread::sleep(Duration::from_millis(100));
    sup.quit().unwrap();
    assert!(!sup.is_alive());
    assert_eq!(latch.notice().unwrap().signal, Some(Signal::SIGKILL as i32));
  }

  #[test]
  fn test_quit_when_idle_is_noop() {
    let latch = Arc::new(Latch::new());
    let sup = supervisor(latch.clone(), StopStrategy::ForceGroup);
    sup.quit().unwrap();
    assert!(!latch.is_set());
  }

  #[test]
  fn test_concurrent_spawns_leave_one_process() {
    let (tx, rx) = async_channel::unbounded::<ExitNotice>();
    let sup = Arc::new(Supervisor::new(
      Arc::new(tx),
      StopStrategy::ForceGroup,
      Duration::from_secs(2),
    ));
    let barrier = Arc::new(std::sync::Barrier::new(8));

    let spawners: Vec<_> = (0..8)
      .map(|_| {
        let sup = sup.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
          barrier.wait();
          sup.spawn(&argv(&["sleep", "30"])).map(drop)
        })
      })
      .collect();
    for spawner in spawners {
      spawner.join().unwrap().unwrap();
    }

    assert_eq!(sup.generation(), 8);
    assert!(sup.is_alive());
    // Every replaced process has already been stopped and reported.
    assert_eq!(rx.len(), 7);

    sup.quit().unwrap();
    let mut generations: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
      .map(|n| n.generation)
      .collect();
    generations.sort_unstable();
    assert_eq!(generations, (1..=8).collect::<Vec<_>>());
  }

  #[test]
  fn test_unknown_exit_status() {
    let handle = ProcessHandle {
      pid: 0,
      generation: 1,
      exit: Arc::new(ExitSlot::default()),
      watcher: None,
    };
    assert!(handle.is_alive());
    assert!(!handle.wait_timeout(Duration::from_millis(10)));

    *handle.exit.state.lock() = ExitState::Exited(None);
    assert!(!handle.is_alive());
    assert!(handle.wait_timeout(Duration::ZERO));
    assert_eq!(handle.exit_status(), None);

    let notice = ExitNotice::new(handle.generation(), handle.pid(), handle.exit_status());
    assert_eq!(notice.code, None);
    assert_eq!(notice.signal, None);
  }
}
