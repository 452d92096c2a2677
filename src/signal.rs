//! Completion signal raised when a supervised player process exits.
//!
//! The controller only ever calls [`CompletionSignal::set`]. Waiting on and
//! resetting the signal belong to the caller, which supplies the signal at
//! construction.

use std::process::ExitStatus;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Describes one player process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitNotice {
  /// Spawn counter of the controller that owned the process, starting at 1.
  pub generation: u64,
  /// Process id of the exited player.
  pub pid: u32,
  /// Exit code, if the process exited normally.
  pub code: Option<i32>,
  /// Terminating signal number, if the process was killed.
  pub signal: Option<i32>,
}

impl ExitNotice {
  pub fn new(generation: u64, pid: u32, status: Option<ExitStatus>) -> Self {
    use std::os::unix::process::ExitStatusExt;

    Self {
      generation,
      pid,
      code: status.and_then(|s| s.code()),
      signal: status.and_then(|s| s.signal()),
    }
  }
}

/// Once-per-process notification crossing the controller/caller boundary.
///
/// Called from the watcher thread, exactly once per spawned process.
pub trait CompletionSignal: Send + Sync {
  fn set(&self, notice: ExitNotice);
}

/// Blocking latch, the simplest signal a caller can hand over.
///
/// Holds the most recent notice until the caller resets it.
#[derive(Debug, Default)]
pub struct Latch {
  notice: Mutex<Option<ExitNotice>>,
  cond: Condvar,
}

impl Latch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_set(&self) -> bool {
    self.notice.lock().is_some()
  }

  /// The notice currently held, if set.
  pub fn notice(&self) -> Option<ExitNotice> {
    *self.notice.lock()
  }

  /// Clear the latch and return what it held.
  pub fn reset(&self) -> Option<ExitNotice> {
    self.notice.lock().take()
  }

  /// Block until the latch is set.
  pub fn wait(&self) -> ExitNotice {
    let mut guard = self.notice.lock();
    loop {
      if let Some(notice) = *guard {
        return notice;
      }
      self.cond.wait(&mut guard);
    }
  }

  /// Block until the latch is set or `timeout` elapses.
  pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitNotice> {
    let mut guard = self.notice.lock();
    if guard.is_none() {
      self
        .cond
        .wait_while_for(&mut guard, |notice| notice.is_none(), timeout);
    }
    *guard
  }
}

impl CompletionSignal for Latch {
  fn set(&self, notice: ExitNotice) {
    *self.notice.lock() = Some(notice);
    self.cond.notify_all();
  }
}

impl CompletionSignal for async_channel::Sender<ExitNotice> {
  fn set(&self, notice: ExitNotice) {
    if let Err(e) = self.try_send(notice) {
      log::debug!("Exit notice dropped, no receiver: {}", e);
    }
  }
}

impl CompletionSignal for tokio::sync::watch::Sender<Option<ExitNotice>> {
  fn set(&self, notice: ExitNotice) {
    self.send_replace(Some(notice));
  }
}
