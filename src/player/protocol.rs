//! Slave-mode line protocol.
//!
//! Commands are single newline-terminated lines (`verb arg...`). Query
//! answers come back as `KEY=value` lines mixed into the player's other
//! console output.
//!
//! Reference: http://www.mplayerhq.hu/DOCS/tech/slave.txt

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use super::transport::{ReadOutcome, Transport, TransportError};

/// Response key of `get_time_pos`.
pub const ANS_TIME_POSITION: &str = "ANS_TIME_POSITION";

/// Clamp any integer into the 0-100 volume range.
pub fn clamp_volume(volume: i64) -> u8 {
  volume.clamp(0, 100) as u8
}

/// Command sent to the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveCommand {
  pub verb: &'static str,
  pub args: Vec<String>,
  /// Key of the answer line, for queries.
  pub expect: Option<&'static str>,
}

impl SlaveCommand {
  pub fn new(verb: &'static str) -> Self {
    Self {
      verb,
      args: Vec::new(),
      expect: None,
    }
  }

  pub fn arg(mut self, arg: impl ToString) -> Self {
    self.args.push(arg.to_string());
    self
  }

  pub fn expecting(mut self, key: &'static str) -> Self {
    self.expect = Some(key);
    self
  }

  /// Toggle pause.
  pub fn pause() -> Self {
    Self::new("pause")
  }

  /// Set absolute volume (0-100).
  pub fn set_volume(volume: u8) -> Self {
    Self::new("volume").arg(volume.min(100)).arg(1)
  }

  /// Query the playback position in seconds.
  pub fn get_time_pos() -> Self {
    Self::new("get_time_pos").expecting(ANS_TIME_POSITION)
  }

  /// Wire form, without the terminating newline.
  pub fn to_line(&self) -> String {
    let mut line = self.verb.to_string();
    for arg in &self.args {
      line.push(' ');
      line.push_str(arg);
    }
    line
  }
}

/// A `KEY=value` answer line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub key: String,
  pub value: String,
}

impl Response {
  /// Parse an answer line. Lines with no `=` or more than one are not answers.
  pub fn parse(line: &str) -> Option<Self> {
    let mut parts = line.trim_end().split('=');
    let key = parts.next()?;
    let value = parts.next()?;
    if parts.next().is_some() {
      return None;
    }
    Some(Self {
      key: key.trim().to_string(),
      value: value.trim().to_string(),
    })
  }

  pub fn matches(&self, key: &str) -> bool {
    self.key == key
  }
}

/// Convert a reported position to whole seconds, rounding half away from zero.
pub fn parse_seconds(value: &str) -> Option<i64> {
  let seconds: f64 = value.trim().parse().ok()?;
  seconds.is_finite().then(|| seconds.round() as i64)
}

/// Writes commands and collects their answers.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
  settle: Duration,
}

impl Codec {
  pub fn new(settle: Duration) -> Self {
    Self { settle }
  }

  /// Write `cmd` and wait out the settle delay.
  ///
  /// The player needs that time before a queued answer becomes readable.
  pub fn send<W: Write, R: Read>(
    &self,
    transport: &mut Transport<W, R>,
    cmd: &SlaveCommand,
  ) -> Result<(), TransportError> {
    let line = cmd.to_line();
    log::debug!("Send command to player: {}", line);
    transport.write_line(&line)?;
    thread::sleep(self.settle);
    Ok(())
  }

  /// Write `cmd`, then scan readable lines for its expected answer.
  ///
  /// Returns `None` as soon as no more data is readable without finding it.
  /// Commands without an expected key always return `None`.
  pub fn send_and_expect<W: Write, R: Read>(
    &self,
    transport: &mut Transport<W, R>,
    cmd: &SlaveCommand,
  ) -> Result<Option<String>, TransportError> {
    self.send(transport, cmd)?;
    let Some(expect) = cmd.expect else {
      return Ok(None);
    };

    loop {
      match transport.read_line() {
        ReadOutcome::Line(line) => {
          if let Some(response) = Response::parse(&line).filter(|r| r.matches(expect)) {
            return Ok(Some(response.value));
          }
        }
        ReadOutcome::NoData | ReadOutcome::Closed => return Ok(None),
      }
    }
  }
}
