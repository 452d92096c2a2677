//! Byte channel to the player's stdin/stdout.
//!
//! Writes block. Reads never do: the read side is switched to `O_NONBLOCK`
//! and "nothing to read yet" is reported as [`ReadOutcome::NoData`].

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::fd::AsFd;
use std::process::{ChildStdin, ChildStdout};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
  #[error("Write failed: {0}")]
  WriteFailed(#[source] io::Error),
  #[error("Failed to configure pipe: {0}")]
  Configure(#[source] io::Error),
}

/// Result of one non-blocking line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
  /// A complete line, without its terminator.
  Line(String),
  /// Nothing readable right now.
  NoData,
  /// The player closed its end.
  Closed,
}

/// Transport bound to a spawned player.
pub type ChildTransport = Transport<ChildStdin, ChildStdout>;

/// Put a descriptor into non-blocking mode.
fn set_nonblocking(fd: impl AsFd) -> nix::Result<()> {
  let fd = fd.as_fd();
  let flags = OFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFL)?);
  fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
  Ok(())
}

/// Duplex line channel.
pub struct Transport<W, R> {
  writer: W,
  reader: BufReader<R>,
  /// Bytes of a line whose terminator has not arrived yet.
  partial: Vec<u8>,
}

impl ChildTransport {
  /// Bind to a child's pipes, making stdout non-blocking.
  pub fn from_child(stdin: ChildStdin, stdout: ChildStdout) -> Result<Self, TransportError> {
    set_nonblocking(&stdout).map_err(|e| TransportError::Configure(e.into()))?;
    Ok(Self::new(stdin, stdout))
  }
}

impl<W: Write, R: Read> Transport<W, R> {
  /// Wrap already configured streams.
  pub fn new(writer: W, reader: R) -> Self {
    Self {
      writer,
      reader: BufReader::new(reader),
      partial: Vec::new(),
    }
  }

  /// Write `line` plus a newline and flush.
  ///
  /// A failed write is retried once with every non-ASCII character dropped
  /// from the line; the second failure is returned.
  pub fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');

    if let Err(e) = self.write_flush(&bytes) {
      log::warn!("Write to player failed ({}), retrying as plain ASCII", e);
      let fallback = ascii_fallback(line);
      self
        .write_flush(&fallback)
        .map_err(TransportError::WriteFailed)?;
    }
    Ok(())
  }

  fn write_flush(&mut self, bytes: &[u8]) -> io::Result<()> {
    self.writer.write_all(bytes)?;
    self.writer.flush()
  }

  /// Read one line if a complete one is available.
  pub fn read_line(&mut self) -> ReadOutcome {
    match self.reader.read_until(b'\n', &mut self.partial) {
      Ok(0) if self.partial.is_empty() => ReadOutcome::Closed,
      // A line only comes back unterminated at EOF, so it is the last one.
      Ok(_) => ReadOutcome::Line(self.take_line()),
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::NoData,
      Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::NoData,
      Err(e) => {
        log::debug!("Read from player failed: {}", e);
        ReadOutcome::NoData
      }
    }
  }

  fn take_line(&mut self) -> String {
    let raw = std::mem::take(&mut self.partial);
    String::from_utf8_lossy(&raw)
      .trim_end_matches(&['\r', '\n'][..])
      .to_string()
  }
}

fn ascii_fallback(line: &str) -> Vec<u8> {
  let mut bytes: Vec<u8> = line.chars().filter(char::is_ascii).map(|c| c as u8).collect();
  bytes.push(b'\n');
  bytes
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::VecDeque;
  use std::io::Cursor;

  /// Writer that fails a fixed number of times before accepting data.
  struct FlakyWriter {
    failures: usize,
    written: Vec<u8>,
  }

  impl Write for FlakyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      if self.failures > 0 {
        self.failures -= 1;
        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
      }
      self.written.extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  /// Reader that yields scripted chunks, then WouldBlock.
  struct ScriptedReader {
    chunks: VecDeque<Vec<u8>>,
  }

  impl Read for ScriptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
      match self.chunks.pop_front() {
        Some(chunk) => {
          let n = chunk.len().min(buf.len());
          buf[..n].copy_from_slice(&chunk[..n]);
          Ok(n)
        }
        None => Err(io::ErrorKind::WouldBlock.into()),
      }
    }
  }

  fn scripted(chunks: &[&[u8]]) -> ScriptedReader {
    ScriptedReader {
      chunks: chunks.iter().map(|c| c.to_vec()).collect(),
    }
  }

  #[test]
  fn test_write_appends_newline() {
    let mut t = Transport::new(Vec::new(), Cursor::new(Vec::new()));
    t.write_line("volume 50 1").unwrap();
    assert_eq!(t.writer, b"volume 50 1\n");
  }

  #[test]
  fn test_write_retries_with_ascii_fallback() {
    let writer = FlakyWriter {
      failures: 1,
      written: Vec::new(),
    };
    let mut t = Transport::new(writer, Cursor::new(Vec::new()));
    t.write_line("loadfile caf\u{e9}.mp3").unwrap();
    assert_eq!(t.writer.written, b"loadfile caf.mp3\n");
  }

  #[test]
  fn test_write_fails_after_one_retry() {
    let writer = FlakyWriter {
      failures: 2,
      written: Vec::new(),
    };
    let mut t = Transport::new(writer, Cursor::new(Vec::new()));
    let err = t.write_line("pause").unwrap_err();
    assert!(matches!(err, TransportError::WriteFailed(_)));
  }

  #[test]
  fn test_read_without_data() {
    let mut t = Transport::new(Vec::new(), scripted(&[]));
    assert_eq!(t.read_line(), ReadOutcome::NoData);
  }

  #[test]
  fn test_partial_line_survives_would_block() {
    let mut t = Transport::new(Vec::new(), scripted(&[b"ANS_TIME_PO".as_slice()]));
    assert_eq!(t.read_line(), ReadOutcome::NoData);
    t.reader.get_mut().chunks.push_back(b"SITION=1.5\nnext".to_vec());
    assert_eq!(
      t.read_line(),
      ReadOutcome::Line("ANS_TIME_POSITION=1.5".to_string())
    );
    assert_eq!(t.read_line(), ReadOutcome::NoData);
  }

  #[test]
  fn test_eof_flushes_dangling_line() {
    let mut t = Transport::new(Vec::new(), Cursor::new(b"a\r\nb".to_vec()));
    assert_eq!(t.read_line(), ReadOutcome::Line("a".to_string()));
    assert_eq!(t.read_line(), ReadOutcome::Line("b".to_string()));
    assert_eq!(t.read_line(), ReadOutcome::Closed);
  }

  #[test]
  fn test_child_stdout_never_blocks() {
    use std::process::{Command, Stdio};

    let mut child = Command::new("sh")
      .args(["-c", "read -r line"])
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .spawn()
      .unwrap();
    let mut t =
      ChildTransport::from_child(child.stdin.take().unwrap(), child.stdout.take().unwrap()).unwrap();
    assert_eq!(t.read_line(), ReadOutcome::NoData);
    t.write_line("done").unwrap();
    drop(t);
    assert!(child.wait().unwrap().success());
  }

  #[test]
  fn test_invalid_utf8_is_replaced() {
    let mut t = Transport::new(Vec::new(), Cursor::new(b"x=\xff\n".to_vec()));
    assert_eq!(t.read_line(), ReadOutcome::Line("x=\u{fffd}".to_string()));
  }
}
