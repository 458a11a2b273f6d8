//! Buffered, binary-safe I/O over an injected byte stream (component A).
//!
//! Two logging channels exist side by side here and are not to be confused: `log::trace!`/
//! `log::debug!` calls are for implementors debugging this crate, while [`crate::trace`] is
//! the channel a consuming application registers to capture exactly the bytes that crossed
//! the wire (with the LOGIN/AUTHENTICATE PLAIN secret already masked).

use crate::trace::{self, TraceSink};
use anyhow::Context as _;
use std::{collections::VecDeque, io, time::Duration};

/// Collaborator a stream type must supply in addition to `Read`/`Write` so [`Stream`] can
/// implement the zero-timeout `is_open` probe and the caller-configured read deadline. A
/// `std::net::TcpStream` satisfies this directly; an in-memory test double can implement it
/// as a no-op if it never blocks.
pub trait SetReadTimeout {
  fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl SetReadTimeout for std::net::TcpStream {
  fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    std::net::TcpStream::set_read_timeout(self, timeout)
  }
}

/// A destination for literal payload bytes that bypasses in-memory accumulation entirely,
/// e.g. a temp file a caller wants a large message body streamed straight into.
pub trait LiteralSink {
  fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<W: io::Write> LiteralSink for W {
  fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
    io::Write::write_all(self, bytes)
  }
}

#[derive(Debug)]
pub struct Stream<RW> {
  rw: RW,
  buffer: VecDeque<u8>,
  timeout: Option<Duration>,
  sink: Box<dyn TraceSink>,
}

impl<RW> Stream<RW>
where
  RW: io::Read + io::Write + SetReadTimeout,
{
  pub fn new(rw: RW) -> Self {
    Self {
      rw,
      buffer: VecDeque::new(),
      timeout: None,
      sink: Box::new(trace::Discard),
    }
  }

  pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
    self.sink = sink;
  }

  /// Surrenders the underlying stream, e.g. when releasing a session back to its caller.
  pub fn into_inner(self) -> RW {
    self.rw
  }

  pub fn set_timeout(&mut self, timeout: Option<Duration>) -> anyhow::Result<()> {
    self.timeout = timeout;
    self.rw.set_read_timeout(timeout).context("set_read_timeout")
  }

  /// Writes `bytes` verbatim, logging a masked-or-not trace depending on `sensitive`.
  pub fn write_all(&mut self, bytes: &[u8], sensitive: bool) -> anyhow::Result<()> {
    if sensitive {
      self.sink.write(b"***\r\n");
    } else {
      self.sink.write(bytes);
    }
    log::debug!("> {}", if sensitive { "***" } else { &trace::escape(bytes) });
    self.rw.write_all(bytes).context("write_all")?;
    Ok(())
  }

  /// Pulls one more chunk from the underlying stream into the internal buffer. Bails with
  /// a disconnect-shaped error on a zero-byte read (the peer closed its write half).
  fn fill(&mut self) -> anyhow::Result<usize> {
    let mut chunk = [0u8; 64 * 1024];
    match self.rw.read(&mut chunk) {
      Ok(0) => anyhow::bail!(io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream")),
      Ok(length) => {
        self.buffer.extend(&chunk[..length]);
        Ok(length)
      }
      Err(error) => Err(error).context("read"),
    }
  }

  /// Returns the bytes up to (and excluding) the next CRLF, consuming the CRLF itself.
  /// Bytes past the CRLF remain buffered for the following call — this is the one place a
  /// newline scan is applied; literal payloads are always read by exact count via
  /// [`Stream::read_exact`] instead (see invariant I3 in the design notes).
  pub fn read_line(&mut self) -> anyhow::Result<Vec<u8>> {
    loop {
      if let Some(position) = find_crlf(&self.buffer) {
        let line: Vec<u8> = self.buffer.drain(..position).collect();
        self.buffer.drain(..2); // CRLF
        log::trace!("< {}", trace::escape(&line));
        return Ok(line);
      }
      self.fill()?;
    }
  }

  /// Returns exactly `n` bytes, assembling them from the internal buffer and, as needed,
  /// further reads of the underlying stream.
  pub fn read_exact(&mut self, n: usize) -> anyhow::Result<Vec<u8>> {
    while self.buffer.len() < n {
      self.fill()?;
    }
    Ok(self.buffer.drain(..n).collect())
  }

  /// Like [`Stream::read_exact`] but streams the bytes to `sink` instead of returning them,
  /// so a literal the size of a large attachment never has to live in memory at once.
  pub fn copy_exact(&mut self, mut n: usize, sink: &mut dyn LiteralSink) -> anyhow::Result<()> {
    while n > 0 {
      if self.buffer.is_empty() {
        self.fill()?;
      }
      let take = std::cmp::min(n, self.buffer.len());
      let chunk: Vec<u8> = self.buffer.drain(..take).collect();
      sink.write(&chunk).context("literal sink write")?;
      n -= take;
    }
    Ok(())
  }

  /// Non-blocking-ish readability probe used by `is_open`: attempts a read with an
  /// effectively zero deadline. `Ok(true)` means more bytes are now buffered (the peer sent
  /// something, possibly a BYE); `Ok(false)` means nothing arrived within the window.
  pub fn poll_readable(&mut self) -> anyhow::Result<bool> {
    if !self.buffer.is_empty() {
      return Ok(true);
    }
    self
      .rw
      .set_read_timeout(Some(Duration::from_millis(0)))
      .context("set_read_timeout(0)")?;
    let result = match self.fill() {
      Ok(_) => Ok(true),
      Err(error) => match error.downcast_ref::<io::Error>() {
        Some(io_error)
          if matches!(
            io_error.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
          ) =>
        {
          Ok(false)
        }
        _ => Err(error),
      },
    };
    self
      .rw
      .set_read_timeout(self.timeout)
      .context("restore timeout")?;
    result
  }
}

impl<RW> Stream<RW>
where
  RW: io::Write,
{
  /// Raw, unbuffered, errors-discarded write. Exists for contexts like `Drop` that can't
  /// require `io::Read` just to send a best-effort line.
  pub(crate) fn write_best_effort(&mut self, bytes: &[u8]) {
    let _ = self.rw.write_all(bytes);
  }
}

fn find_crlf(buffer: &VecDeque<u8>) -> Option<usize> {
  let (first, second) = buffer.as_slices();
  if let Some(position) = memchr::memmem::find(first, b"\r\n") {
    return Some(position);
  }
  if first.last() == Some(&b'\r') && second.first() == Some(&b'\n') {
    return Some(first.len() - 1);
  }
  memchr::memmem::find(second, b"\r\n").map(|position| first.len() + position)
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use std::io::{Cursor, Read, Write};

  /// An in-memory duplex pipe standing in for a socket in unit tests: reads come from a
  /// fixed script, writes accumulate into a vector the test can inspect.
  pub struct Mock {
    pub to_read: Cursor<Vec<u8>>,
    pub written: Vec<u8>,
  }

  impl Mock {
    pub fn new(script: &[u8]) -> Self {
      Self {
        to_read: Cursor::new(script.to_vec()),
        written: Vec::new(),
      }
    }
  }

  impl Read for Mock {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
      self.to_read.read(buf)
    }
  }

  impl Write for Mock {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.written.extend_from_slice(buf);
      Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  impl SetReadTimeout for Mock {
    fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
      Ok(())
    }
  }

  #[test]
  fn read_line_splits_on_crlf() {
    let mut stream = Stream::new(Mock::new(b"a1 OK done\r\nrest"));
    assert_eq!(b"a1 OK done".to_vec(), stream.read_line().unwrap());
    assert_eq!(b"rest".to_vec(), stream.read_exact(4).unwrap());
  }

  #[test]
  fn read_exact_spans_embedded_crlf() {
    let mut stream = Stream::new(Mock::new(b"ab\r\ncd{3}\r\n"));
    assert_eq!(b"ab\r\ncd".to_vec(), stream.read_exact(6).unwrap());
  }

  #[test]
  fn read_line_past_end_of_stream_errors() {
    let mut stream = Stream::new(Mock::new(b"no newline"));
    assert!(stream.read_line().is_err());
  }

  #[test]
  fn copy_exact_streams_without_materializing_a_single_buffer() {
    let mut stream = Stream::new(Mock::new(b"hello world"));
    let mut sink = Vec::new();
    stream.copy_exact(5, &mut sink).unwrap();
    assert_eq!(b"hello".to_vec(), sink);
    assert_eq!(b" world".to_vec(), stream.read_exact(6).unwrap());
  }
}
