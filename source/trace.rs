use std::{cmp, io, sync};

/// Renders non-printable bytes the way the crate's own `log` diagnostics do, so a sink's
/// output and a `RUST_LOG=debug` trace read the same way.
pub fn escape(bytes: &[u8]) -> String {
  let mut string = String::new();
  for byte in bytes {
    string += &std::ascii::escape_default(*byte).to_string();
  }
  string
}

pub(crate) fn summarize(bytes: &[u8]) -> String {
  let stop = bytes
    .windows(2)
    .position(|window| window == b"\r\n")
    .unwrap_or(bytes.len());
  let stop = cmp::min(stop + 2, bytes.len());
  let mut string = escape(&bytes[..stop]);
  if stop < bytes.len() {
    string += "...omitted...";
  }
  string
}

/// Receives the raw bytes that crossed the wire, independent of the crate's own `log`
/// diagnostics (see the module doc on [`crate::stream`]). Implementations must tolerate
/// reentrant calls from both the read and write paths of the same session.
pub trait TraceSink: Send {
  fn write(&self, bytes: &[u8]);
}

/// The default: discards everything.
pub struct Discard;

impl TraceSink for Discard {
  fn write(&self, _bytes: &[u8]) {}
}

/// Forwards to any `io::Write`, e.g. `io::stderr()`.
pub struct Writer<W>(sync::Mutex<W>);

impl<W> Writer<W>
where
  W: io::Write + Send,
{
  pub fn new(writer: W) -> Self {
    Self(sync::Mutex::new(writer))
  }
}

impl<W> TraceSink for Writer<W>
where
  W: io::Write + Send,
{
  fn write(&self, bytes: &[u8]) {
    // A trace sink is diagnostic, not load-bearing: a write failure (e.g. a closed pipe) is
    // silently dropped rather than propagated into the protocol path.
    let _ = self.0.lock().unwrap().write_all(bytes);
  }
}

/// Forwards to an arbitrary closure.
pub struct Callback<F>(F);

impl<F> Callback<F>
where
  F: Fn(&[u8]) + Send,
{
  pub fn new(callback: F) -> Self {
    Self(callback)
  }
}

impl<F> TraceSink for Callback<F>
where
  F: Fn(&[u8]) + Send,
{
  fn write(&self, bytes: &[u8]) {
    (self.0)(bytes)
  }
}

/// Accumulates everything in memory; meant for tests asserting on the exact wire trace.
#[derive(Default)]
pub struct Buffer(sync::Mutex<Vec<u8>>);

impl Buffer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn take(&self) -> Vec<u8> {
    std::mem::take(&mut self.0.lock().unwrap())
  }
}

impl TraceSink for Buffer {
  fn write(&self, bytes: &[u8]) {
    self.0.lock().unwrap().extend_from_slice(bytes);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn buffer_accumulates() {
    let sink = Buffer::new();
    sink.write(b"a1 NOOP\r\n");
    sink.write(b"* OK\r\n");
    assert_eq!(b"a1 NOOP\r\n* OK\r\n".to_vec(), sink.take());
    assert_eq!(Vec::<u8>::new(), sink.take());
  }

  #[test]
  fn summarize_truncates_at_first_crlf() {
    assert_eq!("ab\\r\\n...omitted...", summarize(b"ab\r\nmore"));
    assert_eq!("ab", summarize(b"ab"));
  }
}
