use imapenta::SetReadTimeout;
use std::io::{self, Cursor, Read, Write};
use std::time::Duration;

/// An in-memory duplex pipe standing in for a socket: reads come from a fixed script, writes
/// accumulate into a buffer the test can inspect afterward.
pub struct Mock {
  to_read: Cursor<Vec<u8>>,
  pub written: Vec<u8>,
}

impl Mock {
  pub fn new(script: &[u8]) -> Self {
    Self { to_read: Cursor::new(script.to_vec()), written: Vec::new() }
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
