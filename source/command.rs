//! Command serializer (component D): turns a verb and a list of [`Argument`]s into bytes on
//! the wire, including the continuation-prompt handshake for literal arguments.

use crate::stream::{SetReadTimeout, Stream};
use anyhow::Context as _;
use std::io::{self, Read, Seek};
use zeroize::Zeroize as _;

/// One command argument. The classification drives how it's quoted or literalized; see the
/// design notes on argument classification.
pub enum Argument<'a> {
  /// Emitted verbatim: already known to be safe (a bare keyword, a sequence-set string, …).
  Verbatim(Vec<u8>),
  /// Quoted iff it contains whitespace or IMAP metacharacters; forced to a literal if it
  /// contains NUL/CR/LF. This is the default for user-supplied strings like folder names.
  Quotable(Vec<u8>),
  /// Always quoted, regardless of content (used for the LOGIN password so a server always
  /// sees a quoted-string literal shape even when the password happens to look atom-safe).
  ForceQuote(Vec<u8>),
  /// Never quoted, even if it contains characters that would otherwise trigger quoting
  /// (used for sequence-sets ending in `*`, which some servers refuse quoted).
  NoQuote(Vec<u8>),
  /// Forced to a literal regardless of content.
  ForceLiteral(Vec<u8>),
  /// A literal whose size is discovered by seeking, and whose bytes are streamed from the
  /// source rather than held fully in memory (component A's streamed-literal handle).
  LiteralSource(&'a mut dyn ReadSeek),
  /// Marks the argument carrying credentials; the written bytes are not logged in clear
  /// to the trace sink, matching [`Argument::ForceQuote`]'s wire shape.
  Sensitive(Vec<u8>),
}

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

fn needs_literal(bytes: &[u8]) -> bool {
  bytes.iter().any(|&b| matches!(b, 0 | b'\r' | b'\n'))
}

fn needs_quoting(bytes: &[u8]) -> bool {
  if bytes.starts_with(b"(") {
    return false;
  }
  bytes.is_empty()
    || bytes
      .iter()
      .any(|&b| matches!(b, b' ' | b'{' | b'}' | b'%' | b'*' | b'"' | b'(' | b')') || b <= 0x1f)
}

fn quote(bytes: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(bytes.len() + 2);
  out.push(b'"');
  for &byte in bytes {
    if byte == b'\\' || byte == b'"' {
      out.push(b'\\');
    }
    out.push(byte);
  }
  out.push(b'"');
  out
}

enum Piece<'a> {
  Bytes(Vec<u8>),
  Literal { size: u64, source: LiteralInput<'a> },
}

enum LiteralInput<'a> {
  Owned(Vec<u8>),
  Source(&'a mut dyn ReadSeek),
}

fn plan(argument: Argument) -> anyhow::Result<Piece> {
  Ok(match argument {
    Argument::Verbatim(bytes) | Argument::NoQuote(bytes) => Piece::Bytes(bytes),
    Argument::ForceQuote(bytes) => Piece::Bytes(quote(&bytes)),
    Argument::Sensitive(mut bytes) => {
      // The in-memory copy of the credential is wiped as soon as its quoted wire form is
      // built; the quoted copy still crosses the wire normally (and is masked in the trace,
      // not here - see `Stream::write_all`'s `sensitive` flag).
      let piece = Piece::Bytes(quote(&bytes));
      bytes.zeroize();
      piece
    }
    Argument::Quotable(bytes) => {
      if needs_literal(&bytes) {
        Piece::Literal {
          size: bytes.len() as u64,
          source: LiteralInput::Owned(bytes),
        }
      } else if needs_quoting(&bytes) {
        Piece::Bytes(quote(&bytes))
      } else {
        Piece::Bytes(bytes)
      }
    }
    Argument::ForceLiteral(bytes) => Piece::Literal {
      size: bytes.len() as u64,
      source: LiteralInput::Owned(bytes),
    },
    Argument::LiteralSource(mut source) => {
      let size = source.seek(io::SeekFrom::End(0)).context("seek to end")?;
      source.seek(io::SeekFrom::Start(0)).context("seek to start")?;
      Piece::Literal {
        size,
        source: LiteralInput::Source(source),
      }
    }
  })
}

/// Writes `tag SP verb (SP argument)* CRLF`, pausing for a `+` continuation line between
/// any literal argument and whatever follows it. `sensitive` marks whether this whole
/// command line (e.g. a LOGIN) should be masked when traced.
pub fn write<RW>(
  stream: &mut Stream<RW>,
  tag: &[u8],
  verb: &str,
  arguments: Vec<Argument>,
  sensitive: bool,
) -> anyhow::Result<()>
where
  RW: io::Read + io::Write + SetReadTimeout,
{
  let mut line = Vec::new();
  line.extend_from_slice(tag);
  line.push(b' ');
  line.extend_from_slice(verb.as_bytes());

  for argument in arguments {
    line.push(b' ');
    match plan(argument)? {
      Piece::Bytes(bytes) => line.extend_from_slice(&bytes),
      Piece::Literal { size, source } => {
        line.extend_from_slice(format!("{{{size}}}").as_bytes());
        line.extend_from_slice(b"\r\n");
        stream.write_all(&line, sensitive)?;
        line.clear();

        let continuation = stream.read_line().context("awaiting continuation")?;
        anyhow::ensure!(
          continuation.first() == Some(&b'+'),
          "server did not send a continuation request: {:?}",
          String::from_utf8_lossy(&continuation)
        );

        match source {
          LiteralInput::Owned(bytes) => stream.write_all(&bytes, sensitive)?,
          LiteralInput::Source(mut source) => {
            let mut buffer = vec![0u8; 64 * 1024];
            let mut remaining = size;
            while remaining > 0 {
              let take = std::cmp::min(remaining, buffer.len() as u64) as usize;
              source.read_exact(&mut buffer[..take]).context("read literal source")?;
              stream.write_all(&buffer[..take], sensitive)?;
              remaining -= take as u64;
            }
          }
        }
      }
    }
  }
  line.extend_from_slice(b"\r\n");
  stream.write_all(&line, sensitive)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stream::tests::Mock;

  fn write_and_capture(tag: &[u8], verb: &str, arguments: Vec<Argument>) -> Vec<u8> {
    let mut stream = Stream::new(Mock::new(b"+ go ahead\r\n+ go ahead\r\n+ go ahead\r\n"));
    write(&mut stream, tag, verb, arguments, false).unwrap();
    stream.into_inner().written
  }

  #[test]
  fn verbatim_and_quotable_plain() {
    let bytes = write_and_capture(
      b"a1",
      "SELECT",
      vec![Argument::Quotable(b"INBOX".to_vec())],
    );
    assert_eq!(b"a1 SELECT INBOX\r\n".to_vec(), bytes);
  }

  #[test]
  fn quotable_with_space_is_quoted() {
    let bytes = write_and_capture(
      b"a1",
      "CREATE",
      vec![Argument::Quotable(b"My Folder".to_vec())],
    );
    assert_eq!(b"a1 CREATE \"My Folder\"\r\n".to_vec(), bytes);
  }

  #[test]
  fn quotable_starting_with_paren_is_not_quoted() {
    let bytes = write_and_capture(
      b"a1",
      "SEARCH",
      vec![Argument::Quotable(b"(FLAGGED)".to_vec())],
    );
    assert_eq!(b"a1 SEARCH (FLAGGED)\r\n".to_vec(), bytes);
  }

  #[test]
  fn quotable_with_nul_is_forced_literal() {
    let bytes = write_and_capture(
      b"a1",
      "APPEND",
      vec![Argument::Quotable(b"a\0b".to_vec())],
    );
    assert_eq!(b"a1 APPEND {3}\r\na\0b\r\n".to_vec(), bytes);
  }

  #[test]
  fn no_continuation_is_an_error() {
    let mut stream = Stream::new(Mock::new(b"a1 NO try later\r\n"));
    let result = write(
      &mut stream,
      b"a1",
      "APPEND",
      vec![Argument::ForceLiteral(b"hi".to_vec())],
      false,
    );
    assert!(result.is_err());
  }
}
