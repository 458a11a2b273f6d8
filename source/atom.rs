//! Tokenizer / atom reader (component B). Drives [`crate::stream::Stream`] one logical
//! response line at a time and yields fully-formed [`Atom`] values, resolving nested
//! parenthesized lists with an explicit stack rather than native recursion so a
//! maliciously deep BODYSTRUCTURE can't blow the call stack.

use crate::stream::{LiteralSink, SetReadTimeout, Stream};
use anyhow::Context as _;
use std::io;

/// What a literal's payload turned into once fully read off the wire.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LiteralData {
  Owned(Vec<u8>),
  /// The bytes were handed to a registered [`LiteralSink`] instead of being kept in memory.
  Sunk,
}

impl LiteralData {
  pub fn as_bytes(&self) -> &[u8] {
    match self {
      LiteralData::Owned(bytes) => bytes,
      LiteralData::Sunk => &[],
    }
  }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Atom {
  Null,
  Str(Vec<u8>),
  Literal(LiteralData),
  List(Vec<Atom>),
}

impl Atom {
  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      Atom::Str(bytes) => Some(bytes),
      Atom::Literal(data) => Some(data.as_bytes()),
      Atom::Null | Atom::List(_) => None,
    }
  }

  pub fn as_list(&self) -> Option<&[Atom]> {
    match self {
      Atom::List(items) => Some(items),
      _ => None,
    }
  }

  pub fn as_str_uppercase(&self) -> Option<String> {
    self
      .as_bytes()
      .map(|bytes| String::from_utf8_lossy(bytes).to_uppercase())
  }
}

struct Line {
  bytes: Vec<u8>,
  pos: usize,
}

impl Line {
  fn remaining(&self) -> &[u8] {
    &self.bytes[self.pos..]
  }

  fn at_end(&self) -> bool {
    self.pos >= self.bytes.len()
  }
}

pub struct Tokenizer<'s, 'k, RW> {
  stream: &'s mut Stream<RW>,
  line: Line,
  literal_sink: Option<&'k mut dyn LiteralSink>,
}

fn atom_special(byte: u8) -> bool {
  matches!(byte, b'(' | b')' | b'{' | b' ' | b'%' | b'*' | b'"' | b']') || byte <= 0x1f || byte == 0x7f
}

/// Length of a case-insensitive "BODY.PEEK" or "BODY" prefix at the start of `remaining`,
/// checked in that order since the former is a superset match of the latter.
fn body_section_prefix(remaining: &[u8]) -> Option<usize> {
  for candidate in [&b"BODY.PEEK"[..], &b"BODY"[..]] {
    if remaining.len() >= candidate.len() && remaining[..candidate.len()].eq_ignore_ascii_case(candidate) {
      return Some(candidate.len());
    }
  }
  None
}

impl<'s, 'k, RW> Tokenizer<'s, 'k, RW>
where
  RW: io::Read + io::Write + SetReadTimeout,
{
  /// Reads one response line from `stream` and prepares a tokenizer over it. `literal_sink`,
  /// when present, receives the bytes of every literal encountered on this line instead of
  /// them being materialized in an `Atom::Literal(LiteralData::Owned(_))`.
  pub fn read_line(
    stream: &'s mut Stream<RW>,
    literal_sink: Option<&'k mut dyn LiteralSink>,
  ) -> anyhow::Result<Self> {
    let bytes = stream.read_line()?;
    Ok(Self {
      stream,
      line: Line { bytes, pos: 0 },
      literal_sink,
    })
  }

  pub fn at_end(&self) -> bool {
    self.line.at_end()
  }

  fn reborrow_sink(&mut self) -> Option<&mut dyn LiteralSink> {
    self.literal_sink.as_mut().map(|s| &mut **s)
  }

  fn skip_space(&mut self) {
    while self.line.remaining().first() == Some(&b' ') {
      self.line.pos += 1;
    }
  }

  /// Reads one fully-resolved atom, consuming any nested `(...)` list via an explicit work
  /// stack instead of native recursion. Returns `None` exactly when the line is already
  /// exhausted at depth 0.
  pub fn next_atom(&mut self) -> anyhow::Result<Option<Atom>> {
    let mut stack: Vec<Vec<Atom>> = Vec::new();
    loop {
      self.skip_space();
      if self.line.at_end() {
        return if stack.is_empty() {
          Ok(None)
        } else {
          anyhow::bail!("unexpected end of line inside a list")
        };
      }
      match self.line.remaining()[0] {
        b'(' => {
          self.line.pos += 1;
          stack.push(Vec::new());
        }
        b')' => {
          self.line.pos += 1;
          let list = stack.pop().context("unmatched )")?;
          let atom = Atom::List(list);
          match stack.last_mut() {
            Some(parent) => parent.push(atom),
            None => return Ok(Some(atom)),
          }
        }
        _ => {
          let atom = self.read_scalar()?;
          match stack.last_mut() {
            Some(parent) => parent.push(atom),
            None => return Ok(Some(atom)),
          }
        }
      }
    }
  }

  fn read_scalar(&mut self) -> anyhow::Result<Atom> {
    match self.line.remaining()[0] {
      b'"' => self.read_quoted(),
      b'{' => self.read_literal(),
      _ => self.read_string(),
    }
  }

  fn read_quoted(&mut self) -> anyhow::Result<Atom> {
    self.line.pos += 1; // opening quote
    let mut out = Vec::new();
    loop {
      let remaining = self.line.remaining();
      match remaining.first() {
        None => anyhow::bail!("unterminated quoted string"),
        Some(b'"') => {
          self.line.pos += 1;
          break;
        }
        Some(b'\\') => {
          let escaped = *remaining.get(1).context("dangling escape in quoted string")?;
          out.push(escaped);
          self.line.pos += 2;
        }
        Some(&byte) => {
          out.push(byte);
          self.line.pos += 1;
        }
      }
    }
    Ok(Atom::Str(out))
  }

  fn read_literal(&mut self) -> anyhow::Result<Atom> {
    let remaining = self.line.remaining();
    let close = memchr::memchr(b'}', remaining).context("unterminated literal size")?;
    let n: usize = std::str::from_utf8(&remaining[1..close])?
      .parse()
      .context("invalid literal size")?;
    anyhow::ensure!(
      close + 1 == remaining.len(),
      "trailing bytes after literal size on the same line"
    );
    self.line.pos = self.line.bytes.len();

    let sink = self.reborrow_sink();
    let atom = match sink {
      Some(sink) => {
        self.stream.copy_exact(n, sink)?;
        Atom::Literal(LiteralData::Sunk)
      }
      None => Atom::Literal(LiteralData::Owned(self.stream.read_exact(n)?)),
    };
    // The literal is always immediately followed by the rest of the response on a new line;
    // that line becomes our new cursor so parsing can continue seamlessly.
    self.line = Line {
      bytes: self.stream.read_line()?,
      pos: 0,
    };
    Ok(atom)
  }

  fn read_string(&mut self) -> anyhow::Result<Atom> {
    // A FETCH "BODY[section]" / "BODY.PEEK[section]<partial>" item name is its own grammar
    // production, not a plain atom: its section-spec may itself contain parens and spaces
    // (e.g. "HEADER.FIELDS (TO FROM)"), which the generic list scanner must not interpret.
    // Brackets don't nest here, so scanning to the next literal ']' is exact.
    if let Some(prefix_len) = body_section_prefix(self.line.remaining()) {
      if self.line.remaining().get(prefix_len) == Some(&b'[') {
        let remaining = self.line.remaining();
        let close = memchr::memchr(b']', &remaining[prefix_len..]).context("unterminated section spec")?;
        let mut end = prefix_len + close + 1;
        if remaining.get(end) == Some(&b'<') {
          let close2 = memchr::memchr(b'>', &remaining[end..]).context("unterminated partial range")?;
          end += close2 + 1;
        }
        let word = remaining[..end].to_vec();
        self.line.pos += end;
        return Ok(Atom::Str(word));
      }
    }

    let remaining = self.line.remaining();
    let end = remaining
      .iter()
      .position(|&byte| atom_special(byte))
      .unwrap_or(remaining.len());
    anyhow::ensure!(end > 0, "expected an atom, found {:?}", remaining.first());
    let word = &remaining[..end];
    self.line.pos += end;
    if word.eq_ignore_ascii_case(b"NIL") {
      Ok(Atom::Null)
    } else {
      Ok(Atom::Str(word.to_vec()))
    }
  }

  /// Fast path for a space-separated run of decimal IDs (SEARCH/SORT results), which is
  /// provably free of quoting or literals and can be split without going through the
  /// general atom dispatch.
  pub fn rest_as_numbers(&mut self) -> anyhow::Result<Vec<u64>> {
    self.skip_space();
    let remaining = self.line.remaining();
    let mut numbers = Vec::new();
    for chunk in remaining.split(|&byte| byte == b' ') {
      if chunk.is_empty() {
        continue;
      }
      numbers.push(
        std::str::from_utf8(chunk)
          .ok()
          .and_then(|s| s.parse().ok())
          .with_context(|| format!("expected a decimal number, found {:?}", chunk))?,
      );
    }
    self.line.pos = self.line.bytes.len();
    Ok(numbers)
  }

  /// Reads every remaining atom on the line.
  pub fn rest_as_atoms(&mut self) -> anyhow::Result<Vec<Atom>> {
    let mut atoms = Vec::new();
    while let Some(atom) = self.next_atom()? {
      atoms.push(atom);
    }
    Ok(atoms)
  }

  /// Takes the rest of the line as free text (the `text` production: response human text,
  /// with no further tokenization).
  pub fn rest_as_text(&mut self) -> String {
    self.skip_space();
    let text = String::from_utf8_lossy(self.line.remaining()).into_owned();
    self.line.pos = self.line.bytes.len();
    text
  }

  /// Consumes a literal `(EARLIER)` qualifier if present, reporting whether it was there.
  pub fn peek_earlier(&mut self) -> anyhow::Result<bool> {
    self.skip_space();
    if self.line.remaining().starts_with(b"(EARLIER)") {
      self.line.pos += "(EARLIER)".len();
      Ok(true)
    } else {
      Ok(false)
    }
  }

  /// Whether the next non-space byte opens a `[...]` response-code bracket.
  pub fn peek_bracket(&mut self) -> anyhow::Result<bool> {
    self.skip_space();
    Ok(self.line.remaining().first() == Some(&b'['))
  }

  /// Consumes a `[...]` bracket (assuming [`Tokenizer::peek_bracket`] just returned `true`)
  /// and returns its interior bytes, unparsed.
  pub fn take_bracketed(&mut self) -> anyhow::Result<Vec<u8>> {
    self.skip_space();
    let remaining = self.line.remaining();
    anyhow::ensure!(remaining.first() == Some(&b'['), "expected '['");
    let close = memchr::memchr(b']', remaining).context("unterminated response code")?;
    let inner = remaining[1..close].to_vec();
    self.line.pos += close + 1;
    self.skip_space();
    Ok(inner)
  }
}

/// Parses a standalone, self-contained run of atoms with no literal support — used for
/// `[response code]` interiors, which are always fully present on one line.
pub fn parse_all(bytes: &[u8]) -> anyhow::Result<Vec<Atom>> {
  let mut line = Line {
    bytes: bytes.to_vec(),
    pos: 0,
  };
  let mut atoms = Vec::new();
  loop {
    while line.remaining().first() == Some(&b' ') {
      line.pos += 1;
    }
    if line.at_end() {
      return Ok(atoms);
    }
    atoms.push(parse_one(&mut line)?);
  }
}

fn parse_one(line: &mut Line) -> anyhow::Result<Atom> {
  let mut stack: Vec<Vec<Atom>> = Vec::new();
  loop {
    while line.remaining().first() == Some(&b' ') {
      line.pos += 1;
    }
    anyhow::ensure!(!line.at_end(), "unexpected end of response code");
    let atom = match line.remaining()[0] {
      b'(' => {
        line.pos += 1;
        stack.push(Vec::new());
        continue;
      }
      b')' => {
        line.pos += 1;
        Atom::List(stack.pop().context("unmatched )")?)
      }
      b'{' => anyhow::bail!("literals are not supported inside a response code"),
      b'"' => parse_quoted(line)?,
      _ => parse_bare(line)?,
    };
    match stack.last_mut() {
      Some(parent) => parent.push(atom),
      None => return Ok(atom),
    }
  }
}

fn parse_quoted(line: &mut Line) -> anyhow::Result<Atom> {
  line.pos += 1;
  let mut out = Vec::new();
  loop {
    match line.remaining().first() {
      None => anyhow::bail!("unterminated quoted string"),
      Some(b'"') => {
        line.pos += 1;
        break;
      }
      Some(b'\\') => {
        let escaped = *line.remaining().get(1).context("dangling escape")?;
        out.push(escaped);
        line.pos += 2;
      }
      Some(&byte) => {
        out.push(byte);
        line.pos += 1;
      }
    }
  }
  Ok(Atom::Str(out))
}

fn parse_bare(line: &mut Line) -> anyhow::Result<Atom> {
  let remaining = line.remaining();
  let end = remaining
    .iter()
    .position(|&byte| atom_special(byte))
    .unwrap_or(remaining.len());
  anyhow::ensure!(end > 0, "expected an atom");
  let word = &remaining[..end];
  line.pos += end;
  if word.eq_ignore_ascii_case(b"NIL") {
    Ok(Atom::Null)
  } else {
    Ok(Atom::Str(word.to_vec()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stream::tests::Mock;

  fn tokenize(line: &[u8]) -> Vec<Atom> {
    let mut stream = Stream::new(Mock::new(line));
    let mut tokenizer = Tokenizer::read_line(&mut stream, None).unwrap();
    let mut atoms = Vec::new();
    while let Some(atom) = tokenizer.next_atom().unwrap() {
      atoms.push(atom);
    }
    atoms
  }

  #[test]
  fn plain_atoms() {
    assert_eq!(
      vec![Atom::Str(b"LIST".to_vec()), Atom::Str(b"INBOX".to_vec())],
      tokenize(b"LIST INBOX\r\n")
    );
  }

  #[test]
  fn nil_and_quoted() {
    assert_eq!(
      vec![Atom::Null, Atom::Str(b"he said \"hi\"".to_vec())],
      tokenize(b"NIL \"he said \\\"hi\\\"\"\r\n")
    );
  }

  #[test]
  fn nested_list() {
    assert_eq!(
      vec![Atom::List(vec![
        Atom::Str(b"\\Seen".to_vec()),
        Atom::List(vec![Atom::Str(b"a".to_vec()), Atom::Str(b"b".to_vec())]),
      ])],
      tokenize(b"(\\Seen (a b))\r\n")
    );
  }

  #[test]
  fn literal_reads_exact_bytes_then_resumes() {
    let mut stream = Stream::new(Mock::new(b"{5}\r\nhello REST\r\n"));
    let mut tokenizer = Tokenizer::read_line(&mut stream, None).unwrap();
    let atom = tokenizer.next_atom().unwrap().unwrap();
    assert_eq!(Atom::Literal(LiteralData::Owned(b"hello".to_vec())), atom);
    let rest = tokenizer.next_atom().unwrap().unwrap();
    assert_eq!(Atom::Str(b"REST".to_vec()), rest);
  }

  #[test]
  fn literal_with_embedded_crlf_is_exact() {
    let mut stream = Stream::new(Mock::new(b"{6}\r\nab\r\ncd REST\r\n"));
    let mut tokenizer = Tokenizer::read_line(&mut stream, None).unwrap();
    let atom = tokenizer.next_atom().unwrap().unwrap();
    assert_eq!(
      Atom::Literal(LiteralData::Owned(b"ab\r\ncd".to_vec())),
      atom
    );
  }

  #[test]
  fn literal_to_sink_is_sunk() {
    let mut stream = Stream::new(Mock::new(b"{5}\r\nhello\r\n"));
    let mut sink: Vec<u8> = Vec::new();
    let mut tokenizer = Tokenizer::read_line(&mut stream, Some(&mut sink)).unwrap();
    let atom = tokenizer.next_atom().unwrap().unwrap();
    assert_eq!(Atom::Literal(LiteralData::Sunk), atom);
    assert_eq!(b"hello".to_vec(), sink);
  }

  #[test]
  fn rest_as_numbers_splits_search_results() {
    let mut stream = Stream::new(Mock::new(b"\r\n"));
    let mut tokenizer = Tokenizer::read_line(&mut stream, None).unwrap();
    tokenizer.next_atom().unwrap(); // consumes nothing on an empty line
    let mut stream = Stream::new(Mock::new(b"2 3 10\r\n"));
    let mut tokenizer = Tokenizer::read_line(&mut stream, None).unwrap();
    assert_eq!(vec![2, 3, 10], tokenizer.rest_as_numbers().unwrap());
  }
}
