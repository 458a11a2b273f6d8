//! Response parser (component C): drives the tokenizer to read untagged responses until the
//! tagged completion matching the outstanding command's tag arrives.

use crate::atom::{Atom, Tokenizer};
use crate::error::{Error, Status};
use crate::stream::{LiteralSink, SetReadTimeout, Stream};
use std::collections::HashMap;
use std::io;

/// A response code carried inside `OK [CODE ...]`, `NO [CODE ...]`, or a bare `* CODE ...`
/// line. Kept as a small keyed store rather than a fully-typed enum because callers only
/// ever want to look one or two of these up per command (see `Session`'s response-code
/// cache, component E).
#[derive(Debug, Clone, PartialEq)]
pub enum Code {
  PermanentFlags(Vec<String>),
  UidValidity(u64),
  UidNext(u64),
  HighestModSeq(u64),
  Modified(Vec<(u64, u64)>),
  ReadOnly,
  ReadWrite,
  /// The accompanying human-readable `text` on the same response carries the alert message.
  Alert,
  TryCreate,
  Parse,
  NewName(String),
  AppendUid { uidvalidity: u64, uid: u64 },
  CopyUid { uidvalidity: u64, source: String, dest: String },
  Capability(Vec<String>),
  Other { name: String, text: String },
}

/// One untagged response line, reshaped into a closed sum rather than left as a raw atom
/// list. Extensions this crate doesn't give a dedicated shape to (ACL, QUOTA, ANNOTATION,
/// ID, …) fall into `Other`, carrying the keyword and the remaining atoms on the line so
/// the façade can still interpret them without the parser knowing every RFC by heart.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
  Exists(u64),
  Recent(u64),
  Expunge(u64),
  Vanished { earlier: bool, uids: Vec<(u64, u64)> },
  Fetch { id: u64, items: HashMap<String, Atom> },
  Search(Vec<u64>),
  Sort(Vec<u64>),
  Thread(Vec<Atom>),
  Flags(Vec<String>),
  List { flags: Vec<String>, separator: Option<u8>, name: Vec<u8> },
  Lsub { flags: Vec<String>, separator: Option<u8>, name: Vec<u8> },
  Status { mailbox: Vec<u8>, items: HashMap<String, Atom> },
  Capability(Vec<String>),
  Enabled(Vec<String>),
  Namespace(Vec<Atom>),
  Ok(Option<Code>, String),
  No(Option<Code>, String),
  Bad(Option<Code>, String),
  Bye(String),
  Other { keyword: String, atoms: Vec<Atom> },
}

/// Outcome of reading until the tagged completion: the untagged data collected along the
/// way, plus the completion's status/code/text.
pub struct Response {
  pub untagged: Vec<Data>,
  pub status: CompletionStatus,
  pub code: Option<Code>,
  pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
  Ok,
  No,
  Bad,
}

fn as_upper(atom: &Atom) -> Option<String> {
  atom.as_str_uppercase()
}

fn atoms_to_strings(atoms: &[Atom]) -> Vec<String> {
  atoms
    .iter()
    .filter_map(|atom| atom.as_bytes())
    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    .collect()
}

fn parse_code(keyword: &str, rest: &[Atom]) -> Code {
  match keyword {
    "PERMANENTFLAGS" => Code::PermanentFlags(
      rest
        .first()
        .and_then(Atom::as_list)
        .map(atoms_to_strings)
        .unwrap_or_default(),
    ),
    "UIDVALIDITY" => Code::UidValidity(parse_u64(rest.first())),
    "UIDNEXT" => Code::UidNext(parse_u64(rest.first())),
    "HIGHESTMODSEQ" => Code::HighestModSeq(parse_u64(rest.first())),
    "MODIFIED" => Code::Modified(parse_sequence_set(rest.first())),
    "READ-ONLY" => Code::ReadOnly,
    "READ-WRITE" => Code::ReadWrite,
    "TRYCREATE" => Code::TryCreate,
    "PARSE" => Code::Parse,
    "ALERT" => Code::Alert,
    "NEWNAME" => Code::NewName(
      rest
        .first()
        .and_then(Atom::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default(),
    ),
    "APPENDUID" => Code::AppendUid {
      uidvalidity: parse_u64(rest.first()),
      uid: parse_u64(rest.get(1)),
    },
    "COPYUID" => Code::CopyUid {
      uidvalidity: parse_u64(rest.first()),
      source: rest
        .get(1)
        .and_then(Atom::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default(),
      dest: rest
        .get(2)
        .and_then(Atom::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default(),
    },
    "CAPABILITY" => Code::Capability(atoms_to_strings(rest)),
    other => Code::Other {
      name: other.to_string(),
      text: atoms_to_strings(rest).join(" "),
    },
  }
}

fn parse_u64(atom: Option<&Atom>) -> u64 {
  atom
    .and_then(Atom::as_bytes)
    .and_then(|b| std::str::from_utf8(b).ok())
    .and_then(|s| s.parse().ok())
    .unwrap_or(0)
}

/// Parses a `MODIFIED`-style sequence-set (`7,9` or `7:9,12`) out of a single unquoted atom.
fn parse_sequence_set(atom: Option<&Atom>) -> Vec<(u64, u64)> {
  let Some(bytes) = atom.and_then(Atom::as_bytes) else {
    return Vec::new();
  };
  let text = String::from_utf8_lossy(bytes);
  text
    .split(',')
    .filter_map(|item| match item.split_once(':') {
      Some((a, b)) => Some((a.parse().ok()?, b.parse().ok()?)),
      None => {
        let n = item.parse().ok()?;
        Some((n, n))
      }
    })
    .collect()
}

fn parse_uid_set_text(text: &str) -> Vec<(u64, u64)> {
  text
    .trim()
    .split(',')
    .filter(|item| !item.is_empty())
    .filter_map(|item| match item.split_once(':') {
      Some((a, b)) => Some((a.parse().ok()?, b.parse().ok()?)),
      None => {
        let n = item.parse().ok()?;
        Some((n, n))
      }
    })
    .collect()
}

/// Reads atoms from `tokenizer` until end-of-line, optionally consuming a leading `[CODE
/// ...]` bracket, and returns the trailing free text plus the parsed code (if any).
fn read_text_with_code<RW>(tokenizer: &mut Tokenizer<RW>) -> anyhow::Result<(Option<Code>, String)>
where
  RW: io::Read + io::Write + SetReadTimeout,
{
  // `[CODE ...]` is not itself atom-shaped (brackets aren't list delimiters), so it is
  // recognized positionally: if the remaining line starts with `[`, everything up to the
  // matching `]` is the code, tokenized as a nested line of its own.
  let mut code = None;
  if tokenizer.peek_bracket()? {
    let inner = tokenizer.take_bracketed()?;
    let inner_atoms = crate::atom::parse_all(&inner)?;
    if let Some((keyword, rest)) = inner_atoms.split_first() {
      if let Some(name) = as_upper(keyword) {
        code = Some(parse_code(&name, rest));
      }
    }
  }
  let text = tokenizer.rest_as_text();
  Ok((code, text))
}

fn parse_untagged<RW>(keyword_atom: Atom, tokenizer: &mut Tokenizer<RW>) -> anyhow::Result<Data>
where
  RW: io::Read + io::Write + SetReadTimeout,
{
  // Numbered responses ("* <n> EXISTS/RECENT/EXPUNGE/FETCH") have a decimal first token.
  if let Some(bytes) = keyword_atom.as_bytes() {
    if let Ok(n) = std::str::from_utf8(bytes).unwrap_or("").parse::<u64>() {
      let verb = tokenizer
        .next_atom()?
        .and_then(|a| as_upper(&a))
        .ok_or_else(|| anyhow::anyhow!("expected a verb after sequence number"))?;
      return match verb.as_str() {
        "EXISTS" => Ok(Data::Exists(n)),
        "RECENT" => Ok(Data::Recent(n)),
        "EXPUNGE" => Ok(Data::Expunge(n)),
        "FETCH" => {
          let list = tokenizer
            .next_atom()?
            .and_then(|a| match a {
              Atom::List(items) => Some(items),
              _ => None,
            })
            .ok_or_else(|| anyhow::anyhow!("expected a parenthesized FETCH item list"))?;
          let mut items = HashMap::new();
          let mut it = list.into_iter();
          while let Some(key_atom) = it.next() {
            // "BODY[section]" arrives as a single atom already (see
            // `atom::Tokenizer::read_string`'s section-spec special case), so it becomes its
            // own lowercased key directly, brackets and all.
            let key = as_upper(&key_atom).unwrap_or_default().to_lowercase();
            let value = it.next().ok_or_else(|| anyhow::anyhow!("odd-length FETCH item list"))?;
            items.insert(key, value);
          }
          Ok(Data::Fetch { id: n, items })
        }
        other => Ok(Data::Other {
          keyword: other.to_string(),
          atoms: tokenizer.rest_as_atoms()?,
        }),
      };
    }
  }

  let keyword = as_upper(&keyword_atom).unwrap_or_default();
  match keyword.as_str() {
    "SEARCH" => Ok(Data::Search(tokenizer.rest_as_numbers()?)),
    "SORT" => Ok(Data::Sort(tokenizer.rest_as_numbers()?)),
    "THREAD" => Ok(Data::Thread(tokenizer.rest_as_atoms()?)),
    "VANISHED" => {
      // uid-set ("1:10,12") is not atom-shaped (':' and ',' are plain atom characters), so
      // it is taken as raw text rather than through the general atom dispatch; the only
      // thing that is atom-shaped here is the optional "(EARLIER)" qualifier.
      let earlier = tokenizer.peek_earlier()?;
      let uids = parse_uid_set_text(&tokenizer.rest_as_text());
      Ok(Data::Vanished { earlier, uids })
    }
    "FLAGS" => {
      let list = tokenizer
        .next_atom()?
        .and_then(|a| match a {
          Atom::List(items) => Some(atoms_to_strings(&items)),
          _ => None,
        })
        .unwrap_or_default();
      Ok(Data::Flags(list))
    }
    "CAPABILITY" => Ok(Data::Capability(
      tokenizer
        .rest_as_atoms()?
        .iter()
        .filter_map(Atom::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .collect(),
    )),
    "ENABLED" => Ok(Data::Enabled(
      tokenizer
        .rest_as_atoms()?
        .iter()
        .filter_map(Atom::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .collect(),
    )),
    "NAMESPACE" => Ok(Data::Namespace(tokenizer.rest_as_atoms()?)),
    "LIST" | "LSUB" => {
      let flags = tokenizer
        .next_atom()?
        .and_then(|a| match a {
          Atom::List(items) => Some(atoms_to_strings(&items)),
          _ => None,
        })
        .unwrap_or_default();
      let separator = tokenizer.next_atom()?.and_then(|a| match a {
        Atom::Str(bytes) if bytes.len() == 1 => Some(bytes[0]),
        _ => None,
      });
      let name = tokenizer
        .next_atom()?
        .and_then(|a| a.as_bytes().map(|b| b.to_vec()))
        .unwrap_or_default();
      if keyword == "LIST" {
        Ok(Data::List { flags, separator, name })
      } else {
        Ok(Data::Lsub { flags, separator, name })
      }
    }
    "STATUS" => {
      let mailbox = tokenizer
        .next_atom()?
        .and_then(|a| a.as_bytes().map(|b| b.to_vec()))
        .unwrap_or_default();
      let list = tokenizer
        .next_atom()?
        .and_then(|a| match a {
          Atom::List(items) => Some(items),
          _ => None,
        })
        .unwrap_or_default();
      let mut items = HashMap::new();
      let mut it = list.into_iter();
      while let Some(key) = it.next() {
        let key = as_upper(&key).unwrap_or_default().to_lowercase();
        if let Some(value) = it.next() {
          items.insert(key, value);
        }
      }
      Ok(Data::Status { mailbox, items })
    }
    "BYE" => {
      let (_, text) = read_text_with_code(tokenizer)?;
      Ok(Data::Bye(text))
    }
    "OK" => {
      let (code, text) = read_text_with_code(tokenizer)?;
      Ok(Data::Ok(code, text))
    }
    "NO" => {
      let (code, text) = read_text_with_code(tokenizer)?;
      Ok(Data::No(code, text))
    }
    "BAD" => {
      let (code, text) = read_text_with_code(tokenizer)?;
      Ok(Data::Bad(code, text))
    }
    other => Ok(Data::Other {
      keyword: other.to_string(),
      atoms: tokenizer.rest_as_atoms()?,
    }),
  }
}

/// Reads untagged lines and accumulates [`Data`] until the tagged completion line matching
/// `tag` arrives, then returns everything gathered plus the completion itself. `literal_sink`
/// is offered to every literal encountered (see [`crate::atom::Tokenizer`]); `pedantic`
/// governs whether trailing garbage after a parsed line is a hard error.
pub fn read_until_tagged<RW>(
  stream: &mut Stream<RW>,
  tag: &[u8],
  mut literal_sink: Option<&mut dyn LiteralSink>,
  pedantic: bool,
) -> Result<Response, Error>
where
  RW: io::Read + io::Write + SetReadTimeout,
{
  let mut untagged = Vec::new();
  loop {
    let sink = literal_sink.as_mut().map(|s| &mut **s);
    let mut tokenizer = Tokenizer::read_line(stream, sink).map_err(crate::error::from_anyhow)?;
    let first = tokenizer
      .next_atom()
      .map_err(crate::error::from_anyhow)?
      .ok_or_else(|| Error::Parse("empty response line".into()))?;
    let is_tagged = first.as_bytes() == Some(tag);
    if is_tagged {
      let keyword = tokenizer
        .next_atom()
        .map_err(crate::error::from_anyhow)?
        .and_then(|a| as_upper(&a))
        .ok_or_else(|| Error::Parse("missing completion keyword".into()))?;
      let (code, text) = read_text_with_code(&mut tokenizer).map_err(crate::error::from_anyhow)?;
      if pedantic && !tokenizer.at_end() {
        return Err(Error::Parse("trailing bytes after tagged completion".into()));
      }
      let status = match keyword.as_str() {
        "OK" => CompletionStatus::Ok,
        "NO" => CompletionStatus::No,
        "BAD" => CompletionStatus::Bad,
        other => return Err(Error::Parse(format!("unexpected completion status {other}"))),
      };
      return Ok(Response {
        untagged,
        status,
        code,
        text,
      });
    }

    // Only "*" or a matching tag are legal starts for a response line; anything else from a
    // well-behaved server is, practically, always "*". Tolerate it the same way.
    let keyword = tokenizer
      .next_atom()
      .map_err(crate::error::from_anyhow)?
      .ok_or_else(|| Error::Parse("empty untagged response".into()))?;
    let data = parse_untagged(keyword, &mut tokenizer).map_err(crate::error::from_anyhow)?;
    if pedantic && !tokenizer.at_end() {
      return Err(Error::Parse("trailing bytes after untagged response".into()));
    }
    if let Data::Bye(ref text) = data {
      // A BYE outside of LOGOUT is fatal; callers issuing LOGOUT special-case the first
      // untagged BYE they see instead of calling this function at all for that command.
      return Err(Error::Disconnected).map_err(|e: Error| {
        log::debug!("unsolicited BYE: {text}");
        e
      });
    }
    untagged.push(data);
  }
}

impl Response {
  pub fn into_result(self) -> Result<Self, Error> {
    match self.status {
      CompletionStatus::Ok => Ok(self),
      CompletionStatus::No => Err(Error::Negative {
        status: Status::No,
        code: self.code.map(|c| format!("{c:?}")),
        text: self.text,
      }),
      CompletionStatus::Bad => Err(Error::Negative {
        status: Status::Bad,
        code: self.code.map(|c| format!("{c:?}")),
        text: self.text,
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stream::tests::Mock;
  use pretty_assertions::assert_eq;

  fn run(script: &[u8], tag: &[u8]) -> Response {
    let mut stream = Stream::new(Mock::new(script));
    read_until_tagged(&mut stream, tag, None, true).unwrap()
  }

  #[test]
  fn list_response() {
    let response = run(
      b"* LIST (\\HasNoChildren) \".\" \"INBOX.Sent\"\r\nA1 OK List completed\r\n",
      b"A1",
    );
    assert_eq!(
      vec![Data::List {
        flags: vec!["\\HasNoChildren".to_string()],
        separator: Some(b'.'),
        name: b"INBOX.Sent".to_vec(),
      }],
      response.untagged
    );
    assert_eq!(CompletionStatus::Ok, response.status);
  }

  #[test]
  fn fetch_uid_and_flags() {
    let response = run(
      b"* 1 FETCH (UID 1952 FLAGS (\\Recent \\Seen))\r\n\
* 2 FETCH (UID 1958 FLAGS (\\Recent))\r\n\
A1 OK Completed\r\n",
      b"A1",
    );
    assert_eq!(2, response.untagged.len());
    match &response.untagged[0] {
      Data::Fetch { id, items } => {
        assert_eq!(1, *id);
        assert_eq!(
          Some(&Atom::Str(b"1952".to_vec())),
          items.get("uid")
        );
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn fetch_literal_body() {
    let response = run(
      b"* 1 FETCH (RFC822.SIZE 11 BODY[TEXT] {5}\r\nHello)\r\nA1 OK\r\n",
      b"A1",
    );
    match &response.untagged[0] {
      Data::Fetch { items, .. } => {
        assert_eq!(
          Some(&Atom::Str(b"11".to_vec())),
          items.get("rfc822.size")
        );
        assert_eq!(
          Some(&Atom::Str(b"Hello".to_vec())),
          items.get("body[text]")
        );
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn negative_completion_becomes_an_error() {
    let response = run(b"A1 NO [TRYCREATE] no such mailbox\r\n", b"A1");
    let error = response.into_result().unwrap_err();
    assert!(matches!(error, Error::Negative { status: Status::No, .. }));
  }

  #[test]
  fn unsolicited_bye_is_fatal() {
    let mut stream = Stream::new(Mock::new(b"* BYE idle timeout\r\n"));
    let error = read_until_tagged(&mut stream, b"A1", None, true).unwrap_err();
    assert!(matches!(error, Error::Disconnected));
  }

  #[test]
  fn select_permanentflags_code() {
    let response = run(
      b"* OK [PERMANENTFLAGS (\\Answered \\Seen \\*)] Flags permitted.\r\nA1 OK [READ-WRITE] done\r\n",
      b"A1",
    );
    match &response.untagged[0] {
      Data::Ok(Some(Code::PermanentFlags(flags)), _) => {
        assert_eq!(vec!["\\Answered", "\\Seen", "\\*"], *flags);
      }
      other => panic!("unexpected {other:?}"),
    }
    assert_eq!(Some(Code::ReadWrite), response.code);
  }
}
