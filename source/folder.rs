//! Folder-name rewriter (component F): applies a server-imposed root-folder prefix to
//! user-supplied mailbox names, and offers the modified UTF-7 codec IMAP uses on the wire
//! for non-ASCII mailbox names (RFC 3501 §5.1.3).

use regex::bytes::Regex;

fn escape_literal(pattern: &str) -> String {
  regex::escape(pattern)
}

fn build_matchers(root: &str, separator: char, alt_root: Option<&str>, case_insensitive: bool) -> (Regex, Regex) {
  let flag = if case_insensitive { "(?i)" } else { "" };
  let sep = regex::escape(&separator.to_string());
  let root_pat = escape_literal(root);

  // M1: matches when the name is already "inside" the namespace (the root itself, anything
  // under the root, or anything under the alt-root) and should pass through unrewritten.
  let mut m1 = format!("^{flag}(?:{root_pat}(?:{sep}.*)?)?$");
  if root.is_empty() {
    m1 = format!("^{flag}.*$");
  }
  let m1 = match alt_root {
    Some(alt) if !alt.is_empty() => {
      let alt_pat = escape_literal(alt);
      format!("^{flag}(?:{root_pat}(?:{sep}.*)?|{alt_pat}(?:{sep}.*)?)$")
    }
    _ => m1,
  };

  // M2: matches a "root+sep"-prefixed name, used to strip that prefix back off of LIST
  // results before exposing them to the caller.
  let m2 = format!("^{flag}{root_pat}{sep}");

  (
    Regex::new(&m1).expect("matcher M1 is built from escaped literals"),
    Regex::new(&m2).expect("matcher M2 is built from escaped literals"),
  )
}

/// Holds the configured namespace shape and the two precomputed matchers derived from it.
pub struct Rewriter {
  root: String,
  separator: char,
  alt_root: Option<String>,
  case_insensitive: bool,
  m1: Regex,
  m2: Regex,
}

impl Rewriter {
  pub fn new(root: &str, separator: char, alt_root: Option<&str>, case_insensitive: bool) -> Self {
    let (m1, m2) = build_matchers(root, separator, alt_root, case_insensitive);
    Self {
      root: root.to_string(),
      separator,
      alt_root: alt_root.map(str::to_string),
      case_insensitive,
      m1,
      m2,
    }
  }

  /// Called when a LIST response reports a hierarchy separator that doesn't match the
  /// configured one; regenerates the matchers for the new separator.
  pub fn reconfigure_separator(&mut self, separator: char) {
    if separator == self.separator {
      return;
    }
    self.separator = separator;
    let (m1, m2) = build_matchers(&self.root, separator, self.alt_root.as_deref(), self.case_insensitive);
    self.m1 = m1;
    self.m2 = m2;
  }

  fn is_wildcarded(name: &str) -> bool {
    name.contains('%') || name.contains('*')
  }

  /// Prefixes a user-supplied folder name with `root+separator` unless it already names
  /// something inside the configured namespace, is a wildcard pattern, or the root is
  /// empty. Idempotent: `rewrite(rewrite(name)) == rewrite(name)`.
  pub fn rewrite(&self, name: &str) -> String {
    if self.root.is_empty() || Self::is_wildcarded(name) || self.m1.is_match(name.as_bytes()) {
      return name.to_string();
    }
    format!("{}{}{}", self.root, self.separator, name)
  }

  /// Strips a leading `root+separator` off a name returned by LIST/LSUB, for display back
  /// to the caller.
  pub fn strip_prefix<'a>(&self, name: &'a str) -> &'a str {
    match self.m2.find(name.as_bytes()) {
      Some(m) => &name[m.end()..],
      None => name,
    }
  }

  pub fn separator(&self) -> char {
    self.separator
  }
}

/// Decodes a modified UTF-7 mailbox name (RFC 3501 §5.1.3) into Unicode. `None` on malformed
/// input (a `&` shift with no matching `-`, or Base64 that doesn't resolve to valid UTF-16).
pub fn utf7_to_utf8(input: &[u8]) -> Option<String> {
  let engine = base64::engine::GeneralPurpose::new(
    &base64::alphabet::IMAP_MUTF7,
    base64::engine::general_purpose::NO_PAD,
  );
  use base64::Engine as _;
  let mut buffer = Vec::new();
  let mut output = String::new();
  let mut i = 0;
  while i < input.len() {
    match input[i] {
      b'&' => {
        let start = i;
        loop {
          i += 1;
          if i == input.len() {
            return None;
          }
          if input[i] == b'-' {
            break;
          }
        }
        if start + 1 == i {
          output.push('&');
        } else {
          buffer.clear();
          engine.decode_vec(&input[start + 1..i], &mut buffer).ok()?;
          let mut decoder = encoding_rs::UTF_16BE.new_decoder_without_bom_handling();
          let (result, _) = decoder.decode_to_string_without_replacement(&buffer, &mut output, true);
          match result {
            encoding_rs::DecoderResult::InputEmpty => (),
            _ => return None,
          }
        }
      }
      c @ 0x20..=0x25 | c @ 0x27..=0x7e => output.push(c as char),
      _ => return None,
    }
    i += 1;
  }
  Some(output)
}

/// Encodes Unicode text into modified UTF-7 for the wire. Runs of non-ASCII (or `&`) are
/// shifted into Base64-encoded UTF-16BE; everything else passes through unchanged.
pub fn utf8_to_utf7(input: &str) -> String {
  use base64::Engine as _;
  let engine = base64::engine::GeneralPurpose::new(
    &base64::alphabet::IMAP_MUTF7,
    base64::engine::general_purpose::NO_PAD,
  );
  let mut output = Vec::new();
  let mut pending: Vec<u16> = Vec::new();

  fn flush(pending: &mut Vec<u16>, output: &mut Vec<u8>, engine: &base64::engine::GeneralPurpose) {
    if pending.is_empty() {
      return;
    }
    output.push(b'&');
    let mut utf16be = Vec::with_capacity(pending.len() * 2);
    for unit in pending.drain(..) {
      utf16be.extend_from_slice(&unit.to_be_bytes());
    }
    output.extend(engine.encode(&utf16be).into_bytes());
    output.push(b'-');
  }

  for c in input.chars() {
    if c == '&' {
      flush(&mut pending, &mut output, &engine);
      output.extend_from_slice(b"&-");
    } else if (0x20..=0x7e).contains(&(c as u32)) {
      flush(&mut pending, &mut output, &engine);
      output.push(c as u8);
    } else {
      let mut units = [0u16; 2];
      pending.extend_from_slice(c.encode_utf16(&mut units));
    }
  }
  flush(&mut pending, &mut output, &engine);
  String::from_utf8(output).expect("output is composed of ASCII and valid base64 only")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn utf7_round_trip() {
    assert_eq!("", utf7_to_utf8(b"").unwrap());
    assert_eq!("&", utf7_to_utf8(b"&-").unwrap());
    assert_eq!(
      "~peter/mail/台北/日本語",
      utf7_to_utf8(b"~peter/mail/&U,BTFw-/&ZeVnLIqe-").unwrap()
    );
    assert_eq!(None, utf7_to_utf8(b"&Jjo!"));
    assert_eq!("☺!", utf7_to_utf8(b"&Jjo-!").unwrap());

    let original = "~peter/mail/台北/日本語";
    assert_eq!(original, utf7_to_utf8(utf8_to_utf7(original).as_bytes()).unwrap());
    assert_eq!("&-", utf8_to_utf7("&"));
  }

  #[test]
  fn rewrite_respects_namespace_and_wildcards() {
    let rewriter = Rewriter::new("INBOX", '.', Some("user"), true);
    assert_eq!("INBOX", rewriter.rewrite("INBOX"));
    assert_eq!("INBOX.Sent", rewriter.rewrite("Sent"));
    assert_eq!("inbox.Drafts", rewriter.rewrite("inbox.Drafts"));
    assert_eq!("user.alice", rewriter.rewrite("user.alice"));
    assert_eq!("*", rewriter.rewrite("*"));
    assert_eq!(rewriter.rewrite("Sent"), rewriter.rewrite(&rewriter.rewrite("Sent")));
  }

  #[test]
  fn rewrite_with_empty_root_is_passthrough() {
    let rewriter = Rewriter::new("", '.', None, false);
    assert_eq!("Anything", rewriter.rewrite("Anything"));
  }

  #[test]
  fn strip_prefix_removes_root_and_separator() {
    let rewriter = Rewriter::new("INBOX", '.', None, false);
    assert_eq!("Sent", rewriter.strip_prefix("INBOX.Sent"));
    assert_eq!("INBOX", rewriter.strip_prefix("INBOX"));
  }
}
