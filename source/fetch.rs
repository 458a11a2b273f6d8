//! FETCH reshaper (component G): turns the raw parsed atom list inside a FETCH response into
//! friendly records — ENVELOPE and BODYSTRUCTURE get recursive reshaping, BODY[section]
//! literals get their header block parsed out, everything else passes through as an atom.

use crate::atom::Atom;
use crate::header::HeaderDecoder;
use std::collections::HashMap;

/// A reshaped FETCH value. Closed sum rather than a fully dynamic bag: callers pattern-match
/// on the variant they expect for a given key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  Text(String),
  Number(u64),
  List(Vec<Value>),
  Map(HashMap<String, Value>),
  /// A key this reshaper doesn't give special treatment to, carried through unparsed.
  Raw(Atom),
}

impl Value {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Text(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
    match self {
      Value::Map(m) => Some(m),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[Value]> {
    match self {
      Value::List(l) => Some(l),
      _ => None,
    }
  }
}

pub type Record = HashMap<String, Value>;

/// Parse-mode flags gating the expensive reshapes (§6: defaults ParseEnvelope/ParseBodystructure
/// on, IncludeRawAddresses/DecodeHeaderWords off).
#[derive(Debug, Clone, Copy)]
pub struct Options {
  pub parse_envelope: bool,
  pub parse_bodystructure: bool,
  pub include_raw_addresses: bool,
  pub decode_header_words: bool,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      parse_envelope: true,
      parse_bodystructure: true,
      include_raw_addresses: false,
      decode_header_words: false,
    }
  }
}

fn atom_text(atom: &Atom) -> Value {
  match atom {
    Atom::Null => Value::Null,
    _ => atom
      .as_bytes()
      .map(|b| Value::Text(String::from_utf8_lossy(b).into_owned()))
      .unwrap_or(Value::Null),
  }
}

fn decode_field(text: String, decoder: &dyn HeaderDecoder, opts: &Options) -> Value {
  if opts.decode_header_words && crate::header::looks_encoded(text.as_bytes()) {
    Value::Text(decoder.decode(text.as_bytes()))
  } else {
    Value::Text(text)
  }
}

fn reshape_address(atom: &Atom) -> Option<HashMap<String, Value>> {
  let parts = atom.as_list()?;
  let mut map = HashMap::new();
  map.insert("display-name".to_string(), parts.get(0).map(atom_text).unwrap_or(Value::Null));
  map.insert("source-route".to_string(), parts.get(1).map(atom_text).unwrap_or(Value::Null));
  map.insert("mailbox-name".to_string(), parts.get(2).map(atom_text).unwrap_or(Value::Null));
  map.insert("host-name".to_string(), parts.get(3).map(atom_text).unwrap_or(Value::Null));
  Some(map)
}

fn reshape_address_list(atom: Option<&Atom>) -> Vec<HashMap<String, Value>> {
  match atom.and_then(Atom::as_list) {
    Some(addresses) => addresses.iter().filter_map(reshape_address).collect(),
    None => Vec::new(),
  }
}

fn format_address(address: &HashMap<String, Value>) -> String {
  let mailbox = address.get("mailbox-name").and_then(Value::as_str).unwrap_or("");
  let host = address.get("host-name").and_then(Value::as_str).unwrap_or("");
  let display = address.get("display-name").and_then(Value::as_str);
  match display {
    Some(name) if !name.is_empty() => format!("\"{name}\" <{mailbox}@{host}>"),
    _ => format!("{mailbox}@{host}"),
  }
}

fn format_address_list(addresses: &[HashMap<String, Value>]) -> String {
  addresses.iter().map(format_address).collect::<Vec<_>>().join(", ")
}

/// Reshapes a 10-element ENVELOPE list into a record keyed by field name, per §4.G.
fn reshape_envelope(atom: &Atom, decoder: &dyn HeaderDecoder, opts: &Options) -> Value {
  let Some(fields) = atom.as_list() else {
    return Value::Null;
  };
  let mut record = HashMap::new();

  let text_field = |index: usize| -> Option<String> {
    fields.get(index).and_then(|a| match a {
      Atom::Null => None,
      _ => a.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()),
    })
  };

  record.insert(
    "date".to_string(),
    text_field(0).map(Value::Text).unwrap_or(Value::Null),
  );
  record.insert(
    "subject".to_string(),
    match text_field(1) {
      Some(text) => decode_field(text, decoder, opts),
      None => Value::Null,
    },
  );

  const ADDRESS_FIELDS: [(&str, usize); 6] =
    [("from", 2), ("sender", 3), ("reply-to", 4), ("to", 5), ("cc", 6), ("bcc", 7)];
  for (name, index) in ADDRESS_FIELDS {
    let addresses = reshape_address_list(fields.get(index));
    record.insert(name.to_string(), Value::Text(format_address_list(&addresses)));
    if opts.include_raw_addresses {
      record.insert(
        format!("{name}-raw"),
        Value::List(addresses.into_iter().map(Value::Map).collect()),
      );
    }
  }

  record.insert(
    "in-reply-to".to_string(),
    text_field(8).map(Value::Text).unwrap_or(Value::Null),
  );
  record.insert(
    "message-id".to_string(),
    text_field(9).map(Value::Text).unwrap_or(Value::Null),
  );

  Value::Map(record)
}

fn params_map(atom: Option<&Atom>) -> HashMap<String, Value> {
  let mut map = HashMap::new();
  let Some(list) = atom.and_then(Atom::as_list) else {
    return map;
  };
  let mut it = list.iter();
  while let (Some(key), Some(value)) = (it.next(), it.next()) {
    if let Some(key) = key.as_bytes() {
      map.insert(String::from_utf8_lossy(key).to_lowercase(), atom_text(value));
    }
  }
  map
}

fn disposition_of(atom: Option<&Atom>) -> Value {
  match atom.and_then(Atom::as_list) {
    Some(parts) if !parts.is_empty() => {
      let token = parts[0]
        .as_bytes()
        .map(|b| String::from_utf8_lossy(b).to_lowercase())
        .unwrap_or_default();
      let params = params_map(parts.get(1));
      let mut outer = HashMap::new();
      outer.insert(token, Value::Map(params));
      Value::Map(outer)
    }
    _ => Value::Null,
  }
}

enum Frame<'a> {
  Expand { atom: &'a Atom, partnum: String },
  BuildMultipart { partnum: String, fields: &'a [Atom], child_count: usize },
  BuildMessage { partnum: String, fields: &'a [Atom] },
}

/// Recursively reshapes a BODYSTRUCTURE atom tree, per §4.G. Uses an explicit work stack
/// (mirroring the tokenizer's own list-nesting stack, §4.B) instead of native recursion so a
/// maliciously deep nesting of `message/rfc822` parts can't blow the call stack.
fn reshape_bodystructure(root: &Atom, decoder: &dyn HeaderDecoder, opts: &Options) -> Value {
  let mut stack = vec![Frame::Expand { atom: root, partnum: String::new() }];
  let mut built: Vec<Value> = Vec::new();

  while let Some(frame) = stack.pop() {
    match frame {
      Frame::Expand { atom, partnum } => {
        let Some(fields) = atom.as_list() else {
          built.push(Value::Null);
          continue;
        };
        let is_multipart = matches!(fields.first(), Some(Atom::List(_)));
        if is_multipart {
          let mut count = 0;
          while count < fields.len() && matches!(fields[count], Atom::List(_)) {
            count += 1;
          }
          stack.push(Frame::BuildMultipart {
            partnum: partnum.clone(),
            fields,
            child_count: count,
          });
          for index in (0..count).rev() {
            let child_partnum = if partnum.is_empty() {
              (index + 1).to_string()
            } else {
              format!("{partnum}.{}", index + 1)
            };
            stack.push(Frame::Expand { atom: &fields[index], partnum: child_partnum });
          }
          continue;
        }

        let kind = fields.first().and_then(Atom::as_bytes).map(|b| String::from_utf8_lossy(b).to_lowercase());
        let subtype = fields.get(1).and_then(Atom::as_bytes).map(|b| String::from_utf8_lossy(b).to_lowercase());
        if kind.as_deref() == Some("message") && subtype.as_deref() == Some("rfc822") {
          stack.push(Frame::BuildMessage { partnum: partnum.clone(), fields });
          // ENVELOPE, BODYSTRUCTURE, LINES sit at indices 7/8/9; the embedded bodystructure
          // is the sole conceptual child and always occupies "<partnum>.1".
          let child_partnum = format!("{partnum}.1");
          let nested = fields.get(8);
          match nested {
            Some(nested) => stack.push(Frame::Expand { atom: nested, partnum: child_partnum }),
            None => built.push(Value::Null),
          }
          continue;
        }

        built.push(build_leaf(fields, &partnum, decoder, opts));
      }
      Frame::BuildMultipart { partnum, fields, child_count } => {
        let children: Vec<Value> = built.split_off(built.len() - child_count);
        built.push(build_multipart(fields, child_count, children, &partnum));
      }
      Frame::BuildMessage { partnum, fields } => {
        let nested_bodystructure = built.pop().unwrap_or(Value::Null);
        built.push(build_message(fields, nested_bodystructure, &partnum, decoder, opts));
      }
    }
  }
  built.pop().unwrap_or(Value::Null)
}

fn build_multipart(fields: &[Atom], child_count: usize, children: Vec<Value>, partnum: &str) -> Value {
  let subtype = fields
    .get(child_count)
    .and_then(Atom::as_bytes)
    .map(|b| String::from_utf8_lossy(b).to_lowercase())
    .unwrap_or_default();
  let params = params_map(fields.get(child_count + 1));
  let disposition = disposition_of(fields.get(child_count + 2));
  let language = fields.get(child_count + 3).map(atom_text).unwrap_or(Value::Null);

  let mut record = HashMap::new();
  record.insert("type".to_string(), Value::Text("multipart".to_string()));
  record.insert("subtype".to_string(), Value::Text(subtype.clone()));
  record.insert("parameters".to_string(), Value::Map(params));
  record.insert("disposition".to_string(), disposition);
  record.insert("language".to_string(), language);
  record.insert("subparts".to_string(), Value::List(children));
  record.insert("imap-partnum".to_string(), Value::Text(partnum.to_string()));
  record.insert("mime-txttype".to_string(), Value::Text(format!("multipart/{subtype}")));
  Value::Map(record)
}

fn build_leaf(fields: &[Atom], partnum: &str, decoder: &dyn HeaderDecoder, opts: &Options) -> Value {
  let kind = fields
    .first()
    .and_then(Atom::as_bytes)
    .map(|b| String::from_utf8_lossy(b).to_lowercase())
    .unwrap_or_default();
  let subtype = fields
    .get(1)
    .and_then(Atom::as_bytes)
    .map(|b| String::from_utf8_lossy(b).to_lowercase())
    .unwrap_or_default();

  let mut record = HashMap::new();
  record.insert("type".to_string(), Value::Text(kind.clone()));
  record.insert("subtype".to_string(), Value::Text(subtype.clone()));
  record.insert("parameters".to_string(), Value::Map(params_map(fields.get(2))));
  record.insert("content-id".to_string(), fields.get(3).map(atom_text).unwrap_or(Value::Null));
  record.insert(
    "content-description".to_string(),
    fields.get(4).map(|a| match a {
      Atom::Null => Value::Null,
      _ => a
        .as_bytes()
        .map(|b| decode_field(String::from_utf8_lossy(b).into_owned(), decoder, opts))
        .unwrap_or(Value::Null),
    }).unwrap_or(Value::Null),
  );
  record.insert(
    "content-transfer-encoding".to_string(),
    fields.get(5).map(atom_text).unwrap_or(Value::Null),
  );
  record.insert(
    "size".to_string(),
    fields
      .get(6)
      .and_then(Atom::as_bytes)
      .and_then(|b| std::str::from_utf8(b).ok())
      .and_then(|s| s.parse().ok())
      .map(Value::Number)
      .unwrap_or(Value::Null),
  );

  let mut rest_start = 7;
  if kind == "text" {
    if let Some(lines) = fields.get(7).and_then(Atom::as_bytes).and_then(|b| std::str::from_utf8(b).ok()).and_then(|s| s.parse::<u64>().ok()) {
      record.insert("lines".to_string(), Value::Number(lines));
      rest_start = 8;
    }
  }

  record.insert("content-md5".to_string(), fields.get(rest_start).map(atom_text).unwrap_or(Value::Null));
  record.insert("disposition".to_string(), disposition_of(fields.get(rest_start + 1)));
  record.insert("language".to_string(), fields.get(rest_start + 2).map(atom_text).unwrap_or(Value::Null));
  record.insert("imap-partnum".to_string(), Value::Text(partnum.to_string()));
  record.insert("mime-txttype".to_string(), Value::Text(format!("{kind}/{subtype}")));
  Value::Map(record)
}

/// Like [`build_leaf`] but for a `message/rfc822` leaf, whose grammar inserts an
/// `(envelope, bodystructure, lines)` triple between `Size` and the `Content-MD5` tail
/// (indices 7/8/9), which `build_leaf`'s generic tail offset doesn't account for.
fn build_message(fields: &[Atom], nested_bodystructure: Value, partnum: &str, decoder: &dyn HeaderDecoder, opts: &Options) -> Value {
  let kind = fields.first().and_then(Atom::as_bytes).map(|b| String::from_utf8_lossy(b).to_lowercase()).unwrap_or_default();
  let subtype = fields.get(1).and_then(Atom::as_bytes).map(|b| String::from_utf8_lossy(b).to_lowercase()).unwrap_or_default();

  let mut record = HashMap::new();
  record.insert("type".to_string(), Value::Text(kind.clone()));
  record.insert("subtype".to_string(), Value::Text(subtype.clone()));
  record.insert("parameters".to_string(), Value::Map(params_map(fields.get(2))));
  record.insert("content-id".to_string(), fields.get(3).map(atom_text).unwrap_or(Value::Null));
  record.insert(
    "content-description".to_string(),
    fields
      .get(4)
      .and_then(Atom::as_bytes)
      .map(|b| decode_field(String::from_utf8_lossy(b).into_owned(), decoder, opts))
      .unwrap_or(Value::Null),
  );
  record.insert("content-transfer-encoding".to_string(), fields.get(5).map(atom_text).unwrap_or(Value::Null));
  record.insert(
    "size".to_string(),
    fields
      .get(6)
      .and_then(Atom::as_bytes)
      .and_then(|b| std::str::from_utf8(b).ok())
      .and_then(|s| s.parse().ok())
      .map(Value::Number)
      .unwrap_or(Value::Null),
  );

  let envelope = fields.get(7).map(|a| reshape_envelope(a, decoder, opts)).unwrap_or(Value::Null);
  record.insert("envelope".to_string(), envelope);
  record.insert("bodystructure".to_string(), nested_bodystructure);
  record.insert(
    "lines".to_string(),
    fields
      .get(9)
      .and_then(Atom::as_bytes)
      .and_then(|b| std::str::from_utf8(b).ok())
      .and_then(|s| s.parse().ok())
      .map(Value::Number)
      .unwrap_or(Value::Null),
  );

  record.insert("content-md5".to_string(), fields.get(10).map(atom_text).unwrap_or(Value::Null));
  record.insert("disposition".to_string(), disposition_of(fields.get(11)));
  record.insert("language".to_string(), fields.get(12).map(atom_text).unwrap_or(Value::Null));
  record.insert("imap-partnum".to_string(), Value::Text(partnum.to_string()));
  record.insert("mime-txttype".to_string(), Value::Text(format!("{kind}/{subtype}")));
  Value::Map(record)
}

/// Splits a lowercased `body[section]`/`body.peek[section]<partial>` FETCH key into its
/// bracketed section spec (uppercased, as the server sent it).
fn section_spec(key: &str) -> Option<&str> {
  let open = key.find('[')?;
  let close = key.rfind(']')?;
  if close <= open {
    return None;
  }
  Some(&key[open + 1..close])
}

/// Parses a `HEADER`/`HEADER.FIELDS (...)` literal payload into a map from lowercase header
/// name to its ordered field-body values, folding continuation lines (leading WSP) into the
/// value they continue.
fn parse_headers(raw: &[u8]) -> HashMap<String, Vec<String>> {
  let text = String::from_utf8_lossy(raw);
  let mut headers: HashMap<String, Vec<String>> = HashMap::new();
  let mut last_key: Option<String> = None;
  for line in text.split("\r\n") {
    if line.is_empty() {
      continue;
    }
    if (line.starts_with(' ') || line.starts_with('\t')) && last_key.is_some() {
      if let Some(key) = &last_key {
        if let Some(values) = headers.get_mut(key) {
          if let Some(last) = values.last_mut() {
            last.push_str("\r\n");
            last.push_str(line);
          }
        }
      }
      continue;
    }
    if let Some((name, value)) = line.split_once(':') {
      let key = name.trim().to_lowercase();
      headers.entry(key.clone()).or_default().push(value.trim_start().to_string());
      last_key = Some(key);
    }
  }
  headers
}

/// Reshapes the raw `{key: atom}` FETCH item map into a friendly record, per §4.G.
pub fn reshape(items: HashMap<String, Atom>, decoder: &dyn HeaderDecoder, opts: &Options) -> Record {
  let mut record = Record::new();
  for (key, atom) in items {
    if key == "envelope" && opts.parse_envelope {
      record.insert(key, reshape_envelope(&atom, decoder, opts));
      continue;
    }
    if key == "bodystructure" && opts.parse_bodystructure {
      record.insert(key, reshape_bodystructure(&atom, decoder, opts));
      continue;
    }
    if key.starts_with("body[") || key.starts_with("body.peek[") {
      let spec = section_spec(&key).unwrap_or("").to_uppercase();
      let text_value = atom.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned());
      if spec == "HEADER" || spec.starts_with("HEADER.FIELDS") {
        if let Some(bytes) = atom.as_bytes() {
          let headers = parse_headers(bytes);
          record.insert(
            "headers".to_string(),
            Value::Map(
              headers
                .into_iter()
                .map(|(k, v)| (k, Value::List(v.into_iter().map(Value::Text).collect())))
                .collect(),
            ),
          );
        }
      }
      record.insert("body".to_string(), text_value.map(Value::Text).unwrap_or(Value::Null));
      continue;
    }
    record.insert(key, Value::Raw(atom));
  }
  record
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::header::Passthrough;
  use pretty_assertions::assert_eq;

  fn parse(source: &str) -> Atom {
    let bytes = format!("{source}\r\n").into_bytes();
    let mut stream = crate::stream::Stream::new(crate::stream::tests::Mock::new(&bytes));
    let mut tokenizer = crate::atom::Tokenizer::read_line(&mut stream, None).unwrap();
    tokenizer.next_atom().unwrap().unwrap()
  }

  #[test]
  fn envelope_reshape_formats_addresses() {
    let atom = parse(
      r#"("date" "subj" (("J" NIL "j" "x.com")) (("J" NIL "j" "x.com")) (("J" NIL "j" "x.com")) (("B" NIL "b" "y.com")) NIL NIL NIL NIL)"#,
    );
    let value = reshape_envelope(&atom, &Passthrough, &Options::default());
    let record = value.as_map().unwrap();
    assert_eq!(Some("\"J\" <j@x.com>"), record.get("from").and_then(Value::as_str));
    assert_eq!(Some(""), record.get("cc").and_then(Value::as_str));
    assert_eq!(Some(&Value::Null), record.get("in-reply-to"));
    assert_eq!(Some(&Value::Null), record.get("message-id"));
  }

  #[test]
  fn bodystructure_leaf_gets_partnum_and_txttype() {
    let atom = parse(r#"("TEXT" "PLAIN" ("CHARSET" "utf-8") NIL NIL "7BIT" 100 2 NIL NIL NIL)"#);
    let value = reshape_bodystructure(&atom, &Passthrough, &Options::default());
    let record = value.as_map().unwrap();
    assert_eq!(Some(""), record.get("imap-partnum").and_then(Value::as_str));
    assert_eq!(Some("text/plain"), record.get("mime-txttype").and_then(Value::as_str));
    assert_eq!(Some(&Value::Number(2)), record.get("lines"));
  }

  #[test]
  fn bodystructure_multipart_numbers_children() {
    let atom = parse(
      r#"((("TEXT" "PLAIN" NIL NIL NIL "7BIT" 10 1 NIL NIL NIL) ("TEXT" "HTML" NIL NIL NIL "7BIT" 20 2 NIL NIL NIL) "ALTERNATIVE" NIL NIL NIL))"#,
    );
    let value = reshape_bodystructure(&atom, &Passthrough, &Options::default());
    let record = value.as_map().unwrap();
    assert_eq!(Some("multipart/alternative"), record.get("mime-txttype").and_then(Value::as_str));
    let subparts = record.get("subparts").and_then(Value::as_list).unwrap();
    assert_eq!(2, subparts.len());
    assert_eq!(
      Some("1"),
      subparts[0].as_map().unwrap().get("imap-partnum").and_then(Value::as_str)
    );
    assert_eq!(
      Some("2"),
      subparts[1].as_map().unwrap().get("imap-partnum").and_then(Value::as_str)
    );
  }

  #[test]
  fn body_section_header_fields_are_parsed() {
    let mut items = HashMap::new();
    items.insert(
      "body[header.fields (to from)]".to_string(),
      Atom::Str(b"To: a@b.com\r\nFrom: c@d.com\r\n".to_vec()),
    );
    let record = reshape(items, &Passthrough, &Options::default());
    let headers = record.get("headers").unwrap().as_map().unwrap();
    assert_eq!(Some("a@b.com"), headers.get("to").unwrap().as_list().unwrap()[0].as_str());
  }
}
