//! MIME traversal helpers (component H): locate the primary text part, build a Content-ID
//! map, and resolve a dotted IMAP-Partnum back to its node, all over an already-reshaped
//! BODYSTRUCTURE tree (see [`crate::fetch`]).

use crate::fetch::Value;
use std::collections::{HashMap, VecDeque};

const TEXT_FAMILY: [&str; 5] = ["plain", "text", "enriched", "calendar", "html"];
const PLAIN_FAMILY: [&str; 4] = ["plain", "text", "enriched", "calendar"];

fn is_attachment(node: &HashMap<String, Value>) -> bool {
  let Some(disposition) = node.get("disposition").and_then(Value::as_map) else {
    return false;
  };
  if disposition.contains_key("attachment") {
    return true;
  }
  if let Some(params) = disposition.get("inline").and_then(Value::as_map) {
    return params.contains_key("filename");
  }
  false
}

fn subparts_of(node: &HashMap<String, Value>) -> Vec<&HashMap<String, Value>> {
  node
    .get("subparts")
    .and_then(Value::as_list)
    .map(|list| list.iter().filter_map(Value::as_map).collect())
    .unwrap_or_default()
}

fn is_higher_priority_multipart(subtype: &str) -> bool {
  matches!(subtype, "alternative" | "signed")
}

fn size_of(node: &HashMap<String, Value>) -> u64 {
  match node.get("size") {
    Some(Value::Number(n)) => *n,
    _ => 0,
  }
}

/// Breadth-first walk collecting the first matching leaf per text-family subtype (§4.H),
/// preferring sub-parts of `multipart/alternative` or `multipart/signed` ahead of siblings,
/// and discarding attachment-marked leaves. After the walk, at most one of the non-html
/// plain-family subtypes survives, in the order {`plain`,`text`,`enriched`,`calendar`}.
pub fn find_text_part(structure: &Value) -> HashMap<String, Value> {
  let mut found: HashMap<&'static str, &HashMap<String, Value>> = HashMap::new();
  let mut queue: VecDeque<&HashMap<String, Value>> = VecDeque::new();
  if let Some(root) = structure.as_map() {
    queue.push_back(root);
  }

  while let Some(node) = queue.pop_front() {
    let kind = node.get("type").and_then(Value::as_str).unwrap_or("");
    if kind == "multipart" {
      let subtype = node.get("subtype").and_then(Value::as_str).unwrap_or("");
      let subparts = subparts_of(node);
      if is_higher_priority_multipart(subtype) {
        for sub in subparts.into_iter().rev() {
          queue.push_front(sub);
        }
      } else {
        for sub in subparts {
          queue.push_back(sub);
        }
      }
      continue;
    }
    if kind != "text" || is_attachment(node) {
      continue;
    }
    let subtype = node.get("subtype").and_then(Value::as_str).unwrap_or("");
    // Re-resolve against the constant array so the map key borrows from `'static` rather
    // than from `node`'s shorter lifetime.
    let Some(subtype) = TEXT_FAMILY.iter().find(|&&known| known == subtype) else {
      continue;
    };
    match found.get(*subtype) {
      Some(existing) if size_of(existing) != 0 || size_of(node) == 0 => {}
      _ => {
        found.insert(*subtype, node);
      }
    }
  }

  if let Some(&winner) = PLAIN_FAMILY.iter().find(|subtype| found.contains_key(*subtype)) {
    let mut result = HashMap::new();
    if let Some(node) = found.get(winner) {
      result.insert(winner.to_string(), Value::Map((*node).clone()));
    }
    if let Some(node) = found.get("html") {
      result.insert("html".to_string(), Value::Map((*node).clone()));
    }
    return result;
  }

  found
    .into_iter()
    .map(|(subtype, node)| (subtype.to_string(), Value::Map(node.clone())))
    .collect()
}

/// Collects a map from Content-ID (angle brackets stripped) to the originating node.
pub fn build_cid_map(structure: &Value) -> HashMap<String, Value> {
  let mut map = HashMap::new();
  let mut stack = Vec::new();
  if let Some(root) = structure.as_map() {
    stack.push(root);
  }
  while let Some(node) = stack.pop() {
    if node.get("type").and_then(Value::as_str) == Some("multipart") {
      stack.extend(subparts_of(node));
      continue;
    }
    if let Some(cid) = node.get("content-id").and_then(Value::as_str) {
      let cid = cid.trim_start_matches('<').trim_end_matches('>');
      if !cid.is_empty() {
        map.insert(cid.to_string(), Value::Map(node.clone()));
      }
    }
    if node.get("type").and_then(Value::as_str) == Some("message") {
      if let Some(Value::Map(nested)) = node.get("bodystructure") {
        stack.push(nested);
      }
    }
  }
  map
}

/// Resolves a dotted IMAP-Partnum (`"1.2"`) to its node, descending through `subparts` (one
/// path component per level) and through an embedded `bodystructure` (consuming one path
/// component for its single conceptual child, as `IMAP-Partnum` construction reserves it).
pub fn get_body_part<'a>(structure: &'a Value, partnum: &str) -> Option<&'a HashMap<String, Value>> {
  descend(structure.as_map()?, partnum)
}

fn descend<'a>(node: &'a HashMap<String, Value>, partnum: &str) -> Option<&'a HashMap<String, Value>> {
  if partnum.is_empty() {
    return Some(node);
  }
  let (head, rest) = match partnum.split_once('.') {
    Some((head, rest)) => (head, Some(rest)),
    None => (partnum, None),
  };
  let index: usize = head.parse().ok()?;

  if node.get("type").and_then(Value::as_str) == Some("message") {
    let nested = node.get("bodystructure").and_then(Value::as_map)?;
    return match (index, rest) {
      (1, Some(rest)) => descend(nested, rest),
      (1, None) => Some(nested),
      _ => None,
    };
  }

  let subparts = subparts_of(node);
  let child = *subparts.get(index.checked_sub(1)?)?;
  match rest {
    Some(rest) => descend(child, rest),
    None => Some(child),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::header::Passthrough;

  fn parse_bodystructure(source: &str) -> Value {
    let bytes = format!("{source}\r\n").into_bytes();
    let mut stream = crate::stream::Stream::new(crate::stream::tests::Mock::new(&bytes));
    let mut tokenizer = crate::atom::Tokenizer::read_line(&mut stream, None).unwrap();
    let atom = tokenizer.next_atom().unwrap().unwrap();
    let mut items = std::collections::HashMap::new();
    items.insert("bodystructure".to_string(), atom);
    let record = crate::fetch::reshape(items, &Passthrough, &crate::fetch::Options::default());
    record.into_iter().next().unwrap().1
  }

  #[test]
  fn find_text_part_prefers_alternative_children() {
    let structure = parse_bodystructure(
      r#"((("TEXT" "PLAIN" NIL NIL NIL "7BIT" 10 1 NIL NIL NIL) ("TEXT" "HTML" NIL NIL NIL "7BIT" 20 2 NIL NIL NIL) "ALTERNATIVE" NIL NIL NIL))"#,
    );
    let result = find_text_part(&structure);
    assert!(result.contains_key("plain"));
    assert!(result.contains_key("html"));
  }

  #[test]
  fn get_body_part_resolves_dotted_partnum() {
    let structure = parse_bodystructure(
      r#"((("TEXT" "PLAIN" NIL NIL NIL "7BIT" 10 1 NIL NIL NIL) ("TEXT" "HTML" NIL NIL NIL "7BIT" 20 2 NIL NIL NIL) "ALTERNATIVE" NIL NIL NIL))"#,
    );
    let part = get_body_part(&structure, "1").unwrap();
    assert_eq!(Some("plain"), part.get("subtype").and_then(Value::as_str));
  }
}
