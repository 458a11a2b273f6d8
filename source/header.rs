/// Decodes RFC 2047 encoded-words (`=?charset?encoding?text?=`) found in header-derived
/// fields such as ENVELOPE's subject and address display-names. Actually decoding is
/// delegated to whatever encoding library the embedding application already depends on;
/// this crate only defines the seam and ships a lossless passthrough.
pub trait HeaderDecoder: Send + Sync {
  fn decode(&self, raw: &[u8]) -> String;
}

/// Default collaborator: renders the raw bytes as (lossy) UTF-8 without touching encoded
/// words. `DecodeHeaderWords` is a no-op until a real decoder is injected.
pub struct Passthrough;

impl HeaderDecoder for Passthrough {
  fn decode(&self, raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
  }
}

/// Matches the outer shell of an RFC 2047 encoded-word, ignoring anything inside it. Useful
/// for a `HeaderDecoder` implementation deciding whether it's worth doing the heavier work,
/// and used by [`crate::fetch`] to decide whether a field is a candidate at all.
pub fn looks_encoded(raw: &[u8]) -> bool {
  memchr::memmem::find(raw, b"=?").is_some() && memchr::memmem::find(raw, b"?=").is_some()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn passthrough_is_lossy_utf8() {
    assert_eq!("hello", Passthrough.decode(b"hello"));
  }

  #[test]
  fn looks_encoded_detects_shell() {
    assert!(looks_encoded(b"=?UTF-8?B?aGVsbG8=?="));
    assert!(!looks_encoded(b"plain subject"));
  }
}
