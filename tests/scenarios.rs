//! Blackbox scenarios driven entirely through the public `Session` façade over an in-memory
//! duplex stream, each one pinned to a concrete wire exchange.

use imapenta::session::{Auth, Config, Session};
use test_log::test;

mod common;
use common::Mock;

fn authenticated_session(script: &[u8], config: Config) -> Session<Mock> {
  Session::new(Mock::new(script), config)
}

#[test]
fn list_parse_strips_root_and_reports_separator() {
  let script = b"* LIST (\\HasNoChildren) \".\" \"INBOX.Sent\"\r\nA1 OK List completed\r\n";
  let config = Config { root: "INBOX".to_string(), separator: '.', expect_greeting: false, ..Default::default() };
  let mut session = authenticated_session(script, config);

  let mailboxes = session.list("", "*").unwrap();

  assert_eq!(1, mailboxes.len());
  let mailbox = &mailboxes[0];
  assert_eq!(vec!["\\HasNoChildren".to_string()], mailbox.flags);
  assert_eq!(Some('.'), mailbox.separator);
  assert_eq!("Sent", mailbox.name);
}

#[test]
fn fetch_in_uid_mode_keys_by_uid_and_drops_inner_uid() {
  let script = b"* 1 FETCH (UID 1952 FLAGS (\\Recent \\Seen))\r\n* 2 FETCH (UID 1958 FLAGS (\\Recent))\r\nA1 OK Completed\r\n";
  let config = Config { expect_greeting: false, ..Default::default() };
  let mut session = authenticated_session(script, config);

  let records = session.fetch("1:*", "(FLAGS UID)").unwrap();

  assert_eq!(2, records.len());
  let first = records.get(&1952).expect("uid 1952 present");
  assert!(first.get("uid").is_none());
  let flags = match first.get("flags") {
    Some(imapenta::fetch::Value::Raw(imapenta::atom::Atom::List(items))) => items,
    other => panic!("expected a raw atom list for flags, got {other:?}"),
  };
  let flags: Vec<_> = flags.iter().filter_map(|a| a.as_bytes()).map(String::from_utf8_lossy).collect();
  assert_eq!(vec!["\\Recent", "\\Seen"], flags);

  let second = records.get(&1958).expect("uid 1958 present");
  assert!(second.get("uid").is_none());

  let written = session.release().written;
  assert_eq!(b"A1 UID FETCH 1:* (FLAGS UID)\r\n".to_vec(), written);
}

#[test]
fn fetch_literal_in_response_is_consumed_exactly() {
  let script = b"* 1 FETCH (RFC822.SIZE 11 BODY[TEXT] {5}\r\nHello)\r\nA1 OK\r\n";
  let config = Config { expect_greeting: false, ..Default::default() };
  let mut session = authenticated_session(script, config);

  let records = session.fetch("1", "(RFC822.SIZE BODY[TEXT])").unwrap();

  let record = records.get(&1).expect("message 1 present");
  let size = match record.get("rfc822.size") {
    Some(imapenta::fetch::Value::Raw(atom)) => atom.as_bytes().map(String::from_utf8_lossy),
    other => panic!("expected a raw atom for rfc822.size, got {other:?}"),
  };
  assert_eq!(Some("11".into()), size);
  assert_eq!(Some("Hello"), record.get("body").and_then(|v| v.as_str()));
}

#[test]
fn append_drives_the_continuation_handshake() {
  let message: &[u8] = b"hello world, 17b!"; // exactly 17 bytes, to pin the literal-size framing
  let script = b"+ go ahead\r\nA1 OK [APPENDUID 1 5] Completed\r\n";
  let config = Config { expect_greeting: false, ..Default::default() };
  let mut session = authenticated_session(script, config);

  let result = session.append("INBOX", &[], message).unwrap();
  assert_eq!(Some((1, 5)), result);

  let written = session.release().written;
  assert_eq!(b"A1 APPEND INBOX {17}\r\nhello world, 17b!\r\n".to_vec(), written);
}

#[test]
fn append_without_continuation_is_a_parse_error() {
  let script = b"A1 NO try later\r\n";
  let config = Config { expect_greeting: false, ..Default::default() };
  let mut session = authenticated_session(script, config);

  let result = session.append("INBOX", &[], b"hi");
  assert!(result.is_err());
}

#[test]
fn envelope_reshape_formats_from_and_nulls_message_id() {
  let script = b"* 1 FETCH (ENVELOPE (\"date\" \"subj\" ((\"J\" NIL \"j\" \"x.com\")) ((\"J\" NIL \"j\" \"x.com\")) ((\"J\" NIL \"j\" \"x.com\")) ((\"B\" NIL \"b\" \"y.com\")) NIL NIL NIL NIL))\r\nA1 OK\r\n";
  let config = Config { expect_greeting: false, ..Default::default() };
  let mut session = authenticated_session(script, config);

  let records = session.fetch("1", "(ENVELOPE)").unwrap();
  let record = records.get(&1).unwrap();
  let envelope = record.get("envelope").and_then(|v| v.as_map()).expect("envelope map");
  assert_eq!(Some("\"J\" <j@x.com>"), envelope.get("from").and_then(|v| v.as_str()));
  assert_eq!(Some(""), envelope.get("cc").and_then(|v| v.as_str()));
  assert_eq!(Some(&imapenta::fetch::Value::Null), envelope.get("in-reply-to"));
  assert_eq!(Some(&imapenta::fetch::Value::Null), envelope.get("message-id"));
}

#[test]
fn folder_rewrite_is_applied_before_select_and_idempotent_on_already_rooted_names() {
  let script = b"A1 OK [READ-WRITE] Completed\r\nA2 OK [READ-WRITE] Completed\r\n";
  let config = Config { root: "INBOX".to_string(), separator: '.', expect_greeting: false, ..Default::default() };
  let mut session = authenticated_session(script, config);

  session.select("Sent").unwrap();
  session.select("INBOX.Sent").unwrap();

  let written = session.release().written;
  assert_eq!(b"A1 SELECT INBOX.Sent\r\nA2 SELECT INBOX.Sent\r\n".to_vec(), written);
}

#[test]
fn auto_login_fires_right_after_a_plain_greeting() {
  let script = b"* OK server ready\r\nA1 OK LOGIN completed\r\n";
  let config = Config {
    expect_greeting: true,
    credentials: Some(Auth::Login { user: "alice".to_string(), password: "hunter2".to_string() }),
    ..Default::default()
  };
  let mut session = authenticated_session(script, config);

  session.connect().unwrap();

  assert_eq!(imapenta::session::State::Authenticated, session.state());
  let written = session.release().written;
  assert_eq!(b"A1 LOGIN alice \"hunter2\"\r\n".to_vec(), written);
}

#[test]
fn auto_login_via_sasl_plain_sends_the_bare_credential_line_after_continuation() {
  let script = b"* OK server ready\r\n+ \r\nA1 OK AUTHENTICATE completed\r\n";
  let config = Config {
    expect_greeting: true,
    credentials: Some(Auth::Plain { user: "alice".to_string(), password: "hunter2".to_string() }),
    ..Default::default()
  };
  let mut session = authenticated_session(script, config);

  session.connect().unwrap();

  assert_eq!(imapenta::session::State::Authenticated, session.state());
  let written = session.release().written;
  assert_eq!(
    b"A1 AUTHENTICATE PLAIN\r\nAGFsaWNlAGh1bnRlcjI=\r\n".to_vec(),
    written
  );
}

#[test]
fn preauth_greeting_skips_auto_login() {
  let script = b"* PREAUTH server ready\r\n";
  let config = Config {
    expect_greeting: true,
    credentials: Some(Auth::Login { user: "alice".to_string(), password: "hunter2".to_string() }),
    ..Default::default()
  };
  let mut session = authenticated_session(script, config);

  session.connect().unwrap();

  assert_eq!(imapenta::session::State::Authenticated, session.state());
  assert!(session.release().written.is_empty());
}
