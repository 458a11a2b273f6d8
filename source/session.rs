//! Session/state machine and public operations façade (components E and I): the single
//! entry point applications use. Owns the injected stream, drives one command at a time
//! through [`crate::command`]/[`crate::response`], and reshapes FETCH results via
//! [`crate::fetch`].

use crate::atom::Atom;
use crate::command::Argument;
use crate::error::{Error, Result};
use crate::fetch::{self, Record};
use crate::folder::Rewriter;
use crate::header::{HeaderDecoder, Passthrough};
use crate::response::{Code, Data, Response};
use crate::stream::{SetReadTimeout, Stream};
use crate::trace::TraceSink;
use std::collections::HashMap;
use std::io;
use zeroize::Zeroize as _;

/// See §4 data model / I4: the subset of states a session can be in, gating which verbs are
/// locally accepted. The wire parser doesn't enforce this — some servers are lenient — the
/// façade does, to fail fast without a round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
  Unconnected,
  Connected,
  Authenticated,
  Selected,
}

/// Credentials supplied at construction so [`Session::connect`] can auto-authenticate right
/// after the greeting, instead of requiring a separate call.
pub enum Auth {
  Login { user: String, password: String },
  Plain { user: String, password: String },
}

/// Construction-time configuration (§6 "Configuration at session construction").
pub struct Config {
  pub uid_mode: bool,
  pub root: String,
  pub separator: char,
  pub alt_root: Option<String>,
  pub case_insensitive: bool,
  pub expect_greeting: bool,
  pub credentials: Option<Auth>,
  pub pedantic: bool,
  pub parse: fetch::Options,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      uid_mode: true,
      root: String::new(),
      separator: '.',
      alt_root: None,
      case_insensitive: false,
      expect_greeting: true,
      credentials: None,
      pedantic: false,
      parse: fetch::Options::default(),
    }
  }
}

/// The subset of response codes worth memoizing across commands for the lifetime of the
/// current mailbox selection (§9, §4.E).
#[derive(Debug, Default, Clone)]
pub struct MailboxStatus {
  pub exists: Option<u64>,
  pub recent: Option<u64>,
  pub uidvalidity: Option<u64>,
  pub uidnext: Option<u64>,
  pub highestmodseq: Option<u64>,
  pub permanentflags: Option<Vec<String>>,
  pub read_only: bool,
}

pub struct Session<RW> {
  stream: Stream<RW>,
  state: State,
  tag: u64,
  config: Config,
  rewriter: Rewriter,
  decoder: Box<dyn HeaderDecoder>,
  capabilities: Option<Vec<String>>,
  namespace: Option<Vec<Atom>>,
  mailbox: MailboxStatus,
  last_error: Option<String>,
  on_folder_change: Option<Box<dyn FnMut(&str) + Send>>,
}

fn requires_extension(capabilities: &[String], name: &str) -> bool {
  !capabilities.iter().any(|c| c.eq_ignore_ascii_case(name))
}

/// RFC 4616 PLAIN initial response: `\0user\0password`, standard base64.
fn plain_credential(user: &str, password: &str) -> String {
  use base64::Engine as _;
  let engine = base64::engine::GeneralPurpose::new(&base64::alphabet::STANDARD, base64::engine::general_purpose::PAD);
  engine.encode(format!("\0{user}\0{password}"))
}

impl<RW> Session<RW>
where
  RW: io::Read + io::Write + SetReadTimeout,
{
  /// Wraps `rw` in a new session. With `config.expect_greeting` the caller is expected to
  /// call [`Session::connect`] before anything else; otherwise the session starts out
  /// `Authenticated` (adopting an already logged-in stream).
  pub fn new(rw: RW, config: Config) -> Self {
    let rewriter = Rewriter::new(&config.root, config.separator, config.alt_root.as_deref(), config.case_insensitive);
    let state = if config.expect_greeting { State::Unconnected } else { State::Authenticated };
    Self {
      stream: Stream::new(rw),
      state,
      tag: 0,
      config,
      rewriter,
      decoder: Box::new(Passthrough),
      capabilities: None,
      namespace: None,
      mailbox: MailboxStatus::default(),
      last_error: None,
      on_folder_change: None,
    }
  }

  pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
    self.stream.set_trace_sink(sink);
  }

  pub fn set_header_decoder(&mut self, decoder: Box<dyn HeaderDecoder>) {
    self.decoder = decoder;
  }

  pub fn set_on_folder_change(&mut self, callback: Box<dyn FnMut(&str) + Send>) {
    self.on_folder_change = Some(callback);
  }

  pub fn state(&self) -> State {
    self.state
  }

  /// Most recent error as a string, for callers preferring a polling-style API over `Result`.
  pub fn last_error(&self) -> Option<&str> {
    self.last_error.as_deref()
  }

  fn fail<T>(&mut self, error: Error) -> Result<T> {
    self.last_error = Some(error.to_string());
    if error.is_fatal() {
      self.state = State::Unconnected;
    }
    Err(error)
  }

  fn require(&mut self, minimum: State) -> Result<()> {
    let rank = |s: State| match s {
      State::Unconnected => 0,
      State::Connected => 1,
      State::Authenticated => 2,
      State::Selected => 3,
    };
    if rank(self.state) < rank(minimum) {
      return self.fail(Error::InvalidState(format!("{minimum:?} required, session is {:?}", self.state)));
    }
    Ok(())
  }

  fn next_tag(&mut self) -> Vec<u8> {
    self.tag += 1;
    format!("A{}", self.tag).into_bytes()
  }

  /// Writes one command and reads until its tagged completion, converting both wire and
  /// protocol failures into the typed [`Error`] before they leave this function — no
  /// `anyhow::Error` crosses the façade boundary (§7).
  fn command(&mut self, verb: &str, arguments: Vec<Argument>, sensitive: bool) -> Result<Response> {
    let tag = self.next_tag();
    crate::command::write(&mut self.stream, &tag, verb, arguments, sensitive).map_err(|error| {
      let error = crate::error::from_anyhow(error);
      self.last_error = Some(error.to_string());
      self.state = State::Unconnected;
      error
    })?;
    match crate::response::read_until_tagged(&mut self.stream, &tag, None, self.config.pedantic) {
      Ok(response) => Ok(response),
      Err(error) => {
        self.last_error = Some(error.to_string());
        if error.is_fatal() {
          self.state = State::Unconnected;
        }
        Err(error)
      }
    }
  }

  fn command_ok(&mut self, verb: &str, arguments: Vec<Argument>, sensitive: bool) -> Result<Response> {
    let response = self.command(verb, arguments, sensitive)?;
    response.into_result().map_err(|error| {
      self.last_error = Some(error.to_string());
      error
    })
  }

  fn rewritten(&self, folder: &str) -> String {
    self.rewriter.rewrite(folder)
  }

  fn fire_folder_change(&mut self, folder: &str) {
    if let Some(callback) = &mut self.on_folder_change {
      callback(folder);
    }
  }

  fn ensure_capability(&mut self, name: &str) -> Result<()> {
    let capabilities = self.capability()?;
    if requires_extension(&capabilities, name) {
      return self.fail(Error::InvalidState(format!("server doesn't advertise {name}")));
    }
    Ok(())
  }

  // ---- connection lifecycle --------------------------------------------------------------

  /// Consumes the server greeting (`* OK ...` or `* PREAUTH ...`) and, if credentials were
  /// supplied at construction, auto-authenticates immediately afterward. Only meaningful when
  /// `config.expect_greeting` is set; callers adopting an already-authenticated stream skip
  /// straight to issuing commands.
  pub fn connect(&mut self) -> Result<()> {
    let line = self.stream.read_line().map_err(|error| {
      let error = crate::error::from_anyhow(error);
      self.last_error = Some(error.to_string());
      self.state = State::Unconnected;
      error
    })?;
    let upper = String::from_utf8_lossy(&line).to_uppercase();
    if upper.contains("PREAUTH") {
      self.state = State::Authenticated;
    } else if upper.starts_with("* OK") {
      self.state = State::Connected;
    } else {
      return self.fail(Error::Parse(format!("unexpected greeting: {:?}", String::from_utf8_lossy(&line))));
    }
    if self.state == State::Connected {
      if let Some(auth) = self.config.credentials.take() {
        match auth {
          Auth::Login { user, password } => self.login(&user, &password)?,
          Auth::Plain { user, password } => self.authenticate_plain(&user, &password)?,
        }
      }
    }
    Ok(())
  }

  pub fn capability(&mut self) -> Result<Vec<String>> {
    if let Some(capabilities) = &self.capabilities {
      return Ok(capabilities.clone());
    }
    let response = self.command_ok("CAPABILITY", vec![], false)?;
    let capabilities = response
      .untagged
      .into_iter()
      .find_map(|data| match data {
        Data::Capability(list) => Some(list),
        _ => None,
      })
      .unwrap_or_default();
    self.capabilities = Some(capabilities.clone());
    Ok(capabilities)
  }

  /// Clears the capability/namespace memo. Required after AUTHENTICATE/STARTTLS, since the
  /// advertised capability set can legitimately change (RFC 3501 §6.2).
  pub fn invalidate_capabilities(&mut self) {
    self.capabilities = None;
    self.namespace = None;
  }

  /// Issues `STARTTLS` and invalidates the capability/namespace memo on success. The TLS
  /// handshake itself is out of scope: the caller reads the completion, performs the upgrade
  /// on the raw stream it owns, and hands a fresh `Session` back over the wrapped stream.
  pub fn starttls(&mut self) -> Result<()> {
    self.require(State::Connected)?;
    self.command_ok("STARTTLS", vec![], false)?;
    self.invalidate_capabilities();
    Ok(())
  }

  pub fn login(&mut self, user: &str, password: &str) -> Result<()> {
    self.require(State::Connected)?;
    self.command_ok(
      "LOGIN",
      vec![Argument::Quotable(user.as_bytes().to_vec()), Argument::Sensitive(password.as_bytes().to_vec())],
      true,
    )?;
    self.state = State::Authenticated;
    self.invalidate_capabilities();
    Ok(())
  }

  /// RFC 4616 SASL PLAIN over RFC 3501 AUTHENTICATE: unlike other commands, the credential
  /// isn't a command argument — it's a bare base64 line sent after the server's `+`
  /// continuation request, so this bypasses [`Self::command`] and drives the stream directly.
  pub fn authenticate_plain(&mut self, user: &str, password: &str) -> Result<()> {
    self.require(State::Connected)?;
    let tag = self.next_tag();
    let mut line = tag.clone();
    line.extend_from_slice(b" AUTHENTICATE PLAIN\r\n");
    self.stream.write_all(&line, false).map_err(|error| {
      let error = crate::error::from_anyhow(error);
      self.last_error = Some(error.to_string());
      self.state = State::Unconnected;
      error
    })?;
    let continuation = self.stream.read_line().map_err(|error| {
      let error = crate::error::from_anyhow(error);
      self.last_error = Some(error.to_string());
      self.state = State::Unconnected;
      error
    })?;
    if continuation.first() != Some(&b'+') {
      return self.fail(Error::Parse(format!(
        "server did not send a continuation request: {:?}",
        String::from_utf8_lossy(&continuation)
      )));
    }
    let mut credential = plain_credential(user, password).into_bytes();
    credential.extend_from_slice(b"\r\n");
    let write_result = self.stream.write_all(&credential, true);
    credential.zeroize();
    write_result.map_err(|error| {
      let error = crate::error::from_anyhow(error);
      self.last_error = Some(error.to_string());
      self.state = State::Unconnected;
      error
    })?;
    let response = match crate::response::read_until_tagged(&mut self.stream, &tag, None, self.config.pedantic) {
      Ok(response) => response,
      Err(error) => {
        self.last_error = Some(error.to_string());
        self.state = State::Unconnected;
        return Err(error);
      }
    };
    response.into_result().map_err(|error| {
      self.last_error = Some(error.to_string());
      error
    })?;
    self.state = State::Authenticated;
    self.invalidate_capabilities();
    Ok(())
  }

  pub fn logout(&mut self) -> Result<()> {
    let result = self.command_ok("LOGOUT", vec![], false);
    self.state = State::Unconnected;
    result.map(|_| ())
  }

  /// Consumes the session and surrenders the underlying stream. After this point the
  /// session value no longer exists, so no "use after release" state is reachable at the
  /// type level (§9). Deliberately does not go through `Drop`'s best-effort LOGOUT: a caller
  /// asking for the raw stream back wants it as-is, not logged out from under it.
  pub fn release(self) -> RW {
    // SAFETY: `mem::forget` below means `self` is never dropped, so `self.stream` is read
    // out exactly once and the rest of `self`'s fields are simply never touched again.
    let stream = unsafe { std::ptr::read(&self.stream) };
    std::mem::forget(self);
    stream.into_inner()
  }

  /// Probes the connection with a zero-timeout read (§4.E). `Ok(true)` means the connection
  /// is live; `Ok(false)` means the peer sent `BYE` or the read failed, and the session has
  /// transitioned to `Unconnected`.
  pub fn is_open(&mut self) -> Result<bool> {
    loop {
      match self.stream.poll_readable() {
        Ok(false) => return Ok(true),
        Ok(true) => {
          let line = match self.stream.read_line() {
            Ok(line) => line,
            Err(_) => {
              self.state = State::Unconnected;
              return Ok(false);
            }
          };
          if String::from_utf8_lossy(&line).to_uppercase().starts_with("* BYE") {
            self.state = State::Unconnected;
            return Ok(false);
          }
          // unsolicited alert/notification; drop it and keep polling.
        }
        Err(_) => {
          self.state = State::Unconnected;
          return Ok(false);
        }
      }
    }
  }

  // ---- mailbox selection ------------------------------------------------------------------

  fn select_or_examine(&mut self, verb: &str, folder: &str) -> Result<MailboxStatus> {
    self.require(State::Authenticated)?;
    let name = self.rewritten(folder);
    let response = self.command_ok(verb, vec![Argument::Quotable(name.into_bytes())], false)?;
    let mut mailbox = MailboxStatus { read_only: verb == "EXAMINE", ..Default::default() };
    for data in &response.untagged {
      match data {
        Data::Exists(n) => mailbox.exists = Some(*n),
        Data::Recent(n) => mailbox.recent = Some(*n),
        Data::Flags(flags) => {
          mailbox.permanentflags.get_or_insert_with(|| flags.clone());
        }
        Data::Ok(Some(Code::UidValidity(n)), _) => mailbox.uidvalidity = Some(*n),
        Data::Ok(Some(Code::UidNext(n)), _) => mailbox.uidnext = Some(*n),
        Data::Ok(Some(Code::HighestModSeq(n)), _) => mailbox.highestmodseq = Some(*n),
        Data::Ok(Some(Code::PermanentFlags(flags)), _) => mailbox.permanentflags = Some(flags.clone()),
        _ => {}
      };
    }
    if let Some(Code::ReadOnly) = response.code {
      mailbox.read_only = true;
    }
    self.state = State::Selected;
    self.mailbox = mailbox.clone();
    Ok(mailbox)
  }

  pub fn select(&mut self, folder: &str) -> Result<MailboxStatus> {
    self.select_or_examine("SELECT", folder)
  }

  pub fn examine(&mut self, folder: &str) -> Result<MailboxStatus> {
    self.select_or_examine("EXAMINE", folder)
  }

  pub fn close(&mut self) -> Result<()> {
    self.require(State::Selected)?;
    self.command_ok("CLOSE", vec![], false)?;
    self.state = State::Authenticated;
    self.mailbox = MailboxStatus::default();
    Ok(())
  }

  pub fn unselect(&mut self) -> Result<()> {
    self.require(State::Selected)?;
    self.ensure_capability("UNSELECT")?;
    self.command_ok("UNSELECT", vec![], false)?;
    self.state = State::Authenticated;
    self.mailbox = MailboxStatus::default();
    Ok(())
  }

  // ---- mailbox management ------------------------------------------------------------------

  pub fn create(&mut self, folder: &str) -> Result<()> {
    self.require(State::Authenticated)?;
    let name = self.rewritten(folder);
    self.fire_folder_change(folder);
    self.command_ok("CREATE", vec![Argument::Quotable(name.into_bytes())], false)?;
    Ok(())
  }

  pub fn delete(&mut self, folder: &str) -> Result<()> {
    self.require(State::Authenticated)?;
    let name = self.rewritten(folder);
    self.fire_folder_change(folder);
    self.command_ok("DELETE", vec![Argument::Quotable(name.into_bytes())], false)?;
    Ok(())
  }

  pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
    self.require(State::Authenticated)?;
    let (from_wire, to_wire) = (self.rewritten(from), self.rewritten(to));
    self.fire_folder_change(from);
    self.fire_folder_change(to);
    self.command_ok(
      "RENAME",
      vec![Argument::Quotable(from_wire.into_bytes()), Argument::Quotable(to_wire.into_bytes())],
      false,
    )?;
    Ok(())
  }

  pub fn subscribe(&mut self, folder: &str) -> Result<()> {
    self.require(State::Authenticated)?;
    let name = self.rewritten(folder);
    self.command_ok("SUBSCRIBE", vec![Argument::Quotable(name.into_bytes())], false).map(|_| ())
  }

  pub fn unsubscribe(&mut self, folder: &str) -> Result<()> {
    self.require(State::Authenticated)?;
    let name = self.rewritten(folder);
    self.command_ok("UNSUBSCRIBE", vec![Argument::Quotable(name.into_bytes())], false).map(|_| ())
  }

}

impl<RW> Drop for Session<RW>
where
  RW: io::Write + SetReadTimeout,
{
  /// Best-effort `LOGOUT` if the session was still authenticated when dropped. Nothing here
  /// waits for or inspects the reply, and any write failure is swallowed: a destructor has no
  /// way to report an error, and a peer that's already gone doesn't need one sent to it.
  fn drop(&mut self) {
    if matches!(self.state, State::Authenticated | State::Selected) {
      self.tag += 1;
      let line = format!("A{} LOGOUT\r\n", self.tag);
      self.stream.write_best_effort(line.as_bytes());
    }
  }
}

/// One LIST/LSUB result entry, after §4.F's root-prefix stripping.
#[derive(Debug, Clone, PartialEq)]
pub struct Mailbox {
  pub flags: Vec<String>,
  pub separator: Option<char>,
  pub name: String,
}

impl<RW> Session<RW>
where
  RW: io::Read + io::Write + SetReadTimeout,
{
  fn list_or_lsub(&mut self, verb: &str, reference: &str, pattern: &str) -> Result<Vec<Mailbox>> {
    self.require(State::Authenticated)?;
    let response = self.command_ok(
      verb,
      vec![Argument::Quotable(reference.as_bytes().to_vec()), Argument::Quotable(pattern.as_bytes().to_vec())],
      false,
    )?;
    let mut results = Vec::new();
    for data in response.untagged {
      let (flags, separator, name) = match data {
        Data::List { flags, separator, name } if verb == "LIST" => (flags, separator, name),
        Data::Lsub { flags, separator, name } if verb == "LSUB" => (flags, separator, name),
        _ => continue,
      };
      let separator = separator.map(|b| b as char);
      if let Some(separator) = separator {
        self.rewriter.reconfigure_separator(separator);
      }
      let raw_name = String::from_utf8_lossy(&name).into_owned();
      let name = crate::folder::utf7_to_utf8(raw_name.as_bytes()).unwrap_or(raw_name);
      let name = self.rewriter.strip_prefix(&name).to_string();
      results.push(Mailbox { flags, separator, name });
    }
    Ok(results)
  }

  pub fn list(&mut self, reference: &str, pattern: &str) -> Result<Vec<Mailbox>> {
    self.list_or_lsub("LIST", reference, pattern)
  }

  pub fn lsub(&mut self, reference: &str, pattern: &str) -> Result<Vec<Mailbox>> {
    self.list_or_lsub("LSUB", reference, pattern)
  }

  /// Batched STATUS: sends one command per folder back-to-back (tags T, T+1, …), then reads
  /// their tagged completions in the same order (§5). Untagged STATUS responses between
  /// tagged completions are attributed to the command whose tagged completion follows.
  pub fn status(&mut self, folders: &[&str], items: &[&str]) -> Result<HashMap<String, HashMap<String, u64>>> {
    self.require(State::Authenticated)?;
    let item_list = format!("({})", items.iter().map(|s| s.to_uppercase()).collect::<Vec<_>>().join(" "));
    let mut tags = Vec::with_capacity(folders.len());
    for folder in folders {
      let name = self.rewritten(folder);
      let tag = self.next_tag();
      let args = vec![Argument::Quotable(name.into_bytes()), Argument::Verbatim(item_list.clone().into_bytes())];
      crate::command::write(&mut self.stream, &tag, "STATUS", args, false).map_err(|error| {
        let error = crate::error::from_anyhow(error);
        self.last_error = Some(error.to_string());
        self.state = State::Unconnected;
        error
      })?;
      tags.push(tag);
    }

    let mut results = HashMap::new();
    for tag in tags {
      let response = match crate::response::read_until_tagged(&mut self.stream, &tag, None, self.config.pedantic) {
        Ok(response) => response,
        Err(error) => {
          self.last_error = Some(error.to_string());
          self.state = State::Unconnected;
          return Err(error);
        }
      };
      let response = response.into_result().map_err(|error| {
        self.last_error = Some(error.to_string());
        error
      })?;
      for data in response.untagged {
        if let Data::Status { mailbox, items } = data {
          let name = String::from_utf8_lossy(&mailbox).into_owned();
          let name = self.rewriter.strip_prefix(&name).to_string();
          let numbers = items
            .into_iter()
            .filter_map(|(key, value)| {
              let number = value.as_bytes().and_then(|b| std::str::from_utf8(b).ok())?.parse().ok()?;
              Some((key, number))
            })
            .collect();
          results.insert(name, numbers);
        }
      }
    }
    Ok(results)
  }

  // ---- message operations ------------------------------------------------------------------

  pub fn append(&mut self, folder: &str, flags: &[&str], message: &[u8]) -> Result<Option<(u64, u64)>> {
    self.require(State::Authenticated)?;
    let name = self.rewritten(folder);
    let mut arguments = vec![Argument::Quotable(name.into_bytes())];
    if !flags.is_empty() {
      arguments.push(Argument::Verbatim(format!("({})", flags.join(" ")).into_bytes()));
    }
    arguments.push(Argument::ForceLiteral(message.to_vec()));
    self.fire_folder_change(folder);
    let response = self.command_ok("APPEND", arguments, false)?;
    Ok(match response.code {
      Some(Code::AppendUid { uidvalidity, uid }) => Some((uidvalidity, uid)),
      _ => None,
    })
  }

  pub fn check(&mut self) -> Result<()> {
    self.require(State::Selected)?;
    self.command_ok("CHECK", vec![], false).map(|_| ())
  }

  pub fn noop(&mut self) -> Result<Vec<Data>> {
    let response = self.command_ok("NOOP", vec![], false)?;
    for data in &response.untagged {
      match data {
        Data::Exists(n) => self.mailbox.exists = Some(*n),
        Data::Recent(n) => self.mailbox.recent = Some(*n),
        Data::Expunge(_) => self.invalidate_exists_recent(),
        _ => {}
      }
    }
    Ok(response.untagged)
  }

  fn invalidate_exists_recent(&mut self) {
    self.mailbox.exists = None;
    self.mailbox.recent = None;
  }

  /// Plain `EXPUNGE` removes every `\Deleted` message in the selected mailbox; passing
  /// `uid_set` instead issues RFC 2359 `UID EXPUNGE <uid_set>`, a UIDPLUS extension that
  /// limits the expunge to that set (gated on the capability regardless of `uid_mode`,
  /// since it is a distinct verb rather than a UID-prefixed alias of plain EXPUNGE).
  pub fn expunge(&mut self, uid_set: Option<&str>) -> Result<Vec<u64>> {
    self.require(State::Selected)?;
    self.fire_folder_change("");
    let response = match uid_set {
      Some(uid_set) => {
        self.ensure_capability("UIDPLUS")?;
        self.command_ok("UID EXPUNGE", vec![Argument::Verbatim(uid_set.as_bytes().to_vec())], false)?
      }
      None => self.command_ok("EXPUNGE", vec![], false)?,
    };
    self.invalidate_exists_recent();
    Ok(
      response
        .untagged
        .into_iter()
        .filter_map(|data| match data {
          Data::Expunge(n) => Some(n),
          _ => None,
        })
        .collect(),
    )
  }

  fn search_like(&mut self, verb: &str, criteria: &str) -> Result<Vec<u64>> {
    self.require(State::Selected)?;
    let full_verb = if self.config.uid_mode { format!("UID {verb}") } else { verb.to_string() };
    let response = self.command_ok(&full_verb, vec![Argument::Verbatim(criteria.as_bytes().to_vec())], false)?;
    Ok(
      response
        .untagged
        .into_iter()
        .find_map(|data| match data {
          Data::Search(ids) => Some(ids),
          Data::Sort(ids) => Some(ids),
          _ => None,
        })
        .unwrap_or_default(),
    )
  }

  /// Returns message numbers or, per I5, UIDs when `config.uid_mode` is on.
  pub fn search(&mut self, criteria: &str) -> Result<Vec<u64>> {
    self.search_like("SEARCH", criteria)
  }

  pub fn sort(&mut self, sort_keys: &str, charset: &str, criteria: &str) -> Result<Vec<u64>> {
    self.ensure_capability("SORT")?;
    self.search_like("SORT", &format!("({sort_keys}) {charset} {criteria}"))
  }

  pub fn thread(&mut self, algorithm: &str, charset: &str, criteria: &str) -> Result<Vec<Atom>> {
    self.require(State::Selected)?;
    self.ensure_capability("THREAD")?;
    let verb = if self.config.uid_mode { "UID THREAD" } else { "THREAD" };
    let arguments = format!("{algorithm} {charset} {criteria}");
    let response = self.command_ok(verb, vec![Argument::Verbatim(arguments.into_bytes())], false)?;
    Ok(
      response
        .untagged
        .into_iter()
        .find_map(|data| match data {
          Data::Thread(tree) => Some(tree),
          _ => None,
        })
        .unwrap_or_default(),
    )
  }

  /// Per I5, keys the result by UID (with the inner `uid` entry removed) when
  /// `config.uid_mode` is on; otherwise keys it by message sequence number.
  pub fn fetch(&mut self, sequence_set: &str, items: &str) -> Result<HashMap<u64, Record>> {
    self.require(State::Selected)?;
    let uid = self.config.uid_mode;
    let verb = if uid { "UID FETCH" } else { "FETCH" };
    let response = self.command_ok(
      verb,
      vec![Argument::NoQuote(sequence_set.as_bytes().to_vec()), Argument::Verbatim(items.as_bytes().to_vec())],
      false,
    )?;
    let mut results = HashMap::new();
    for data in response.untagged {
      if let Data::Fetch { id, mut items } = data {
        let key = if uid {
          items
            .remove("uid")
            .and_then(|a| a.as_bytes().and_then(|b| std::str::from_utf8(b).ok()).and_then(|s| s.parse().ok()))
            .unwrap_or(id)
        } else {
          id
        };
        let record = fetch::reshape(items, self.decoder.as_ref(), &self.config.parse);
        results.insert(key, record);
      }
    }
    Ok(results)
  }

  pub fn store(&mut self, sequence_set: &str, item: &str, flags: &[&str]) -> Result<HashMap<u64, Vec<String>>> {
    self.require(State::Selected)?;
    let verb = if self.config.uid_mode { "UID STORE" } else { "STORE" };
    let value = format!("({})", flags.join(" "));
    self.fire_folder_change("");
    let response = self.command_ok(
      verb,
      vec![
        Argument::NoQuote(sequence_set.as_bytes().to_vec()),
        Argument::Verbatim(item.as_bytes().to_vec()),
        Argument::Verbatim(value.into_bytes()),
      ],
      false,
    )?;
    let mut results = HashMap::new();
    for data in response.untagged {
      if let Data::Fetch { id, items } = data {
        if let Some(flags) = items.get("flags").and_then(Atom::as_list) {
          let strings = flags.iter().filter_map(Atom::as_bytes).map(|b| String::from_utf8_lossy(b).into_owned()).collect();
          results.insert(id, strings);
        }
      }
    }
    Ok(results)
  }

  pub fn copy(&mut self, sequence_set: &str, folder: &str) -> Result<Option<(u64, String, String)>> {
    self.require(State::Selected)?;
    let verb = if self.config.uid_mode { "UID COPY" } else { "COPY" };
    let name = self.rewritten(folder);
    self.fire_folder_change(folder);
    let response = self.command_ok(
      verb,
      vec![Argument::NoQuote(sequence_set.as_bytes().to_vec()), Argument::Quotable(name.into_bytes())],
      false,
    )?;
    Ok(match response.code {
      Some(Code::CopyUid { uidvalidity, source, dest }) => Some((uidvalidity, source, dest)),
      _ => None,
    })
  }

  pub fn r#move(&mut self, sequence_set: &str, folder: &str) -> Result<()> {
    self.require(State::Selected)?;
    self.ensure_capability("MOVE")?;
    let verb = if self.config.uid_mode { "UID MOVE" } else { "MOVE" };
    let name = self.rewritten(folder);
    self.fire_folder_change(folder);
    self.command_ok(
      verb,
      vec![Argument::NoQuote(sequence_set.as_bytes().to_vec()), Argument::Quotable(name.into_bytes())],
      false,
    )?;
    Ok(())
  }

  // ---- extensions -----------------------------------------------------------------------

  pub fn namespace(&mut self) -> Result<Vec<Atom>> {
    if let Some(namespace) = &self.namespace {
      return Ok(namespace.clone());
    }
    self.ensure_capability("NAMESPACE")?;
    let response = self.command_ok("NAMESPACE", vec![], false)?;
    let namespace = response
      .untagged
      .into_iter()
      .find_map(|data| match data {
        Data::Namespace(atoms) => Some(atoms),
        _ => None,
      })
      .unwrap_or_default();
    self.namespace = Some(namespace.clone());
    Ok(namespace)
  }

  /// RFC 2971 client/server identification, returned as a string map.
  pub fn id(&mut self, fields: &[(&str, &str)]) -> Result<HashMap<String, String>> {
    self.ensure_capability("ID")?;
    let argument = if fields.is_empty() {
      "NIL".to_string()
    } else {
      let pairs: Vec<String> = fields.iter().map(|(k, v)| format!("\"{k}\" \"{v}\"")).collect();
      format!("({})", pairs.join(" "))
    };
    let response = self.command_ok("ID", vec![Argument::Verbatim(argument.into_bytes())], false)?;
    let mut result = HashMap::new();
    for data in response.untagged {
      if let Data::Other { keyword, atoms } = data {
        if keyword == "ID" {
          if let Some(Atom::List(items)) = atoms.first() {
            let mut it = items.iter();
            while let (Some(key), Some(value)) = (it.next(), it.next()) {
              if let (Some(key), Some(value)) = (key.as_bytes(), value.as_bytes()) {
                result.insert(
                  String::from_utf8_lossy(key).to_lowercase(),
                  String::from_utf8_lossy(value).into_owned(),
                );
              }
            }
          }
        }
      }
    }
    Ok(result)
  }

  pub fn getacl(&mut self, folder: &str) -> Result<HashMap<String, String>> {
    self.ensure_capability("ACL")?;
    let name = self.rewritten(folder);
    let response = self.command_ok("GETACL", vec![Argument::Quotable(name.into_bytes())], false)?;
    Ok(acl_pairs(&response))
  }

  pub fn setacl(&mut self, folder: &str, identifier: &str, rights: &str) -> Result<()> {
    self.ensure_capability("ACL")?;
    let name = self.rewritten(folder);
    self.command_ok(
      "SETACL",
      vec![
        Argument::Quotable(name.into_bytes()),
        Argument::Quotable(identifier.as_bytes().to_vec()),
        Argument::Quotable(rights.as_bytes().to_vec()),
      ],
      false,
    )
    .map(|_| ())
  }

  pub fn deleteacl(&mut self, folder: &str, identifier: &str) -> Result<()> {
    self.ensure_capability("ACL")?;
    let name = self.rewritten(folder);
    self.command_ok(
      "DELETEACL",
      vec![Argument::Quotable(name.into_bytes()), Argument::Quotable(identifier.as_bytes().to_vec())],
      false,
    )
    .map(|_| ())
  }

  pub fn listrights(&mut self, folder: &str, identifier: &str) -> Result<Vec<String>> {
    self.ensure_capability("ACL")?;
    let name = self.rewritten(folder);
    let response = self.command_ok(
      "LISTRIGHTS",
      vec![Argument::Quotable(name.into_bytes()), Argument::Quotable(identifier.as_bytes().to_vec())],
      false,
    )?;
    Ok(
      response
        .untagged
        .into_iter()
        .find_map(|data| match data {
          Data::Other { keyword, atoms } if keyword == "LISTRIGHTS" => {
            Some(atoms.iter().filter_map(Atom::as_bytes).map(|b| String::from_utf8_lossy(b).into_owned()).collect())
          }
          _ => None,
        })
        .unwrap_or_default(),
    )
  }

  pub fn myrights(&mut self, folder: &str) -> Result<String> {
    self.ensure_capability("ACL")?;
    let name = self.rewritten(folder);
    let response = self.command_ok("MYRIGHTS", vec![Argument::Quotable(name.into_bytes())], false)?;
    Ok(
      response
        .untagged
        .into_iter()
        .find_map(|data| match data {
          Data::Other { keyword, atoms } if keyword == "MYRIGHTS" => {
            atoms.last().and_then(Atom::as_bytes).map(|b| String::from_utf8_lossy(b).into_owned())
          }
          _ => None,
        })
        .unwrap_or_default(),
    )
  }

  pub fn getquota(&mut self, root: &str) -> Result<HashMap<String, (u64, u64)>> {
    self.ensure_capability("QUOTA")?;
    let response = self.command_ok("GETQUOTA", vec![Argument::Quotable(root.as_bytes().to_vec())], false)?;
    Ok(quota_resources(&response))
  }

  pub fn getquotaroot(&mut self, folder: &str) -> Result<HashMap<String, (u64, u64)>> {
    self.ensure_capability("QUOTA")?;
    let name = self.rewritten(folder);
    let response = self.command_ok("GETQUOTAROOT", vec![Argument::Quotable(name.into_bytes())], false)?;
    Ok(quota_resources(&response))
  }

  pub fn setquota(&mut self, root: &str, resource: &str, limit: u64) -> Result<()> {
    self.ensure_capability("QUOTA")?;
    self.command_ok(
      "SETQUOTA",
      vec![Argument::Quotable(root.as_bytes().to_vec()), Argument::Verbatim(format!("({resource} {limit})").into_bytes())],
      false,
    )
    .map(|_| ())
  }
}

fn acl_pairs(response: &Response) -> HashMap<String, String> {
  let mut result = HashMap::new();
  for data in &response.untagged {
    if let Data::Other { keyword, atoms } = data {
      if keyword == "ACL" {
        let mut it = atoms.iter().skip(1); // first atom is the mailbox name
        while let (Some(identifier), Some(rights)) = (it.next(), it.next()) {
          if let (Some(identifier), Some(rights)) = (identifier.as_bytes(), rights.as_bytes()) {
            result.insert(String::from_utf8_lossy(identifier).into_owned(), String::from_utf8_lossy(rights).into_owned());
          }
        }
      }
    }
  }
  result
}

fn quota_resources(response: &Response) -> HashMap<String, (u64, u64)> {
  let mut result = HashMap::new();
  for data in &response.untagged {
    if let Data::Other { keyword, atoms } = data {
      if keyword == "QUOTA" {
        if let Some(Atom::List(items)) = atoms.get(1) {
          let mut it = items.iter();
          while let (Some(resource), Some(usage), Some(limit)) = (it.next(), it.next(), it.next()) {
            let resource = resource.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
            let usage = usage.as_bytes().and_then(|b| std::str::from_utf8(b).ok()).and_then(|s| s.parse().ok()).unwrap_or(0);
            let limit = limit.as_bytes().and_then(|b| std::str::from_utf8(b).ok()).and_then(|s| s.parse().ok()).unwrap_or(0);
            result.insert(resource, (usage, limit));
          }
        }
      }
    }
  }
  result
}
