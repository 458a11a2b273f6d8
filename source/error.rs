use std::io;

/// Status word on a tagged completion or a `NO`/`BAD` response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
  No,
  Bad,
}

impl std::fmt::Display for Status {
  fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
    match self {
      Status::No => write!(formatter, "NO"),
      Status::Bad => write!(formatter, "BAD"),
    }
  }
}

/// The public error taxonomy. Every fallible operation on [`crate::Session`] returns
/// `Result<T, Error>`; nothing upstream of the façade leaks an `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("timed out waiting for the server")]
  Timeout,
  #[error("disconnected from the server")]
  Disconnected,
  #[error("I/O error: {0}")]
  Io(#[source] io::Error),
  #[error("couldn't parse the server's response: {0}")]
  Parse(String),
  #[error("{status} [{code}] {text}", code = code.as_deref().unwrap_or(""))]
  Negative {
    status: Status,
    code: Option<String>,
    text: String,
  },
  #[error("invalid in the current state: {0}")]
  InvalidState(String),
  #[error("invalid argument: {0}")]
  InvalidArgument(String),
}

impl Error {
  /// Whether the session that produced this error should be discarded rather than reused.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      Error::Timeout | Error::Disconnected | Error::Io(_) | Error::Parse(_)
    )
  }
}

impl From<io::Error> for Error {
  fn from(error: io::Error) -> Self {
    match error.kind() {
      io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
      io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
        Error::Disconnected
      }
      _ => Error::Io(error),
    }
  }
}

/// Converts an internal `anyhow::Error` (used for `.context()` chaining while parsing and
/// serializing) into the public taxonomy at the façade boundary. Anything that isn't already
/// one of our own variants is folded into [`Error::Parse`]: internal plumbing only ever
/// produces parse-shaped failures once I/O has been ruled out, since I/O failures are
/// constructed directly from [`io::Error`] and never wrapped in `anyhow` first.
pub(crate) fn from_anyhow(error: anyhow::Error) -> Error {
  match error.downcast::<Error>() {
    Ok(error) => error,
    Err(error) => match error.downcast::<io::Error>() {
      Ok(error) => error.into(),
      Err(error) => Error::Parse(format!("{error:#}")),
    },
  }
}

pub type Result<T> = std::result::Result<T, Error>;
