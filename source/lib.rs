// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc2086 - ACL extension
// https://www.rfc-editor.org/rfc/rfc2087 - QUOTA extension
// https://www.rfc-editor.org/rfc/rfc2342 - NAMESPACE
// https://www.rfc-editor.org/rfc/rfc2971 - ID extension
// https://www.rfc-editor.org/rfc/rfc2359 - UIDPLUS extension
// https://www.rfc-editor.org/rfc/rfc4616 - SASL PLAIN
// https://www.rfc-editor.org/rfc/rfc4731 - SORT/THREAD extensions
// https://www.rfc-editor.org/rfc/rfc6851 - MOVE extension
//
// A synchronous IMAP4rev1 client: one command outstanding at a time, driven entirely by the
// caller. This crate doesn't open sockets or negotiate TLS itself — it's handed a byte stream
// that already implements `Read + Write` plus [`stream::SetReadTimeout`], and drives the wire
// protocol over it. IDLE, SASL mechanisms beyond LOGIN/PLAIN, and connection pooling are out of
// scope; see [`Session`] for the operations surface.

#![allow(clippy::upper_case_acronyms)]

pub mod atom;
pub mod command;
pub mod error;
pub mod fetch;
pub mod folder;
pub mod header;
pub mod mime;
pub mod response;
pub mod session;
pub mod stream;
pub mod trace;

pub use error::{Error, Result};
pub use header::HeaderDecoder;
pub use session::{Auth, Config, Mailbox, MailboxStatus, Session, State};
pub use stream::SetReadTimeout;
pub use trace::TraceSink;
