//! # Cadence Channels
//! Mailbox collaborators: SMTP sending (lettre) and an IMAP change feed
//! (async-imap) whose headers are parsed with mail-parser.

pub mod email;
pub mod headers;
pub mod imap;

pub use email::SmtpMailer;
pub use headers::parse_headers;
pub use imap::ImapHistoryFeed;
