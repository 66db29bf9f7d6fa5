//! Collaborator traits — the seams between the engine and the outside world.

pub mod alert;
pub mod history;
pub mod mailer;

pub use alert::AlertSink;
pub use history::{HistoryFeed, WatchRenewer};
pub use mailer::{CredentialRefresher, MailSender};
