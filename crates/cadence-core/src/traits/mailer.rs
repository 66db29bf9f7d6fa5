//! Mailbox provider traits.

use async_trait::async_trait;

use crate::error::{Result, SendError};
use crate::types::{Mailbox, OutgoingEmail, SentEmail};

/// Sends email through a connected mailbox.
#[async_trait]
pub trait MailSender: Send + Sync {
    fn name(&self) -> &str;

    /// Send one email. Fails with [`SendError::TokenExpired`] when the caller
    /// should refresh credentials and retry once.
    async fn send(
        &self,
        mailbox: &Mailbox,
        email: &OutgoingEmail,
    ) -> std::result::Result<SentEmail, SendError>;
}

/// Refreshes mailbox credentials after a token expiry.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, mailbox_id: &str) -> Result<()>;
}

/// Refresher for mailboxes with static credentials (SMTP passwords).
pub struct StaticCredentials;

#[async_trait]
impl CredentialRefresher for StaticCredentials {
    async fn refresh(&self, _mailbox_id: &str) -> Result<()> {
        Ok(())
    }
}
