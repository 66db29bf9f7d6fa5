//! Mailbox change-feed traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{FeedError, Result};
use crate::types::{FeedPage, Mailbox, MailboxWatchCursor};

/// Incremental change feed of a connected mailbox.
#[async_trait]
pub trait HistoryFeed: Send + Sync {
    fn name(&self) -> &str;

    /// All messages added since `cursor`. `None` means "start from now".
    ///
    /// If a read fails partway, the implementation returns the messages read so
    /// far with `new_cursor` positioned after the last of them.
    async fn changes(
        &self,
        mailbox: &Mailbox,
        cursor: Option<&str>,
    ) -> std::result::Result<FeedPage, FeedError>;

    /// Full resynchronization from the most recent known state, used after
    /// [`FeedError::CursorExpired`]. Returns the recent window of messages and
    /// a fresh cursor.
    async fn resync(&self, mailbox: &Mailbox) -> std::result::Result<FeedPage, FeedError>;
}

/// Renews push/watch subscriptions before they expire.
#[async_trait]
pub trait WatchRenewer: Send + Sync {
    /// Returns the new expiry instant.
    async fn renew(&self, cursor: &MailboxWatchCursor) -> Result<DateTime<Utc>>;
}
