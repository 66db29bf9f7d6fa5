//! MailboxHistorySync — turns a mailbox change feed into bounce/reply events.
//!
//! Two halves:
//! - [`classify`] is pure: headers + labels → [`MessageKind`].
//! - [`MailboxHistorySync::sync`] fetches, dedupes, correlates each message
//!   to a sequence contact and hands it to the state machine.
//!
//! The cursor is only persisted after the page is processed. A failed fetch
//! leaves it untouched; a failed message is skipped.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::SyncConfig;
use cadence_core::error::{CadenceError, FeedError, Result};
use cadence_core::traits::{HistoryFeed, WatchRenewer};
use cadence_core::types::{EmailEvent, EmailEventType, FeedMessage, FeedPage, Mailbox, MailboxWatchCursor};
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::persistence::CadenceDb;
use crate::sequence::SequenceStateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Bounce,
    /// Inbound message carrying reply headers; correlation decides if it is ours.
    Reply,
    Other,
}

const DAEMON_SENDERS: &[&str] = &["mailer-daemon", "postmaster", "mail-daemon"];

/// Strip angle brackets and whitespace from a Message-ID.
pub fn normalize_message_id(raw: &str) -> String {
    raw.trim().trim_start_matches('<').trim_end_matches('>').trim().to_string()
}

/// `Name <addr@host>` → `addr@host`, lowercased.
pub fn bare_address(raw: &str) -> String {
    let addr = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => &raw[start + 1..end],
        _ => raw,
    };
    addr.trim().trim_matches('"').to_lowercase()
}

fn is_bounce(msg: &FeedMessage) -> bool {
    let from = bare_address(&msg.from);
    let local = from.split('@').next().unwrap_or_default();
    if DAEMON_SENDERS.iter().any(|d| local.contains(d)) {
        return true;
    }
    let report = msg.content_type.as_deref() == Some("multipart/report")
        && msg
            .report_type
            .as_deref()
            .is_some_and(|t| t.to_lowercase().contains("delivery-status"));
    report || !msg.failed_recipients.is_empty()
}

fn is_inbound(msg: &FeedMessage, mailbox_email: &str) -> bool {
    let outbound_label = msg
        .labels
        .iter()
        .any(|l| l.eq_ignore_ascii_case("SENT") || l.eq_ignore_ascii_case("DRAFT"));
    !outbound_label && bare_address(&msg.from) != bare_address(mailbox_email)
}

fn is_auto_reply(msg: &FeedMessage) -> bool {
    msg.auto_submitted
        .as_deref()
        .is_some_and(|v| !v.trim().eq_ignore_ascii_case("no"))
}

/// Classify one message seen in `mailbox_email`'s feed.
pub fn classify(msg: &FeedMessage, mailbox_email: &str) -> MessageKind {
    if is_bounce(msg) {
        return MessageKind::Bounce;
    }
    let threaded = !msg.in_reply_to.is_empty() || !msg.references.is_empty() || msg.thread_id.is_some();
    if is_inbound(msg, mailbox_email) && threaded && !is_auto_reply(msg) {
        MessageKind::Reply
    } else {
        MessageKind::Other
    }
}

/// Where a message lands: (sequence, contact, step).
type Target = (String, String, u32);

pub struct MailboxHistorySync {
    db: Arc<CadenceDb>,
    machine: Arc<SequenceStateMachine>,
    feed: Arc<dyn HistoryFeed>,
    renewer: Option<Arc<dyn WatchRenewer>>,
    config: SyncConfig,
}

impl MailboxHistorySync {
    pub fn new(
        machine: Arc<SequenceStateMachine>,
        feed: Arc<dyn HistoryFeed>,
        renewer: Option<Arc<dyn WatchRenewer>>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db: machine.db().clone(),
            machine,
            feed,
            renewer,
            config,
        }
    }

    /// Pull changes since the stored cursor and ingest them. Returns the
    /// events newly recorded by this run.
    pub async fn sync(&self, mailbox_id: &str) -> Result<Vec<EmailEvent>> {
        let mailbox = self
            .db
            .mailbox(mailbox_id)?
            .ok_or_else(|| CadenceError::NotFound(format!("mailbox '{mailbox_id}'")))?;
        let now = Utc::now();
        let mut cursor = self.db.cursor(mailbox_id)?.unwrap_or_else(|| MailboxWatchCursor {
            mailbox_id: mailbox_id.to_string(),
            history_id: None,
            watch_expires_at: None,
            account_ref: mailbox.email.clone(),
            last_full_sync_at: None,
            updated_at: now,
        });

        let page = match self.feed.changes(&mailbox, cursor.history_id.as_deref()).await {
            Ok(page) => page,
            Err(FeedError::CursorExpired) => {
                tracing::warn!(
                    "🕳️ History cursor for {mailbox_id} expired at {:?}; resyncing, earlier changes are lost",
                    cursor.history_id
                );
                let page = self
                    .feed
                    .resync(&mailbox)
                    .await
                    .map_err(|e| CadenceError::Feed(e.to_string()))?;
                cursor.last_full_sync_at = Some(now);
                page
            }
            Err(FeedError::Fetch(e)) => return Err(CadenceError::Feed(e)),
        };

        let FeedPage { messages, new_cursor } = page;
        let mut events = Vec::new();
        let mut skipped = 0usize;
        for msg in &messages {
            if self.db.is_message_processed(mailbox_id, &msg.id)? {
                continue;
            }
            match self.ingest(&mailbox, msg, now) {
                Ok(recorded) => {
                    self.db.mark_message_processed(mailbox_id, &msg.id)?;
                    events.extend(recorded);
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!("⚠️ Skipping message {} in {mailbox_id}: {e}", msg.id);
                }
            }
        }

        cursor.history_id = Some(new_cursor);
        cursor.updated_at = now;
        self.db.save_cursor(&cursor)?;

        if !events.is_empty() || skipped > 0 {
            tracing::info!(
                "📬 {mailbox_id}: {} messages, {} events, {skipped} skipped",
                messages.len(),
                events.len()
            );
        }
        Ok(events)
    }

    /// Classify, correlate and apply one message. Returns the events newly
    /// recorded; a bounce can stop the same address in several sequences.
    fn ingest(&self, mailbox: &Mailbox, msg: &FeedMessage, now: DateTime<Utc>) -> Result<Vec<EmailEvent>> {
        let kind = classify(msg, &mailbox.email);
        let event_type = match kind {
            MessageKind::Bounce => EmailEventType::Bounced,
            MessageKind::Reply => EmailEventType::Replied,
            MessageKind::Other => return Ok(Vec::new()),
        };
        let targets = self.correlate(mailbox, msg, kind)?;
        if targets.is_empty() {
            tracing::debug!("📭 {} {:?} does not match any sequence contact", msg.id, kind);
        }
        let message_id = msg
            .message_id
            .as_deref()
            .map(normalize_message_id)
            .unwrap_or_else(|| msg.id.clone());

        let mut recorded = Vec::new();
        for (sequence_id, contact_id, step_index) in targets {
            let event = EmailEvent {
                event_type,
                timestamp: now,
                sequence_id,
                contact_id,
                step_index,
                message_id: Some(message_id.clone()),
                thread_id: msg.thread_id.clone(),
            };
            let new = match kind {
                MessageKind::Bounce => self.machine.on_bounce(&event, now)?,
                _ => self.machine.on_reply(&event, now)?,
            };
            if new {
                recorded.push(event);
            }
        }
        Ok(recorded)
    }

    /// Find the sequence contacts a message refers to.
    ///
    /// Order: our sent Message-IDs in In-Reply-To/References, then (bounces
    /// only) failed recipients, then the provider thread. A failed recipient
    /// matches every enrolment of that address still in progress.
    fn correlate(&self, mailbox: &Mailbox, msg: &FeedMessage, kind: MessageKind) -> Result<Vec<Target>> {
        for id in msg.in_reply_to.iter().chain(msg.references.iter().rev()) {
            if let Some(sent) = self.db.sent_event_by_message_id(&normalize_message_id(id))? {
                return Ok(vec![(sent.sequence_id, sent.contact_id, sent.step_index)]);
            }
        }
        if kind == MessageKind::Bounce {
            let mut matched = Vec::new();
            for rcpt in &msg.failed_recipients {
                matched.extend(self.db.contacts_by_email(&mailbox.id, &bare_address(rcpt))?);
            }
            let live: Vec<Target> = matched
                .iter()
                .filter(|sc| !sc.status.is_terminal())
                .map(|sc| (sc.sequence_id.clone(), sc.contact_id.clone(), sc.current_step_index))
                .collect();
            if !live.is_empty() {
                return Ok(live);
            }
            if let Some(sc) = matched.into_iter().next() {
                return Ok(vec![(sc.sequence_id, sc.contact_id, sc.current_step_index)]);
            }
        }
        if let Some(thread) = &msg.thread_id
            && let Some(sc) = self.db.contacts_by_thread(&mailbox.id, thread)?.into_iter().next()
        {
            // A reply must come from the contact, not a colleague on the thread.
            if kind == MessageKind::Reply
                && let Some(contact) = self.db.contact(&sc.contact_id)?
                && bare_address(&contact.email) != bare_address(&msg.from)
            {
                return Ok(Vec::new());
            }
            return Ok(vec![(sc.sequence_id, sc.contact_id, sc.current_step_index)]);
        }
        Ok(Vec::new())
    }

    /// Renew watches that expire within the configured margin.
    pub async fn renew_expiring(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(renewer) = &self.renewer else {
            return Ok(0);
        };
        let margin = chrono::Duration::seconds(self.config.watch_renew_margin_secs as i64);
        let mut renewed = 0;
        for mut cursor in self.db.cursors_expiring_before(now + margin)? {
            match renewer.renew(&cursor).await {
                Ok(expires_at) => {
                    cursor.watch_expires_at = Some(expires_at);
                    cursor.updated_at = now;
                    self.db.save_cursor(&cursor)?;
                    renewed += 1;
                    tracing::debug!("🔭 Watch for {} renewed until {expires_at}", cursor.mailbox_id);
                }
                Err(e) => tracing::warn!("⚠️ Watch renewal for {} failed: {e}", cursor.mailbox_id),
            }
        }
        Ok(renewed)
    }

    /// Poll `mailbox_ids` every `interval` until shutdown.
    pub async fn run(self: Arc<Self>, mailbox_ids: Vec<String>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        tracing::info!("📬 History sync started for {} mailbox(es)", mailbox_ids.len());
        loop {
            if *shutdown.borrow() {
                break;
            }
            for id in &mailbox_ids {
                if let Err(e) = self.sync(id).await {
                    tracing::error!("❌ History sync for {id} failed: {e}");
                }
            }
            if let Err(e) = self.renew_expiring(Utc::now()).await {
                tracing::error!("❌ Watch renewal sweep failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("📬 History sync stopped");
    }
}
