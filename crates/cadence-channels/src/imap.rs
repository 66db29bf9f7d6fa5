//! IMAP history feed — async-imap over native TLS.
//!
//! Cursor format is `"<uidvalidity>:<last uid>"`. A UIDVALIDITY change (or an
//! unparseable cursor) means UIDs were reassigned and the cursor is expired.
//! Only headers are fetched (`BODY.PEEK[HEADER]`), so nothing is marked read.

use std::collections::HashMap;

use async_trait::async_trait;
use cadence_core::config::MailboxConfig;
use cadence_core::error::FeedError;
use cadence_core::traits::HistoryFeed;
use cadence_core::types::{FeedMessage, FeedPage, Mailbox};
use futures::StreamExt;

use crate::headers::parse_headers;

type ImapSession = async_imap::Session<tokio_native_tls::TlsStream<tokio::net::TcpStream>>;

/// Outcome of one UID FETCH.
struct Fetched {
    messages: Vec<FeedMessage>,
    /// Highest UID read, parseable or not.
    max_uid: u32,
    failure: Option<String>,
}

/// Parsed `uidvalidity:uid` cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidCursor {
    pub validity: u32,
    pub last_uid: u32,
}

impl UidCursor {
    pub fn parse(raw: &str) -> Option<Self> {
        let (validity, uid) = raw.split_once(':')?;
        Some(Self {
            validity: validity.trim().parse().ok()?,
            last_uid: uid.trim().parse().ok()?,
        })
    }
}

impl std::fmt::Display for UidCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.validity, self.last_uid)
    }
}

fn fetch_err(what: &str) -> impl Fn(async_imap::error::Error) -> FeedError + '_ {
    move |e| FeedError::Fetch(format!("{what}: {e}"))
}

fn uid_of(message_id: &str) -> u32 {
    message_id
        .rsplit(':')
        .next()
        .and_then(|uid| uid.parse().ok())
        .unwrap_or_default()
}

async fn connect(account: &MailboxConfig) -> Result<ImapSession, FeedError> {
    let tcp = tokio::net::TcpStream::connect((account.imap_host.as_str(), account.imap_port))
        .await
        .map_err(|e| FeedError::Fetch(format!("TCP connect: {e}")))?;
    let connector = native_tls::TlsConnector::new()
        .map_err(|e| FeedError::Fetch(format!("TLS connector: {e}")))?;
    let tls = tokio_native_tls::TlsConnector::from(connector)
        .connect(&account.imap_host, tcp)
        .await
        .map_err(|e| FeedError::Fetch(format!("TLS handshake: {e}")))?;

    async_imap::Client::new(tls)
        .login(account.login(), &account.password)
        .await
        .map_err(|(e, _)| FeedError::Fetch(format!("IMAP login: {e}")))
}

/// Change feed over each mailbox's IMAP folder.
pub struct ImapHistoryFeed {
    accounts: HashMap<String, MailboxConfig>,
    resync_window: usize,
}

impl ImapHistoryFeed {
    pub fn new(mailboxes: &[MailboxConfig], resync_window: usize) -> Self {
        Self {
            accounts: mailboxes.iter().map(|m| (m.id.clone(), m.clone())).collect(),
            resync_window: resync_window.max(1),
        }
    }

    fn account(&self, mailbox: &Mailbox) -> Result<&MailboxConfig, FeedError> {
        self.accounts
            .get(&mailbox.id)
            .ok_or_else(|| FeedError::Fetch(format!("mailbox '{}' has no IMAP settings", mailbox.id)))
    }

    /// Fetch headers for `uid_set`, keeping UIDs above `after`. Stops at the
    /// first stream error and returns what was read. Message ids are
    /// `validity:uid` so they stay unique across UIDVALIDITY changes.
    async fn fetch_headers(
        session: &mut ImapSession,
        folder: &str,
        validity: u32,
        uid_set: &str,
        after: u32,
    ) -> Result<Fetched, FeedError> {
        let mut stream = session
            .uid_fetch(uid_set, "(UID BODY.PEEK[HEADER])")
            .await
            .map_err(fetch_err("UID FETCH"))?;
        let mut messages = Vec::new();
        let mut max_uid = after;
        let mut failure = None;
        while let Some(item) = stream.next().await {
            let fetch = match item {
                Ok(f) => f,
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            };
            let Some(uid) = fetch.uid.filter(|u| *u > after) else {
                continue;
            };
            max_uid = max_uid.max(uid);
            let Some(raw) = fetch.header() else {
                continue;
            };
            match parse_headers(raw, format!("{validity}:{uid}"), vec![folder.to_string()]) {
                Some(msg) => messages.push(msg),
                None => tracing::warn!("⚠️ Unparseable headers for UID {uid}"),
            }
        }
        drop(stream);
        messages.sort_by_key(|m| uid_of(&m.id));
        Ok(Fetched {
            messages,
            max_uid,
            failure,
        })
    }
}

#[async_trait]
impl HistoryFeed for ImapHistoryFeed {
    fn name(&self) -> &str {
        "imap"
    }

    async fn changes(&self, mailbox: &Mailbox, cursor: Option<&str>) -> Result<FeedPage, FeedError> {
        let account = self.account(mailbox)?;
        let parsed = match cursor {
            Some(raw) => Some(UidCursor::parse(raw).ok_or(FeedError::CursorExpired)?),
            None => None,
        };

        let mut session = connect(account).await?;
        let selected = session.select(&account.folder).await.map_err(fetch_err("SELECT"))?;
        let validity = selected.uid_validity.unwrap_or_default();
        let head = selected.uid_next.unwrap_or(1).saturating_sub(1);

        let Some(cur) = parsed else {
            // First contact: start from now.
            session.logout().await.ok();
            return Ok(FeedPage {
                messages: Vec::new(),
                new_cursor: UidCursor { validity, last_uid: head }.to_string(),
            });
        };
        if cur.validity != validity {
            session.logout().await.ok();
            return Err(FeedError::CursorExpired);
        }
        if head <= cur.last_uid {
            session.logout().await.ok();
            return Ok(FeedPage {
                messages: Vec::new(),
                new_cursor: cur.to_string(),
            });
        }

        let uid_set = format!("{}:*", cur.last_uid + 1);
        let Fetched {
            messages,
            max_uid,
            failure,
        } = Self::fetch_headers(&mut session, &account.folder, validity, &uid_set, cur.last_uid).await?;
        session.logout().await.ok();

        if let Some(e) = failure {
            if max_uid == cur.last_uid {
                return Err(FeedError::Fetch(e));
            }
            tracing::warn!("⚠️ IMAP fetch for {} stopped early: {e}", mailbox.id);
        }
        tracing::debug!("📧 {}: {} new header(s)", mailbox.id, messages.len());
        Ok(FeedPage {
            messages,
            new_cursor: UidCursor { validity, last_uid: max_uid }.to_string(),
        })
    }

    async fn resync(&self, mailbox: &Mailbox) -> Result<FeedPage, FeedError> {
        let account = self.account(mailbox)?;
        let mut session = connect(account).await?;
        let selected = session.select(&account.folder).await.map_err(fetch_err("SELECT"))?;
        let validity = selected.uid_validity.unwrap_or_default();
        let head = selected.uid_next.unwrap_or(1).saturating_sub(1);

        let mut uids: Vec<u32> = session
            .uid_search("ALL")
            .await
            .map_err(fetch_err("UID SEARCH"))?
            .into_iter()
            .collect();
        uids.sort_unstable();
        let recent = &uids[uids.len().saturating_sub(self.resync_window)..];

        let messages = if recent.is_empty() {
            Vec::new()
        } else {
            let uid_set = recent.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
            let fetched = Self::fetch_headers(&mut session, &account.folder, validity, &uid_set, 0).await?;
            if let Some(e) = fetched.failure {
                session.logout().await.ok();
                return Err(FeedError::Fetch(e));
            }
            fetched.messages
        };
        session.logout().await.ok();

        tracing::info!("📧 {}: resynced {} recent message(s)", mailbox.id, messages.len());
        Ok(FeedPage {
            new_cursor: UidCursor { validity, last_uid: head }.to_string(),
            messages,
        })
    }
}
