//! Fixtures and fake collaborators shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cadence_core::config::{QueueConfig, RetryPolicy, WorkerConfig};
use cadence_core::error::{FeedError, Result, SendError};
use cadence_core::traits::{AlertSink, CredentialRefresher, HistoryFeed, MailSender, WatchRenewer};
use cadence_core::types::{
    Contact, Delay, DelayUnit, FeedPage, HealthStatus, Mailbox, MailboxWatchCursor, OutgoingEmail,
    SentEmail, Sequence, Step,
};
use chrono::{DateTime, Utc};

use crate::persistence::CadenceDb;
use crate::queue::JobStore;
use crate::sequence::SequenceStateMachine;

/// Default policies without jitter, so backoff delays are exact.
pub fn exact_policies() -> QueueConfig {
    QueueConfig {
        sequence_step: RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::sequence_step()
        },
        email_send: RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::email_send()
        },
    }
}

pub fn test_store() -> (Arc<CadenceDb>, JobStore) {
    let db = Arc::new(CadenceDb::open_in_memory().unwrap());
    let store = JobStore::new(db.clone(), exact_policies(), &WorkerConfig::default());
    (db, store)
}

pub fn machine() -> SequenceStateMachine {
    let (db, store) = test_store();
    SequenceStateMachine::new(db, Arc::new(store))
}

/// A draft custom-schedule sequence on mailbox `mb-1` (owner@acme.test).
/// Step 0 fires immediately, later steps wait two days. Each contact id gets
/// `<id>@example.com`.
pub fn seed_sequence(db: &CadenceDb, id: &str, steps: u32, contacts: &[&str]) {
    db.save_mailbox(&Mailbox {
        id: "mb-1".into(),
        email: "owner@acme.test".into(),
        display_name: Some("Owner".into()),
    })
    .unwrap();
    let mut seq = Sequence::new(id, &format!("Sequence {id}"));
    seq.mailbox_id = Some("mb-1".into());
    db.save_sequence(&seq).unwrap();
    for i in 0..steps {
        db.add_step(&Step {
            id: format!("{id}-step-{i}"),
            sequence_id: id.into(),
            order_index: i,
            delay: if i == 0 {
                Delay::none()
            } else {
                Delay::new(2, DelayUnit::Days)
            },
            priority: 5,
            subject: if i == 0 {
                "Quick question, {{first_name}}".into()
            } else {
                String::new()
            },
            body: format!("Hi {{{{first_name}}}}, note {i} for {{{{company}}}}."),
        })
        .unwrap();
    }
    for c in contacts {
        let mut contact = Contact::new(c, &format!("{c}@example.com"));
        contact.first_name = c.to_uppercase();
        contact.company = "Initech".into();
        db.save_contact(&contact).unwrap();
        db.insert_sequence_contact(id, c).unwrap();
    }
}

/// Records every email; replays scripted results first, then succeeds.
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<OutgoingEmail>>,
    pub script: Mutex<VecDeque<std::result::Result<SentEmail, SendError>>>,
    counter: AtomicUsize,
}

impl RecordingSender {
    pub fn scripted(results: Vec<std::result::Result<SentEmail, SendError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailSender for RecordingSender {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, _mailbox: &Mailbox, email: &OutgoingEmail) -> std::result::Result<SentEmail, SendError> {
        self.sent.lock().unwrap().push(email.clone());
        if let Some(result) = self.script.lock().unwrap().pop_front() {
            return result;
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(SentEmail {
            message_id: format!("msg-{n}@acme.test"),
            thread_id: email.thread_id.clone().unwrap_or_else(|| format!("thread-{n}")),
        })
    }
}

#[derive(Default)]
pub struct CountingRefresher {
    pub calls: AtomicUsize,
}

#[async_trait]
impl CredentialRefresher for CountingRefresher {
    async fn refresh(&self, _mailbox_id: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Replays scripted pages. An empty script returns an empty page at the
/// same cursor.
#[derive(Default)]
pub struct ScriptedFeed {
    pub pages: Mutex<VecDeque<std::result::Result<FeedPage, FeedError>>>,
    pub resync_page: Mutex<Option<FeedPage>>,
    pub cursors_seen: Mutex<Vec<Option<String>>>,
}

impl ScriptedFeed {
    pub fn push(&self, page: std::result::Result<FeedPage, FeedError>) {
        self.pages.lock().unwrap().push_back(page);
    }
}

#[async_trait]
impl HistoryFeed for ScriptedFeed {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn changes(&self, _mailbox: &Mailbox, cursor: Option<&str>) -> std::result::Result<FeedPage, FeedError> {
        self.cursors_seen.lock().unwrap().push(cursor.map(str::to_string));
        match self.pages.lock().unwrap().pop_front() {
            Some(page) => page,
            None => Ok(FeedPage {
                messages: Vec::new(),
                new_cursor: cursor.unwrap_or("0").to_string(),
            }),
        }
    }

    async fn resync(&self, _mailbox: &Mailbox) -> std::result::Result<FeedPage, FeedError> {
        self.resync_page
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| FeedError::Fetch("no resync page scripted".into()))
    }
}

pub struct FixedRenewer {
    pub expires_at: DateTime<Utc>,
    pub renewed: Mutex<Vec<String>>,
}

#[async_trait]
impl WatchRenewer for FixedRenewer {
    async fn renew(&self, cursor: &MailboxWatchCursor) -> Result<DateTime<Utc>> {
        self.renewed.lock().unwrap().push(cursor.mailbox_id.clone());
        Ok(self.expires_at)
    }
}

#[derive(Default)]
pub struct RecordingAlertSink {
    pub alerts: Mutex<Vec<(String, HealthStatus)>>,
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn notify(&self, sequence_id: &str, status: HealthStatus, _detail: &str) {
        self.alerts.lock().unwrap().push((sequence_id.to_string(), status));
    }
}
