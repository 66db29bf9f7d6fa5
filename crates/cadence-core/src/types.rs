//! Domain records: sequences, steps, contact cursors, jobs, events.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CadenceError;

/// Status enums are stored as lowercase strings in SQLite.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CadenceError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(CadenceError::Database(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

// ─── Sequences ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Error,
}

string_enum!(SequenceStatus {
    Draft => "draft",
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    Error => "error",
});

/// Whether sends are constrained by a BusinessHours record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Business,
    Custom,
}

string_enum!(ScheduleType {
    Business => "business",
    Custom => "custom",
});

/// An ordered campaign of email steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: String,
    pub name: String,
    pub status: SequenceStatus,
    pub mailbox_id: Option<String>,
    pub schedule_type: ScheduleType,
    pub business_hours: Option<BusinessHours>,
    /// Test mode ignores business hours and reads every delay as minutes.
    pub test_mode: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Sequence {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: SequenceStatus::Draft,
            mailbox_id: None,
            schedule_type: ScheduleType::Custom,
            business_hours: None,
            test_mode: false,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// The calendar that governs this sequence's sends, if any.
    pub fn calendar(&self) -> Option<&BusinessHours> {
        if self.test_mode || self.schedule_type == ScheduleType::Custom {
            None
        } else {
            self.business_hours.as_ref()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

string_enum!(DelayUnit {
    Minutes => "minutes",
    Hours => "hours",
    Days => "days",
});

/// How long after the previous step a step fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    pub amount: u32,
    pub unit: DelayUnit,
}

impl Delay {
    pub const fn new(amount: u32, unit: DelayUnit) -> Self {
        Self { amount, unit }
    }

    pub const fn none() -> Self {
        Self::new(0, DelayUnit::Minutes)
    }
}

/// One timed email action within a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub sequence_id: String,
    /// Contiguous from 0 within a sequence.
    pub order_index: u32,
    pub delay: Delay,
    /// Lower is more urgent.
    pub priority: i32,
    pub subject: String,
    pub body: String,
}

/// Timezone/workday/work-hour/holiday constraint for sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub id: String,
    /// IANA name, e.g. "Europe/Berlin".
    pub timezone: String,
    /// 0 = Sunday .. 6 = Saturday.
    pub work_days: Vec<u8>,
    /// "HH:MM"
    pub start: String,
    /// "HH:MM", exclusive.
    pub end: String,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

impl BusinessHours {
    /// Mon–Fri 09:00–17:00 in the given zone.
    pub fn weekdays(id: &str, timezone: &str) -> Self {
        Self {
            id: id.to_string(),
            timezone: timezone.to_string(),
            work_days: vec![1, 2, 3, 4, 5],
            start: "09:00".into(),
            end: "17:00".into(),
            holidays: Vec::new(),
        }
    }
}

// ─── Contacts ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub company: String,
    /// Globally opted out of all outreach.
    pub unsubscribed: bool,
}

impl Contact {
    pub fn new(id: &str, email: &str) -> Self {
        Self {
            id: id.to_string(),
            email: email.to_string(),
            first_name: String::new(),
            last_name: String::new(),
            company: String::new(),
            unsubscribed: false,
        }
    }

    pub fn is_eligible(&self) -> bool {
        !self.unsubscribed && !self.email.trim().is_empty()
    }
}

/// A connected sending mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    NotStarted,
    Scheduled,
    Sent,
    Bounced,
    Replied,
    Interested,
    OptedOut,
    Completed,
    Error,
}

string_enum!(ContactStatus {
    NotStarted => "not_started",
    Scheduled => "scheduled",
    Sent => "sent",
    Bounced => "bounced",
    Replied => "replied",
    Interested => "interested",
    OptedOut => "opted_out",
    Completed => "completed",
    Error => "error",
});

impl ContactStatus {
    /// No further steps are scheduled from these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContactStatus::Bounced
                | ContactStatus::Replied
                | ContactStatus::Interested
                | ContactStatus::OptedOut
                | ContactStatus::Completed
                | ContactStatus::Error
        )
    }

    /// Terminal states that survive a sequence reset.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ContactStatus::Completed
                | ContactStatus::OptedOut
                | ContactStatus::Bounced
                | ContactStatus::Replied
                | ContactStatus::Interested
        )
    }
}

/// The progress cursor of one contact through one sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceContact {
    pub sequence_id: String,
    pub contact_id: String,
    pub current_step_index: u32,
    pub status: ContactStatus,
    /// Non-null iff status = scheduled.
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub thread_id: Option<String>,
    /// Message id of the last step sent, used for In-Reply-To on follow-ups.
    pub last_message_id: Option<String>,
    pub last_error: Option<String>,
}

// ─── Jobs ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobClass {
    SequenceStep,
    EmailSend,
}

string_enum!(JobClass {
    SequenceStep => "sequence-step",
    EmailSend => "email-send",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Stalled,
    Cancelled,
}

string_enum!(JobState {
    Waiting => "waiting",
    Delayed => "delayed",
    Active => "active",
    Completed => "completed",
    Failed => "failed",
    Stalled => "stalled",
    Cancelled => "cancelled",
});

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// A durable unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub class: JobClass,
    pub sequence_id: Option<String>,
    /// Set for jobs that advance a SequenceContact.
    pub contact_id: Option<String>,
    pub step_index: Option<u32>,
    /// RateGate resource key.
    pub mailbox_id: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub state: JobState,
    pub owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub stalled_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Job to be inserted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub class: JobClass,
    pub sequence_id: Option<String>,
    pub contact_id: Option<String>,
    pub step_index: Option<u32>,
    pub mailbox_id: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    /// Job that sends step `step_index` to a sequence contact.
    pub fn sequence_step(
        sequence_id: &str,
        contact_id: &str,
        step_index: u32,
        mailbox_id: &str,
        priority: i32,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            class: JobClass::SequenceStep,
            sequence_id: Some(sequence_id.to_string()),
            contact_id: Some(contact_id.to_string()),
            step_index: Some(step_index),
            mailbox_id: mailbox_id.to_string(),
            payload: serde_json::Value::Null,
            priority,
            run_at,
        }
    }
}

// ─── Mailbox history ────────────────────────────────────────

/// Per-mailbox position in the provider's change history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxWatchCursor {
    pub mailbox_id: String,
    pub history_id: Option<String>,
    pub watch_expires_at: Option<DateTime<Utc>>,
    /// Opaque reference to the owning account's credentials.
    pub account_ref: String,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventType {
    Sent,
    Opened,
    Clicked,
    Replied,
    Bounced,
}

string_enum!(EmailEventType {
    Sent => "sent",
    Opened => "opened",
    Clicked => "clicked",
    Replied => "replied",
    Bounced => "bounced",
});

/// Append-only delivery/engagement record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailEvent {
    pub event_type: EmailEventType,
    pub timestamp: DateTime<Utc>,
    pub sequence_id: String,
    pub contact_id: String,
    pub step_index: u32,
    /// For `sent`: the id of our message. For replies/bounces: the inbound message id.
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
}

/// Headers of one message pulled from a mailbox change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMessage {
    /// Provider-unique id, used for ingestion dedupe.
    pub id: String,
    pub thread_id: Option<String>,
    /// Provider labels/folders ("SENT", "DRAFT", "INBOX", ...).
    pub labels: Vec<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub message_id: Option<String>,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    /// "type/subtype", lowercased.
    pub content_type: Option<String>,
    /// Content type of the delivery-status report part, when multipart/report.
    pub report_type: Option<String>,
    pub failed_recipients: Vec<String>,
    pub auto_submitted: Option<String>,
}

/// One batch from a change feed.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub messages: Vec<FeedMessage>,
    /// Cursor positioned after the last message successfully read.
    pub new_cursor: String,
}

/// Outgoing email handed to a mailbox provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub body: String,
    /// Provider thread to continue, if the contact already has one.
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
}

/// Provider acknowledgement for a sent email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub message_id: String,
    pub thread_id: String,
}

// ─── Health ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
    Critical,
}

string_enum!(HealthStatus {
    Healthy => "healthy",
    Warning => "warning",
    Error => "error",
    Critical => "critical",
});
