//! SQLite-backed persistence for sequences, contact cursors, events and cursors.
//! The job queue shares this connection (see `queue.rs`).
//!
//! Timestamps are stored as epoch milliseconds. Status transitions go through
//! compare-and-set updates (`WHERE status IN (...)`) so concurrent dispatch
//! workers cannot lose each other's writes.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{
    BusinessHours, Contact, ContactStatus, Delay, EmailEvent, EmailEventType, Mailbox,
    MailboxWatchCursor, ScheduleType, Sequence, SequenceContact, SequenceStatus, Step,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS mailboxes (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL,
        display_name TEXT
    );

    CREATE TABLE IF NOT EXISTS contacts (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL,
        first_name TEXT NOT NULL DEFAULT '',
        last_name TEXT NOT NULL DEFAULT '',
        company TEXT NOT NULL DEFAULT '',
        unsubscribed INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS business_hours (
        id TEXT PRIMARY KEY,
        timezone TEXT NOT NULL,
        work_days TEXT NOT NULL,          -- JSON array of 0..6
        start_time TEXT NOT NULL,         -- HH:MM
        end_time TEXT NOT NULL,           -- HH:MM
        holidays TEXT NOT NULL DEFAULT '[]'
    );

    CREATE TABLE IF NOT EXISTS sequences (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'draft',
        mailbox_id TEXT,
        schedule_type TEXT NOT NULL DEFAULT 'custom',
        business_hours_id TEXT,
        test_mode INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS steps (
        id TEXT PRIMARY KEY,
        sequence_id TEXT NOT NULL,
        order_index INTEGER NOT NULL,
        delay_amount INTEGER NOT NULL,
        delay_unit TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 5,
        subject TEXT NOT NULL,
        body TEXT NOT NULL,
        UNIQUE (sequence_id, order_index)
    );

    CREATE TABLE IF NOT EXISTS sequence_contacts (
        sequence_id TEXT NOT NULL,
        contact_id TEXT NOT NULL,
        current_step_index INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'not_started',
        next_scheduled_at INTEGER,
        last_processed_at INTEGER,
        thread_id TEXT,
        last_message_id TEXT,
        last_error TEXT,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (sequence_id, contact_id)
    );
    CREATE INDEX IF NOT EXISTS sequence_contacts_thread ON sequence_contacts(thread_id);

    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        class TEXT NOT NULL,              -- 'sequence-step', 'email-send'
        sequence_id TEXT,
        contact_id TEXT,
        step_index INTEGER,
        mailbox_id TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT 'null',
        priority INTEGER NOT NULL DEFAULT 5,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        run_at INTEGER NOT NULL,
        state TEXT NOT NULL,
        owner TEXT,
        lease_expires_at INTEGER,
        stalled_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    -- At most one in-flight job per SequenceContact.
    CREATE UNIQUE INDEX IF NOT EXISTS jobs_one_in_flight ON jobs(sequence_id, contact_id)
        WHERE contact_id IS NOT NULL AND state IN ('waiting', 'delayed', 'active', 'stalled');
    CREATE INDEX IF NOT EXISTS jobs_claimable ON jobs(state, run_at, priority);

    CREATE TABLE IF NOT EXISTS email_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_type TEXT NOT NULL,         -- sent, opened, clicked, replied, bounced
        sequence_id TEXT NOT NULL,
        contact_id TEXT NOT NULL,
        step_index INTEGER NOT NULL,
        message_id TEXT,
        thread_id TEXT,
        created_at INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS email_events_dedupe
        ON email_events(event_type, sequence_id, contact_id, message_id) WHERE message_id IS NOT NULL;
    CREATE INDEX IF NOT EXISTS email_events_message ON email_events(message_id);

    CREATE TABLE IF NOT EXISTS processed_messages (
        mailbox_id TEXT NOT NULL,
        message_id TEXT NOT NULL,
        processed_at INTEGER NOT NULL,
        PRIMARY KEY (mailbox_id, message_id)
    );

    CREATE TABLE IF NOT EXISTS mailbox_cursors (
        mailbox_id TEXT PRIMARY KEY,
        history_id TEXT,
        watch_expires_at INTEGER,
        account_ref TEXT NOT NULL DEFAULT '',
        last_full_sync_at INTEGER,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS delivery_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sequence_id TEXT NOT NULL,
        contact_id TEXT,
        job_id TEXT,
        kind TEXT NOT NULL,               -- 'retryable', 'fatal', 'exhausted', 'stalled'
        error TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS delivery_errors_seq ON delivery_errors(sequence_id, created_at);
";

/// SQLite store shared by every engine component.
pub struct CadenceDb {
    conn: Mutex<Connection>,
}

/// A compare-and-set update of a SequenceContact row.
#[derive(Debug, Clone)]
pub struct ContactTransition {
    pub status: ContactStatus,
    /// `None` keeps the current index.
    pub step_index: Option<u32>,
    /// Required for `Scheduled`, ignored otherwise.
    pub next_scheduled_at: Option<DateTime<Utc>>,
    /// `None` keeps the current thread.
    pub thread_id: Option<String>,
    pub last_message_id: Option<String>,
    pub last_error: Option<String>,
    /// Stamp `last_processed_at`.
    pub processed_at: Option<DateTime<Utc>>,
}

impl ContactTransition {
    pub fn to(status: ContactStatus) -> Self {
        Self {
            status,
            step_index: None,
            next_scheduled_at: None,
            thread_id: None,
            last_message_id: None,
            last_error: None,
            processed_at: None,
        }
    }

    pub fn scheduled(step_index: u32, at: DateTime<Utc>) -> Self {
        Self {
            step_index: Some(step_index),
            next_scheduled_at: Some(at),
            ..Self::to(ContactStatus::Scheduled)
        }
    }
}

impl CadenceDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        // WAL lets the history sync read while workers write.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;").ok();
        Self::with_connection(conn)
    }

    /// In-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err("Migration"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection.
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CadenceError::Database(format!("Lock: {e}")))
    }

    // ─── Mailboxes & Contacts ───────────────────────────────

    pub fn save_mailbox(&self, mailbox: &Mailbox) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO mailboxes (id, email, display_name) VALUES (?1, ?2, ?3)",
                params![mailbox.id, mailbox.email, mailbox.display_name],
            )
            .map_err(db_err("Save mailbox"))?;
        Ok(())
    }

    pub fn mailbox(&self, id: &str) -> Result<Option<Mailbox>> {
        self.conn()?
            .query_row(
                "SELECT id, email, display_name FROM mailboxes WHERE id = ?1",
                [id],
                |row| {
                    Ok(Mailbox {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        display_name: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(db_err("Load mailbox"))
    }

    pub fn save_contact(&self, contact: &Contact) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO contacts (id, email, first_name, last_name, company, unsubscribed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    contact.id,
                    contact.email,
                    contact.first_name,
                    contact.last_name,
                    contact.company,
                    contact.unsubscribed as i32,
                ],
            )
            .map_err(db_err("Save contact"))?;
        Ok(())
    }

    pub fn contact(&self, id: &str) -> Result<Option<Contact>> {
        self.conn()?
            .query_row(
                "SELECT id, email, first_name, last_name, company, unsubscribed FROM contacts WHERE id = ?1",
                [id],
                |row| {
                    Ok(Contact {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        first_name: row.get(2)?,
                        last_name: row.get(3)?,
                        company: row.get(4)?,
                        unsubscribed: row.get::<_, i32>(5)? != 0,
                    })
                },
            )
            .optional()
            .map_err(db_err("Load contact"))
    }

    /// Globally opt a contact out of all outreach.
    pub fn set_contact_unsubscribed(&self, contact_id: &str) -> Result<()> {
        self.conn()?
            .execute("UPDATE contacts SET unsubscribed = 1 WHERE id = ?1", [contact_id])
            .map_err(db_err("Unsubscribe contact"))?;
        Ok(())
    }

    // ─── Sequences & Steps ──────────────────────────────────

    /// Insert or replace a sequence (and its BusinessHours record).
    pub fn save_sequence(&self, seq: &Sequence) -> Result<()> {
        let conn = self.conn()?;
        if let Some(bh) = &seq.business_hours {
            conn.execute(
                "INSERT OR REPLACE INTO business_hours (id, timezone, work_days, start_time, end_time, holidays)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    bh.id,
                    bh.timezone,
                    serde_json::to_string(&bh.work_days)?,
                    bh.start,
                    bh.end,
                    serde_json::to_string(&bh.holidays)?,
                ],
            )
            .map_err(db_err("Save business hours"))?;
        }
        let now = to_ms(Utc::now());
        conn.execute(
            "INSERT INTO sequences
             (id, name, status, mailbox_id, schedule_type, business_hours_id, test_mode, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, status = excluded.status, mailbox_id = excluded.mailbox_id,
                schedule_type = excluded.schedule_type, business_hours_id = excluded.business_hours_id,
                test_mode = excluded.test_mode, last_error = excluded.last_error, updated_at = excluded.updated_at",
            params![
                seq.id,
                seq.name,
                seq.status.as_str(),
                seq.mailbox_id,
                seq.schedule_type.as_str(),
                seq.business_hours.as_ref().map(|b| b.id.clone()),
                seq.test_mode as i32,
                seq.last_error,
                to_ms(seq.created_at),
                now,
            ],
        )
        .map_err(db_err("Save sequence"))?;
        Ok(())
    }

    pub fn sequence(&self, id: &str) -> Result<Option<Sequence>> {
        self.conn()?
            .query_row(
                "SELECT s.id, s.name, s.status, s.mailbox_id, s.schedule_type, s.test_mode, s.last_error, s.created_at,
                        b.id, b.timezone, b.work_days, b.start_time, b.end_time, b.holidays
                 FROM sequences s LEFT JOIN business_hours b ON b.id = s.business_hours_id
                 WHERE s.id = ?1",
                [id],
                |row| {
                    let bh_id: Option<String> = row.get(8)?;
                    let business_hours = match bh_id {
                        Some(bh_id) => Some(BusinessHours {
                            id: bh_id,
                            timezone: row.get(9)?,
                            work_days: json_col(row, 10)?,
                            start: row.get(11)?,
                            end: row.get(12)?,
                            holidays: json_col(row, 13)?,
                        }),
                        None => None,
                    };
                    Ok(Sequence {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        status: parse_col(row, 2)?,
                        mailbox_id: row.get(3)?,
                        schedule_type: parse_col::<ScheduleType>(row, 4)?,
                        business_hours,
                        test_mode: row.get::<_, i32>(5)? != 0,
                        last_error: row.get(6)?,
                        created_at: from_ms(row.get(7)?),
                    })
                },
            )
            .optional()
            .map_err(db_err("Load sequence"))
    }

    /// Load a sequence or fail with NotFound.
    pub fn require_sequence(&self, id: &str) -> Result<Sequence> {
        self.sequence(id)?
            .ok_or_else(|| CadenceError::NotFound(format!("sequence '{id}'")))
    }

    /// Set a sequence's status, optionally only if it is currently in `from`.
    pub fn set_sequence_status(
        &self,
        id: &str,
        status: SequenceStatus,
        from: &[SequenceStatus],
        last_error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let now = to_ms(Utc::now());
        let changed = if from.is_empty() {
            conn.execute(
                "UPDATE sequences SET status = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, status.as_str(), last_error, now],
            )
        } else {
            let sql = format!(
                "UPDATE sequences SET status = ?2, last_error = ?3, updated_at = ?4
                 WHERE id = ?1 AND status IN ({})",
                in_list(from.iter().map(|s| s.as_str()))
            );
            conn.execute(&sql, params![id, status.as_str(), last_error, now])
        }
        .map_err(db_err("Update sequence status"))?;
        Ok(changed > 0)
    }

    /// Ids of sequences in `status`.
    pub fn sequences_by_status(&self, status: SequenceStatus) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id FROM sequences WHERE status = ?1 ORDER BY created_at")
            .map_err(db_err("Prepare sequences"))?;
        let rows = stmt
            .query_map([status.as_str()], |r| r.get(0))
            .map_err(db_err("Query sequences"))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(db_err("Read sequences"))
    }

    /// Append a step at `step.order_index`; indexes must stay contiguous.
    pub fn add_step(&self, step: &Step) -> Result<()> {
        let conn = self.conn()?;
        let count: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM steps WHERE sequence_id = ?1",
                [&step.sequence_id],
                |r| r.get(0),
            )
            .map_err(db_err("Count steps"))?;
        if step.order_index != count {
            return Err(CadenceError::Validation(format!(
                "step order_index {} is not contiguous (sequence has {count} steps)",
                step.order_index
            )));
        }
        conn.execute(
            "INSERT INTO steps (id, sequence_id, order_index, delay_amount, delay_unit, priority, subject, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                step.id,
                step.sequence_id,
                step.order_index,
                step.delay.amount,
                step.delay.unit.as_str(),
                step.priority,
                step.subject,
                step.body,
            ],
        )
        .map_err(db_err("Add step"))?;
        Ok(())
    }

    /// Steps of a sequence in order.
    pub fn steps(&self, sequence_id: &str) -> Result<Vec<Step>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, sequence_id, order_index, delay_amount, delay_unit, priority, subject, body
                 FROM steps WHERE sequence_id = ?1 ORDER BY order_index",
            )
            .map_err(db_err("Prepare steps"))?;
        let rows = stmt
            .query_map([sequence_id], |row| {
                Ok(Step {
                    id: row.get(0)?,
                    sequence_id: row.get(1)?,
                    order_index: row.get(2)?,
                    delay: Delay {
                        amount: row.get(3)?,
                        unit: parse_col(row, 4)?,
                    },
                    priority: row.get(5)?,
                    subject: row.get(6)?,
                    body: row.get(7)?,
                })
            })
            .map_err(db_err("Query steps"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read steps"))
    }

    // ─── Sequence Contacts ──────────────────────────────────

    /// Create the cursor for a contact. Returns false if it already exists.
    pub fn insert_sequence_contact(&self, sequence_id: &str, contact_id: &str) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "INSERT OR IGNORE INTO sequence_contacts (sequence_id, contact_id, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![sequence_id, contact_id, to_ms(Utc::now())],
            )
            .map_err(db_err("Insert sequence contact"))?;
        Ok(changed > 0)
    }

    pub fn sequence_contact(&self, sequence_id: &str, contact_id: &str) -> Result<Option<SequenceContact>> {
        self.conn()?
            .query_row(
                &format!("{SC_SELECT} WHERE sequence_id = ?1 AND contact_id = ?2"),
                [sequence_id, contact_id],
                sequence_contact_row,
            )
            .optional()
            .map_err(db_err("Load sequence contact"))
    }

    pub fn require_sequence_contact(&self, sequence_id: &str, contact_id: &str) -> Result<SequenceContact> {
        self.sequence_contact(sequence_id, contact_id)?.ok_or_else(|| {
            CadenceError::NotFound(format!("contact '{contact_id}' in sequence '{sequence_id}'"))
        })
    }

    /// All cursors of a sequence, optionally filtered by status.
    pub fn sequence_contacts(
        &self,
        sequence_id: &str,
        statuses: &[ContactStatus],
    ) -> Result<Vec<SequenceContact>> {
        let conn = self.conn()?;
        let sql = if statuses.is_empty() {
            format!("{SC_SELECT} WHERE sequence_id = ?1 ORDER BY contact_id")
        } else {
            format!(
                "{SC_SELECT} WHERE sequence_id = ?1 AND status IN ({}) ORDER BY contact_id",
                in_list(statuses.iter().map(|s| s.as_str()))
            )
        };
        let mut stmt = conn.prepare(&sql).map_err(db_err("Prepare sequence contacts"))?;
        let rows = stmt
            .query_map([sequence_id], sequence_contact_row)
            .map_err(db_err("Query sequence contacts"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read sequence contacts"))
    }

    /// Contacts in the sequence that can still be sent to.
    pub fn eligible_contact_count(&self, sequence_id: &str) -> Result<u32> {
        self.conn()?
            .query_row(
                "SELECT COUNT(*) FROM sequence_contacts sc JOIN contacts c ON c.id = sc.contact_id
                 WHERE sc.sequence_id = ?1 AND c.unsubscribed = 0 AND TRIM(c.email) != ''
                   AND sc.status IN ('not_started', 'scheduled', 'sent')",
                [sequence_id],
                |r| r.get(0),
            )
            .map_err(db_err("Count eligible contacts"))
    }

    /// Compare-and-set a contact cursor. Applies only if the current status is
    /// one of `expect` (and, when given, the step index matches). Returns
    /// whether the row changed.
    pub fn transition_contact(
        &self,
        sequence_id: &str,
        contact_id: &str,
        expect: &[ContactStatus],
        expect_step: Option<u32>,
        t: &ContactTransition,
    ) -> Result<bool> {
        let next_at = match (t.status, t.next_scheduled_at) {
            (ContactStatus::Scheduled, Some(at)) => Some(to_ms(at)),
            (ContactStatus::Scheduled, None) => {
                return Err(CadenceError::Validation(
                    "scheduled transition requires next_scheduled_at".into(),
                ));
            }
            _ => None,
        };
        let mut sql = String::from(
            "UPDATE sequence_contacts SET
                status = ?3,
                current_step_index = COALESCE(?4, current_step_index),
                next_scheduled_at = ?5,
                thread_id = COALESCE(?6, thread_id),
                last_message_id = COALESCE(?7, last_message_id),
                last_error = ?8,
                last_processed_at = COALESCE(?9, last_processed_at),
                updated_at = ?10
             WHERE sequence_id = ?1 AND contact_id = ?2 AND current_step_index = COALESCE(?11, current_step_index)",
        );
        if !expect.is_empty() {
            sql.push_str(&format!(
                " AND status IN ({})",
                in_list(expect.iter().map(|s| s.as_str()))
            ));
        }
        let changed = self
            .conn()?
            .execute(
                &sql,
                params![
                    sequence_id,
                    contact_id,
                    t.status.as_str(),
                    t.step_index,
                    next_at,
                    t.thread_id,
                    t.last_message_id,
                    t.last_error,
                    t.processed_at.map(to_ms),
                    to_ms(Utc::now()),
                    expect_step,
                ],
            )
            .map_err(db_err("Transition contact"))?;
        Ok(changed > 0)
    }

    /// Rewind every non-permanent contact of a sequence to the first step.
    /// Contacts that answered, opted out, bounced or completed stay put.
    pub fn reset_sequence_contacts(&self, sequence_id: &str) -> Result<usize> {
        self.conn()?
            .execute(
                "UPDATE sequence_contacts SET status = 'not_started', current_step_index = 0,
                    next_scheduled_at = NULL, thread_id = NULL, last_message_id = NULL,
                    last_error = NULL, updated_at = ?2
                 WHERE sequence_id = ?1
                   AND status NOT IN ('completed', 'opted_out', 'bounced', 'replied', 'interested')",
                params![sequence_id, to_ms(Utc::now())],
            )
            .map_err(db_err("Reset sequence contacts"))
    }

    /// `last_error` of the sequence's most recently failed contact.
    pub fn latest_contact_error(&self, sequence_id: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row(
                "SELECT last_error FROM sequence_contacts
                 WHERE sequence_id = ?1 AND status = 'error' AND last_error IS NOT NULL
                 ORDER BY updated_at DESC LIMIT 1",
                [sequence_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err("Load latest contact error"))
    }

    /// Cursors on `mailbox_id`'s sequences whose thread matches.
    pub fn contacts_by_thread(&self, mailbox_id: &str, thread_id: &str) -> Result<Vec<SequenceContact>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{SC_SELECT} WHERE thread_id = ?2
                   AND sequence_id IN (SELECT id FROM sequences WHERE mailbox_id = ?1)"
            ))
            .map_err(db_err("Prepare contacts by thread"))?;
        let rows = stmt
            .query_map([mailbox_id, thread_id], sequence_contact_row)
            .map_err(db_err("Query contacts by thread"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read contacts by thread"))
    }

    /// Cursors on `mailbox_id`'s sequences whose contact has this address
    /// and has been sent at least one step.
    pub fn contacts_by_email(&self, mailbox_id: &str, email: &str) -> Result<Vec<SequenceContact>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{SC_SELECT} WHERE last_message_id IS NOT NULL
                   AND contact_id IN (SELECT id FROM contacts WHERE LOWER(email) = LOWER(?2))
                   AND sequence_id IN (SELECT id FROM sequences WHERE mailbox_id = ?1)"
            ))
            .map_err(db_err("Prepare contacts by email"))?;
        let rows = stmt
            .query_map([mailbox_id, email.trim()], sequence_contact_row)
            .map_err(db_err("Query contacts by email"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read contacts by email"))
    }

    // ─── Email Events ───────────────────────────────────────

    /// Append an event. Returns false if an identical event (same type,
    /// contact and message id) was already recorded.
    pub fn record_event(&self, event: &EmailEvent) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "INSERT OR IGNORE INTO email_events
                 (event_type, sequence_id, contact_id, step_index, message_id, thread_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.event_type.as_str(),
                    event.sequence_id,
                    event.contact_id,
                    event.step_index,
                    event.message_id,
                    event.thread_id,
                    to_ms(event.timestamp),
                ],
            )
            .map_err(db_err("Record event"))?;
        Ok(changed > 0)
    }

    /// The `sent` event for one of our outbound message ids.
    pub fn sent_event_by_message_id(&self, message_id: &str) -> Result<Option<EmailEvent>> {
        self.conn()?
            .query_row(
                &format!("{EVENT_SELECT} WHERE event_type = 'sent' AND message_id = ?1 LIMIT 1"),
                [message_id],
                event_row,
            )
            .optional()
            .map_err(db_err("Load sent event"))
    }

    pub fn events_for_contact(&self, sequence_id: &str, contact_id: &str) -> Result<Vec<EmailEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{EVENT_SELECT} WHERE sequence_id = ?1 AND contact_id = ?2 ORDER BY id"
            ))
            .map_err(db_err("Prepare events"))?;
        let rows = stmt
            .query_map([sequence_id, contact_id], event_row)
            .map_err(db_err("Query events"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read events"))
    }

    pub fn count_events_since(
        &self,
        sequence_id: &str,
        event_type: EmailEventType,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        self.conn()?
            .query_row(
                "SELECT COUNT(*) FROM email_events WHERE sequence_id = ?1 AND event_type = ?2 AND created_at >= ?3",
                params![sequence_id, event_type.as_str(), to_ms(since)],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(db_err("Count events"))
    }

    // ─── Delivery Errors ────────────────────────────────────

    pub fn record_delivery_error(
        &self,
        sequence_id: &str,
        contact_id: Option<&str>,
        job_id: Option<&str>,
        kind: &str,
        error: &str,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO delivery_errors (sequence_id, contact_id, job_id, kind, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![sequence_id, contact_id, job_id, kind, error, to_ms(Utc::now())],
            )
            .map_err(db_err("Record delivery error"))?;
        Ok(())
    }

    pub fn count_delivery_errors_since(&self, sequence_id: &str, since: DateTime<Utc>) -> Result<u64> {
        self.conn()?
            .query_row(
                "SELECT COUNT(*) FROM delivery_errors WHERE sequence_id = ?1 AND created_at >= ?2",
                params![sequence_id, to_ms(since)],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(db_err("Count delivery errors"))
    }

    // ─── Mailbox Cursors ────────────────────────────────────

    pub fn cursor(&self, mailbox_id: &str) -> Result<Option<MailboxWatchCursor>> {
        self.conn()?
            .query_row(
                &format!("{CURSOR_SELECT} WHERE mailbox_id = ?1"),
                [mailbox_id],
                cursor_row,
            )
            .optional()
            .map_err(db_err("Load cursor"))
    }

    pub fn save_cursor(&self, cursor: &MailboxWatchCursor) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO mailbox_cursors
                 (mailbox_id, history_id, watch_expires_at, account_ref, last_full_sync_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    cursor.mailbox_id,
                    cursor.history_id,
                    cursor.watch_expires_at.map(to_ms),
                    cursor.account_ref,
                    cursor.last_full_sync_at.map(to_ms),
                    to_ms(cursor.updated_at),
                ],
            )
            .map_err(db_err("Save cursor"))?;
        Ok(())
    }

    /// Cursors whose watch expires before `before`.
    pub fn cursors_expiring_before(&self, before: DateTime<Utc>) -> Result<Vec<MailboxWatchCursor>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{CURSOR_SELECT} WHERE watch_expires_at IS NOT NULL AND watch_expires_at < ?1"
            ))
            .map_err(db_err("Prepare expiring cursors"))?;
        let rows = stmt
            .query_map([to_ms(before)], cursor_row)
            .map_err(db_err("Query expiring cursors"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read expiring cursors"))
    }

    /// Mark an inbound message as ingested. Returns false if it already was.
    pub fn mark_message_processed(&self, mailbox_id: &str, message_id: &str) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "INSERT OR IGNORE INTO processed_messages (mailbox_id, message_id, processed_at)
                 VALUES (?1, ?2, ?3)",
                params![mailbox_id, message_id, to_ms(Utc::now())],
            )
            .map_err(db_err("Mark message processed"))?;
        Ok(changed > 0)
    }

    pub fn is_message_processed(&self, mailbox_id: &str, message_id: &str) -> Result<bool> {
        self.conn()?
            .query_row(
                "SELECT 1 FROM processed_messages WHERE mailbox_id = ?1 AND message_id = ?2",
                [mailbox_id, message_id],
                |_| Ok(()),
            )
            .optional()
            .map(|r| r.is_some())
            .map_err(db_err("Check processed message"))
    }
}

// ─── Row mapping ────────────────────────────────────────────

const SC_SELECT: &str = "SELECT sequence_id, contact_id, current_step_index, status, next_scheduled_at,
        last_processed_at, thread_id, last_message_id, last_error FROM sequence_contacts";

fn sequence_contact_row(row: &Row<'_>) -> rusqlite::Result<SequenceContact> {
    Ok(SequenceContact {
        sequence_id: row.get(0)?,
        contact_id: row.get(1)?,
        current_step_index: row.get(2)?,
        status: parse_col(row, 3)?,
        next_scheduled_at: row.get::<_, Option<i64>>(4)?.map(from_ms),
        last_processed_at: row.get::<_, Option<i64>>(5)?.map(from_ms),
        thread_id: row.get(6)?,
        last_message_id: row.get(7)?,
        last_error: row.get(8)?,
    })
}

const EVENT_SELECT: &str = "SELECT event_type, created_at, sequence_id, contact_id, step_index,
        message_id, thread_id FROM email_events";

fn event_row(row: &Row<'_>) -> rusqlite::Result<EmailEvent> {
    Ok(EmailEvent {
        event_type: parse_col(row, 0)?,
        timestamp: from_ms(row.get(1)?),
        sequence_id: row.get(2)?,
        contact_id: row.get(3)?,
        step_index: row.get(4)?,
        message_id: row.get(5)?,
        thread_id: row.get(6)?,
    })
}

const CURSOR_SELECT: &str = "SELECT mailbox_id, history_id, watch_expires_at, account_ref,
        last_full_sync_at, updated_at FROM mailbox_cursors";

fn cursor_row(row: &Row<'_>) -> rusqlite::Result<MailboxWatchCursor> {
    Ok(MailboxWatchCursor {
        mailbox_id: row.get(0)?,
        history_id: row.get(1)?,
        watch_expires_at: row.get::<_, Option<i64>>(2)?.map(from_ms),
        account_ref: row.get(3)?,
        last_full_sync_at: row.get::<_, Option<i64>>(4)?.map(from_ms),
        updated_at: from_ms(row.get(5)?),
    })
}

// ─── Helpers ────────────────────────────────────────────────

pub(crate) fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Map a rusqlite error into a Database error with context.
pub(crate) fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> CadenceError {
    move |e| CadenceError::Database(format!("{context}: {e}"))
}

/// Parse a text column into one of the string enums.
pub(crate) fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = CadenceError>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: CadenceError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// `'a', 'b'` for an SQL IN list of known-safe enum strings.
pub(crate) fn in_list<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.map(|s| format!("'{s}'")).collect::<Vec<_>>().join(", ")
}
