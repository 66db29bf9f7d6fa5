//! Dispatcher — claims jobs, throttles per mailbox, sends, and reports back.
//!
//! One `Dispatcher` is shared by every worker task. Each worker loops:
//! claim → rate gate → re-check contact → send → complete/fail → advance.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::error::{Result, SendError};
use cadence_core::traits::{CredentialRefresher, MailSender};
use cadence_core::types::{
    Contact, ContactStatus, EmailEvent, EmailEventType, Job, JobClass, Mailbox, OutgoingEmail,
    SentEmail, SequenceContact, SequenceStatus, Step,
};
use chrono::Utc;
use tokio::sync::watch;

use crate::persistence::{CadenceDb, ContactTransition};
use crate::queue::{FailOutcome, JobStore};
use crate::rate_gate::RateGate;
use crate::sequence::SequenceStateMachine;

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Sent { message_id: String },
    /// Completed without sending (state changed since scheduling).
    Skipped(String),
    /// Handed back to the queue (sequence no longer active).
    Released,
    Retrying { delay: Duration },
    Failed(String),
    LeaseLost,
}

/// Substitute `{{first_name}}`, `{{last_name}}`, `{{email}}`, `{{company}}`.
pub fn render(template: &str, contact: &Contact) -> String {
    template
        .replace("{{first_name}}", &contact.first_name)
        .replace("{{last_name}}", &contact.last_name)
        .replace("{{email}}", &contact.email)
        .replace("{{company}}", &contact.company)
}

/// Build the email for `step`. Follow-ups continue the contact's thread.
pub fn compose(step: &Step, contact: &Contact, cursor: Option<&SequenceContact>, first_subject: &str) -> OutgoingEmail {
    let thread_id = cursor.and_then(|c| c.thread_id.clone());
    let in_reply_to = cursor.and_then(|c| c.last_message_id.clone());
    let subject = if step.subject.trim().is_empty() {
        format!("Re: {}", render(first_subject, contact))
    } else {
        render(&step.subject, contact)
    };
    let to_name = format!("{} {}", contact.first_name, contact.last_name)
        .trim()
        .to_string();
    OutgoingEmail {
        to: contact.email.clone(),
        to_name: (!to_name.is_empty()).then_some(to_name),
        subject,
        body: render(&step.body, contact),
        thread_id,
        in_reply_to,
    }
}

pub struct Dispatcher {
    db: Arc<CadenceDb>,
    jobs: Arc<JobStore>,
    machine: Arc<SequenceStateMachine>,
    gate: RateGate,
    sender: Arc<dyn MailSender>,
    refresher: Arc<dyn CredentialRefresher>,
}

impl Dispatcher {
    pub fn new(
        machine: Arc<SequenceStateMachine>,
        gate: RateGate,
        sender: Arc<dyn MailSender>,
        refresher: Arc<dyn CredentialRefresher>,
    ) -> Self {
        Self {
            db: machine.db().clone(),
            jobs: machine.jobs().clone(),
            machine,
            gate,
            sender,
            refresher,
        }
    }

    /// Claim and process at most one job.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<JobOutcome>> {
        let Some(job) = self.jobs.dequeue(worker_id, Utc::now())? else {
            return Ok(None);
        };
        tracing::debug!("📤 [{worker_id}] claimed {} job {} (attempt {})", job.class, job.id, job.attempts);
        let outcome = match job.class {
            JobClass::SequenceStep => self.process_step(worker_id, &job).await?,
            JobClass::EmailSend => self.process_send(worker_id, &job).await?,
        };
        Ok(Some(outcome))
    }

    /// Worker loop. Finishes the job in hand before honouring shutdown.
    pub async fn run_worker(self: Arc<Self>, worker_id: String, poll: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("👷 Worker {worker_id} started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once(&worker_id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => tracing::error!("❌ [{worker_id}] {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("👷 Worker {worker_id} stopped");
    }

    /// Send with one credential refresh on token expiry.
    async fn send_with_refresh(&self, mailbox: &Mailbox, email: &OutgoingEmail) -> std::result::Result<SentEmail, SendError> {
        match self.sender.send(mailbox, email).await {
            Err(SendError::TokenExpired) => {
                tracing::info!("🔑 Token expired for {}, refreshing", mailbox.id);
                if let Err(e) = self.refresher.refresh(&mailbox.id).await {
                    return Err(SendError::Transient(format!("credential refresh failed: {e}")));
                }
                match self.sender.send(mailbox, email).await {
                    Err(SendError::TokenExpired) => {
                        Err(SendError::Transient("token still expired after refresh".into()))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn process_step(&self, worker_id: &str, job: &Job) -> Result<JobOutcome> {
        let (Some(seq_id), Some(contact_id), Some(step_index)) =
            (job.sequence_id.as_deref(), job.contact_id.as_deref(), job.step_index)
        else {
            return self.fatal(worker_id, job, "malformed sequence-step job");
        };

        let seq = self.db.require_sequence(seq_id)?;
        if seq.status != SequenceStatus::Active {
            self.jobs.release(&job.id, worker_id, Utc::now())?;
            return Ok(JobOutcome::Released);
        }
        if let Some(reason) = self.stale(seq_id, contact_id, step_index)? {
            return self.skip(worker_id, job, reason);
        }

        let contact = match self.db.contact(contact_id)? {
            Some(c) if c.is_eligible() => c,
            Some(c) if c.unsubscribed => {
                self.machine.skip_unsubscribed(seq_id, contact_id, step_index)?;
                return self.skip(worker_id, job, "contact unsubscribed".into());
            }
            _ => {
                self.machine.mark_error(seq_id, contact_id, step_index, "contact has no email address")?;
                return self.skip(worker_id, job, "contact has no email address".into());
            }
        };
        let steps = self.db.steps(seq_id)?;
        let Some(step) = steps.get(step_index as usize) else {
            let msg = format!("step {step_index} no longer exists");
            self.machine.mark_error(seq_id, contact_id, step_index, &msg)?;
            return self.fatal(worker_id, job, &msg);
        };
        let Some(mailbox) = self.db.mailbox(&job.mailbox_id)? else {
            let msg = format!("mailbox '{}' not found", job.mailbox_id);
            self.machine.fail_sequence(seq_id, &msg)?;
            return self.fatal(worker_id, job, &msg);
        };

        self.gate.acquire(&job.mailbox_id).await;
        self.jobs.extend_lease(&job.id, worker_id, Utc::now())?;

        // A bounce or reply may have landed while waiting at the gate.
        if let Some(reason) = self.stale(seq_id, contact_id, step_index)? {
            return self.skip(worker_id, job, reason);
        }
        let cursor = self.db.sequence_contact(seq_id, contact_id)?;
        let first_subject = steps.first().map(|s| s.subject.as_str()).unwrap_or_default();
        let email = compose(step, &contact, cursor.as_ref(), first_subject);

        match self.send_with_refresh(&mailbox, &email).await {
            Ok(sent) => self.on_sent(worker_id, job, seq_id, contact_id, step_index, sent),
            Err(e) => self.on_send_error(worker_id, job, seq_id, contact_id, step_index, e),
        }
    }

    /// Why the contact no longer wants this job, if it doesn't.
    fn stale(&self, seq_id: &str, contact_id: &str, step_index: u32) -> Result<Option<String>> {
        Ok(match self.db.sequence_contact(seq_id, contact_id)? {
            None => Some("contact removed from sequence".into()),
            Some(sc) if sc.status != ContactStatus::Scheduled => Some(format!("contact is {}", sc.status)),
            Some(sc) if sc.current_step_index != step_index => {
                Some(format!("contact moved to step {}", sc.current_step_index))
            }
            Some(_) => None,
        })
    }

    fn skip(&self, worker_id: &str, job: &Job, reason: String) -> Result<JobOutcome> {
        tracing::debug!("⏭️ Job {} skipped: {reason}", job.id);
        self.jobs.complete(&job.id, worker_id, Utc::now())?;
        Ok(JobOutcome::Skipped(reason))
    }

    fn fatal(&self, worker_id: &str, job: &Job, error: &str) -> Result<JobOutcome> {
        self.jobs.fail_fatal(&job.id, worker_id, error, Utc::now())?;
        Ok(JobOutcome::Failed(error.to_string()))
    }

    fn on_sent(
        &self,
        worker_id: &str,
        job: &Job,
        seq_id: &str,
        contact_id: &str,
        step_index: u32,
        sent: SentEmail,
    ) -> Result<JobOutcome> {
        let now = Utc::now();
        let mut t = ContactTransition::to(ContactStatus::Sent);
        t.thread_id = Some(sent.thread_id.clone());
        t.last_message_id = Some(sent.message_id.clone());
        t.processed_at = Some(now);
        let moved = self.db.transition_contact(
            seq_id,
            contact_id,
            &[ContactStatus::Scheduled],
            Some(step_index),
            &t,
        )?;
        // The email went out either way; record it.
        self.db.record_event(&EmailEvent {
            event_type: EmailEventType::Sent,
            timestamp: now,
            sequence_id: seq_id.to_string(),
            contact_id: contact_id.to_string(),
            step_index,
            message_id: Some(sent.message_id.clone()),
            thread_id: Some(sent.thread_id.clone()),
        })?;
        tracing::info!("📧 Sent step {step_index} to {contact_id} ({seq_id})");
        if !self.jobs.complete(&job.id, worker_id, now)? {
            // The sweeper advances the contact once the reclaimed job is skipped.
            tracing::warn!("⚠️ Job {} lost its lease after sending; not advancing {contact_id}", job.id);
            return Ok(JobOutcome::LeaseLost);
        }
        if moved {
            self.machine.advance(seq_id, contact_id, now)?;
        } else {
            tracing::warn!("⚠️ {contact_id} changed state during send; not advancing");
        }
        Ok(JobOutcome::Sent {
            message_id: sent.message_id,
        })
    }

    fn on_send_error(
        &self,
        worker_id: &str,
        job: &Job,
        seq_id: &str,
        contact_id: &str,
        step_index: u32,
        error: SendError,
    ) -> Result<JobOutcome> {
        let now = Utc::now();
        let msg = error.to_string();
        match error {
            SendError::CredentialRevoked(_) => {
                self.jobs.fail_fatal(&job.id, worker_id, &msg, now)?;
                self.db
                    .record_delivery_error(seq_id, Some(contact_id), Some(&job.id), "credential", &msg)?;
                self.machine.fail_sequence(seq_id, &msg)?;
                Ok(JobOutcome::Failed(msg))
            }
            SendError::Permanent(_) => {
                self.jobs.fail_fatal(&job.id, worker_id, &msg, now)?;
                self.db
                    .record_delivery_error(seq_id, Some(contact_id), Some(&job.id), "fatal", &msg)?;
                self.machine.mark_error(seq_id, contact_id, step_index, &msg)?;
                Ok(JobOutcome::Failed(msg))
            }
            _ => match self.jobs.fail(&job.id, worker_id, &msg, now)? {
                FailOutcome::Retrying { attempt, delay } => {
                    tracing::warn!("🔁 Job {} attempt {attempt} failed: {msg}, retry in {delay:?}", job.id);
                    Ok(JobOutcome::Retrying { delay })
                }
                FailOutcome::Failed { attempts } => {
                    let msg = format!("{msg} (gave up after {attempts} attempts)");
                    self.db
                        .record_delivery_error(seq_id, Some(contact_id), Some(&job.id), "exhausted", &msg)?;
                    self.machine.mark_error(seq_id, contact_id, step_index, &msg)?;
                    Ok(JobOutcome::Failed(msg))
                }
                FailOutcome::LeaseLost => Ok(JobOutcome::LeaseLost),
            },
        }
    }

    /// One-off send of a step to an arbitrary address.
    async fn process_send(&self, worker_id: &str, job: &Job) -> Result<JobOutcome> {
        let seq_id = job.payload["sequence_id"].as_str().unwrap_or_default();
        let to = job.payload["to"].as_str().unwrap_or_default();
        let step_index = job.step_index.unwrap_or_default();
        let steps = self.db.steps(seq_id)?;
        let (Some(step), Some(mailbox)) = (steps.get(step_index as usize), self.db.mailbox(&job.mailbox_id)?)
        else {
            return self.fatal(worker_id, job, "test email references missing step or mailbox");
        };

        let mut sample = Contact::new("sample", to);
        sample.first_name = "Test".into();
        sample.last_name = "Recipient".into();
        sample.company = "Example Co".into();
        let first_subject = steps.first().map(|s| s.subject.as_str()).unwrap_or_default();
        let email = compose(step, &sample, None, first_subject);

        self.gate.acquire(&job.mailbox_id).await;
        match self.send_with_refresh(&mailbox, &email).await {
            Ok(sent) => {
                self.jobs.complete(&job.id, worker_id, Utc::now())?;
                tracing::info!("🧪 Test email for {seq_id} step {step_index} sent to {to}");
                Ok(JobOutcome::Sent {
                    message_id: sent.message_id,
                })
            }
            Err(e) if e.is_retryable() => match self.jobs.fail(&job.id, worker_id, &e.to_string(), Utc::now())? {
                FailOutcome::Retrying { delay, .. } => Ok(JobOutcome::Retrying { delay }),
                FailOutcome::Failed { .. } => {
                    tracing::error!("❌ Test email to {to} failed: {e}");
                    Ok(JobOutcome::Failed(e.to_string()))
                }
                FailOutcome::LeaseLost => Ok(JobOutcome::LeaseLost),
            },
            Err(e) => {
                tracing::error!("❌ Test email to {to} rejected: {e}");
                self.fatal(worker_id, job, &e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sender", &self.sender.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingRefresher, RecordingSender, exact_policies, seed_sequence};
    use cadence_core::config::{RateLimitConfig, WorkerConfig};
    use cadence_core::types::JobState;
    use std::sync::atomic::Ordering;

    struct Harness {
        db: Arc<CadenceDb>,
        machine: Arc<SequenceStateMachine>,
        sender: Arc<RecordingSender>,
        refresher: Arc<CountingRefresher>,
        dispatcher: Dispatcher,
    }

    fn harness(sender: RecordingSender) -> Harness {
        let db = Arc::new(CadenceDb::open_in_memory().unwrap());
        let jobs = Arc::new(JobStore::new(db.clone(), exact_policies(), &WorkerConfig::default()));
        let machine = Arc::new(SequenceStateMachine::new(db.clone(), jobs));
        let sender = Arc::new(sender);
        let refresher = Arc::new(CountingRefresher::default());
        let gate = RateGate::new(RateLimitConfig {
            per_second: 100,
            per_minute: 1000,
            ..RateLimitConfig::default()
        });
        let dispatcher = Dispatcher::new(machine.clone(), gate, sender.clone(), refresher.clone());
        Harness {
            db,
            machine,
            sender,
            refresher,
            dispatcher,
        }
    }

    fn launched(h: &Harness, steps: u32, contacts: &[&str]) {
        seed_sequence(&h.db, "s1", steps, contacts);
        h.machine.launch("s1", Utc::now() - chrono::Duration::seconds(1)).unwrap();
    }

    #[test]
    fn test_render_and_compose_follow_up() {
        let mut c = Contact::new("c1", "ann@example.com");
        c.first_name = "Ann".into();
        c.company = "Initech".into();
        let step = Step {
            id: "st".into(),
            sequence_id: "s1".into(),
            order_index: 1,
            delay: cadence_core::types::Delay::none(),
            priority: 5,
            subject: String::new(),
            body: "Hi {{first_name}} at {{company}} ({{email}})".into(),
        };
        let cursor = SequenceContact {
            sequence_id: "s1".into(),
            contact_id: "c1".into(),
            current_step_index: 1,
            status: ContactStatus::Scheduled,
            next_scheduled_at: Some(Utc::now()),
            last_processed_at: None,
            thread_id: Some("t-1".into()),
            last_message_id: Some("m-1@acme.test".into()),
            last_error: None,
        };
        let email = compose(&step, &c, Some(&cursor), "Quick question, {{first_name}}");
        assert_eq!(email.subject, "Re: Quick question, Ann");
        assert_eq!(email.body, "Hi Ann at Initech (ann@example.com)");
        assert_eq!(email.thread_id.as_deref(), Some("t-1"));
        assert_eq!(email.in_reply_to.as_deref(), Some("m-1@acme.test"));
        assert_eq!(email.to_name.as_deref(), Some("Ann"));
    }

    #[tokio::test]
    async fn test_send_advances_contact() {
        let h = harness(RecordingSender::default());
        launched(&h, 2, &["c1"]);

        let outcome = h.dispatcher.run_once("w1").await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Sent { .. }));
        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "c1@example.com");
        assert_eq!(sent[0].subject, "Quick question, C1");

        let sc = h.db.require_sequence_contact("s1", "c1").unwrap();
        assert_eq!(sc.status, ContactStatus::Scheduled);
        assert_eq!(sc.current_step_index, 1);
        assert_eq!(sc.thread_id.as_deref(), Some("thread-0"));
        let events = h.db.events_for_contact("s1", "c1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EmailEventType::Sent);
        // Step 1 waits two days.
        assert!(h.dispatcher.run_once("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_token_expired_refreshes_once() {
        let h = harness(RecordingSender::scripted(vec![Err(SendError::TokenExpired)]));
        launched(&h, 1, &["c1"]);
        let outcome = h.dispatcher.run_once("w1").await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Sent { .. }));
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.sender.sent().len(), 2);
        assert_eq!(
            h.db.require_sequence_contact("s1", "c1").unwrap().status,
            ContactStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_to_contact_error() {
        let h = harness(RecordingSender::scripted(vec![
            Err(SendError::Transient("timeout".into())),
            Err(SendError::Transient("timeout".into())),
            Err(SendError::Transient("timeout".into())),
        ]));
        launched(&h, 2, &["c1"]);

        let first = h.dispatcher.run_once("w1").await.unwrap().unwrap();
        assert_eq!(first, JobOutcome::Retrying { delay: Duration::from_secs(1) });

        // Make the retries due without waiting.
        for expected in [Some(Duration::from_secs(2)), None] {
            let job = &h.machine.jobs().jobs_for_contact("s1", "c1").unwrap()[0];
            h.db.conn()
                .unwrap()
                .execute("UPDATE jobs SET run_at = 0 WHERE id = ?1", [&job.id])
                .unwrap();
            let outcome = h.dispatcher.run_once("w1").await.unwrap().unwrap();
            match expected {
                Some(delay) => assert_eq!(outcome, JobOutcome::Retrying { delay }),
                None => assert!(matches!(outcome, JobOutcome::Failed(_))),
            }
        }
        let sc = h.db.require_sequence_contact("s1", "c1").unwrap();
        assert_eq!(sc.status, ContactStatus::Error);
        assert!(sc.last_error.unwrap().contains("gave up after 3 attempts"));
        assert_eq!(h.sender.sent().len(), 3);
        let job = &h.machine.jobs().jobs_for_contact("s1", "c1").unwrap()[0];
        assert_eq!(job.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_fatal() {
        let h = harness(RecordingSender::scripted(vec![Err(SendError::Permanent(
            "550 5.1.1 user unknown".into(),
        ))]));
        launched(&h, 2, &["c1", "c2"]);
        let outcome = h.dispatcher.run_once("w1").await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Failed(_)));
        let statuses: Vec<ContactStatus> = ["c1", "c2"]
            .iter()
            .map(|c| h.db.require_sequence_contact("s1", c).unwrap().status)
            .collect();
        assert!(statuses.contains(&ContactStatus::Error));
        // The other contact is unaffected.
        assert!(statuses.contains(&ContactStatus::Scheduled));
        assert_eq!(h.db.require_sequence("s1").unwrap().status, SequenceStatus::Active);
    }

    #[tokio::test]
    async fn test_sequence_errors_when_every_contact_fails() {
        let h = harness(RecordingSender::scripted(vec![Err(SendError::Permanent(
            "550 5.1.1 user unknown".into(),
        ))]));
        launched(&h, 2, &["c1"]);
        h.dispatcher.run_once("w1").await.unwrap().unwrap();
        assert_eq!(h.db.require_sequence_contact("s1", "c1").unwrap().status, ContactStatus::Error);
        let seq = h.db.require_sequence("s1").unwrap();
        assert_eq!(seq.status, SequenceStatus::Error);
        assert!(seq.last_error.unwrap().contains("550"));
    }

    #[tokio::test]
    async fn test_unsubscribed_contact_completes_sequence() {
        let h = harness(RecordingSender::default());
        launched(&h, 2, &["c1"]);
        h.db.set_contact_unsubscribed("c1").unwrap();
        let outcome = h.dispatcher.run_once("w1").await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Skipped("contact unsubscribed".into()));
        assert!(h.sender.sent().is_empty());
        assert_eq!(h.db.require_sequence_contact("s1", "c1").unwrap().status, ContactStatus::OptedOut);
        assert_eq!(h.db.require_sequence("s1").unwrap().status, SequenceStatus::Completed);
    }

    #[tokio::test]
    async fn test_lost_lease_after_send_does_not_advance() {
        let h = harness(RecordingSender::default());
        launched(&h, 2, &["c1"]);
        let job = h.machine.jobs().dequeue("w1", Utc::now()).unwrap().unwrap();
        h.db.conn()
            .unwrap()
            .execute("UPDATE jobs SET state = 'stalled', owner = NULL WHERE id = ?1", [&job.id])
            .unwrap();

        let sent = SentEmail {
            message_id: "m-1@acme.test".into(),
            thread_id: "t-1".into(),
        };
        let outcome = h.dispatcher.on_sent("w1", &job, "s1", "c1", 0, sent).unwrap();
        assert_eq!(outcome, JobOutcome::LeaseLost);
        let sc = h.db.require_sequence_contact("s1", "c1").unwrap();
        assert_eq!(sc.status, ContactStatus::Sent);
        assert_eq!(sc.current_step_index, 0);
        assert_eq!(h.db.events_for_contact("s1", "c1").unwrap().len(), 1);
        // Step 1 was not queued behind the stalled job.
        let jobs = h.machine.jobs().jobs_for_contact("s1", "c1").unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Stalled);
    }

    #[tokio::test]
    async fn test_revoked_credential_stops_sequence() {
        let h = harness(RecordingSender::scripted(vec![Err(SendError::CredentialRevoked(
            "invalid_grant".into(),
        ))]));
        launched(&h, 1, &["c1", "c2"]);
        h.dispatcher.run_once("w1").await.unwrap().unwrap();
        let seq = h.db.require_sequence("s1").unwrap();
        assert_eq!(seq.status, SequenceStatus::Error);
        assert!(seq.last_error.unwrap().contains("invalid_grant"));
        // Remaining jobs are gated.
        assert!(h.dispatcher.run_once("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claimed_job_noops_after_bounce() {
        let h = harness(RecordingSender::default());
        launched(&h, 2, &["x"]);
        let job = h.machine.jobs().dequeue("w1", Utc::now()).unwrap().unwrap();
        h.machine
            .on_bounce(
                &EmailEvent {
                    event_type: EmailEventType::Bounced,
                    timestamp: Utc::now(),
                    sequence_id: "s1".into(),
                    contact_id: "x".into(),
                    step_index: 0,
                    message_id: Some("dsn@mx".into()),
                    thread_id: None,
                },
                Utc::now(),
            )
            .unwrap();

        let outcome = h.dispatcher.process_step("w1", &job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped(_)));
        assert!(h.sender.sent().is_empty());
        assert_eq!(h.db.require_sequence_contact("s1", "x").unwrap().status, ContactStatus::Bounced);
    }

    #[tokio::test]
    async fn test_test_email_job() {
        let h = harness(RecordingSender::default());
        seed_sequence(&h.db, "s1", 2, &[]);
        h.machine.send_test_email("s1", 0, "me@example.com", Utc::now()).unwrap();
        let outcome = h.dispatcher.run_once("w1").await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Sent { .. }));
        let sent = h.sender.sent();
        assert_eq!(sent[0].to, "me@example.com");
        assert_eq!(sent[0].subject, "Quick question, Test");
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let h = harness(RecordingSender::default());
        launched(&h, 1, &["c1"]);
        let (tx, rx) = watch::channel(false);
        let dispatcher = Arc::new(h.dispatcher);
        let worker = tokio::spawn(dispatcher.clone().run_worker("w1".into(), Duration::from_millis(10), rx));
        for _ in 0..200 {
            if !h.sender.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        worker.await.unwrap();
        assert_eq!(h.sender.sent().len(), 1);
    }
}
