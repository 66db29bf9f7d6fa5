//! SequenceStateMachine — lifecycle of contacts-in-sequence.
//!
//! ```text
//! not_started ─► scheduled ─► sent ─┬─► scheduled (next step)
//!                    │              ├─► completed
//!                    │              └─► error
//!                    └──────────────────► bounced | replied | opted_out
//! ```
//!
//! Every contact write is a compare-and-set on the expected status, so a
//! bounce that lands while a worker holds the contact's job wins.

use std::sync::Arc;

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{
    ContactStatus, Delay, EmailEvent, JobClass, NewJob, ScheduleType, Sequence, SequenceStatus, Step,
};
use chrono::{DateTime, Duration, Utc};

use crate::calendar::{self, Calendar};
use crate::persistence::{CadenceDb, ContactTransition};
use crate::queue::{EnqueueOutcome, JobStore};

/// Contact states that can still receive a step.
const LIVE: &[ContactStatus] = &[
    ContactStatus::NotStarted,
    ContactStatus::Scheduled,
    ContactStatus::Sent,
];

/// Contact states that count as a sequence reaching its audience.
const SUCCEEDED: &[ContactStatus] = &[
    ContactStatus::Completed,
    ContactStatus::Replied,
    ContactStatus::Interested,
];

/// Priority used by "send now".
pub const SEND_NOW_PRIORITY: i32 = 0;

/// Summary of a launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchReport {
    pub scheduled: usize,
    /// Contacts skipped as ineligible (unsubscribed or no address).
    pub skipped: usize,
    /// Contacts whose previous job is still running. The sweeper queues
    /// them once it finishes.
    pub deferred: usize,
}

/// Result of placing a contact's next step on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Queued,
    /// The contact moved on concurrently; nothing queued.
    Unchanged,
    /// A claimed job still holds the contact's slot; the contact was left as it was.
    Deferred,
    /// Ineligible contact moved to a terminal state.
    Skipped,
}

pub struct SequenceStateMachine {
    db: Arc<CadenceDb>,
    jobs: Arc<JobStore>,
}

impl SequenceStateMachine {
    pub fn new(db: Arc<CadenceDb>, jobs: Arc<JobStore>) -> Self {
        Self { db, jobs }
    }

    pub fn db(&self) -> &Arc<CadenceDb> {
        &self.db
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    /// Next send instant for `delay` after `from` under the sequence's rules.
    /// Test mode ignores business hours and reads every unit as minutes.
    pub fn next_eligible(&self, seq: &Sequence, from: DateTime<Utc>, delay: Delay) -> Result<DateTime<Utc>> {
        if seq.test_mode {
            return Ok(from + Duration::minutes(i64::from(delay.amount)));
        }
        calendar::next_eligible(from, delay, seq.calendar())
    }

    /// Check that a sequence may go active. Returns its steps.
    pub fn validate_launch(&self, seq: &Sequence) -> Result<Vec<Step>> {
        let Some(mailbox_id) = &seq.mailbox_id else {
            return Err(CadenceError::Validation(format!("sequence '{}' has no mailbox", seq.id)));
        };
        if self.db.mailbox(mailbox_id)?.is_none() {
            return Err(CadenceError::Validation(format!(
                "sequence '{}' references unknown mailbox '{mailbox_id}'",
                seq.id
            )));
        }
        let steps = self.db.steps(&seq.id)?;
        if steps.is_empty() {
            return Err(CadenceError::Validation(format!("sequence '{}' has no steps", seq.id)));
        }
        if seq.schedule_type == ScheduleType::Business {
            let Some(hours) = &seq.business_hours else {
                return Err(CadenceError::Validation(format!(
                    "sequence '{}' uses business scheduling without business hours",
                    seq.id
                )));
            };
            Calendar::from_hours(hours)?;
        }
        if self.db.eligible_contact_count(&seq.id)? == 0 {
            return Err(CadenceError::Validation(format!(
                "sequence '{}' has no eligible contacts",
                seq.id
            )));
        }
        Ok(steps)
    }

    /// draft/error → active, scheduling the first step for every new contact.
    pub fn launch(&self, sequence_id: &str, now: DateTime<Utc>) -> Result<LaunchReport> {
        let mut seq = self.db.require_sequence(sequence_id)?;
        if !matches!(seq.status, SequenceStatus::Draft | SequenceStatus::Error) {
            return Err(CadenceError::Validation(format!(
                "sequence '{sequence_id}' is {} and cannot be launched",
                seq.status
            )));
        }
        let steps = self.validate_launch(&seq)?;
        if !self.db.set_sequence_status(
            sequence_id,
            SequenceStatus::Active,
            &[SequenceStatus::Draft, SequenceStatus::Error],
            None,
        )? {
            return Err(CadenceError::Validation(format!(
                "sequence '{sequence_id}' changed state during launch"
            )));
        }
        seq.status = SequenceStatus::Active;

        let mut report = LaunchReport::default();
        for sc in self.db.sequence_contacts(sequence_id, &[ContactStatus::NotStarted])? {
            match self.start_contact(&seq, &steps[0], &sc.contact_id, now)? {
                Placement::Queued => report.scheduled += 1,
                Placement::Deferred => report.deferred += 1,
                Placement::Skipped | Placement::Unchanged => report.skipped += 1,
            }
        }
        tracing::info!(
            "🚀 Sequence '{}' launched: {} scheduled, {} skipped, {} deferred",
            seq.name,
            report.scheduled,
            report.skipped,
            report.deferred
        );
        Ok(report)
    }

    /// active → paused. Queued jobs stay queued; claims are gated.
    pub fn pause(&self, sequence_id: &str) -> Result<()> {
        if !self.db.set_sequence_status(sequence_id, SequenceStatus::Paused, &[SequenceStatus::Active], None)? {
            let seq = self.db.require_sequence(sequence_id)?;
            return Err(CadenceError::Validation(format!(
                "sequence '{sequence_id}' is {} and cannot be paused",
                seq.status
            )));
        }
        tracing::info!("⏸️ Sequence {sequence_id} paused");
        Ok(())
    }

    /// paused → active. Pending jobs become claimable again.
    pub fn resume(&self, sequence_id: &str) -> Result<()> {
        if !self.db.set_sequence_status(sequence_id, SequenceStatus::Active, &[SequenceStatus::Paused], None)? {
            let seq = self.db.require_sequence(sequence_id)?;
            return Err(CadenceError::Validation(format!(
                "sequence '{sequence_id}' is {} and cannot be resumed",
                seq.status
            )));
        }
        tracing::info!("▶️ Sequence {sequence_id} resumed");
        Ok(())
    }

    /// Cancel pending work and return the sequence to draft. Contacts still
    /// in progress or in error go back to the first step; those who answered
    /// or left keep their state. Returns the number of contacts rewound.
    pub fn reset(&self, sequence_id: &str, now: DateTime<Utc>) -> Result<usize> {
        self.db.require_sequence(sequence_id)?;
        self.db.set_sequence_status(sequence_id, SequenceStatus::Draft, &[], None)?;
        let cancelled = self.jobs.cancel_for_sequence(sequence_id, now)?;
        let rewound = self.db.reset_sequence_contacts(sequence_id)?;
        tracing::info!("🔄 Sequence {sequence_id} reset: {rewound} contacts rewound, {cancelled} jobs cancelled");
        Ok(rewound)
    }

    /// Add a contact to a sequence. An active sequence schedules the first
    /// step right away. Returns false if the contact was already enrolled.
    pub fn add_contact(&self, sequence_id: &str, contact_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let seq = self.db.require_sequence(sequence_id)?;
        if self.db.contact(contact_id)?.is_none() {
            return Err(CadenceError::NotFound(format!("contact '{contact_id}'")));
        }
        if !self.db.insert_sequence_contact(sequence_id, contact_id)? {
            return Ok(false);
        }
        if seq.status == SequenceStatus::Active {
            let steps = self.db.steps(sequence_id)?;
            if let Some(first) = steps.first() {
                self.start_contact(&seq, first, contact_id, now)?;
            }
        }
        Ok(true)
    }

    /// Schedule the first step for a not-started contact. Ineligible contacts
    /// are moved to a terminal state instead.
    fn start_contact(&self, seq: &Sequence, first: &Step, contact_id: &str, now: DateTime<Utc>) -> Result<Placement> {
        let contact = self.db.contact(contact_id)?;
        match contact {
            Some(c) if c.is_eligible() => self.schedule(
                seq,
                first,
                contact_id,
                now,
                (ContactStatus::NotStarted, 0),
                first.priority,
            ),
            Some(c) if c.unsubscribed => {
                self.db.transition_contact(
                    &seq.id,
                    contact_id,
                    &[ContactStatus::NotStarted],
                    None,
                    &ContactTransition::to(ContactStatus::OptedOut),
                )?;
                Ok(Placement::Skipped)
            }
            _ => {
                let mut t = ContactTransition::to(ContactStatus::Error);
                t.last_error = Some("contact has no email address".into());
                self.db
                    .transition_contact(&seq.id, contact_id, &[ContactStatus::NotStarted], None, &t)?;
                Ok(Placement::Skipped)
            }
        }
    }

    /// Move a contact from `prior` (status, step) to `scheduled` for `step`
    /// and enqueue its job. If a claimed job still holds the contact's slot,
    /// the move is rolled back.
    fn schedule(
        &self,
        seq: &Sequence,
        step: &Step,
        contact_id: &str,
        from: DateTime<Utc>,
        prior: (ContactStatus, u32),
        priority: i32,
    ) -> Result<Placement> {
        let Some(mailbox_id) = seq.mailbox_id.as_deref() else {
            return Err(CadenceError::Validation(format!("sequence '{}' has no mailbox", seq.id)));
        };
        let (prior_status, prior_step) = prior;
        let at = self.next_eligible(seq, from, step.delay)?;
        if !self.db.transition_contact(
            &seq.id,
            contact_id,
            &[prior_status],
            Some(prior_step),
            &ContactTransition::scheduled(step.order_index, at),
        )? {
            tracing::debug!("⏭️ {contact_id}: state changed, step {} not scheduled", step.order_index);
            return Ok(Placement::Unchanged);
        }
        let job = NewJob::sequence_step(&seq.id, contact_id, step.order_index, mailbox_id, priority, at);
        match self.jobs.enqueue(job, from)? {
            EnqueueOutcome::Inserted { .. } => {
                tracing::debug!("📅 {contact_id}: step {} scheduled for {at}", step.order_index);
                Ok(Placement::Queued)
            }
            EnqueueOutcome::Rejected { active_job_id } => {
                let mut back = ContactTransition::to(prior_status);
                back.step_index = Some(prior_step);
                self.db.transition_contact(
                    &seq.id,
                    contact_id,
                    &[ContactStatus::Scheduled],
                    Some(step.order_index),
                    &back,
                )?;
                tracing::warn!(
                    "⏳ {contact_id}: job {active_job_id} still running, step {} deferred",
                    step.order_index
                );
                Ok(Placement::Deferred)
            }
        }
    }

    /// Queue work for contacts of an active sequence that were left without
    /// a job: not-started contacts deferred at launch, and sent contacts whose
    /// next step was never queued. Returns how many got a job.
    pub fn reschedule_stranded(&self, sequence_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let seq = self.db.require_sequence(sequence_id)?;
        if seq.status != SequenceStatus::Active {
            return Ok(0);
        }
        let steps = self.db.steps(sequence_id)?;
        let Some(first) = steps.first() else {
            return Ok(0);
        };
        let mut queued = 0;
        for sc in self
            .db
            .sequence_contacts(sequence_id, &[ContactStatus::NotStarted, ContactStatus::Sent])?
        {
            if self.jobs.pending_for_contact(sequence_id, &sc.contact_id)?.is_some() {
                continue;
            }
            let placed = match sc.status {
                ContactStatus::NotStarted => {
                    self.start_contact(&seq, first, &sc.contact_id, now)? == Placement::Queued
                }
                _ => self.advance(sequence_id, &sc.contact_id, now)? == ContactStatus::Scheduled,
            };
            if placed {
                queued += 1;
            }
        }
        if queued > 0 {
            tracing::info!("🧹 {sequence_id}: {queued} stranded contact(s) rescheduled");
        }
        Ok(queued)
    }

    /// After step k was sent: schedule step k+1, or complete the contact.
    pub fn advance(&self, sequence_id: &str, contact_id: &str, now: DateTime<Utc>) -> Result<ContactStatus> {
        let seq = self.db.require_sequence(sequence_id)?;
        let sc = self.db.require_sequence_contact(sequence_id, contact_id)?;
        if sc.status != ContactStatus::Sent {
            return Ok(sc.status);
        }
        let steps = self.db.steps(sequence_id)?;
        let next = sc.current_step_index + 1;
        match steps.get(next as usize) {
            Some(step) => {
                self.schedule(
                    &seq,
                    step,
                    contact_id,
                    now,
                    (ContactStatus::Sent, sc.current_step_index),
                    step.priority,
                )?;
            }
            None => {
                let mut t = ContactTransition::to(ContactStatus::Completed);
                t.processed_at = Some(now);
                if self
                    .db
                    .transition_contact(sequence_id, contact_id, &[ContactStatus::Sent], Some(sc.current_step_index), &t)?
                {
                    tracing::debug!("🏁 {contact_id} completed sequence {sequence_id}");
                    self.maybe_complete_sequence(sequence_id)?;
                }
            }
        }
        Ok(self.db.require_sequence_contact(sequence_id, contact_id)?.status)
    }

    /// Close an active sequence once no contact has work left. It completes
    /// if any contact finished or answered; if none did and some failed, it
    /// goes to error with the most recent contact error.
    fn maybe_complete_sequence(&self, sequence_id: &str) -> Result<()> {
        if !self.db.sequence_contacts(sequence_id, LIVE)?.is_empty() {
            return Ok(());
        }
        let reached = !self.db.sequence_contacts(sequence_id, SUCCEEDED)?.is_empty();
        if !reached && let Some(error) = self.db.latest_contact_error(sequence_id)? {
            if self.db.set_sequence_status(
                sequence_id,
                SequenceStatus::Error,
                &[SequenceStatus::Active],
                Some(&error),
            )? {
                tracing::error!("❌ Sequence {sequence_id} stopped, no contact left to send to: {error}");
            }
            return Ok(());
        }
        if self.db.set_sequence_status(
            sequence_id,
            SequenceStatus::Completed,
            &[SequenceStatus::Active],
            None,
        )? {
            tracing::info!("✅ Sequence {sequence_id} completed");
        }
        Ok(())
    }

    /// Move a contact's next step to now and put it at the front of the queue.
    pub fn send_now(&self, sequence_id: &str, contact_id: &str, now: DateTime<Utc>) -> Result<String> {
        let seq = self.db.require_sequence(sequence_id)?;
        if !matches!(seq.status, SequenceStatus::Active | SequenceStatus::Paused) {
            return Err(CadenceError::Validation(format!(
                "sequence '{sequence_id}' is {}",
                seq.status
            )));
        }
        let Some(mailbox_id) = seq.mailbox_id.clone() else {
            return Err(CadenceError::Validation(format!("sequence '{sequence_id}' has no mailbox")));
        };
        let sc = self.db.require_sequence_contact(sequence_id, contact_id)?;
        let step_index = match sc.status {
            ContactStatus::NotStarted | ContactStatus::Scheduled => sc.current_step_index,
            ContactStatus::Sent => sc.current_step_index + 1,
            other => {
                return Err(CadenceError::Validation(format!(
                    "contact '{contact_id}' is {other}"
                )));
            }
        };
        let steps = self.db.steps(sequence_id)?;
        if step_index as usize >= steps.len() {
            return Err(CadenceError::Validation(format!(
                "contact '{contact_id}' has no remaining steps"
            )));
        }
        if let Some(job) = self.jobs.pending_for_contact(sequence_id, contact_id)?
            && job.state == cadence_core::types::JobState::Active
        {
            return Err(CadenceError::JobConflict(format!(
                "contact '{contact_id}' is being sent by job {}",
                job.id
            )));
        }

        if !self.db.transition_contact(
            sequence_id,
            contact_id,
            &[sc.status],
            Some(sc.current_step_index),
            &ContactTransition::scheduled(step_index, now),
        )? {
            return Err(CadenceError::JobConflict(format!(
                "contact '{contact_id}' changed state, retry send-now"
            )));
        }
        let job = NewJob::sequence_step(sequence_id, contact_id, step_index, &mailbox_id, SEND_NOW_PRIORITY, now);
        match self.jobs.enqueue(job, now)? {
            EnqueueOutcome::Inserted { job_id, replaced } => {
                tracing::info!(
                    "⚡ Send-now {contact_id} step {step_index} (replaced {} job(s))",
                    replaced.len()
                );
                Ok(job_id)
            }
            EnqueueOutcome::Rejected { active_job_id } => Err(CadenceError::JobConflict(format!(
                "contact '{contact_id}' is being sent by job {active_job_id}"
            ))),
        }
    }

    /// Record a bounce and stop the contact permanently.
    pub fn on_bounce(&self, event: &EmailEvent, now: DateTime<Utc>) -> Result<bool> {
        self.stop(event, ContactStatus::Bounced, now)
    }

    /// Record a reply and stop the contact.
    pub fn on_reply(&self, event: &EmailEvent, now: DateTime<Utc>) -> Result<bool> {
        self.stop(event, ContactStatus::Replied, now)
    }

    /// Make the terminal transition, cancel pending jobs, then append the
    /// event. The event goes last so a failed transition is retried when the
    /// same message is replayed. Returns whether anything was new.
    fn stop(&self, event: &EmailEvent, status: ContactStatus, now: DateTime<Utc>) -> Result<bool> {
        let (seq, contact) = (&event.sequence_id, &event.contact_id);
        let mut t = ContactTransition::to(status);
        t.processed_at = Some(now);
        let changed = self.db.transition_contact(seq, contact, LIVE, None, &t)?;
        let cancelled = self.jobs.cancel_for_contact(seq, contact, now)?;
        let recorded = self.db.record_event(event)?;
        if changed {
            tracing::info!("🛑 {contact} → {status} in sequence {seq} ({cancelled} job(s) cancelled)");
            self.maybe_complete_sequence(seq)?;
        }
        Ok(changed || recorded)
    }

    /// Opt a contact out: terminal here and unsubscribed everywhere.
    pub fn opt_out(&self, sequence_id: &str, contact_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut expect = LIVE.to_vec();
        expect.extend([ContactStatus::Replied, ContactStatus::Interested]);
        let changed = self.db.transition_contact(
            sequence_id,
            contact_id,
            &expect,
            None,
            &ContactTransition::to(ContactStatus::OptedOut),
        )?;
        self.jobs.cancel_for_contact(sequence_id, contact_id, now)?;
        self.db.set_contact_unsubscribed(contact_id)?;
        if changed {
            tracing::info!("🚫 {contact_id} opted out of {sequence_id}");
        }
        Ok(changed)
    }

    /// A scheduled contact turned out to be unsubscribed when its step came due.
    pub fn skip_unsubscribed(&self, sequence_id: &str, contact_id: &str, step_index: u32) -> Result<bool> {
        let changed = self.db.transition_contact(
            sequence_id,
            contact_id,
            &[ContactStatus::Scheduled],
            Some(step_index),
            &ContactTransition::to(ContactStatus::OptedOut),
        )?;
        if changed {
            tracing::info!("🚫 {contact_id} unsubscribed, leaving {sequence_id}");
            self.maybe_complete_sequence(sequence_id)?;
        }
        Ok(changed)
    }

    /// replied → interested.
    pub fn mark_interested(&self, sequence_id: &str, contact_id: &str) -> Result<bool> {
        self.db.transition_contact(
            sequence_id,
            contact_id,
            &[ContactStatus::Replied],
            None,
            &ContactTransition::to(ContactStatus::Interested),
        )
    }

    /// Stop a contact on a fatal or exhausted send, keeping the error.
    pub fn mark_error(&self, sequence_id: &str, contact_id: &str, step_index: u32, error: &str) -> Result<bool> {
        let mut t = ContactTransition::to(ContactStatus::Error);
        t.last_error = Some(error.to_string());
        let changed = self.db.transition_contact(
            sequence_id,
            contact_id,
            &[ContactStatus::Scheduled],
            Some(step_index),
            &t,
        )?;
        if changed {
            tracing::error!("❌ {contact_id} in {sequence_id}: {error}");
            self.maybe_complete_sequence(sequence_id)?;
        }
        Ok(changed)
    }

    /// Move a whole sequence to error (e.g. revoked mailbox credentials).
    /// Its queued jobs stay gated until it is relaunched.
    pub fn fail_sequence(&self, sequence_id: &str, error: &str) -> Result<()> {
        self.db.set_sequence_status(
            sequence_id,
            SequenceStatus::Error,
            &[SequenceStatus::Active, SequenceStatus::Paused],
            Some(error),
        )?;
        tracing::error!("❌ Sequence {sequence_id} stopped: {error}");
        Ok(())
    }

    /// Queue a one-off send of a step to an arbitrary address.
    pub fn send_test_email(&self, sequence_id: &str, step_index: u32, to: &str, now: DateTime<Utc>) -> Result<String> {
        let seq = self.db.require_sequence(sequence_id)?;
        let Some(mailbox_id) = seq.mailbox_id else {
            return Err(CadenceError::Validation(format!("sequence '{sequence_id}' has no mailbox")));
        };
        let steps = self.db.steps(sequence_id)?;
        if step_index as usize >= steps.len() {
            return Err(CadenceError::NotFound(format!(
                "step {step_index} of sequence '{sequence_id}'"
            )));
        }
        if !to.contains('@') {
            return Err(CadenceError::Validation(format!("invalid address '{to}'")));
        }
        let job = NewJob {
            class: JobClass::EmailSend,
            sequence_id: None,
            contact_id: None,
            step_index: Some(step_index),
            mailbox_id,
            payload: serde_json::json!({
                "sequence_id": sequence_id,
                "step_index": step_index,
                "to": to,
            }),
            priority: SEND_NOW_PRIORITY,
            run_at: now,
        };
        match self.jobs.enqueue(job, now)? {
            EnqueueOutcome::Inserted { job_id, .. } => Ok(job_id),
            EnqueueOutcome::Rejected { active_job_id } => Err(CadenceError::JobConflict(active_job_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{machine, seed_sequence};
    use cadence_core::types::{BusinessHours, Contact, EmailEventType, JobState};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        // Monday
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn bounce(seq: &str, contact: &str) -> EmailEvent {
        EmailEvent {
            event_type: EmailEventType::Bounced,
            timestamp: t0(),
            sequence_id: seq.into(),
            contact_id: contact.into(),
            step_index: 0,
            message_id: Some("dsn-1@mx.example.com".into()),
            thread_id: None,
        }
    }

    fn live_jobs(sm: &SequenceStateMachine, seq: &str, contact: &str) -> usize {
        sm.jobs()
            .jobs_for_contact(seq, contact)
            .unwrap()
            .iter()
            .filter(|j| !j.state.is_terminal())
            .count()
    }

    #[test]
    fn test_launch_preconditions() {
        let sm = machine();
        let db = sm.db().clone();

        let mut seq = Sequence::new("s1", "No steps");
        seq.mailbox_id = Some("mb-1".into());
        db.save_sequence(&seq).unwrap();
        assert!(matches!(sm.launch("s1", t0()), Err(CadenceError::Validation(_))));

        seed_sequence(&db, "s2", 2, &["c1"]);
        let mut seq = db.require_sequence("s2").unwrap();
        seq.mailbox_id = None;
        db.save_sequence(&seq).unwrap();
        assert!(sm.launch("s2", t0()).is_err());

        seq.mailbox_id = Some("mb-1".into());
        seq.schedule_type = ScheduleType::Business;
        db.save_sequence(&seq).unwrap();
        assert!(sm.launch("s2", t0()).is_err());

        seed_sequence(&db, "s3", 1, &[]);
        assert!(sm.launch("s3", t0()).is_err());
        assert_eq!(db.require_sequence("s3").unwrap().status, SequenceStatus::Draft);
    }

    #[test]
    fn test_launch_schedules_first_step() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 2, &["c1", "c2"]);
        let mut gone = Contact::new("c3", "gone@example.com");
        gone.unsubscribed = true;
        db.save_contact(&gone).unwrap();
        db.insert_sequence_contact("s1", "c3").unwrap();

        let report = sm.launch("s1", t0()).unwrap();
        assert_eq!(
            report,
            LaunchReport {
                scheduled: 2,
                skipped: 1,
                deferred: 0
            }
        );
        assert_eq!(db.require_sequence("s1").unwrap().status, SequenceStatus::Active);

        let sc = db.require_sequence_contact("s1", "c1").unwrap();
        assert_eq!(sc.status, ContactStatus::Scheduled);
        assert_eq!(sc.next_scheduled_at, Some(t0()));
        assert_eq!(live_jobs(&sm, "s1", "c1"), 1);
        assert_eq!(
            db.require_sequence_contact("s1", "c3").unwrap().status,
            ContactStatus::OptedOut
        );
        // Launching twice is refused.
        assert!(sm.launch("s1", t0()).is_err());
    }

    #[test]
    fn test_business_hours_launch_snaps_to_window() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 1, &["c1"]);
        let mut seq = db.require_sequence("s1").unwrap();
        seq.schedule_type = ScheduleType::Business;
        seq.business_hours = Some(BusinessHours::weekdays("bh1", "UTC"));
        db.save_sequence(&seq).unwrap();

        // Saturday morning → Monday 09:00.
        let saturday = Utc.with_ymd_and_hms(2026, 2, 28, 8, 0, 0).unwrap();
        sm.launch("s1", saturday).unwrap();
        let sc = db.require_sequence_contact("s1", "c1").unwrap();
        assert_eq!(
            sc.next_scheduled_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_advance_to_next_step_then_complete() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 2, &["c1"]);
        sm.launch("s1", t0()).unwrap();

        // Simulate the dispatcher for step 0.
        let job = sm.jobs().dequeue("w1", t0()).unwrap().unwrap();
        let mut sent = ContactTransition::to(ContactStatus::Sent);
        sent.thread_id = Some("thread-1".into());
        assert!(db.transition_contact("s1", "c1", &[ContactStatus::Scheduled], Some(0), &sent).unwrap());
        sm.jobs().complete(&job.id, "w1", t0()).unwrap();

        assert_eq!(sm.advance("s1", "c1", t0()).unwrap(), ContactStatus::Scheduled);
        let sc = db.require_sequence_contact("s1", "c1").unwrap();
        assert_eq!(sc.current_step_index, 1);
        // seed steps after the first wait two days
        assert_eq!(sc.next_scheduled_at, Some(t0() + Duration::days(2)));
        assert_eq!(sc.thread_id.as_deref(), Some("thread-1"));

        let job = sm.jobs().dequeue("w1", t0() + Duration::days(2)).unwrap().unwrap();
        db.transition_contact("s1", "c1", &[ContactStatus::Scheduled], Some(1), &ContactTransition::to(ContactStatus::Sent))
            .unwrap();
        sm.jobs().complete(&job.id, "w1", t0()).unwrap();
        assert_eq!(sm.advance("s1", "c1", t0()).unwrap(), ContactStatus::Completed);
        assert_eq!(db.require_sequence("s1").unwrap().status, SequenceStatus::Completed);
    }

    #[test]
    fn test_test_mode_reads_days_as_minutes() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 1, &["c1"]);
        let mut seq = db.require_sequence("s1").unwrap();
        seq.test_mode = true;
        seq.schedule_type = ScheduleType::Business;
        seq.business_hours = Some(BusinessHours::weekdays("bh1", "UTC"));
        let at = sm
            .next_eligible(&seq, t0(), Delay::new(3, cadence_core::types::DelayUnit::Days))
            .unwrap();
        assert_eq!(at, t0() + Duration::minutes(3));
    }

    #[test]
    fn test_bounce_cancels_waiting_job() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 3, &["x"]);
        sm.launch("s1", t0()).unwrap();
        assert_eq!(live_jobs(&sm, "s1", "x"), 1);

        assert!(sm.on_bounce(&bounce("s1", "x"), t0()).unwrap());
        let sc = db.require_sequence_contact("s1", "x").unwrap();
        assert_eq!(sc.status, ContactStatus::Bounced);
        assert!(sc.next_scheduled_at.is_none());
        assert_eq!(live_jobs(&sm, "s1", "x"), 0);
        let jobs = sm.jobs().jobs_for_contact("s1", "x").unwrap();
        assert_eq!(jobs[0].state, JobState::Cancelled);

        // Nothing can schedule X again.
        assert_eq!(sm.advance("s1", "x", t0()).unwrap(), ContactStatus::Bounced);
        assert!(sm.send_now("s1", "x", t0()).is_err());
        assert_eq!(live_jobs(&sm, "s1", "x"), 0);
        // Replaying the event is a no-op.
        assert!(!sm.on_bounce(&bounce("s1", "x"), t0()).unwrap());
    }

    #[test]
    fn test_send_now_replaces_delayed_job() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 1, &["c1"]);
        let mut seq = db.require_sequence("s1").unwrap();
        seq.schedule_type = ScheduleType::Business;
        seq.business_hours = Some(BusinessHours::weekdays("bh1", "UTC"));
        db.save_sequence(&seq).unwrap();
        let saturday = Utc.with_ymd_and_hms(2026, 2, 28, 8, 0, 0).unwrap();
        sm.launch("s1", saturday).unwrap();
        assert!(sm.jobs().dequeue("w1", saturday).unwrap().is_none());

        let job_id = sm.send_now("s1", "c1", saturday).unwrap();
        let sc = db.require_sequence_contact("s1", "c1").unwrap();
        assert_eq!(sc.next_scheduled_at, Some(saturday));
        assert_eq!(live_jobs(&sm, "s1", "c1"), 1);
        let claimed = sm.jobs().dequeue("w1", saturday).unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.priority, SEND_NOW_PRIORITY);

        // While claimed, send-now is rejected.
        assert!(matches!(
            sm.send_now("s1", "c1", saturday),
            Err(CadenceError::JobConflict(_))
        ));
    }

    #[test]
    fn test_pause_gates_and_resume_releases() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 1, &["c1"]);
        sm.launch("s1", t0()).unwrap();
        sm.pause("s1").unwrap();
        assert!(sm.pause("s1").is_err());
        assert!(sm.jobs().dequeue("w1", t0()).unwrap().is_none());
        sm.resume("s1").unwrap();
        assert!(sm.jobs().dequeue("w1", t0()).unwrap().is_some());
    }

    #[test]
    fn test_reset_keeps_permanent_contacts() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 2, &["a", "b", "r", "i"]);
        sm.launch("s1", t0()).unwrap();
        sm.on_bounce(&bounce("s1", "b"), t0()).unwrap();
        for c in ["r", "i"] {
            let reply = EmailEvent {
                event_type: EmailEventType::Replied,
                message_id: Some(format!("{c}-reply@example.com")),
                ..bounce("s1", c)
            };
            sm.on_reply(&reply, t0()).unwrap();
        }
        sm.mark_interested("s1", "i").unwrap();

        assert_eq!(sm.reset("s1", t0()).unwrap(), 1);
        assert_eq!(db.require_sequence("s1").unwrap().status, SequenceStatus::Draft);
        assert_eq!(db.require_sequence_contact("s1", "a").unwrap().status, ContactStatus::NotStarted);
        assert_eq!(db.require_sequence_contact("s1", "b").unwrap().status, ContactStatus::Bounced);
        assert_eq!(db.require_sequence_contact("s1", "r").unwrap().status, ContactStatus::Replied);
        assert_eq!(db.require_sequence_contact("s1", "i").unwrap().status, ContactStatus::Interested);
        assert_eq!(live_jobs(&sm, "s1", "a"), 0);

        // Only the contact that never answered is emailed again.
        let report = sm.launch("s1", t0()).unwrap();
        assert_eq!(report.scheduled, 1);
        assert_eq!(live_jobs(&sm, "s1", "r"), 0);
        assert_eq!(live_jobs(&sm, "s1", "i"), 0);
    }

    #[test]
    fn test_relaunch_defers_contact_with_claimed_job() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 2, &["a", "b", "c"]);
        sm.launch("s1", t0()).unwrap();
        let claimed = sm.jobs().dequeue("w1", t0()).unwrap().unwrap();
        let held = claimed.contact_id.clone().unwrap();

        sm.reset("s1", t0()).unwrap();
        let report = sm.launch("s1", t0()).unwrap();
        assert_eq!(
            report,
            LaunchReport {
                scheduled: 2,
                skipped: 0,
                deferred: 1
            }
        );
        assert_eq!(db.require_sequence("s1").unwrap().status, SequenceStatus::Active);
        for c in ["a", "b", "c"].into_iter().filter(|c| *c != held) {
            assert_eq!(db.require_sequence_contact("s1", c).unwrap().status, ContactStatus::Scheduled);
            assert_eq!(live_jobs(&sm, "s1", c), 1);
        }
        // The held contact is rolled back, not left scheduled without a job.
        let sc = db.require_sequence_contact("s1", &held).unwrap();
        assert_eq!(sc.status, ContactStatus::NotStarted);
        assert!(sc.next_scheduled_at.is_none());

        // Nothing to do while the old job is still claimed.
        assert_eq!(sm.reschedule_stranded("s1", t0()).unwrap(), 0);
        sm.jobs().complete(&claimed.id, "w1", t0()).unwrap();
        assert_eq!(sm.reschedule_stranded("s1", t0()).unwrap(), 1);
        assert_eq!(db.require_sequence_contact("s1", &held).unwrap().status, ContactStatus::Scheduled);
        assert_eq!(live_jobs(&sm, "s1", &held), 1);
    }

    #[test]
    fn test_reschedule_stranded_advances_sent_contact() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 2, &["c1"]);
        sm.launch("s1", t0()).unwrap();
        let job = sm.jobs().dequeue("w1", t0()).unwrap().unwrap();
        db.transition_contact("s1", "c1", &[ContactStatus::Scheduled], Some(0), &ContactTransition::to(ContactStatus::Sent))
            .unwrap();
        sm.jobs().complete(&job.id, "w1", t0()).unwrap();

        // The worker died before advancing.
        assert_eq!(sm.reschedule_stranded("s1", t0()).unwrap(), 1);
        let sc = db.require_sequence_contact("s1", "c1").unwrap();
        assert_eq!(sc.status, ContactStatus::Scheduled);
        assert_eq!(sc.current_step_index, 1);
        assert_eq!(sm.reschedule_stranded("s1", t0()).unwrap(), 0);
    }

    #[test]
    fn test_bounce_replays_after_failed_transition() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 2, &["x"]);
        sm.launch("s1", t0()).unwrap();

        db.conn()
            .unwrap()
            .execute_batch(
                "CREATE TEMP TRIGGER block_contact_updates BEFORE UPDATE ON sequence_contacts
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();
        assert!(sm.on_bounce(&bounce("s1", "x"), t0()).is_err());
        assert!(db.events_for_contact("s1", "x").unwrap().is_empty());
        db.conn().unwrap().execute_batch("DROP TRIGGER block_contact_updates;").unwrap();

        // The same bounce seen again still stops the contact.
        assert!(sm.on_bounce(&bounce("s1", "x"), t0()).unwrap());
        assert_eq!(db.require_sequence_contact("s1", "x").unwrap().status, ContactStatus::Bounced);
        assert_eq!(live_jobs(&sm, "s1", "x"), 0);
        assert_eq!(db.events_for_contact("s1", "x").unwrap().len(), 1);
    }

    #[test]
    fn test_opt_out_and_interested() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 2, &["a", "b"]);
        sm.launch("s1", t0()).unwrap();

        assert!(sm.opt_out("s1", "a", t0()).unwrap());
        assert_eq!(live_jobs(&sm, "s1", "a"), 0);
        assert!(db.contact("a").unwrap().unwrap().unsubscribed);

        assert!(!sm.mark_interested("s1", "b").unwrap());
        let reply = EmailEvent {
            event_type: EmailEventType::Replied,
            ..bounce("s1", "b")
        };
        sm.on_reply(&reply, t0()).unwrap();
        assert!(sm.mark_interested("s1", "b").unwrap());
        assert_eq!(db.require_sequence_contact("s1", "b").unwrap().status, ContactStatus::Interested);
    }

    #[test]
    fn test_add_contact_to_active_sequence() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 1, &["a"]);
        sm.launch("s1", t0()).unwrap();
        db.save_contact(&Contact::new("late", "late@example.com")).unwrap();

        assert!(sm.add_contact("s1", "late", t0()).unwrap());
        assert!(!sm.add_contact("s1", "late", t0()).unwrap());
        assert_eq!(
            db.require_sequence_contact("s1", "late").unwrap().status,
            ContactStatus::Scheduled
        );
        assert!(matches!(sm.add_contact("s1", "nobody", t0()), Err(CadenceError::NotFound(_))));
    }

    #[test]
    fn test_send_test_email_job_is_not_gated() {
        let sm = machine();
        let db = sm.db().clone();
        seed_sequence(&db, "s1", 2, &["a"]);
        // Draft sequence: test sends still run.
        let id = sm.send_test_email("s1", 1, "me@example.com", t0()).unwrap();
        let job = sm.jobs().dequeue("w1", t0()).unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.class, JobClass::EmailSend);
        assert!(sm.send_test_email("s1", 5, "me@example.com", t0()).is_err());
        assert!(sm.send_test_email("s1", 0, "not-an-address", t0()).is_err());
    }
}
