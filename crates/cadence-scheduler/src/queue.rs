//! JobStore — durable delayed-job queue on top of `CadenceDb`.
//!
//! ```text
//!   enqueue ──► delayed ──(run_at <= now)──► waiting ──claim──► active
//!                  ▲                                               │
//!                  └────────── fail (retry left) ◄─────────────────┤
//!                                                                  ├─► completed
//!   active + lease expired ──► stalled ──► waiting                 └─► failed
//! ```
//!
//! Claims run inside `BEGIN IMMEDIATE`, so two workers (threads or
//! processes) can never hold the same job. A partial unique index keeps at
//! most one non-terminal job per (sequence, contact).

use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::{QueueConfig, RetryPolicy, WorkerConfig};
use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{Job, JobClass, JobState, NewJob};
use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};

use crate::persistence::{CadenceDb, db_err, from_ms, parse_col, to_ms};

/// Result of an enqueue under the replace-or-reject policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Inserted; any pending jobs for the same contact were cancelled.
    Inserted { job_id: String, replaced: Vec<String> },
    /// An active job for the same contact holds the slot.
    Rejected { active_job_id: String },
}

/// Result of failing a job.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Re-queued as delayed.
    Retrying { attempt: u32, delay: Duration },
    /// No attempts left, or failed as fatal.
    Failed { attempts: u32 },
    /// The caller no longer owns the job (stalled and reclaimed, or cancelled).
    LeaseLost,
}

/// Outcome of a stalled-job sweep.
#[derive(Debug, Clone, Default)]
pub struct StalledSweep {
    pub requeued: Vec<String>,
    /// Jobs failed for exceeding the stall limit.
    pub failed: Vec<Job>,
}

/// Queue counts by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

pub struct JobStore {
    db: Arc<CadenceDb>,
    policies: QueueConfig,
    lease: Duration,
    max_stalled: u32,
}

impl JobStore {
    pub fn new(db: Arc<CadenceDb>, policies: QueueConfig, worker: &WorkerConfig) -> Self {
        Self {
            db,
            policies,
            lease: Duration::from_secs(worker.lease_secs),
            max_stalled: worker.max_stalled_count,
        }
    }

    pub fn policy(&self, class: JobClass) -> &RetryPolicy {
        match class {
            JobClass::SequenceStep => &self.policies.sequence_step,
            JobClass::EmailSend => &self.policies.email_send,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Insert a job. Pending (waiting/delayed/stalled) jobs for the same
    /// sequence contact are cancelled first; an active one rejects the insert.
    pub fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        let max_attempts = self.policy(job.class).max_attempts;
        let id = uuid::Uuid::new_v4().to_string();
        let state = if job.run_at <= now {
            JobState::Waiting
        } else {
            JobState::Delayed
        };

        let mut conn = self.db.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin enqueue"))?;

        let mut replaced = Vec::new();
        if let (Some(seq), Some(contact)) = (&job.sequence_id, &job.contact_id) {
            let active: Option<String> = tx
                .query_row(
                    "SELECT id FROM jobs WHERE sequence_id = ?1 AND contact_id = ?2 AND state = 'active'",
                    [seq, contact],
                    |r| r.get(0),
                )
                .optional()
                .map_err(db_err("Check active job"))?;
            if let Some(active_job_id) = active {
                return Ok(EnqueueOutcome::Rejected { active_job_id });
            }

            {
                let mut stmt = tx
                    .prepare(
                        "SELECT id FROM jobs WHERE sequence_id = ?1 AND contact_id = ?2
                         AND state IN ('waiting', 'delayed', 'stalled')",
                    )
                    .map_err(db_err("Prepare pending jobs"))?;
                let rows = stmt
                    .query_map([seq, contact], |r| r.get::<_, String>(0))
                    .map_err(db_err("Query pending jobs"))?;
                for row in rows {
                    replaced.push(row.map_err(db_err("Read pending job"))?);
                }
            }
            tx.execute(
                "UPDATE jobs SET state = 'cancelled', updated_at = ?3
                 WHERE sequence_id = ?1 AND contact_id = ?2 AND state IN ('waiting', 'delayed', 'stalled')",
                params![seq, contact, to_ms(now)],
            )
            .map_err(db_err("Cancel pending jobs"))?;
        }

        tx.execute(
            "INSERT INTO jobs
             (id, class, sequence_id, contact_id, step_index, mailbox_id, payload, priority,
              attempts, max_attempts, run_at, state, stalled_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?11, 0, ?12, ?12)",
            params![
                id,
                job.class.as_str(),
                job.sequence_id,
                job.contact_id,
                job.step_index,
                job.mailbox_id,
                job.payload.to_string(),
                job.priority,
                max_attempts,
                to_ms(job.run_at),
                state.as_str(),
                to_ms(now),
            ],
        )
        .map_err(db_err("Insert job"))?;
        tx.commit().map_err(db_err("Commit enqueue"))?;

        if !replaced.is_empty() {
            tracing::debug!("♻️ Job {id} replaced {} pending job(s)", replaced.len());
        }
        Ok(EnqueueOutcome::Inserted {
            job_id: id,
            replaced,
        })
    }

    /// Claim the most urgent runnable job for `worker_id`.
    ///
    /// Due delayed jobs are promoted first. Jobs of sequences that are not
    /// active stay queued until the sequence resumes.
    pub fn dequeue(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let lease_until = now + chrono::Duration::from_std(self.lease).unwrap_or_default();
        let mut conn = self.db.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin claim"))?;

        tx.execute(
            "UPDATE jobs SET state = 'waiting', updated_at = ?1 WHERE state = 'delayed' AND run_at <= ?1",
            [to_ms(now)],
        )
        .map_err(db_err("Promote delayed"))?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT j.id FROM jobs j LEFT JOIN sequences s ON s.id = j.sequence_id
                 WHERE j.state = 'waiting' AND j.run_at <= ?1
                   AND (j.sequence_id IS NULL OR s.status = 'active')
                 ORDER BY j.priority ASC, j.run_at ASC, j.created_at ASC
                 LIMIT 1",
                [to_ms(now)],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err("Select claimable"))?;

        let Some(id) = candidate else {
            tx.commit().map_err(db_err("Commit claim"))?;
            return Ok(None);
        };

        let claimed = tx
            .execute(
                "UPDATE jobs SET state = 'active', owner = ?2, lease_expires_at = ?3,
                    attempts = attempts + 1, updated_at = ?4
                 WHERE id = ?1 AND state = 'waiting'",
                params![id, worker_id, to_ms(lease_until), to_ms(now)],
            )
            .map_err(db_err("Claim job"))?;
        let job = if claimed == 1 {
            tx.query_row(&format!("{JOB_SELECT} WHERE id = ?1"), [&id], job_row)
                .optional()
                .map_err(db_err("Load claimed job"))?
        } else {
            None
        };
        tx.commit().map_err(db_err("Commit claim"))?;
        Ok(job)
    }

    /// Push the lease of a job the worker still holds.
    pub fn extend_lease(&self, job_id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let until = now + chrono::Duration::from_std(self.lease).unwrap_or_default();
        let changed = self
            .db
            .conn()?
            .execute(
                "UPDATE jobs SET lease_expires_at = ?3, updated_at = ?4
                 WHERE id = ?1 AND owner = ?2 AND state = 'active'",
                params![job_id, worker_id, to_ms(until), to_ms(now)],
            )
            .map_err(db_err("Extend lease"))?;
        Ok(changed > 0)
    }

    /// Hand an owned job back to the queue without spending an attempt.
    pub fn release(&self, job_id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .db
            .conn()?
            .execute(
                "UPDATE jobs SET state = 'waiting', owner = NULL, lease_expires_at = NULL,
                    attempts = MAX(attempts - 1, 0), updated_at = ?3
                 WHERE id = ?1 AND owner = ?2 AND state = 'active'",
                params![job_id, worker_id, to_ms(now)],
            )
            .map_err(db_err("Release job"))?;
        Ok(changed > 0)
    }

    /// Mark an owned job completed. Returns false if the lease was lost.
    pub fn complete(&self, job_id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .db
            .conn()?
            .execute(
                "UPDATE jobs SET state = 'completed', owner = NULL, lease_expires_at = NULL, updated_at = ?3
                 WHERE id = ?1 AND owner = ?2 AND state = 'active'",
                params![job_id, worker_id, to_ms(now)],
            )
            .map_err(db_err("Complete job"))?;
        if changed == 0 {
            tracing::warn!("⚠️ Job {job_id}: lease lost before completion");
        }
        Ok(changed > 0)
    }

    /// Record a failed attempt. Retries with backoff while attempts remain.
    pub fn fail(&self, job_id: &str, worker_id: &str, error: &str, now: DateTime<Utc>) -> Result<FailOutcome> {
        self.fail_inner(job_id, worker_id, error, now, true)
    }

    /// Fail an owned job without retrying.
    pub fn fail_fatal(&self, job_id: &str, worker_id: &str, error: &str, now: DateTime<Utc>) -> Result<FailOutcome> {
        self.fail_inner(job_id, worker_id, error, now, false)
    }

    fn fail_inner(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
        retry: bool,
    ) -> Result<FailOutcome> {
        let mut conn = self.db.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin fail"))?;
        let row: Option<(String, u32, u32, String, Option<String>)> = tx
            .query_row(
                "SELECT class, attempts, max_attempts, state, owner FROM jobs WHERE id = ?1",
                [job_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()
            .map_err(db_err("Load job"))?;
        let Some((class, attempts, max_attempts, state, owner)) = row else {
            return Err(CadenceError::NotFound(format!("job '{job_id}'")));
        };
        if state != JobState::Active.as_str() || owner.as_deref() != Some(worker_id) {
            return Ok(FailOutcome::LeaseLost);
        }
        let class: JobClass = class.parse()?;

        let outcome = if retry && attempts < max_attempts {
            let policy = self.policy(class);
            let delay = Duration::from_millis(jittered(policy, attempts));
            let run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            tx.execute(
                "UPDATE jobs SET state = 'delayed', run_at = ?2, owner = NULL, lease_expires_at = NULL,
                    last_error = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![job_id, to_ms(run_at), error, to_ms(now)],
            )
            .map_err(db_err("Delay job"))?;
            FailOutcome::Retrying {
                attempt: attempts,
                delay,
            }
        } else {
            tx.execute(
                "UPDATE jobs SET state = 'failed', owner = NULL, lease_expires_at = NULL,
                    last_error = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![job_id, error, to_ms(now)],
            )
            .map_err(db_err("Fail job"))?;
            FailOutcome::Failed { attempts }
        };
        tx.commit().map_err(db_err("Commit fail"))?;
        Ok(outcome)
    }

    /// Cancel pending jobs of one sequence contact. Active jobs are left to
    /// their worker, which re-checks state before acting.
    pub fn cancel_for_contact(&self, sequence_id: &str, contact_id: &str, now: DateTime<Utc>) -> Result<usize> {
        self.db
            .conn()?
            .execute(
                "UPDATE jobs SET state = 'cancelled', updated_at = ?3
                 WHERE sequence_id = ?1 AND contact_id = ?2 AND state IN ('waiting', 'delayed', 'stalled')",
                params![sequence_id, contact_id, to_ms(now)],
            )
            .map_err(db_err("Cancel contact jobs"))
    }

    /// Cancel every pending job of a sequence.
    pub fn cancel_for_sequence(&self, sequence_id: &str, now: DateTime<Utc>) -> Result<usize> {
        self.db
            .conn()?
            .execute(
                "UPDATE jobs SET state = 'cancelled', updated_at = ?2
                 WHERE sequence_id = ?1 AND state IN ('waiting', 'delayed', 'stalled')",
                params![sequence_id, to_ms(now)],
            )
            .map_err(db_err("Cancel sequence jobs"))
    }

    /// Return jobs whose lease expired to the queue. Jobs that stalled more
    /// than `max_stalled_count` times are failed.
    pub fn recover_stalled(&self, now: DateTime<Utc>) -> Result<StalledSweep> {
        let mut conn = self.db.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin sweep"))?;
        tx.execute(
            "UPDATE jobs SET state = 'stalled', owner = NULL, lease_expires_at = NULL,
                stalled_count = stalled_count + 1, updated_at = ?1
             WHERE state = 'active' AND lease_expires_at < ?1",
            [to_ms(now)],
        )
        .map_err(db_err("Mark stalled"))?;

        let stalled: Vec<Job> = {
            let mut stmt = tx
                .prepare(&format!("{JOB_SELECT} WHERE state = 'stalled'"))
                .map_err(db_err("Prepare stalled"))?;
            let rows = stmt.query_map([], job_row).map_err(db_err("Query stalled"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("Read stalled"))?
        };

        let mut sweep = StalledSweep::default();
        for mut job in stalled {
            if job.stalled_count > self.max_stalled {
                tx.execute(
                    "UPDATE jobs SET state = 'failed', last_error = ?2, updated_at = ?3 WHERE id = ?1",
                    params![job.id, "job stalled more than allowable limit", to_ms(now)],
                )
                .map_err(db_err("Fail stalled"))?;
                job.state = JobState::Failed;
                job.last_error = Some("job stalled more than allowable limit".into());
                sweep.failed.push(job);
            } else {
                tx.execute(
                    "UPDATE jobs SET state = 'waiting', updated_at = ?2 WHERE id = ?1",
                    params![job.id, to_ms(now)],
                )
                .map_err(db_err("Requeue stalled"))?;
                sweep.requeued.push(job.id);
            }
        }
        tx.commit().map_err(db_err("Commit sweep"))?;

        if !sweep.requeued.is_empty() || !sweep.failed.is_empty() {
            tracing::warn!(
                "🧟 Stalled sweep: {} requeued, {} failed",
                sweep.requeued.len(),
                sweep.failed.len()
            );
        }
        Ok(sweep)
    }

    pub fn job(&self, job_id: &str) -> Result<Option<Job>> {
        self.db
            .conn()?
            .query_row(&format!("{JOB_SELECT} WHERE id = ?1"), [job_id], job_row)
            .optional()
            .map_err(db_err("Load job"))
    }

    /// All jobs (any state) of one sequence contact, oldest first.
    pub fn jobs_for_contact(&self, sequence_id: &str, contact_id: &str) -> Result<Vec<Job>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{JOB_SELECT} WHERE sequence_id = ?1 AND contact_id = ?2 ORDER BY created_at, rowid"
            ))
            .map_err(db_err("Prepare contact jobs"))?;
        let rows = stmt
            .query_map([sequence_id, contact_id], job_row)
            .map_err(db_err("Query contact jobs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read contact jobs"))
    }

    /// The non-terminal job of a sequence contact, if any.
    pub fn pending_for_contact(&self, sequence_id: &str, contact_id: &str) -> Result<Option<Job>> {
        self.db
            .conn()?
            .query_row(
                &format!(
                    "{JOB_SELECT} WHERE sequence_id = ?1 AND contact_id = ?2
                     AND state IN ('waiting', 'delayed', 'active', 'stalled')"
                ),
                [sequence_id, contact_id],
                job_row,
            )
            .optional()
            .map_err(db_err("Load pending job"))
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")
            .map_err(db_err("Prepare stats"))?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map_err(db_err("Query stats"))?;
        let mut stats = QueueStats::default();
        for row in rows {
            let (state, n) = row.map_err(db_err("Read stats"))?;
            let n = n as u64;
            match state.as_str() {
                "waiting" | "stalled" => stats.waiting += n,
                "delayed" => stats.delayed += n,
                "active" => stats.active += n,
                "completed" => stats.completed += n,
                "failed" => stats.failed += n,
                "cancelled" => stats.cancelled += n,
                _ => {}
            }
        }
        Ok(stats)
    }
}

/// Backoff delay after `attempts` failures with ±jitter, never above the cap.
fn jittered(policy: &RetryPolicy, attempts: u32) -> u64 {
    let base = policy.delay_ms(attempts);
    if policy.jitter <= 0.0 {
        return base;
    }
    let spread = rand::thread_rng().gen_range(-policy.jitter..=policy.jitter);
    let delay = (base as f64 * (1.0 + spread)).max(0.0) as u64;
    delay.min(policy.max_delay_ms)
}

const JOB_SELECT: &str = "SELECT id, class, sequence_id, contact_id, step_index, mailbox_id, payload,
        priority, attempts, max_attempts, run_at, state, owner, lease_expires_at, stalled_count,
        last_error, created_at FROM jobs";

fn job_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let payload: String = row.get(6)?;
    Ok(Job {
        id: row.get(0)?,
        class: parse_col(row, 1)?,
        sequence_id: row.get(2)?,
        contact_id: row.get(3)?,
        step_index: row.get(4)?,
        mailbox_id: row.get(5)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        priority: row.get(7)?,
        attempts: row.get(8)?,
        max_attempts: row.get(9)?,
        run_at: from_ms(row.get(10)?),
        state: parse_col(row, 11)?,
        owner: row.get(12)?,
        lease_expires_at: row.get::<_, Option<i64>>(13)?.map(from_ms),
        stalled_count: row.get(14)?,
        last_error: row.get(15)?,
        created_at: from_ms(row.get(16)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_sequence, test_store};
    use cadence_core::types::SequenceStatus;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn active(db: &CadenceDb, seq: &str) {
        db.set_sequence_status(seq, SequenceStatus::Active, &[], None).unwrap();
    }

    #[test]
    fn test_delayed_job_not_claimable_early() {
        let (db, store) = test_store();
        seed_sequence(&db, "s1", 1, &["c1"]);
        active(&db, "s1");
        let run_at = t0() + chrono::Duration::minutes(5);
        store
            .enqueue(NewJob::sequence_step("s1", "c1", 0, "mb-1", 5, run_at), t0())
            .unwrap();

        assert!(store.dequeue("w1", t0()).unwrap().is_none());
        let job = store.dequeue("w1", run_at).unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.owner.as_deref(), Some("w1"));
    }

    #[test]
    fn test_priority_then_run_at_order() {
        let (db, store) = test_store();
        seed_sequence(&db, "s1", 1, &["c1", "c2", "c3"]);
        active(&db, "s1");
        store.enqueue(NewJob::sequence_step("s1", "c1", 0, "mb-1", 5, t0()), t0()).unwrap();
        store
            .enqueue(NewJob::sequence_step("s1", "c2", 0, "mb-1", 5, t0() - chrono::Duration::minutes(1)), t0())
            .unwrap();
        store.enqueue(NewJob::sequence_step("s1", "c3", 0, "mb-1", 0, t0()), t0()).unwrap();

        let order: Vec<String> = (0..3)
            .map(|_| store.dequeue("w", t0()).unwrap().unwrap().contact_id.unwrap())
            .collect();
        assert_eq!(order, vec!["c3", "c2", "c1"]);
    }

    #[test]
    fn test_paused_sequence_jobs_are_held() {
        let (db, store) = test_store();
        seed_sequence(&db, "s1", 1, &["c1"]);
        active(&db, "s1");
        store.enqueue(NewJob::sequence_step("s1", "c1", 0, "mb-1", 5, t0()), t0()).unwrap();
        db.set_sequence_status("s1", SequenceStatus::Paused, &[], None).unwrap();
        assert!(store.dequeue("w1", t0()).unwrap().is_none());
        active(&db, "s1");
        assert!(store.dequeue("w1", t0()).unwrap().is_some());
    }

    #[test]
    fn test_concurrent_claim_exactly_once() {
        let (db, store) = test_store();
        seed_sequence(&db, "s1", 1, &["c1"]);
        active(&db, "s1");
        store.enqueue(NewJob::sequence_step("s1", "c1", 0, "mb-1", 5, t0()), t0()).unwrap();

        let store = Arc::new(store);
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.dequeue(&format!("w{i}"), t0()).unwrap()
                })
            })
            .collect();
        let claimed: Vec<Job> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(claimed.len(), 1);
    }

    #[test]
    fn test_replace_pending_and_reject_active() {
        let (db, store) = test_store();
        seed_sequence(&db, "s1", 2, &["c1"]);
        active(&db, "s1");
        let later = t0() + chrono::Duration::days(1);

        let first = store
            .enqueue(NewJob::sequence_step("s1", "c1", 0, "mb-1", 5, later), t0())
            .unwrap();
        let EnqueueOutcome::Inserted { job_id: first_id, .. } = first else {
            panic!("expected insert");
        };

        // A newer decision replaces the pending job.
        let second = store
            .enqueue(NewJob::sequence_step("s1", "c1", 0, "mb-1", 0, t0()), t0())
            .unwrap();
        let EnqueueOutcome::Inserted { replaced, .. } = second else {
            panic!("expected insert");
        };
        assert_eq!(replaced, vec![first_id.clone()]);
        assert_eq!(store.job(&first_id).unwrap().unwrap().state, JobState::Cancelled);

        // Once claimed, new enqueues are rejected.
        let claimed = store.dequeue("w1", t0()).unwrap().unwrap();
        let third = store
            .enqueue(NewJob::sequence_step("s1", "c1", 1, "mb-1", 5, later), t0())
            .unwrap();
        assert_eq!(
            third,
            EnqueueOutcome::Rejected {
                active_job_id: claimed.id.clone()
            }
        );
        let live: Vec<_> = store
            .jobs_for_contact("s1", "c1")
            .unwrap()
            .into_iter()
            .filter(|j| !j.state.is_terminal())
            .collect();
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn test_retry_backoff_then_exhaustion() {
        let (db, store) = test_store();
        seed_sequence(&db, "s1", 1, &["c1"]);
        active(&db, "s1");
        store.enqueue(NewJob::sequence_step("s1", "c1", 0, "mb-1", 5, t0()), t0()).unwrap();

        let mut now = t0();
        let mut delays = Vec::new();
        loop {
            let job = store.dequeue("w1", now).unwrap().expect("job due");
            match store.fail(&job.id, "w1", "connection reset", now).unwrap() {
                FailOutcome::Retrying { delay, .. } => {
                    delays.push(delay);
                    // Not claimable before the backoff elapses.
                    assert!(store.dequeue("w1", now).unwrap().is_none());
                    now += chrono::Duration::from_std(delay).unwrap();
                }
                FailOutcome::Failed { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                FailOutcome::LeaseLost => panic!("lease lost"),
            }
        }
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
        let job = &store.jobs_for_contact("s1", "c1").unwrap()[0];
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_fatal_failure_skips_retry() {
        let (db, store) = test_store();
        seed_sequence(&db, "s1", 1, &["c1"]);
        active(&db, "s1");
        store.enqueue(NewJob::sequence_step("s1", "c1", 0, "mb-1", 5, t0()), t0()).unwrap();
        let job = store.dequeue("w1", t0()).unwrap().unwrap();
        let outcome = store.fail_fatal(&job.id, "w1", "550 no such user", t0()).unwrap();
        assert_eq!(outcome, FailOutcome::Failed { attempts: 1 });
    }

    #[test]
    fn test_stalled_job_requeued_then_failed() {
        let (db, store) = test_store();
        seed_sequence(&db, "s1", 1, &["c1"]);
        active(&db, "s1");
        store.enqueue(NewJob::sequence_step("s1", "c1", 0, "mb-1", 5, t0()), t0()).unwrap();

        let lease = chrono::Duration::from_std(store.lease()).unwrap();
        let mut now = t0();
        // max_stalled_count = 2: two recoveries, the third stall fails the job.
        for round in 0..3 {
            let job = store.dequeue("crashed", now).unwrap().expect("claimable");
            now += lease + chrono::Duration::seconds(1);
            let sweep = store.recover_stalled(now).unwrap();
            if round < 2 {
                assert_eq!(sweep.requeued, vec![job.id.clone()]);
                // The crashed worker can no longer complete it.
                assert!(!store.complete(&job.id, "crashed", now).unwrap());
            } else {
                assert_eq!(sweep.failed.len(), 1);
                assert_eq!(sweep.failed[0].state, JobState::Failed);
            }
        }
    }

    #[test]
    fn test_live_lease_is_not_stalled() {
        let (db, store) = test_store();
        seed_sequence(&db, "s1", 1, &["c1"]);
        active(&db, "s1");
        store.enqueue(NewJob::sequence_step("s1", "c1", 0, "mb-1", 5, t0()), t0()).unwrap();
        let job = store.dequeue("w1", t0()).unwrap().unwrap();
        let later = t0() + chrono::Duration::seconds(170);
        assert!(store.extend_lease(&job.id, "w1", later).unwrap());
        let sweep = store.recover_stalled(t0() + chrono::Duration::seconds(200)).unwrap();
        assert!(sweep.requeued.is_empty());
        assert!(store.complete(&job.id, "w1", later).unwrap());
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 3_000,
            jitter: 0.2,
        };
        for _ in 0..200 {
            let d = jittered(&policy, 1);
            assert!((800..=1_200).contains(&d), "{d}");
            assert!(jittered(&policy, 10) <= 3_000);
        }
    }

    #[test]
    fn test_email_send_jobs_have_no_contact_slot() {
        let (_db, store) = test_store();
        let job = NewJob {
            class: JobClass::EmailSend,
            sequence_id: None,
            contact_id: None,
            step_index: None,
            mailbox_id: "mb-1".into(),
            payload: serde_json::json!({"to": "a@example.com"}),
            priority: 0,
            run_at: t0(),
        };
        store.enqueue(job.clone(), t0()).unwrap();
        store.enqueue(job, t0()).unwrap();
        assert_eq!(store.stats().unwrap().waiting, 2);
        let claimed = store.dequeue("w1", t0()).unwrap().unwrap();
        assert_eq!(claimed.max_attempts, 2);
        assert_eq!(claimed.payload["to"], "a@example.com");
    }
}
