//! Engine — explicitly constructed context that owns the shared pieces
//! (database, JobStore, RateGate) and runs the background loops:
//! N dispatcher workers, one history-sync loop per mailbox, and a sweeper
//! that recovers stalled jobs and evaluates sequence health.
//!
//! `shutdown()` flips a shared watch channel and waits for the loops to
//! drain, bounded by the configured grace period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_core::config::CadenceConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{AlertSink, CredentialRefresher, HistoryFeed, MailSender, WatchRenewer};
use cadence_core::types::{Job, Mailbox, SequenceStatus};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatch::Dispatcher;
use crate::health::{HealthMonitor, HealthReport};
use crate::history::MailboxHistorySync;
use crate::notify::alert_sink_from_config;
use crate::persistence::CadenceDb;
use crate::queue::JobStore;
use crate::rate_gate::RateGate;
use crate::sequence::SequenceStateMachine;

/// Outside-world implementations the engine talks to.
pub struct Collaborators {
    pub sender: Arc<dyn MailSender>,
    pub refresher: Arc<dyn CredentialRefresher>,
    /// Without a feed no history sync loops are started.
    pub feed: Option<Arc<dyn HistoryFeed>>,
    pub renewer: Option<Arc<dyn WatchRenewer>>,
    /// Defaults to the sink described by `[alert]`.
    pub alert: Option<Arc<dyn AlertSink>>,
}

/// Result of one sweeper pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub requeued: usize,
    pub failed: usize,
    /// Contacts that had no job and were queued again.
    pub rescheduled: usize,
    pub health: Vec<HealthReport>,
}

pub struct Engine {
    config: CadenceConfig,
    db: Arc<CadenceDb>,
    machine: Arc<SequenceStateMachine>,
    dispatcher: Arc<Dispatcher>,
    sync: Option<Arc<MailboxHistorySync>>,
    health: HealthMonitor,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Engine {
    /// Open the configured database and build the engine.
    pub fn open(config: CadenceConfig, collaborators: Collaborators) -> Result<Self> {
        let path = config.database_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Arc::new(CadenceDb::open(&path)?);
        Self::with_db(config, db, collaborators)
    }

    /// Build the engine over an existing database. Configured mailboxes are
    /// upserted so sequences can reference them.
    pub fn with_db(config: CadenceConfig, db: Arc<CadenceDb>, collaborators: Collaborators) -> Result<Self> {
        for mb in &config.mailboxes {
            db.save_mailbox(&Mailbox {
                id: mb.id.clone(),
                email: mb.email.clone(),
                display_name: mb.display_name.clone(),
            })?;
        }

        let jobs = Arc::new(JobStore::new(db.clone(), config.queue.clone(), &config.worker));
        let machine = Arc::new(SequenceStateMachine::new(db.clone(), jobs));
        let gate = RateGate::new(config.rate_limit.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            machine.clone(),
            gate,
            collaborators.sender,
            collaborators.refresher,
        ));
        let sync = collaborators.feed.map(|feed| {
            Arc::new(MailboxHistorySync::new(
                machine.clone(),
                feed,
                collaborators.renewer,
                config.sync.clone(),
            ))
        });
        let alert = collaborators
            .alert
            .unwrap_or_else(|| alert_sink_from_config(&config.alert));
        let health = HealthMonitor::new(db.clone(), config.health.clone(), alert);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            db,
            machine,
            dispatcher,
            sync,
            health,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn db(&self) -> &Arc<CadenceDb> {
        &self.db
    }

    pub fn machine(&self) -> &Arc<SequenceStateMachine> {
        &self.machine
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        self.machine.jobs()
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn sync(&self) -> Option<&Arc<MailboxHistorySync>> {
        self.sync.as_ref()
    }

    /// Spawn the background loops. Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CadenceError::Validation("engine already started".into()));
        }
        let mut spawned = Vec::new();

        // Distinct per process so leases from several processes never collide.
        let instance = uuid::Uuid::new_v4().simple().to_string();
        let poll = Duration::from_millis(self.config.worker.poll_interval_ms.max(1));
        for i in 0..self.config.worker.workers {
            let worker_id = format!("{}-{i}", &instance[..8]);
            spawned.push(tokio::spawn(self.dispatcher.clone().run_worker(
                worker_id,
                poll,
                self.shutdown_tx.subscribe(),
            )));
        }

        if let Some(sync) = &self.sync {
            for mb in &self.config.mailboxes {
                spawned.push(tokio::spawn(
                    sync.clone().run(vec![mb.id.clone()], self.shutdown_tx.subscribe()),
                ));
            }
        }

        let engine = self.clone();
        let rx = self.shutdown_tx.subscribe();
        spawned.push(tokio::spawn(async move { engine.run_sweeper(rx).await }));

        tracing::info!(
            "🚀 Engine started: {} worker(s), {} sync loop(s)",
            self.config.worker.workers,
            if self.sync.is_some() { self.config.mailboxes.len() } else { 0 }
        );
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(spawned);
        Ok(())
    }

    /// Signal every loop to stop and wait for them, at most the grace period.
    /// Returns false if some loop was still running when the grace expired.
    pub async fn shutdown(&self) -> bool {
        self.shutdown_tx.send_replace(true);
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        if handles.is_empty() {
            return true;
        }
        let grace = Duration::from_secs(self.config.worker.shutdown_grace_secs);
        tracing::info!("🛑 Engine shutting down, draining {} task(s)", handles.len());
        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(results) => {
                for r in results {
                    if let Err(e) = r {
                        tracing::error!("❌ Engine task ended abnormally: {e}");
                    }
                }
                tracing::info!("👋 Engine stopped");
                true
            }
            Err(_) => {
                tracing::warn!("⚠️ Engine tasks still running after {grace:?}; their leases will expire");
                false
            }
        }
    }

    /// One sweeper pass: requeue stalled jobs, fail the ones past the stall
    /// limit, then check health of every active sequence.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let stalled = self.jobs().recover_stalled(now)?;
        for job in &stalled.failed {
            self.on_stalled_out(job)?;
        }

        let mut health = Vec::new();
        let mut rescheduled = 0;
        for seq in self.db.sequences_by_status(SequenceStatus::Active)? {
            match self.machine.reschedule_stranded(&seq, now) {
                Ok(n) => rescheduled += n,
                Err(e) => tracing::warn!("⚠️ Rescheduling stranded contacts of {seq} failed: {e}"),
            }
            match self.health.check_health(&seq, now) {
                Ok(report) => health.push(report),
                Err(e) => tracing::warn!("⚠️ Health check for {seq} failed: {e}"),
            }
        }
        Ok(SweepReport {
            requeued: stalled.requeued.len(),
            failed: stalled.failed.len(),
            rescheduled,
            health,
        })
    }

    fn on_stalled_out(&self, job: &Job) -> Result<()> {
        let reason = job
            .last_error
            .clone()
            .unwrap_or_else(|| "job stalled more than allowable limit".into());
        match (&job.sequence_id, &job.contact_id, job.step_index) {
            (Some(seq), Some(contact), Some(step)) => {
                self.db
                    .record_delivery_error(seq, Some(contact), Some(&job.id), "stalled", &reason)?;
                self.machine.mark_error(seq, contact, step, &reason)?;
            }
            _ => tracing::warn!("⚠️ {} job {} failed: {reason}", job.class, job.id),
        }
        Ok(())
    }

    async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let every = Duration::from_secs(self.config.worker.stalled_sweep_interval_secs.max(1));
        let mut interval = tokio::time::interval(every);
        tracing::info!("🧹 Sweeper started (every {}s)", every.as_secs());
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep(Utc::now()) {
                tracing::error!("❌ Sweep failed: {e}");
            }
        }
        tracing::info!("🧹 Sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingRefresher, RecordingAlertSink, RecordingSender, seed_sequence};
    use cadence_core::config::MailboxConfig;
    use cadence_core::types::{ContactStatus, HealthStatus};

    fn config() -> CadenceConfig {
        let mut cfg = CadenceConfig::default();
        cfg.worker.workers = 2;
        cfg.worker.poll_interval_ms = 5;
        cfg.worker.shutdown_grace_secs = 5;
        cfg.worker.max_stalled_count = 0;
        cfg.rate_limit.per_second = 100;
        cfg.rate_limit.per_minute = 1000;
        cfg
    }

    fn engine(sender: Arc<RecordingSender>, alert: Arc<RecordingAlertSink>) -> Arc<Engine> {
        let db = Arc::new(CadenceDb::open_in_memory().unwrap());
        Arc::new(
            Engine::with_db(
                config(),
                db,
                Collaborators {
                    sender,
                    refresher: Arc::new(CountingRefresher::default()),
                    feed: None,
                    renewer: None,
                    alert: Some(alert as Arc<dyn AlertSink>),
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_configured_mailboxes_are_saved() {
        let mut cfg = config();
        cfg.mailboxes.push(MailboxConfig {
            id: "sales".into(),
            email: "sales@acme.test".into(),
            display_name: Some("Sales".into()),
            smtp_host: "smtp.acme.test".into(),
            smtp_port: 587,
            imap_host: "imap.acme.test".into(),
            imap_port: 993,
            username: String::new(),
            password: String::new(),
            folder: "INBOX".into(),
        });
        let db = Arc::new(CadenceDb::open_in_memory().unwrap());
        let engine = Engine::with_db(
            cfg,
            db.clone(),
            Collaborators {
                sender: Arc::new(RecordingSender::default()),
                refresher: Arc::new(CountingRefresher::default()),
                feed: None,
                renewer: None,
                alert: None,
            },
        )
        .unwrap();
        assert_eq!(engine.db().mailbox("sales").unwrap().unwrap().email, "sales@acme.test");
    }

    #[tokio::test]
    async fn test_start_sends_and_shutdown_drains() {
        let sender = Arc::new(RecordingSender::default());
        let engine = engine(sender.clone(), Arc::new(RecordingAlertSink::default()));
        seed_sequence(engine.db(), "s1", 1, &["c1", "c2", "c3"]);
        engine.machine().launch("s1", Utc::now() - chrono::Duration::seconds(1)).unwrap();

        engine.start().unwrap();
        assert!(engine.start().is_err());
        for _ in 0..400 {
            if sender.sent().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(engine.shutdown().await);
        assert_eq!(sender.sent().len(), 3);
        for c in ["c1", "c2", "c3"] {
            assert_eq!(
                engine.db().require_sequence_contact("s1", c).unwrap().status,
                ContactStatus::Completed
            );
        }
        assert_eq!(engine.db().require_sequence("s1").unwrap().status, SequenceStatus::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_without_start() {
        let engine = engine(Arc::new(RecordingSender::default()), Arc::new(RecordingAlertSink::default()));
        assert!(engine.shutdown().await);
    }

    #[tokio::test]
    async fn test_sweep_fails_dead_worker_job_and_reports_health() {
        let alert = Arc::new(RecordingAlertSink::default());
        let engine = engine(Arc::new(RecordingSender::default()), alert.clone());
        seed_sequence(engine.db(), "s1", 2, &["c1"]);
        let now = Utc::now();
        engine.machine().launch("s1", now - chrono::Duration::seconds(1)).unwrap();

        // A worker claims the job and dies.
        let job = engine.jobs().dequeue("dead-worker", now).unwrap().unwrap();
        let later = now + chrono::Duration::hours(1);
        let report = engine.sweep(later).unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(engine.jobs().job(&job.id).unwrap().unwrap().state, cadence_core::types::JobState::Failed);
        let sc = engine.db().require_sequence_contact("s1", "c1").unwrap();
        assert_eq!(sc.status, ContactStatus::Error);
        assert!(sc.last_error.unwrap().contains("stalled"));

        // Its only contact failed, so the sequence stops with that error.
        let seq = engine.db().require_sequence("s1").unwrap();
        assert_eq!(seq.status, SequenceStatus::Error);
        assert!(seq.last_error.unwrap().contains("stalled"));
        assert!(report.health.iter().all(|h| h.sequence_id != "s1"));

        // One delivery error and no sends in the window is critical.
        let direct = engine.health().check_health("s1", later).unwrap();
        assert_eq!(direct.errors, 1);
        assert_eq!(direct.status, HealthStatus::Critical);
    }

    #[test]
    fn test_sweep_queues_deferred_contact_once_job_finishes() {
        let engine = engine(Arc::new(RecordingSender::default()), Arc::new(RecordingAlertSink::default()));
        seed_sequence(engine.db(), "s1", 2, &["c1"]);
        let now = Utc::now();
        engine.machine().launch("s1", now - chrono::Duration::seconds(1)).unwrap();
        let job = engine.jobs().dequeue("w1", now).unwrap().unwrap();

        engine.machine().reset("s1", now).unwrap();
        let launched = engine.machine().launch("s1", now).unwrap();
        assert_eq!(launched.deferred, 1);
        assert_eq!(engine.sweep(now).unwrap().rescheduled, 0);

        engine.jobs().complete(&job.id, "w1", now).unwrap();
        assert_eq!(engine.sweep(now).unwrap().rescheduled, 1);
        assert_eq!(
            engine.db().require_sequence_contact("s1", "c1").unwrap().status,
            ContactStatus::Scheduled
        );
    }
}
