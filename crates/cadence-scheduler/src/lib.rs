//! # Cadence Scheduler
//!
//! Delivery orchestration for multi-step email sequences.
//!
//! ## Design Principles
//! - No external broker: SQLite is the queue, the state store and the ledger
//! - Every state change is a compare-and-set, so late workers no-op
//! - Tokio timers only; idle loops sleep
//! - Collaborators (mail sending, mailbox feeds, alerts) sit behind traits
//!
//! ## Architecture
//! ```text
//! Engine
//!   ├── Dispatcher workers ×N
//!   │     JobStore.dequeue → re-check contact → RateGate.acquire
//!   │     → MailSender.send → SequenceStateMachine.advance
//!   ├── MailboxHistorySync per mailbox
//!   │     HistoryFeed.changes → classify → on_bounce / on_reply
//!   └── Sweeper
//!         JobStore.recover_stalled → HealthMonitor → AlertSink
//! ```

pub mod calendar;
pub mod dispatch;
pub mod engine;
pub mod health;
pub mod history;
pub mod notify;
pub mod persistence;
pub mod queue;
pub mod rate_gate;
pub mod sequence;

#[cfg(test)]
mod testing;

pub use calendar::Calendar;
pub use dispatch::{Dispatcher, JobOutcome};
pub use engine::{Collaborators, Engine, SweepReport};
pub use health::{HealthMonitor, HealthReport};
pub use history::{MailboxHistorySync, MessageKind, classify};
pub use notify::{LogAlertSink, WebhookAlertSink, alert_sink_from_config};
pub use persistence::CadenceDb;
pub use queue::{EnqueueOutcome, FailOutcome, JobStore};
pub use rate_gate::RateGate;
pub use sequence::{LaunchReport, SequenceStateMachine};
