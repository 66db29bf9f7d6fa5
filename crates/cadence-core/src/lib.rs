//! # Cadence Core
//!
//! Shared vocabulary for the delivery orchestration engine: configuration,
//! the error taxonomy, sequence/contact/job record types, and the traits the
//! engine uses to talk to mailbox providers, history feeds and alerting.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
