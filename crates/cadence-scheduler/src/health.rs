//! HealthMonitor — rolling error rate per sequence.
//!
//! errors = delivery errors + bounces in the window, sent = `sent` events in
//! the window, rate = errors / max(sent, 1). Entering critical health
//! notifies the alert sink once; the sequence keeps running until an
//! operator decides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cadence_core::config::HealthConfig;
use cadence_core::error::Result;
use cadence_core::traits::AlertSink;
use cadence_core::types::{EmailEventType, HealthStatus};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::notify::spawn_alert;
use crate::persistence::CadenceDb;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub sequence_id: String,
    pub sent: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub status: HealthStatus,
}

/// Map an error rate onto ascending thresholds.
pub fn health_status(error_rate: f64, thresholds: &HealthConfig) -> HealthStatus {
    if error_rate >= thresholds.critical {
        HealthStatus::Critical
    } else if error_rate >= thresholds.error {
        HealthStatus::Error
    } else if error_rate >= thresholds.warning {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

pub struct HealthMonitor {
    db: Arc<CadenceDb>,
    config: HealthConfig,
    alert: Arc<dyn AlertSink>,
    /// Last level seen per sequence.
    last: Mutex<HashMap<String, HealthStatus>>,
}

impl HealthMonitor {
    pub fn new(db: Arc<CadenceDb>, config: HealthConfig, alert: Arc<dyn AlertSink>) -> Self {
        Self {
            db,
            config,
            alert,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Compute health with the configured thresholds.
    pub fn check_health(&self, sequence_id: &str, now: DateTime<Utc>) -> Result<HealthReport> {
        self.check_health_with(sequence_id, &self.config, now)
    }

    /// Compute health against explicit thresholds. Becoming critical fires
    /// an alert; staying critical does not.
    pub fn check_health_with(
        &self,
        sequence_id: &str,
        thresholds: &HealthConfig,
        now: DateTime<Utc>,
    ) -> Result<HealthReport> {
        let since = now - Duration::seconds(thresholds.window_secs as i64);
        let sent = self.db.count_events_since(sequence_id, EmailEventType::Sent, since)?;
        let bounces = self.db.count_events_since(sequence_id, EmailEventType::Bounced, since)?;
        let failures = self.db.count_delivery_errors_since(sequence_id, since)?;
        let errors = bounces + failures;
        let error_rate = errors as f64 / sent.max(1) as f64;
        let status = health_status(error_rate, thresholds);
        let previous = self
            .last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sequence_id.to_string(), status);

        if status == HealthStatus::Critical && previous == Some(HealthStatus::Critical) {
            tracing::debug!("🩺 Sequence {sequence_id} still critical ({error_rate:.3})");
        } else if status == HealthStatus::Critical {
            let detail = format!(
                "error rate {:.1}% ({errors} errors / {sent} sent)",
                error_rate * 100.0
            );
            tracing::warn!("🩺 Sequence {sequence_id} is critical: {detail}");
            spawn_alert(self.alert.clone(), sequence_id, status, detail);
        } else if status > HealthStatus::Healthy {
            tracing::debug!("🩺 Sequence {sequence_id} health {status} ({error_rate:.3})");
        }

        Ok(HealthReport {
            sequence_id: sequence_id.to_string(),
            sent,
            errors,
            error_rate,
            status,
        })
    }
}
